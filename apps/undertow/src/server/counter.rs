//! Demo view served by `undertow serve`.

use tracing::debug;

use super::view::{View, ViewError};
use crate::dom::hooks::HOOK_ATTRIBUTE;
use crate::events::LINK_ATTRIBUTE;
use crate::protocol::{ClientEvent, EventKind, HookValue, NodeRef, Patch, Subtree};

#[derive(Debug)]
pub struct CounterView {
    count: i64,
    step: i64,
    path: String,
}

impl Default for CounterView {
    fn default() -> Self {
        Self {
            count: 0,
            step: 1,
            path: "/".into(),
        }
    }
}

impl CounterView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    fn count_patches(&self) -> Vec<Patch> {
        vec![
            Patch::SetText {
                node: NodeRef::from("count"),
                text: self.count.to_string(),
            },
            Patch::RemoveAttribute {
                node: NodeRef::from("inc"),
                name: "aria-busy".into(),
            },
            Patch::RemoveClass {
                node: NodeRef::from("dec"),
                class: "pending".into(),
            },
            Patch::Dispatch {
                node: NodeRef::from("count"),
                event: "counter:changed".into(),
                detail: HookValue::Int(self.count),
            },
        ]
    }
}

impl View for CounterView {
    fn render(&self) -> Subtree {
        Subtree::element("main")
            .with_id("app")
            .with_child(Subtree::element("h1").with_id("title").with_child(Subtree::text("Counter")))
            .with_child(
                Subtree::element("p")
                    .with_id("count")
                    .with_attr(HOOK_ATTRIBUTE, "Flash")
                    .with_child(Subtree::text(self.count.to_string())),
            )
            .with_child(
                Subtree::element("button")
                    .with_id("inc")
                    .with_attr("ut-on-click", "prevent")
                    .with_attr("ut-optimistic-click", "set-attr aria-busy true")
                    .with_child(Subtree::text("+")),
            )
            .with_child(
                Subtree::element("button")
                    .with_id("dec")
                    .with_attr("ut-on-click", "prevent")
                    .with_attr("ut-optimistic-click", "toggle-class pending")
                    .with_child(Subtree::text("-")),
            )
            .with_child(
                Subtree::element("input")
                    .with_id("step")
                    .with_attr("type", "number")
                    .with_attr("value", self.step.to_string())
                    .with_attr("ut-on-input", "debounce=200"),
            )
            .with_child(
                Subtree::element("a")
                    .with_id("about")
                    .with_attr(LINK_ATTRIBUTE, "/about")
                    .with_child(Subtree::text("About")),
            )
    }

    fn handle_event(&mut self, event: &ClientEvent) -> Result<Vec<Patch>, ViewError> {
        debug!(target = "undertow::server", node = %event.node, kind = event.kind.name(), "counter event");
        match (event.node.as_str(), &event.kind) {
            ("inc", EventKind::Click { .. }) => {
                self.count = self
                    .count
                    .checked_add(self.step)
                    .ok_or_else(|| ViewError::new(422, "counter overflow"))?;
                Ok(self.count_patches())
            }
            ("dec", EventKind::Click { .. }) => {
                let next = self.count - self.step;
                if next < 0 {
                    return Err(ViewError::new(409, "counter cannot go below zero"));
                }
                self.count = next;
                Ok(self.count_patches())
            }
            ("step", EventKind::Input { value }) => {
                let step = value
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .filter(|step| (1..=1_000).contains(step))
                    .ok_or_else(|| ViewError::new(422, format!("invalid step {value:?}")))?;
                self.step = step;
                Ok(vec![Patch::SetValue {
                    node: NodeRef::from("step"),
                    value: step.to_string(),
                }])
            }
            (_, EventKind::Navigate { url, .. }) => {
                self.path = url.clone();
                Ok(vec![
                    Patch::PushUrl { url: url.clone() },
                    Patch::SetTitle {
                        title: format!("Counter {}", self.path),
                    },
                ])
            }
            _ => Ok(Vec::new()),
        }
    }
}
