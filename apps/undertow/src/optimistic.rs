//! Speculative local mutations applied before the server answers.

use tracing::debug;

use crate::dom::{ReconcileEngine, ReconcileError};
use crate::effect::Effect;
use crate::events::OptimisticAction;
use crate::protocol::{NodeRef, Patch, Subtree};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Class(String),
    Text,
    Attribute(String),
}

/// What a speculative write overwrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prior {
    Absent,
    Value(String),
    /// Children of a node whose content was replaced by text.
    Children(Vec<Subtree>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub node: NodeRef,
    pub field: Field,
    pub prior: Prior,
}

impl PendingUpdate {
    fn restore(&self, engine: &mut ReconcileEngine) -> Result<Vec<Effect>, ReconcileError> {
        let node = self.node.clone();
        let patch = match (&self.field, &self.prior) {
            (Field::Text, Prior::Children(children)) => {
                return engine.restore_children(&node, children);
            }
            (Field::Text, _) => return engine.restore_children(&node, &[]),
            (Field::Class(class), Prior::Absent) => Patch::RemoveClass {
                node,
                class: class.clone(),
            },
            (Field::Class(class), _) => Patch::AddClass {
                node,
                class: class.clone(),
            },
            (Field::Attribute(name), Prior::Value(value)) => Patch::SetAttribute {
                node,
                name: name.clone(),
                value: value.clone(),
            },
            (Field::Attribute(name), _) => Patch::RemoveAttribute {
                node,
                name: name.clone(),
            },
        };
        engine.apply(&patch)
    }
}

#[derive(Debug, Default)]
pub struct OptimisticTracker {
    pending: Vec<PendingUpdate>,
}

impl OptimisticTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &[PendingUpdate] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Applies `action` to `node` and records what it overwrote.
    pub fn apply(
        &mut self,
        engine: &mut ReconcileEngine,
        node: &NodeRef,
        action: &OptimisticAction,
    ) -> Result<Vec<Effect>, ReconcileError> {
        let (update, patch) = match action {
            OptimisticAction::ToggleClass(class) => {
                let present = engine.has_class(node, class);
                let update = PendingUpdate {
                    node: node.clone(),
                    field: Field::Class(class.clone()),
                    prior: if present {
                        Prior::Value(class.clone())
                    } else {
                        Prior::Absent
                    },
                };
                let patch = if present {
                    Patch::RemoveClass {
                        node: node.clone(),
                        class: class.clone(),
                    }
                } else {
                    Patch::AddClass {
                        node: node.clone(),
                        class: class.clone(),
                    }
                };
                (update, patch)
            }
            OptimisticAction::SetText(text) => (
                PendingUpdate {
                    node: node.clone(),
                    field: Field::Text,
                    prior: match engine.materialize_node(node) {
                        Some(Subtree::Element { children, .. }) => Prior::Children(children),
                        _ => Prior::Absent,
                    },
                },
                Patch::SetText {
                    node: node.clone(),
                    text: text.clone(),
                },
            ),
            OptimisticAction::SetAttribute { name, value } => (
                PendingUpdate {
                    node: node.clone(),
                    field: Field::Attribute(name.clone()),
                    prior: engine
                        .attribute(node, name)
                        .map_or(Prior::Absent, |value| Prior::Value(value.to_string())),
                },
                Patch::SetAttribute {
                    node: node.clone(),
                    name: name.clone(),
                    value: value.clone(),
                },
            ),
        };
        let effects = engine.apply(&patch)?;
        self.pending.push(update);
        Ok(effects)
    }

    /// The authoritative state arrived; speculative records are no longer needed.
    pub fn clear(&mut self) -> usize {
        let cleared = self.pending.len();
        self.pending.clear();
        cleared
    }

    /// Reverts every pending update, most recent first.
    pub fn rollback(&mut self, engine: &mut ReconcileEngine) -> Vec<Effect> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        crate::metrics::OPTIMISTIC_ROLLBACKS.inc();
        let mut effects = Vec::new();
        for update in self.pending.drain(..).rev() {
            match update.restore(engine) {
                Ok(applied) => effects.extend(applied),
                Err(err) => {
                    debug!(target = "undertow::optimistic", node = %update.node, error = %err, "skipping rollback of vanished node");
                }
            }
        }
        effects
    }
}
