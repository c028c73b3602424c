//! Renderer-side reconciliation: applies decoded patches to the local tree.
//!
//! One [`ReconcileEngine`] per session owns the tree, the node-reference registry and the
//! hook instances. Every patch is validated before it mutates anything, so a rejected
//! patch leaves all three untouched, and every structural change updates the registry in
//! the same step as the tree.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::{debug, warn};

use crate::effect::Effect;
use crate::protocol::{NodeRef, Patch, PatchBatch, Subtree};

pub mod attrs;
pub mod hooks;
pub mod tree;

use attrs::AttrChange;
use hooks::{HOOK_ATTRIBUTE, HookRegistry};
pub use tree::{ElementData, NodeId, NodeKind, NodeRecord, Tree};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("no node registered for reference '{0}'")]
    MissingNode(NodeRef),
    #[error("reference '{0}' is already registered")]
    DuplicateNode(NodeRef),
    #[error("moving '{node}' under '{parent}' would create a cycle")]
    Cycle { node: NodeRef, parent: NodeRef },
    #[error("refusing event-handler attribute '{name}' on '{node}'")]
    ForbiddenAttribute { node: NodeRef, name: String },
    #[error("unknown patch type {0:#04x}")]
    UnknownPatch(u8),
    #[error("invalid full-state payload: {0}")]
    InvalidState(String),
}

impl ReconcileError {
    /// Consistency failures the renderer cannot repair incrementally.
    pub fn needs_self_heal(&self) -> bool {
        matches!(
            self,
            ReconcileError::MissingNode(_)
                | ReconcileError::DuplicateNode(_)
                | ReconcileError::Cycle { .. }
        )
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: usize,
    pub effects: Vec<Effect>,
    /// A self-heal effect was emitted and the rest of the batch skipped.
    pub healed: bool,
    /// Application stopped at a patch this renderer cannot interpret.
    pub truncated: bool,
    pub rejected: usize,
}

#[derive(Debug, Default)]
pub struct ReconcileEngine {
    tree: Tree,
    registry: HashMap<NodeRef, NodeId>,
    hooks: HookRegistry,
    pending_navigation: Option<String>,
    /// References unregistered since the last `take_retired`.
    retired: Vec<NodeRef>,
}

impl ReconcileEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn registered(&self) -> usize {
        self.registry.len()
    }

    pub fn contains(&self, node: &NodeRef) -> bool {
        self.registry.contains_key(node)
    }

    pub fn pending_navigation(&self) -> Option<&str> {
        self.pending_navigation.as_deref()
    }

    pub fn set_pending_navigation(&mut self, url: impl Into<String>) {
        self.pending_navigation = Some(url.into());
    }

    pub fn take_pending_navigation(&mut self) -> Option<String> {
        self.pending_navigation.take()
    }

    /// Drains the references that left the registry. A reference may come back later on a
    /// new node, so per-node state kept elsewhere must be dropped for each of these.
    pub fn take_retired(&mut self) -> Vec<NodeRef> {
        std::mem::take(&mut self.retired)
    }

    pub fn apply_batch(&mut self, batch: &PatchBatch) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for patch in &batch.patches {
            match self.apply(patch) {
                Ok(effects) => {
                    outcome.applied += 1;
                    outcome.effects.extend(effects);
                }
                Err(ReconcileError::UnknownPatch(kind)) => {
                    debug!(target = "undertow::dom", seq = batch.seq, kind, "batch truncated at unknown patch");
                    outcome.truncated = true;
                    break;
                }
                Err(err) if err.needs_self_heal() => {
                    warn!(target = "undertow::dom", seq = batch.seq, error = %err, "registry inconsistent; self-healing");
                    outcome.effects.push(self.self_heal());
                    outcome.healed = true;
                    break;
                }
                Err(err) => {
                    warn!(target = "undertow::dom", seq = batch.seq, error = %err, "patch rejected");
                    outcome.rejected += 1;
                }
            }
        }
        outcome
    }

    /// Completes a pending navigation directly, or reloads.
    pub fn self_heal(&mut self) -> Effect {
        crate::metrics::SELF_HEALS.inc();
        match self.pending_navigation.take() {
            Some(url) => Effect::AssignLocation(url),
            None => Effect::Reload,
        }
    }

    pub fn apply(&mut self, patch: &Patch) -> Result<Vec<Effect>, ReconcileError> {
        let mut effects = Vec::new();
        match patch {
            Patch::SetText { node, text } => {
                let id = self.lookup(node)?;
                let removed = self.tree.clear_children(id);
                self.forget(removed, &mut effects);
                if !text.is_empty() {
                    self.tree.build(id, 0, &Subtree::text(text.clone()));
                }
                self.hooks.updated(node, &mut effects);
            }
            Patch::SetAttribute { node, name, value } => {
                if attrs::is_event_handler(name) {
                    return Err(ReconcileError::ForbiddenAttribute {
                        node: node.clone(),
                        name: name.clone(),
                    });
                }
                let id = self.lookup(node)?;
                let change = attrs::normalize(name, value);
                self.element_mut(id, node)?;
                self.change_attribute(id, node, name, change, &mut effects);
            }
            Patch::RemoveAttribute { node, name } => {
                let id = self.lookup(node)?;
                self.element_mut(id, node)?;
                self.change_attribute(id, node, name, AttrChange::Remove, &mut effects);
            }
            Patch::AddClass { node, class } => {
                let id = self.lookup(node)?;
                let element = self.element_mut(id, node)?;
                let classes = attrs::with_class(element.attr("class"), class);
                element.set_attr("class", classes);
                self.hooks.updated(node, &mut effects);
            }
            Patch::RemoveClass { node, class } => {
                let id = self.lookup(node)?;
                let element = self.element_mut(id, node)?;
                if let Some(current) = element.attr("class") {
                    match attrs::without_class(current, class) {
                        Some(classes) => element.set_attr("class", classes),
                        None => {
                            element.remove_attr("class");
                        }
                    }
                }
                self.hooks.updated(node, &mut effects);
            }
            Patch::SetStyle {
                node,
                property,
                value,
            } => {
                let id = self.lookup(node)?;
                let element = self.element_mut(id, node)?;
                let mut declarations = attrs::parse_style(element.attr("style").unwrap_or(""));
                match declarations.iter_mut().find(|(name, _)| name == property) {
                    Some((_, existing)) => *existing = value.clone(),
                    None => declarations.push((property.clone(), value.clone())),
                }
                if let Some(style) = attrs::format_style(&declarations) {
                    element.set_attr("style", style);
                }
                self.hooks.updated(node, &mut effects);
            }
            Patch::RemoveStyle { node, property } => {
                let id = self.lookup(node)?;
                let element = self.element_mut(id, node)?;
                let mut declarations = attrs::parse_style(element.attr("style").unwrap_or(""));
                declarations.retain(|(name, _)| name != property);
                match attrs::format_style(&declarations) {
                    Some(style) => element.set_attr("style", style),
                    None => {
                        element.remove_attr("style");
                    }
                }
                self.hooks.updated(node, &mut effects);
            }
            Patch::SetValue { node, value } => {
                let id = self.lookup(node)?;
                self.element_mut(id, node)?.value = Some(value.clone());
                self.hooks.updated(node, &mut effects);
            }
            Patch::Insert {
                parent,
                index,
                subtree,
            } => {
                let parent_id = self.lookup(parent)?;
                self.validate_new_refs(subtree, &HashSet::new())?;
                let created = self.tree.build(parent_id, *index as usize, subtree);
                self.register(created, &mut effects);
            }
            Patch::Remove { node } => {
                let id = self.lookup(node)?;
                let removed = self.tree.remove_subtree(id);
                self.forget(removed, &mut effects);
            }
            Patch::Move {
                node,
                new_parent,
                index,
            } => {
                let id = self.lookup(node)?;
                let parent_id = self.lookup(new_parent)?;
                if id == parent_id || self.tree.is_ancestor(id, parent_id) {
                    return Err(ReconcileError::Cycle {
                        node: node.clone(),
                        parent: new_parent.clone(),
                    });
                }
                self.tree.detach(id);
                self.tree.attach(parent_id, id, *index as usize);
            }
            Patch::Replace { node, subtree } => {
                let id = self.lookup(node)?;
                let replaced = self.descendant_refs(id);
                self.validate_new_refs(subtree, &replaced)?;
                let parent = self.tree.parent(id).unwrap_or(NodeId::ROOT);
                let position = self
                    .tree
                    .children(parent)
                    .iter()
                    .position(|child| *child == id)
                    .unwrap_or(0);
                let removed = self.tree.remove_subtree(id);
                self.forget(removed, &mut effects);
                let created = self.tree.build(parent, position, subtree);
                self.register(created, &mut effects);
            }
            Patch::PushUrl { url } => {
                self.pending_navigation = None;
                effects.push(Effect::PushHistory(url.clone()));
            }
            Patch::ReplaceUrl { url } => {
                self.pending_navigation = None;
                effects.push(Effect::ReplaceHistory(url.clone()));
            }
            Patch::SetTitle { title } => effects.push(Effect::SetTitle(title.clone())),
            Patch::Dispatch {
                node,
                event,
                detail,
            } => {
                self.lookup(node)?;
                effects.push(Effect::Dispatch {
                    node: node.clone(),
                    event: event.clone(),
                    detail: detail.clone(),
                });
            }
            Patch::Unknown { kind } => return Err(ReconcileError::UnknownPatch(*kind)),
        }
        Ok(effects)
    }

    /// Replaces the whole tree with a full-state snapshot and rebuilds the registry.
    pub fn replace_root(&mut self, subtree: &Subtree) -> Result<Vec<Effect>, ReconcileError> {
        let mut seen = HashSet::new();
        collect_refs(subtree, &mut |node| {
            if seen.insert(node.clone()) {
                Ok(())
            } else {
                Err(ReconcileError::DuplicateNode(node.clone()))
            }
        })?;

        let mut effects = Vec::new();
        self.hooks.destroy_all(&mut effects);
        self.tree.clear_children(NodeId::ROOT);
        self.retired.extend(self.registry.drain().map(|(node, _)| node));
        let created = self.tree.build(NodeId::ROOT, 0, subtree);
        self.register(created, &mut effects);
        debug!(
            target = "undertow::dom",
            nodes = self.tree.len(),
            registered = self.registry.len(),
            "root replaced"
        );
        Ok(effects)
    }

    /// Rebuilds the children of `node` from a saved copy. The node itself, its attributes
    /// and any hook mounted on it stay in place.
    pub fn restore_children(
        &mut self,
        node: &NodeRef,
        children: &[Subtree],
    ) -> Result<Vec<Effect>, ReconcileError> {
        let id = self.lookup(node)?;
        let saved = Subtree::fragment(children.to_vec());
        let replaced = self.descendant_refs(id);
        self.validate_new_refs(&saved, &replaced)?;
        let mut effects = Vec::new();
        let removed = self.tree.clear_children(id);
        self.forget(removed, &mut effects);
        let created = self.tree.build(id, 0, &saved);
        self.register(created, &mut effects);
        self.hooks.updated(node, &mut effects);
        Ok(effects)
    }

    pub fn replace_root_json(&mut self, json: &str) -> Result<Vec<Effect>, ReconcileError> {
        let subtree =
            Subtree::from_json(json).map_err(|err| ReconcileError::InvalidState(err.to_string()))?;
        self.replace_root(&subtree)
    }

    /// The whole tree as a fragment of the root's children.
    pub fn materialize(&self) -> Subtree {
        self.tree.materialize(NodeId::ROOT)
    }

    pub fn materialize_node(&self, node: &NodeRef) -> Option<Subtree> {
        let id = self.registry.get(node)?;
        Some(self.tree.materialize(*id))
    }

    pub fn element(&self, node: &NodeRef) -> Option<&ElementData> {
        let id = self.registry.get(node)?;
        self.tree.get(*id)?.element()
    }

    pub fn attribute(&self, node: &NodeRef, name: &str) -> Option<&str> {
        self.element(node)?.attr(name)
    }

    pub fn has_class(&self, node: &NodeRef, class: &str) -> bool {
        self.attribute(node, "class")
            .is_some_and(|classes| attrs::class_list(classes).contains(&class))
    }

    pub fn text_content(&self, node: &NodeRef) -> Option<String> {
        let id = self.registry.get(node)?;
        Some(self.tree.text_content(*id))
    }

    /// Live form value, falling back to the `value` attribute.
    pub fn value(&self, node: &NodeRef) -> Option<&str> {
        let element = self.element(node)?;
        element.value.as_deref().or_else(|| element.attr("value"))
    }

    /// References from `node` (inclusive) up to the root, nearest first.
    pub fn ancestors(&self, node: &NodeRef) -> Vec<NodeRef> {
        let mut out = Vec::new();
        let mut current = self.registry.get(node).copied();
        while let Some(id) = current {
            if let Some(node_ref) = self.tree.get(id).and_then(|record| record.node_ref.clone()) {
                out.push(node_ref);
            }
            current = self.tree.parent(id);
        }
        out
    }

    fn lookup(&self, node: &NodeRef) -> Result<NodeId, ReconcileError> {
        self.registry
            .get(node)
            .copied()
            .ok_or_else(|| ReconcileError::MissingNode(node.clone()))
    }

    fn element_mut(&mut self, id: NodeId, node: &NodeRef) -> Result<&mut ElementData, ReconcileError> {
        self.tree
            .get_mut(id)
            .and_then(NodeRecord::element_mut)
            .ok_or_else(|| ReconcileError::MissingNode(node.clone()))
    }

    fn change_attribute(
        &mut self,
        id: NodeId,
        node: &NodeRef,
        name: &str,
        change: AttrChange,
        effects: &mut Vec<Effect>,
    ) {
        let Some(element) = self.tree.get_mut(id).and_then(NodeRecord::element_mut) else {
            return;
        };
        match &change {
            AttrChange::Set(value) => element.set_attr(name, value.clone()),
            AttrChange::Remove => {
                element.remove_attr(name);
            }
        }
        if name == HOOK_ATTRIBUTE {
            match change {
                AttrChange::Set(hook) if !hook.is_empty() => {
                    self.hooks.mount(node.clone(), &hook, effects)
                }
                _ => self.hooks.destroy(node, effects),
            }
        } else {
            self.hooks.updated(node, effects);
        }
    }

    fn descendant_refs(&self, id: NodeId) -> HashSet<NodeRef> {
        self.tree
            .descendants(id)
            .into_iter()
            .filter_map(|descendant| self.tree.get(descendant)?.node_ref.clone())
            .collect()
    }

    fn validate_new_refs(
        &self,
        subtree: &Subtree,
        replaced: &HashSet<NodeRef>,
    ) -> Result<(), ReconcileError> {
        let mut seen = HashSet::new();
        collect_refs(subtree, &mut |node| {
            let taken = self.registry.contains_key(node) && !replaced.contains(node);
            if taken || !seen.insert(node.clone()) {
                return Err(ReconcileError::DuplicateNode(node.clone()));
            }
            Ok(())
        })
    }

    /// Registers freshly built nodes, strips handler attributes and mounts hooks.
    fn register(&mut self, created: Vec<NodeId>, effects: &mut Vec<Effect>) {
        for id in created {
            let Some(record) = self.tree.get_mut(id) else {
                continue;
            };
            let node_ref = record.node_ref.clone();
            let Some(element) = record.element_mut() else {
                continue;
            };
            let before = element.attrs.len();
            element.attrs.retain(|(name, _)| !attrs::is_event_handler(name));
            if element.attrs.len() != before {
                warn!(
                    target = "undertow::dom",
                    node = node_ref.as_ref().map_or("", NodeRef::as_str),
                    "stripped event-handler attributes from inserted element"
                );
            }
            let hook = element.attr(HOOK_ATTRIBUTE).map(str::to_string);
            let Some(node_ref) = node_ref else {
                if hook.is_some() {
                    warn!(target = "undertow::dom", "hook declared on element without reference");
                }
                continue;
            };
            self.registry.insert(node_ref.clone(), id);
            if let Some(hook) = hook.filter(|hook| !hook.is_empty()) {
                self.hooks.mount(node_ref, &hook, effects);
            }
        }
    }

    fn forget(&mut self, removed: Vec<NodeRecord>, effects: &mut Vec<Effect>) {
        for record in removed {
            if let Some(node_ref) = record.node_ref {
                self.registry.remove(&node_ref);
                self.hooks.destroy(&node_ref, effects);
                self.retired.push(node_ref);
            }
        }
    }
}

fn collect_refs<F>(subtree: &Subtree, visit: &mut F) -> Result<(), ReconcileError>
where
    F: FnMut(&NodeRef) -> Result<(), ReconcileError>,
{
    match subtree {
        Subtree::Element { id, children, .. } => {
            if let Some(id) = id {
                visit(id)?;
            }
            children.iter().try_for_each(|child| collect_refs(child, visit))
        }
        Subtree::Fragment { children } => {
            children.iter().try_for_each(|child| collect_refs(child, visit))
        }
        Subtree::Text { .. } | Subtree::Unknown { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HookValue;

    fn r(value: &str) -> NodeRef {
        NodeRef::from(value)
    }

    fn engine_with(subtree: Subtree) -> ReconcileEngine {
        let mut engine = ReconcileEngine::new();
        engine.replace_root(&subtree).expect("initial tree");
        engine
    }

    fn page() -> Subtree {
        Subtree::element("main").with_id("main").with_child(
            Subtree::element("ul")
                .with_id("list")
                .with_child(Subtree::element("li").with_id("a").with_child(Subtree::text("A")))
                .with_child(
                    Subtree::element("li")
                        .with_id("b")
                        .with_attr(HOOK_ATTRIBUTE, "Sortable")
                        .with_child(Subtree::text("B")),
                ),
        )
    }

    #[test_timeout::timeout]
    fn missing_node_reloads_without_pending_navigation() {
        let mut engine = engine_with(page());
        let batch = PatchBatch::new(
            1,
            vec![
                Patch::SetText {
                    node: r("ghost"),
                    text: "x".into(),
                },
                Patch::SetTitle {
                    title: "skipped".into(),
                },
            ],
        );
        let outcome = engine.apply_batch(&batch);
        assert!(outcome.healed);
        assert_eq!(outcome.effects, vec![Effect::Reload]);
        assert_eq!(outcome.applied, 0);
    }

    #[test_timeout::timeout]
    fn missing_node_completes_pending_navigation() {
        let mut engine = engine_with(page());
        engine.set_pending_navigation("/next");
        let batch = PatchBatch::new(
            1,
            vec![Patch::Remove { node: r("ghost") }],
        );
        let outcome = engine.apply_batch(&batch);
        assert_eq!(outcome.effects, vec![Effect::AssignLocation("/next".into())]);
        assert_eq!(engine.pending_navigation(), None);
    }

    #[test_timeout::timeout]
    fn insert_registers_and_remove_unregisters_descendants() {
        let mut engine = engine_with(page());
        let effects = engine
            .apply(&Patch::Insert {
                parent: r("list"),
                index: 99,
                subtree: Subtree::element("li")
                    .with_id("c")
                    .with_attr(HOOK_ATTRIBUTE, "Chart")
                    .with_child(Subtree::element("span").with_id("c-label")),
            })
            .expect("insert");
        assert_eq!(
            effects,
            vec![Effect::HookMounted {
                node: r("c"),
                hook: "Chart".into()
            }]
        );
        assert!(engine.contains(&r("c-label")));
        assert_eq!(engine.ancestors(&r("c-label")), vec![r("c-label"), r("c"), r("list"), r("main")]);

        let effects = engine.apply(&Patch::Remove { node: r("list") }).expect("remove");
        assert_eq!(
            effects,
            vec![
                Effect::HookDestroyed {
                    node: r("b"),
                    hook: "Sortable".into()
                },
                Effect::HookDestroyed {
                    node: r("c"),
                    hook: "Chart".into()
                },
            ]
        );
        for gone in ["list", "a", "b", "c", "c-label"] {
            assert!(!engine.contains(&r(gone)), "{gone} still registered");
        }
        assert_eq!(engine.registered(), 1);
        assert!(engine.hooks().is_empty());
    }

    #[test_timeout::timeout]
    fn duplicate_reference_leaves_state_untouched() {
        let mut engine = engine_with(page());
        let before = engine.materialize();
        let err = engine
            .apply(&Patch::Insert {
                parent: r("list"),
                index: 0,
                subtree: Subtree::fragment(vec![
                    Subtree::element("li").with_id("new"),
                    Subtree::element("li").with_id("a"),
                ]),
            })
            .expect_err("duplicate");
        assert_eq!(err, ReconcileError::DuplicateNode(r("a")));
        assert!(err.needs_self_heal());
        assert_eq!(engine.materialize(), before);
        assert!(!engine.contains(&r("new")));
    }

    #[test_timeout::timeout]
    fn move_rejects_cycles_and_reorders() {
        let mut engine = engine_with(page());
        let err = engine
            .apply(&Patch::Move {
                node: r("list"),
                new_parent: r("a"),
                index: 0,
            })
            .expect_err("cycle");
        assert!(matches!(err, ReconcileError::Cycle { .. }));

        engine
            .apply(&Patch::Move {
                node: r("b"),
                new_parent: r("list"),
                index: 0,
            })
            .expect("move");
        assert_eq!(engine.text_content(&r("list")).as_deref(), Some("BA"));
    }

    #[test_timeout::timeout]
    fn replace_swaps_hooks_and_allows_reusing_replaced_ids() {
        let mut engine = engine_with(page());
        let effects = engine
            .apply(&Patch::Replace {
                node: r("b"),
                subtree: Subtree::element("li")
                    .with_id("b")
                    .with_attr(HOOK_ATTRIBUTE, "Editable")
                    .with_child(Subtree::text("B2")),
            })
            .expect("replace");
        assert_eq!(
            effects,
            vec![
                Effect::HookDestroyed {
                    node: r("b"),
                    hook: "Sortable".into()
                },
                Effect::HookMounted {
                    node: r("b"),
                    hook: "Editable".into()
                },
            ]
        );
        assert_eq!(engine.text_content(&r("list")).as_deref(), Some("AB2"));
    }

    #[test_timeout::timeout]
    fn handler_attributes_are_refused() {
        let mut engine = engine_with(page());
        let batch = PatchBatch::new(
            1,
            vec![
                Patch::SetAttribute {
                    node: r("a"),
                    name: "onclick".into(),
                    value: "steal()".into(),
                },
                Patch::SetAttribute {
                    node: r("a"),
                    name: "title".into(),
                    value: "ok".into(),
                },
            ],
        );
        let outcome = engine.apply_batch(&batch);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.applied, 1);
        assert!(!outcome.healed);
        assert_eq!(engine.attribute(&r("a"), "onclick"), None);
        assert_eq!(engine.attribute(&r("a"), "title"), Some("ok"));

        engine
            .apply(&Patch::Insert {
                parent: r("list"),
                index: 0,
                subtree: Subtree::element("li")
                    .with_id("evil")
                    .with_attr("OnMouseOver", "x()")
                    .with_attr("class", "item"),
            })
            .expect("insert");
        assert_eq!(engine.attribute(&r("evil"), "OnMouseOver"), None);
        assert!(engine.has_class(&r("evil"), "item"));
    }

    #[test_timeout::timeout]
    fn boolean_class_style_and_value_patches() {
        let mut engine = engine_with(page());
        let node = r("a");
        let patches = [
            Patch::SetAttribute {
                node: node.clone(),
                name: "disabled".into(),
                value: "true".into(),
            },
            Patch::AddClass {
                node: node.clone(),
                class: "active".into(),
            },
            Patch::AddClass {
                node: node.clone(),
                class: "selected".into(),
            },
            Patch::RemoveClass {
                node: node.clone(),
                class: "active".into(),
            },
            Patch::SetStyle {
                node: node.clone(),
                property: "color".into(),
                value: "red".into(),
            },
            Patch::SetValue {
                node: node.clone(),
                value: "typed".into(),
            },
        ];
        for patch in &patches {
            engine.apply(patch).expect("apply");
        }
        assert_eq!(engine.attribute(&node, "disabled"), Some(""));
        assert_eq!(engine.attribute(&node, "class"), Some("selected"));
        assert_eq!(engine.attribute(&node, "style"), Some("color: red"));
        assert_eq!(engine.value(&node), Some("typed"));

        engine
            .apply(&Patch::SetAttribute {
                node: node.clone(),
                name: "disabled".into(),
                value: "false".into(),
            })
            .expect("apply");
        engine
            .apply(&Patch::RemoveStyle {
                node: node.clone(),
                property: "color".into(),
            })
            .expect("apply");
        assert_eq!(engine.attribute(&node, "disabled"), None);
        assert_eq!(engine.attribute(&node, "style"), None);
    }

    #[test_timeout::timeout]
    fn set_text_replaces_children_and_their_registrations() {
        let mut engine = engine_with(page());
        let effects = engine
            .apply(&Patch::SetText {
                node: r("list"),
                text: "empty".into(),
            })
            .expect("set text");
        assert!(effects.contains(&Effect::HookDestroyed {
            node: r("b"),
            hook: "Sortable".into()
        }));
        assert!(!engine.contains(&r("a")));
        assert_eq!(engine.text_content(&r("list")).as_deref(), Some("empty"));
    }

    #[test_timeout::timeout]
    fn hook_attribute_changes_mount_update_and_destroy() {
        let mut engine = engine_with(page());
        let set = |hook: &str| Patch::SetAttribute {
            node: r("a"),
            name: HOOK_ATTRIBUTE.into(),
            value: hook.into(),
        };
        assert_eq!(
            engine.apply(&set("Tooltip")).expect("mount"),
            vec![Effect::HookMounted {
                node: r("a"),
                hook: "Tooltip".into()
            }]
        );
        assert_eq!(
            engine
                .apply(&Patch::AddClass {
                    node: r("a"),
                    class: "x".into()
                })
                .expect("update"),
            vec![Effect::HookUpdated {
                node: r("a"),
                hook: "Tooltip".into()
            }]
        );
        assert_eq!(
            engine
                .apply(&Patch::RemoveAttribute {
                    node: r("a"),
                    name: HOOK_ATTRIBUTE.into()
                })
                .expect("destroy"),
            vec![Effect::HookDestroyed {
                node: r("a"),
                hook: "Tooltip".into()
            }]
        );
    }

    #[test_timeout::timeout]
    fn history_patches_clear_pending_navigation() {
        let mut engine = engine_with(page());
        engine.set_pending_navigation("/b");
        let effects = engine
            .apply(&Patch::PushUrl { url: "/b".into() })
            .expect("push");
        assert_eq!(effects, vec![Effect::PushHistory("/b".into())]);
        assert_eq!(engine.pending_navigation(), None);
    }

    #[test_timeout::timeout]
    fn dispatch_requires_a_live_node() {
        let mut engine = engine_with(page());
        let effects = engine
            .apply(&Patch::Dispatch {
                node: r("b"),
                event: "flash".into(),
                detail: HookValue::Int(3),
            })
            .expect("dispatch");
        assert_eq!(effects.len(), 1);
        assert!(matches!(
            engine.apply(&Patch::Dispatch {
                node: r("zzz"),
                event: "flash".into(),
                detail: HookValue::Null,
            }),
            Err(ReconcileError::MissingNode(_))
        ));
    }

    #[test_timeout::timeout]
    fn unknown_patch_truncates_without_healing() {
        let mut engine = engine_with(page());
        let batch = PatchBatch::new(
            4,
            vec![
                Patch::SetTitle { title: "t".into() },
                Patch::Unknown { kind: 0x7f },
            ],
        );
        let outcome = engine.apply_batch(&batch);
        assert!(outcome.truncated);
        assert!(!outcome.healed);
        assert_eq!(outcome.effects, vec![Effect::SetTitle("t".into())]);
    }

    #[test_timeout::timeout]
    fn replace_root_rebuilds_registry_and_hooks() {
        let mut engine = engine_with(page());
        let fresh = Subtree::element("section")
            .with_id("s")
            .with_child(Subtree::element("p").with_id("p").with_attr(HOOK_ATTRIBUTE, "Fade"));
        let json = fresh.to_json().expect("json");
        let effects = engine.replace_root_json(&json).expect("replace root");
        assert_eq!(
            effects,
            vec![
                Effect::HookDestroyed {
                    node: r("b"),
                    hook: "Sortable".into()
                },
                Effect::HookMounted {
                    node: r("p"),
                    hook: "Fade".into()
                },
            ]
        );
        assert_eq!(engine.registered(), 2);
        assert!(!engine.contains(&r("main")));
        assert_eq!(engine.materialize(), Subtree::fragment(vec![fresh]));
        assert!(matches!(
            engine.replace_root_json("not json"),
            Err(ReconcileError::InvalidState(_))
        ));
    }

    #[test_timeout::timeout]
    fn removals_and_full_state_report_retired_refs() {
        let mut engine = engine_with(page());
        assert!(engine.take_retired().is_empty());

        engine.apply(&Patch::Remove { node: r("a") }).expect("remove");
        engine
            .apply(&Patch::Replace {
                node: r("b"),
                subtree: Subtree::element("li").with_id("b"),
            })
            .expect("replace");
        assert_eq!(engine.take_retired(), vec![r("a"), r("b")]);
        assert!(engine.take_retired().is_empty());

        engine
            .replace_root(&Subtree::element("p").with_id("fresh"))
            .expect("replace root");
        let mut retired = engine.take_retired();
        retired.sort();
        assert_eq!(retired, vec![r("b"), r("list"), r("main")]);
    }

    #[test_timeout::timeout]
    fn restore_children_rebuilds_nested_elements() {
        let mut engine = engine_with(page());
        let Some(Subtree::Element { children, .. }) = engine.materialize_node(&r("list")) else {
            panic!("list is an element");
        };
        engine
            .apply(&Patch::SetText {
                node: r("list"),
                text: "loading".into(),
            })
            .expect("set text");
        assert!(!engine.contains(&r("a")));

        let effects = engine.restore_children(&r("list"), &children).expect("restore");
        assert!(effects.contains(&Effect::HookMounted {
            node: r("b"),
            hook: "Sortable".into()
        }));
        assert!(engine.contains(&r("a")));
        assert_eq!(engine.materialize(), Subtree::fragment(vec![page()]));
    }
}
