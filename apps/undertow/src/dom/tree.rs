use crate::protocol::{NodeRef, Subtree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Synthetic document root; never addressable by reference.
    Root,
    Element(ElementData),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ElementData {
    pub tag: String,
    /// Ordered attributes; `class` and `style` are stored here as well.
    pub attrs: Vec<(String, String)>,
    /// Live form value, distinct from the `value` attribute.
    pub value: Option<String>,
}

impl ElementData {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: String) {
        match self.attrs.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) => *existing = value,
            None => self.attrs.push((name.to_string(), value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let index = self.attrs.iter().position(|(key, _)| key == name)?;
        Some(self.attrs.remove(index).1)
    }
}

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub kind: NodeKind,
    pub node_ref: Option<NodeRef>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl NodeRecord {
    pub fn element(&self) -> Option<&ElementData> {
        match &self.kind {
            NodeKind::Element(element) => Some(element),
            _ => None,
        }
    }

    pub fn element_mut(&mut self) -> Option<&mut ElementData> {
        match &mut self.kind {
            NodeKind::Element(element) => Some(element),
            _ => None,
        }
    }

    fn allows_children(&self) -> bool {
        matches!(self.kind, NodeKind::Root | NodeKind::Element(_))
    }
}

/// Arena-backed tree with slot reuse. The root slot is never freed.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Option<NodeRecord>>,
    free: Vec<usize>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(NodeRecord {
                kind: NodeKind::Root,
                node_ref: None,
                parent: None,
                children: Vec::new(),
            })],
            free: Vec::new(),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map_or(&[], |record| record.children.as_slice())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(|record| record.parent)
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children(NodeId::ROOT).is_empty()
    }

    pub fn can_have_children(&self, id: NodeId) -> bool {
        self.get(id).is_some_and(NodeRecord::allows_children)
    }

    fn alloc(&mut self, kind: NodeKind, node_ref: Option<NodeRef>) -> NodeId {
        let record = NodeRecord {
            kind,
            node_ref,
            parent: None,
            children: Vec::new(),
        };
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(record);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(record));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    /// Inserts `child` under `parent` at `index`, clamped to the child count.
    pub fn attach(&mut self, parent: NodeId, child: NodeId, index: usize) {
        let Some(record) = self.get_mut(parent) else {
            return;
        };
        let index = index.min(record.children.len());
        record.children.insert(index, child);
        if let Some(child_record) = self.get_mut(child) {
            child_record.parent = Some(parent);
        }
    }

    /// Unlinks `child` from its parent and returns the position it held.
    pub fn detach(&mut self, child: NodeId) -> Option<usize> {
        let parent = self.get_mut(child)?.parent.take()?;
        let siblings = &mut self.get_mut(parent)?.children;
        let position = siblings.iter().position(|id| *id == child)?;
        siblings.remove(position);
        Some(position)
    }

    /// Detaches and frees `id` with all descendants, returning the freed records in
    /// pre-order.
    pub fn remove_subtree(&mut self, id: NodeId) -> Vec<NodeRecord> {
        if id == NodeId::ROOT {
            return Vec::new();
        }
        self.detach(id);
        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(record) = self.nodes.get_mut(current.0).and_then(Option::take) else {
                continue;
            };
            self.free.push(current.0);
            stack.extend(record.children.iter().rev().copied());
            removed.push(record);
        }
        removed
    }

    /// Removes every child of `id`, returning the freed records.
    pub fn clear_children(&mut self, id: NodeId) -> Vec<NodeRecord> {
        let children: Vec<NodeId> = self.children(id).to_vec();
        children
            .into_iter()
            .flat_map(|child| self.remove_subtree(child))
            .collect()
    }

    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.parent(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    /// Pre-order walk from `id` (inclusive).
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children(current).iter().rev().copied());
        }
        out
    }

    /// Builds `subtree` under `parent` starting at `index`. Fragments flatten, so the
    /// result may hold several top-level nodes. Returned ids are in pre-order.
    pub fn build(&mut self, parent: NodeId, index: usize, subtree: &Subtree) -> Vec<NodeId> {
        let mut created = Vec::new();
        let mut position = index.min(self.children(parent).len());
        self.build_into(parent, &mut position, subtree, &mut created);
        created
    }

    fn build_into(
        &mut self,
        parent: NodeId,
        position: &mut usize,
        subtree: &Subtree,
        created: &mut Vec<NodeId>,
    ) {
        match subtree {
            Subtree::Element {
                tag,
                id,
                attrs,
                children,
            } => {
                let node = self.alloc(
                    NodeKind::Element(ElementData {
                        tag: tag.clone(),
                        attrs: attrs.clone(),
                        value: None,
                    }),
                    id.clone(),
                );
                self.attach(parent, node, *position);
                *position += 1;
                created.push(node);
                let mut child_position = 0;
                for child in children {
                    self.build_into(node, &mut child_position, child, created);
                }
            }
            Subtree::Text { content } => {
                let node = self.alloc(NodeKind::Text(content.clone()), None);
                self.attach(parent, node, *position);
                *position += 1;
                created.push(node);
            }
            Subtree::Fragment { children } => {
                for child in children {
                    self.build_into(parent, position, child, created);
                }
            }
            Subtree::Unknown { .. } => {}
        }
    }

    pub fn materialize(&self, id: NodeId) -> Subtree {
        let Some(record) = self.get(id) else {
            return Subtree::fragment(Vec::new());
        };
        let children = record
            .children
            .iter()
            .map(|child| self.materialize(*child))
            .collect();
        match &record.kind {
            NodeKind::Root => Subtree::Fragment { children },
            NodeKind::Element(element) => Subtree::Element {
                tag: element.tag.clone(),
                id: record.node_ref.clone(),
                attrs: element.attrs.clone(),
                children,
            },
            NodeKind::Text(content) => Subtree::Text {
                content: content.clone(),
            },
        }
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text_content(&self, id: NodeId) -> String {
        self.descendants(id)
            .into_iter()
            .filter_map(|node| match self.get(node).map(|record| &record.kind) {
                Some(NodeKind::Text(content)) => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }
}
