use std::collections::HashMap;

use crate::effect::Effect;
use crate::protocol::NodeRef;

/// Attribute naming the client-side behaviour bound to an element's lifetime.
pub const HOOK_ATTRIBUTE: &str = "ut-hook";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookInstance {
    pub name: String,
}

/// Live hook instances keyed by the element they are bound to.
#[derive(Debug, Default)]
pub struct HookRegistry {
    instances: HashMap<NodeRef, HookInstance>,
}

impl HookRegistry {
    pub fn get(&self, node: &NodeRef) -> Option<&HookInstance> {
        self.instances.get(node)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn mount(&mut self, node: NodeRef, name: &str, effects: &mut Vec<Effect>) {
        if let Some(previous) = self.instances.get(&node) {
            if previous.name == name {
                return;
            }
            self.destroy(&node, effects);
        }
        self.instances.insert(
            node.clone(),
            HookInstance {
                name: name.to_string(),
            },
        );
        effects.push(Effect::HookMounted {
            node,
            hook: name.to_string(),
        });
    }

    pub fn destroy(&mut self, node: &NodeRef, effects: &mut Vec<Effect>) {
        if let Some(instance) = self.instances.remove(node) {
            effects.push(Effect::HookDestroyed {
                node: node.clone(),
                hook: instance.name,
            });
        }
    }

    pub fn updated(&self, node: &NodeRef, effects: &mut Vec<Effect>) {
        if let Some(instance) = self.instances.get(node) {
            effects.push(Effect::HookUpdated {
                node: node.clone(),
                hook: instance.name.clone(),
            });
        }
    }

    pub fn destroy_all(&mut self, effects: &mut Vec<Effect>) {
        let mut nodes: Vec<NodeRef> = self.instances.keys().cloned().collect();
        nodes.sort();
        for node in nodes {
            self.destroy(&node, effects);
        }
    }
}
