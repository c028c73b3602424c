//! Event pipeline: turns local interactions into sequenced `ClientEvent`s.
//!
//! Declarations live on the tree itself (`ut-on-<kind>` attributes), so the pipeline reads
//! them through the reconciliation engine at dispatch time and never caches bindings.

use std::collections::{HashMap, HashSet};

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::dom::ReconcileEngine;
use crate::protocol::{ClientEvent, EventKind, NavigationTrigger, NodeRef};

pub mod bindings;

pub use bindings::{LINK_ATTRIBUTE, Modifiers, OptimisticAction};

/// A raw interaction observed by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomEvent {
    pub target: NodeRef,
    pub kind: EventKind,
}

impl DomEvent {
    pub fn new(target: impl Into<NodeRef>, kind: EventKind) -> Self {
        Self {
            target: target.into(),
            kind,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Events ready for the wire, already sequenced.
    pub emitted: Vec<ClientEvent>,
    pub default_prevented: bool,
    pub propagation_stopped: bool,
    /// Set when the interaction started a client-initiated navigation.
    pub navigation: Option<String>,
    pub optimistic: Vec<(NodeRef, OptimisticAction)>,
}

type BindingKey = (NodeRef, String);

#[derive(Debug)]
struct Debounced {
    deadline: Instant,
    kind: EventKind,
}

#[derive(Debug, Default)]
pub struct EventPipeline {
    last_seq: u64,
    consumed: HashSet<BindingKey>,
    debounced: HashMap<BindingKey, Debounced>,
    throttled: HashMap<BindingKey, Instant>,
}

impl EventPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the most recently emitted event.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn pending_debounced(&self) -> usize {
        self.debounced.len()
    }

    /// Drops `once`, throttle and debounce state held for nodes that left the tree.
    pub fn forget(&mut self, nodes: &[NodeRef]) {
        if nodes.is_empty() {
            return;
        }
        let gone: HashSet<&NodeRef> = nodes.iter().collect();
        self.consumed.retain(|(node, _)| !gone.contains(node));
        self.debounced.retain(|(node, _), _| !gone.contains(node));
        self.throttled.retain(|(node, _), _| !gone.contains(node));
    }

    /// Drops all per-node state. Sequence numbering continues.
    pub fn reset_bindings(&mut self) {
        self.consumed.clear();
        self.debounced.clear();
        self.throttled.clear();
    }

    pub fn dispatch(
        &mut self,
        engine: &ReconcileEngine,
        event: DomEvent,
        now: Instant,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let path = engine.ancestors(&event.target);
        if path.is_empty() {
            debug!(target = "undertow::events", node = %event.target, "event target not in tree");
            return outcome;
        }

        if matches!(event.kind, EventKind::Click { .. }) {
            let link = path.iter().find_map(|node| {
                engine
                    .attribute(node, LINK_ATTRIBUTE)
                    .map(|url| (node.clone(), url.to_string()))
            });
            if let Some((node, url)) = link {
                outcome.default_prevented = true;
                outcome.navigation = Some(url.clone());
                let kind = EventKind::Navigate {
                    url,
                    trigger: NavigationTrigger::Link,
                };
                outcome.emitted.push(self.stamp(node, kind));
                return outcome;
            }
        }

        let name = event.kind.name().to_string();
        let attribute = bindings::event_attribute(&name);
        let declarers: Vec<(NodeRef, Modifiers)> = path
            .iter()
            .filter(|node| !self.consumed.contains(&((*node).clone(), name.clone())))
            .filter_map(|node| {
                let value = engine.attribute(node, &attribute)?;
                Some((node.clone(), Modifiers::parse(value)))
            })
            .collect();

        // Capture declarers run root-first, then bubbling declarers target-first.
        let capture = declarers.iter().rev().filter(|(_, modifiers)| modifiers.capture);
        let bubble = declarers.iter().filter(|(_, modifiers)| !modifiers.capture);
        for (node, modifiers) in capture.chain(bubble) {
            if modifiers.self_only && *node != event.target {
                continue;
            }
            let key = (node.clone(), name.clone());
            if modifiers.once {
                self.consumed.insert(key.clone());
            }
            outcome.default_prevented |= modifiers.prevents_default();

            if let Some(window) = modifiers.debounce {
                trace!(target = "undertow::events", node = %node, kind = %name, "debouncing");
                self.debounced.insert(
                    key,
                    Debounced {
                        deadline: now + window,
                        kind: event.kind.clone(),
                    },
                );
            } else if let Some(window) = modifiers.throttle {
                let throttled = self
                    .throttled
                    .get(&key)
                    .is_some_and(|last| now.saturating_duration_since(*last) < window);
                if throttled {
                    trace!(target = "undertow::events", node = %node, kind = %name, "throttled");
                } else {
                    self.throttled.insert(key, now);
                    outcome.emitted.push(self.stamp(node.clone(), event.kind.clone()));
                }
            } else {
                outcome.emitted.push(self.stamp(node.clone(), event.kind.clone()));
            }

            if let Some(action) = engine
                .attribute(node, &bindings::optimistic_attribute(&name))
                .and_then(OptimisticAction::parse)
            {
                outcome.optimistic.push((node.clone(), action));
            }

            if modifiers.stop {
                outcome.propagation_stopped = true;
                break;
            }
        }
        outcome
    }

    /// Browser back/forward. Always forwarded; the document itself is the target.
    pub fn history_popped(&mut self, url: impl Into<String>) -> ClientEvent {
        let kind = EventKind::Navigate {
            url: url.into(),
            trigger: NavigationTrigger::PopState,
        };
        self.stamp(NodeRef::new(""), kind)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.debounced.values().map(|pending| pending.deadline).min()
    }

    /// Emits every debounced event whose window has closed, oldest deadline first. Events
    /// whose node is no longer in the tree are dropped.
    pub fn poll_due(&mut self, engine: &ReconcileEngine, now: Instant) -> Vec<ClientEvent> {
        let mut due: Vec<(Instant, BindingKey)> = self
            .debounced
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(key, pending)| (pending.deadline, key.clone()))
            .collect();
        due.sort();
        due.into_iter()
            .filter_map(|(_, key)| {
                let pending = self.debounced.remove(&key)?;
                if !engine.contains(&key.0) {
                    trace!(target = "undertow::events", node = %key.0, "debounced target gone");
                    return None;
                }
                Some(self.stamp(key.0, pending.kind))
            })
            .collect()
    }

    fn stamp(&mut self, node: NodeRef, kind: EventKind) -> ClientEvent {
        self.last_seq += 1;
        ClientEvent {
            seq: self.last_seq,
            node,
            kind,
        }
    }
}
