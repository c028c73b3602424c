//! Patch sequencing and gap recovery.
//!
//! Batches are released strictly in sequence order. Batches that arrive ahead of a gap
//! wait in a bounded reorder buffer while a single resync request is outstanding.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::protocol::{Ack, PatchBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerConfig {
    /// Advertised to the server as the number of unacknowledged batches it may send.
    pub ack_window: u32,
    pub reorder_limit: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            ack_window: 16,
            reorder_limit: 32,
        }
    }
}

/// Outcome of handing one inbound batch to the sequencer.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Batches to apply now, in order.
    pub ready: Vec<PatchBatch>,
    pub ack: Option<Ack>,
    /// `Some(last_applied)` when a resync request must be sent.
    pub resync_from: Option<u64>,
    pub duplicate: bool,
}

#[derive(Debug)]
pub struct Sequencer {
    config: SequencerConfig,
    expected: u64,
    last_applied: u64,
    resync_pending: bool,
    pending: BTreeMap<u64, PatchBatch>,
}

impl Sequencer {
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            config,
            expected: 1,
            last_applied: 0,
            resync_pending: false,
            pending: BTreeMap::new(),
        }
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn resync_pending(&self) -> bool {
        self.resync_pending
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn ack_window(&self) -> u32 {
        self.config.ack_window
    }

    /// Aligns with the sequence announced by an accepted ServerHello.
    pub fn reset_expected(&mut self, next_seq: u64) {
        let next_seq = next_seq.max(1);
        self.expected = next_seq;
        self.last_applied = next_seq - 1;
        self.resync_pending = false;
        self.pending.clear();
        debug!(target = "undertow::sync", expected = next_seq, "sequence aligned");
    }

    /// Full-state replacement: counters restart from zero.
    pub fn full_reset(&mut self) {
        self.reset_expected(1);
    }

    pub fn receive(&mut self, batch: PatchBatch) -> Delivery {
        let seq = batch.seq;
        if seq < self.expected || self.pending.contains_key(&seq) {
            trace!(target = "undertow::sync", seq, expected = self.expected, "duplicate batch dropped");
            crate::metrics::DUPLICATE_BATCHES.inc();
            return Delivery {
                duplicate: true,
                ..Delivery::default()
            };
        }

        if seq > self.expected {
            if self.pending.len() < self.config.reorder_limit {
                self.pending.insert(seq, batch);
            } else {
                warn!(target = "undertow::sync", seq, "reorder buffer full; batch dropped");
            }
            let resync_from = self.request_resync();
            if resync_from.is_some() {
                debug!(
                    target = "undertow::sync",
                    seq,
                    expected = self.expected,
                    "sequence gap detected"
                );
            }
            return Delivery {
                resync_from,
                ..Delivery::default()
            };
        }

        let mut ready = vec![batch];
        self.expected += 1;
        while let Some(next) = self.pending.remove(&self.expected) {
            ready.push(next);
            self.expected += 1;
        }
        self.last_applied = self.expected - 1;
        if self.resync_pending && self.pending.is_empty() {
            debug!(target = "undertow::sync", "gap filled; outstanding resync superseded");
            self.resync_pending = false;
        }

        Delivery {
            ready,
            ack: Some(Ack {
                last_seq: self.last_applied,
                window: self.config.ack_window,
            }),
            resync_from: None,
            duplicate: false,
        }
    }

    /// Returns the sequence to resync from unless a request is already in flight.
    pub fn request_resync(&mut self) -> Option<u64> {
        if self.resync_pending {
            return None;
        }
        self.resync_pending = true;
        crate::metrics::RESYNC_REQUESTS.inc();
        Some(self.last_applied)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(SequencerConfig::default())
    }
}
