use std::collections::VecDeque;

use crate::protocol::ClientMessage;

pub const DEFAULT_QUEUE_LIMIT: usize = 256;

/// Bounded FIFO of messages composed while the link is down.
#[derive(Debug)]
pub struct OutboundQueue {
    messages: VecDeque<ClientMessage>,
    limit: usize,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_LIMIT)
    }
}

impl OutboundQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            limit,
        }
    }

    /// Returns `false` and leaves the queue untouched when it is full.
    pub fn enqueue(&mut self, message: ClientMessage) -> bool {
        if self.messages.len() >= self.limit {
            return false;
        }
        self.messages.push_back(message);
        true
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ClientMessage> + '_ {
        self.messages.drain(..)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
