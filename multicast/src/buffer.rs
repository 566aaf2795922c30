//! Retention buffer for delivered messages that are not yet stable.

use crate::message::Message;

#[derive(Debug, Default)]
pub struct MessageBuffer {
    entries: Vec<Message>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.entries.push(message);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.entries.clone()
    }

    /// Remove the entries at `positions` (ascending, as produced by a scan of
    /// this buffer) in one pass and return them.
    pub fn evict(&mut self, positions: &[usize]) -> Vec<Message> {
        if positions.is_empty() {
            return Vec::new();
        }

        let mut evicted = Vec::with_capacity(positions.len());
        let mut pending = positions.iter().peekable();
        let mut kept = Vec::with_capacity(self.entries.len().saturating_sub(positions.len()));

        for (idx, message) in std::mem::take(&mut self.entries).into_iter().enumerate() {
            if pending.next_if_eq(&&idx).is_some() {
                evicted.push(message);
            } else {
                kept.push(message);
            }
        }

        self.entries = kept;
        evicted
    }
}
