use std::collections::VecDeque;

use hub_client::HubMessage;
use serde::{Deserialize, Serialize};

/// A conversation message as templates see it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub sender_id: String,
    pub text: String,
    pub sent_by_human: bool,
}

impl From<&HubMessage> for HistoryEntry {
    fn from(msg: &HubMessage) -> Self {
        Self {
            sender_id: msg.sender_id.clone(),
            text: msg.text.clone(),
            sent_by_human: msg.sent_by_human,
        }
    }
}

/// The last `capacity` messages of the conversation, oldest first.
///
/// Shared by every pipeline: prompts rendered for one question see messages
/// from the others, in hub delivery order.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl HistoryBuffer {
    /// Capacities below 1 are raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str) -> HistoryEntry {
        HistoryEntry { sender_id: "u".into(), text: text.into(), sent_by_human: true }
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let mut h = HistoryBuffer::new(0);
        assert_eq!(h.capacity(), 1);
        h.push(entry("a"));
        h.push(entry("b"));
        assert_eq!(h.len(), 1);
        assert_eq!(h.last().unwrap().text, "b");
    }

    #[test]
    fn test_fifo_eviction_never_exceeds_capacity() {
        let mut h = HistoryBuffer::new(3);
        for i in 0..10 {
            h.push(entry(&i.to_string()));
            assert!(h.len() <= 3);
        }
        let texts: Vec<_> = h.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["7", "8", "9"]);
    }

    #[test]
    fn test_entry_from_message() {
        let msg = HubMessage {
            id: "m".into(),
            sender_id: "p2".into(),
            text: "«Paris»".into(),
            ..HubMessage::default()
        };
        let e = HistoryEntry::from(&msg);
        assert_eq!(e.sender_id, "p2");
        assert_eq!(e.text, "«Paris»");
        assert!(!e.sent_by_human);
    }
}
