//! Bounded duplicate suppression.

use std::collections::{HashSet, VecDeque};

use ember_core::MessageId;

/// Remembers the most recent message ids, evicting the oldest first.
#[derive(Debug)]
pub struct DuplicateFilter {
    capacity: usize,
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl DuplicateFilter {
    /// Creates a filter remembering up to `capacity` ids.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Records `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id);
        true
    }

    /// Returns true if `id` is remembered.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    /// Number of remembered ids.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if no id is remembered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rejected() {
        let mut filter = DuplicateFilter::new(10);
        let id = MessageId::random();
        assert!(filter.insert(id));
        assert!(!filter.insert(id));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_oldest_evicted() {
        let mut filter = DuplicateFilter::new(3);
        let ids: Vec<MessageId> = (0..4).map(|_| MessageId::random()).collect();
        for id in &ids {
            assert!(filter.insert(*id));
        }
        assert_eq!(filter.len(), 3);
        assert!(!filter.contains(&ids[0]));
        assert!(filter.contains(&ids[3]));

        assert!(filter.insert(ids[0]));
        assert!(!filter.contains(&ids[1]));
    }
}
