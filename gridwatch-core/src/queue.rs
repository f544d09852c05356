use std::collections::VecDeque;

/// FIFO with a fixed capacity whose producer never waits: pushing onto a full
/// queue evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { items: VecDeque::with_capacity(capacity), capacity, dropped: 0 }
    }

    /// Returns `false` when an older entry had to be evicted.
    pub fn push(&mut self, item: T) -> bool {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front();
            self.dropped += 1;
            true
        } else {
            false
        };
        self.items.push_back(item);
        !evicted
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_full() {
        let mut queue = BoundedQueue::new(3);
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.drain(), vec![2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn push_reports_eviction() {
        let mut queue = BoundedQueue::new(1);
        assert!(queue.push("a"));
        assert!(!queue.push("b"));
        assert_eq!(queue.iter().collect::<Vec<_>>(), vec![&"b"]);
    }
}
