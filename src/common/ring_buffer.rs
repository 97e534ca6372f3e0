use std::collections::VecDeque;

/// Fixed-capacity sequence that drops its oldest items once full.
///
/// Items are kept in insertion order. The dashboard uses one buffer per
/// telemetry series with [`TELEMETRY_CAPACITY`] slots.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    cap: usize,
}

/// Roughly three minutes of history at one update per second.
pub const TELEMETRY_CAPACITY: usize = 180;

impl<T: Clone> RingBuffer<T> {
    pub fn new(cap: usize) -> Self {
        RingBuffer {
            items: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
        while self.items.len() > self.cap {
            self.items.pop_front();
        }
    }

    /// Owned copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_recent_items_in_arrival_order() {
        let mut buf = RingBuffer::new(3);
        for v in [1, 2, 3, 4] {
            buf.push(v);
        }
        assert_eq!(buf.snapshot(), vec![2, 3, 4]);
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut buf = RingBuffer::new(5);
        for v in 0..100 {
            buf.push(v);
            assert!(buf.len() <= buf.capacity());
        }
        assert_eq!(buf.snapshot(), vec![95, 96, 97, 98, 99]);
    }

    #[test]
    fn snapshot_is_detached_from_buffer() {
        let mut buf = RingBuffer::new(2);
        buf.push("a".to_string());
        let mut snap = buf.snapshot();
        snap.push("b".to_string());
        snap[0].push('x');
        assert_eq!(buf.snapshot(), vec!["a".to_string()]);
    }

    #[test]
    fn clear_empties_buffer() {
        let mut buf = RingBuffer::new(TELEMETRY_CAPACITY);
        buf.push(1.5);
        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.snapshot().is_empty());
    }
}
