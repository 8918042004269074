//! Recent-message cache used to spot retransmitted deliveries.

use std::collections::VecDeque;

/// Ring of the last N packet `time` values seen on one transport.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    recent: VecDeque<i64>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `time`. Returns false if it is already in the window.
    pub fn check_and_record(&mut self, time: i64) -> bool {
        if self.recent.contains(&time) {
            return false;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(time);
        true
    }

    pub fn contains(&self, time: i64) -> bool {
        self.recent.contains(&time)
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_delivery_rejected() {
        let mut w = DedupWindow::new(10);
        assert!(w.check_and_record(100));
        assert!(!w.check_and_record(100));
        assert!(w.check_and_record(101));
    }

    #[test]
    fn tolerates_reordering_inside_window() {
        let mut w = DedupWindow::new(10);
        for t in [5, 3, 4, 1, 2] {
            assert!(w.check_and_record(t));
        }
        for t in [1, 2, 3, 4, 5] {
            assert!(!w.check_and_record(t));
        }
    }

    #[test]
    fn forgets_after_cycling() {
        let mut w = DedupWindow::new(10);
        assert!(w.check_and_record(1));
        for t in 2..=11 {
            assert!(w.check_and_record(t));
        }
        assert_eq!(w.len(), 10);
        assert!(!w.contains(1));
        assert!(w.check_and_record(1));
    }
}
