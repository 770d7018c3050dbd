//! Append-only aggregator.
//!
//! Keeps every item in arrival order. Suited to low-volume, order-sensitive
//! logging where duplicates are meaningful. Group lookups are linear scans.

use super::aggregator::{Aggregator, ScanLookup};
use super::item::GroupItem;

#[derive(Debug, Clone)]
pub struct InlineAggregator<T> {
    data: Vec<T>,
}

impl<T> InlineAggregator<T> {
    pub fn new() -> Self {
        InlineAggregator { data: Vec::new() }
    }

    /// Pre-size the backing vector (e.g. to the batcher's max size).
    pub fn with_capacity(capacity: usize) -> Self {
        InlineAggregator {
            data: Vec::with_capacity(capacity),
        }
    }
}

impl<T> Default for InlineAggregator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: GroupItem> Aggregator<T> for InlineAggregator<T> {
    fn add(&mut self, item: T) {
        self.data.push(item);
    }

    fn count(&self) -> usize {
        self.data.len()
    }

    fn count_by_group(&self, group: &str) -> usize {
        self.data.iter().filter(|item| item.group() == group).count()
    }

    fn aggregate(&self) -> Vec<T> {
        self.data.clone()
    }

    fn clear(&mut self) {
        self.data.clear();
    }

    fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.data)
    }
}

impl<T: GroupItem> ScanLookup<T> for InlineAggregator<T> {
    fn scan<P>(&self, group: &str, predicate: P) -> Option<&T>
    where
        P: Fn(&T) -> bool,
    {
        self.data
            .iter()
            .find(|&item| item.group() == group && predicate(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Event {
        group: &'static str,
        seq: u32,
    }

    impl GroupItem for Event {
        fn group(&self) -> String {
            self.group.to_string()
        }
    }

    fn ev(group: &'static str, seq: u32) -> Event {
        Event { group, seq }
    }

    #[test]
    fn test_inline_keeps_duplicates_in_order() {
        let mut agg = InlineAggregator::new();
        agg.add(ev("a", 1));
        agg.add(ev("a", 1));
        agg.add(ev("b", 2));

        assert_eq!(agg.count(), 3);
        assert_eq!(agg.aggregate(), vec![ev("a", 1), ev("a", 1), ev("b", 2)]);
    }

    #[test]
    fn test_inline_count_by_group() {
        let mut agg = InlineAggregator::new();
        agg.add(ev("a", 1));
        agg.add(ev("b", 2));
        agg.add(ev("a", 3));

        assert_eq!(agg.count_by_group("a"), 2);
        assert_eq!(agg.count_by_group("b"), 1);
        assert_eq!(agg.count_by_group("missing"), 0);
    }

    #[test]
    fn test_inline_scan_is_scoped_to_group() {
        let mut agg = InlineAggregator::new();
        agg.add(ev("a", 1));
        agg.add(ev("b", 7));
        agg.add(ev("a", 7));

        let found = agg.scan("a", |e| e.seq == 7).cloned();
        assert_eq!(found, Some(ev("a", 7)));
        assert!(agg.scan("b", |e| e.seq == 1).is_none());
    }

    #[test]
    fn test_inline_drain_empties() {
        let mut agg = InlineAggregator::with_capacity(4);
        agg.add(ev("a", 1));
        agg.add(ev("a", 2));

        let drained = agg.drain();
        assert_eq!(drained.len(), 2);
        assert!(agg.is_empty());
        assert_eq!(agg.count_by_group("a"), 0);
    }
}
