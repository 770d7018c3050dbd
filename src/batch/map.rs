//! Grouped-append aggregator.
//!
//! Items are appended to a per-group list. Duplicates within a group are
//! kept (e.g. several raw view events for one image); reads only need "how
//! many pending events for this group".

use super::aggregator::{Aggregator, ScanLookup};
use super::item::GroupItem;
use ahash::AHashMap;

#[derive(Debug, Clone)]
pub struct MapAggregator<T> {
    data: AHashMap<String, Vec<T>>,
    collected: usize,
}

impl<T> MapAggregator<T> {
    pub fn new() -> Self {
        MapAggregator {
            data: AHashMap::new(),
            collected: 0,
        }
    }

    /// Number of groups with at least one pending item
    pub fn group_count(&self) -> usize {
        self.data.len()
    }
}

impl<T> Default for MapAggregator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: GroupItem> Aggregator<T> for MapAggregator<T> {
    fn add(&mut self, item: T) {
        self.data.entry(item.group()).or_default().push(item);
        self.collected += 1;
    }

    fn count(&self) -> usize {
        self.collected
    }

    fn count_by_group(&self, group: &str) -> usize {
        self.data.get(group).map_or(0, Vec::len)
    }

    fn aggregate(&self) -> Vec<T> {
        let mut result = Vec::with_capacity(self.collected);
        for items in self.data.values() {
            result.extend(items.iter().cloned());
        }
        result
    }

    fn clear(&mut self) {
        self.data.clear();
        self.collected = 0;
    }

    fn drain(&mut self) -> Vec<T> {
        let mut result = Vec::with_capacity(self.collected);
        for (_, items) in self.data.drain() {
            result.extend(items);
        }
        self.collected = 0;
        result
    }
}

impl<T: GroupItem> ScanLookup<T> for MapAggregator<T> {
    fn scan<P>(&self, group: &str, predicate: P) -> Option<&T>
    where
        P: Fn(&T) -> bool,
    {
        self.data.get(group)?.iter().find(|&item| predicate(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct View {
        image: u32,
        user: Option<u32>,
    }

    impl GroupItem for View {
        fn group(&self) -> String {
            self.image.to_string()
        }
    }

    #[test]
    fn test_map_counts_per_group() {
        let mut agg = MapAggregator::new();
        agg.add(View { image: 42, user: Some(1) });
        agg.add(View { image: 42, user: Some(1) });
        agg.add(View { image: 42, user: None });
        agg.add(View { image: 7, user: None });

        assert_eq!(agg.count(), 4);
        assert_eq!(agg.group_count(), 2);
        assert_eq!(agg.count_by_group("42"), 3);
        assert_eq!(agg.count_by_group("7"), 1);
        assert_eq!(agg.count_by_group("8"), 0);
    }

    #[test]
    fn test_map_scan_only_looks_in_group() {
        let mut agg = MapAggregator::new();
        agg.add(View { image: 1, user: Some(5) });
        agg.add(View { image: 2, user: Some(5) });

        let hit = agg.scan("2", |v| v.user == Some(5)).cloned();
        assert_eq!(hit, Some(View { image: 2, user: Some(5) }));
        assert!(agg.scan("3", |_| true).is_none());
        assert!(agg.scan("1", |v| v.user.is_none()).is_none());
    }

    #[test]
    fn test_map_aggregate_then_clear() {
        let mut agg = MapAggregator::new();
        for user in 0..5 {
            agg.add(View { image: user % 2, user: Some(user) });
        }

        let snapshot = agg.aggregate();
        assert_eq!(snapshot.len(), 5);
        assert_eq!(agg.count(), 5);

        agg.clear();
        assert!(agg.is_empty());
        assert_eq!(agg.group_count(), 0);
    }

    #[test]
    fn test_map_drain_moves_everything_out() {
        let mut agg = MapAggregator::new();
        agg.add(View { image: 1, user: None });
        agg.add(View { image: 2, user: None });
        agg.add(View { image: 2, user: None });

        let mut drained = agg.drain();
        drained.sort_by_key(|v| v.image);
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].image, 1);
        assert_eq!(agg.count(), 0);
        assert_eq!(agg.count_by_group("2"), 0);
    }
}
