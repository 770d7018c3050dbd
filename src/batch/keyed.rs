//! Deduplicating (keyed-group) aggregator.
//!
//! Items are stored by unique key, last write wins. Suited to toggleable
//! facts (like/unlike) where only the final state per identity matters at
//! flush time.
//!
//! Next to the item map, a per-group counter records how many distinct keys
//! of the group were touched since the last clear. Re-adding a key that is
//! already pending overwrites the item but leaves the counter alone, so a
//! like followed by an unlike in the same window counts as one touched key.

use super::aggregator::{Aggregator, ExactLookup};
use super::item::KeyedGroupItem;
use ahash::AHashMap;

#[derive(Debug, Clone)]
pub struct KeyedAggregator<T> {
    items: AHashMap<String, T>,
    counter: AHashMap<String, usize>,
}

impl<T> KeyedAggregator<T> {
    pub fn new() -> Self {
        KeyedAggregator {
            items: AHashMap::new(),
            counter: AHashMap::new(),
        }
    }
}

impl<T: KeyedGroupItem> KeyedAggregator<T> {
    /// Net signed contribution of the pending items of `group`.
    ///
    /// Unlike [`Aggregator::count_by_group`], an unlike pending for a key
    /// counts as `-1` here. Linear in the number of pending items.
    pub fn net_by_group(&self, group: &str) -> i64 {
        self.items
            .values()
            .filter(|item| item.group() == group)
            .map(|item| item.contribution().signed())
            .sum()
    }
}

impl<T> Default for KeyedAggregator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: KeyedGroupItem> Aggregator<T> for KeyedAggregator<T> {
    fn add(&mut self, item: T) {
        let key = item.key();
        if !self.items.contains_key(&key) {
            *self.counter.entry(item.group()).or_insert(0) += 1;
        }
        self.items.insert(key, item);
    }

    fn count(&self) -> usize {
        self.items.len()
    }

    /// Distinct keys touched in `group` since the last clear.
    fn count_by_group(&self, group: &str) -> usize {
        self.counter.get(group).copied().unwrap_or(0)
    }

    fn aggregate(&self) -> Vec<T> {
        self.items.values().cloned().collect()
    }

    fn clear(&mut self) {
        self.items.clear();
        self.counter.clear();
    }

    fn drain(&mut self) -> Vec<T> {
        self.counter.clear();
        self.items.drain().map(|(_, item)| item).collect()
    }
}

impl<T: KeyedGroupItem> ExactLookup<T> for KeyedAggregator<T> {
    fn lookup(&self, key: &str) -> Option<&T> {
        self.items.get(key)
    }
}
