//! Batch Item Contracts
//!
//! The shapes an event type must satisfy to be accepted by an aggregator.
//!
//! - [`GroupItem`]: only a grouping key. Accepted by the append-only and
//!   grouped-append aggregators.
//! - [`KeyedGroupItem`]: grouping key + unique key + signed contribution.
//!   Accepted by the deduplicating aggregator.

/// Signed contribution of a keyed fact to its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Contribution {
    /// The fact adds one to its group (like, view)
    Increment,
    /// The fact removes one from its group (unlike)
    Decrement,
}

impl Contribution {
    /// `+1` or `-1`
    #[inline]
    pub fn signed(self) -> i64 {
        match self {
            Contribution::Increment => 1,
            Contribution::Decrement => -1,
        }
    }

    #[inline]
    pub fn is_increment(self) -> bool {
        matches!(self, Contribution::Increment)
    }
}

impl From<bool> for Contribution {
    fn from(increment: bool) -> Self {
        if increment {
            Contribution::Increment
        } else {
            Contribution::Decrement
        }
    }
}

/// An item that belongs to an aggregation bucket.
///
/// All counts and lookups are scoped to the group key, typically an entity
/// id rendered as a string.
pub trait GroupItem: Clone + Send + Sync + 'static {
    /// Opaque key of the aggregation bucket.
    fn group(&self) -> String;
}

/// An item that restates one logical fact within a group.
///
/// Two items with the same `key` are the same fact; only the last one added
/// before a flush survives. `key` must be stable for the lifetime of the item.
pub trait KeyedGroupItem: GroupItem {
    /// Unique identity of the fact (e.g. `"{image}:{user}"`).
    fn key(&self) -> String;

    /// Contribution of the fact's current state.
    fn contribution(&self) -> Contribution;
}
