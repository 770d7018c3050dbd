//! Image analytics events and read models.

use crate::batch::{Contribution, GroupItem, KeyedGroupItem};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of the random token that keys an anonymous view
pub const ANONYMOUS_TOKEN_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of one viewer's fact about one image: `"{image}:{user}"`
pub fn image_user_key(image_id: ImageId, user_id: UserId) -> String {
    format!("{}:{}", image_id, user_id)
}

fn anonymous_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ANONYMOUS_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Final like state of one user on one image within a flush window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeItem {
    pub image_id: ImageId,
    pub user_id: UserId,
    pub liked: bool,
}

impl LikeItem {
    pub fn like(image_id: ImageId, user_id: UserId) -> Self {
        LikeItem {
            image_id,
            user_id,
            liked: true,
        }
    }

    pub fn unlike(image_id: ImageId, user_id: UserId) -> Self {
        LikeItem {
            image_id,
            user_id,
            liked: false,
        }
    }
}

impl GroupItem for LikeItem {
    fn group(&self) -> String {
        self.image_id.to_string()
    }
}

impl KeyedGroupItem for LikeItem {
    fn key(&self) -> String {
        image_user_key(self.image_id, self.user_id)
    }

    fn contribution(&self) -> Contribution {
        Contribution::from(self.liked)
    }
}

/// One view of an image.
///
/// Identified views are keyed by viewer, so repeated views by the same user
/// collapse into one. Anonymous views get a random token instead, drawn once
/// at construction, and never collapse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewItem {
    pub image_id: ImageId,
    pub user_id: Option<UserId>,
    key: String,
}

impl ViewItem {
    pub fn new(image_id: ImageId, user_id: Option<UserId>) -> Self {
        let key = match user_id {
            Some(user_id) => image_user_key(image_id, user_id),
            None => format!("{}:{}", image_id, anonymous_token()),
        };
        ViewItem {
            image_id,
            user_id,
            key,
        }
    }

    pub fn identified(image_id: ImageId, user_id: UserId) -> Self {
        Self::new(image_id, Some(user_id))
    }

    pub fn anonymous(image_id: ImageId) -> Self {
        Self::new(image_id, None)
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }
}

impl GroupItem for ViewItem {
    fn group(&self) -> String {
        self.image_id.to_string()
    }
}

impl KeyedGroupItem for ViewItem {
    fn key(&self) -> String {
        self.key.clone()
    }

    fn contribution(&self) -> Contribution {
        Contribution::Increment
    }
}

/// Committed counter row of one image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCounters {
    pub views: i64,
    pub likes: i64,
}

/// What one viewer has done to one image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStates {
    pub viewed: bool,
    pub liked: bool,
}

/// Counters of one image including not-yet-committed events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStats {
    pub image_id: ImageId,
    pub views: i64,
    pub likes: i64,
    /// Pending part of `views`
    pub pending_views: usize,
    /// Pending part of `likes`
    pub pending_likes: usize,
}

/// Rows actually written for one image by one bulk statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupDelta {
    pub image_id: ImageId,
    pub count: u64,
}

/// Signed change to one image's counter row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterDelta {
    pub image_id: ImageId,
    pub views: i64,
    pub likes: i64,
}

/// Count rows per image, ordered by image id
pub(crate) fn tally<I>(images: I) -> Vec<GroupDelta>
where
    I: IntoIterator<Item = ImageId>,
{
    let mut counts = std::collections::BTreeMap::new();
    for image_id in images {
        *counts.entry(image_id).or_insert(0u64) += 1;
    }
    counts
        .into_iter()
        .map(|(image_id, count)| GroupDelta { image_id, count })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_item_keys_and_contribution() {
        let like = LikeItem::like(ImageId(7), UserId(1));
        assert_eq!(like.group(), "7");
        assert_eq!(like.key(), "7:1");
        assert_eq!(like.contribution(), Contribution::Increment);

        let unlike = LikeItem::unlike(ImageId(7), UserId(1));
        assert_eq!(unlike.key(), like.key());
        assert_eq!(unlike.contribution(), Contribution::Decrement);
    }

    #[test]
    fn test_identified_view_key() {
        let view = ViewItem::identified(ImageId(3), UserId(9));
        assert_eq!(view.key(), "3:9");
        assert!(!view.is_anonymous());
    }

    #[test]
    fn test_anonymous_view_key_is_stable_and_unique() {
        let view = ViewItem::anonymous(ImageId(3));
        assert!(view.is_anonymous());
        assert_eq!(view.key(), view.key());

        let (prefix, token) = view.key().split_once(':').map(|(a, b)| (a.to_string(), b.to_string())).unwrap();
        assert_eq!(prefix, "3");
        assert_eq!(token.len(), ANONYMOUS_TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));

        let other = ViewItem::anonymous(ImageId(3));
        assert_ne!(view.key(), other.key());
    }

    #[test]
    fn test_tally_groups_and_sorts() {
        let deltas = tally([ImageId(2), ImageId(1), ImageId(2)]);
        assert_eq!(
            deltas,
            vec![
                GroupDelta { image_id: ImageId(1), count: 1 },
                GroupDelta { image_id: ImageId(2), count: 2 },
            ]
        );
        assert!(tally(Vec::new()).is_empty());
    }
}
