//! Canonical, order-independent key for a two-party conversation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationKeyError {
    #[error("a conversation needs two distinct participants, got {0} twice")]
    SameParticipant(UserId),
    #[error("expected exactly 2 participants, got {0}")]
    WrongArity(usize),
    #[error("participants are not in canonical order: {0} > {1}")]
    NotCanonical(UserId, UserId),
}

/// Sorted pair of distinct user ids.
///
/// `ConversationKey::new(a, b) == ConversationKey::new(b, a)` for every pair.
/// Serialized as the two-element `participants` array carried by every message.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<UserId>", into = "Vec<UserId>")]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    pub fn new(a: &UserId, b: &UserId) -> Result<Self, ConversationKeyError> {
        match a.cmp(b) {
            std::cmp::Ordering::Less => Ok(Self {
                low: a.clone(),
                high: b.clone(),
            }),
            std::cmp::Ordering::Greater => Ok(Self {
                low: b.clone(),
                high: a.clone(),
            }),
            std::cmp::Ordering::Equal => Err(ConversationKeyError::SameParticipant(a.clone())),
        }
    }

    /// Accepts only a list that is already canonical: two distinct ids, sorted.
    pub fn from_participants(participants: &[UserId]) -> Result<Self, ConversationKeyError> {
        let [first, second] = participants else {
            return Err(ConversationKeyError::WrongArity(participants.len()));
        };
        match first.cmp(second) {
            std::cmp::Ordering::Less => Ok(Self {
                low: first.clone(),
                high: second.clone(),
            }),
            std::cmp::Ordering::Equal => {
                Err(ConversationKeyError::SameParticipant(first.clone()))
            }
            std::cmp::Ordering::Greater => Err(ConversationKeyError::NotCanonical(
                first.clone(),
                second.clone(),
            )),
        }
    }

    pub fn participants(&self) -> [&UserId; 2] {
        [&self.low, &self.high]
    }

    pub fn low(&self) -> &UserId {
        &self.low
    }

    pub fn high(&self) -> &UserId {
        &self.high
    }

    pub fn contains(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }

    pub fn counterpart_of(&self, viewer: &UserId) -> Option<&UserId> {
        if &self.low == viewer {
            Some(&self.high)
        } else if &self.high == viewer {
            Some(&self.low)
        } else {
            None
        }
    }

    pub fn to_vec(&self) -> Vec<UserId> {
        vec![self.low.clone(), self.high.clone()]
    }
}

impl TryFrom<Vec<UserId>> for ConversationKey {
    type Error = ConversationKeyError;

    fn try_from(value: Vec<UserId>) -> Result<Self, Self::Error> {
        Self::from_participants(&value)
    }
}

impl From<ConversationKey> for Vec<UserId> {
    fn from(value: ConversationKey) -> Self {
        vec![value.low, value.high]
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}
