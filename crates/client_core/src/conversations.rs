//! Conversation list derived from a message snapshot and the user directory.
//!
//! The list is rebuilt from scratch on every delivery. Nothing here keeps
//! state between calls, so the output is always exactly what the current
//! snapshot implies.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use shared::{
    conversation::ConversationKey,
    domain::{MessageId, User, UserId},
};

use crate::snapshot::{Message, MessageSnapshot};

pub const PLACEHOLDER_TEXT: &str = "Start a conversation!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastMessage {
    /// No message has been exchanged yet.
    Placeholder,
    Message {
        id: MessageId,
        sender_id: UserId,
        content: String,
        timestamp: DateTime<Utc>,
    },
}

impl LastMessage {
    fn from_message(message: &Message) -> Self {
        LastMessage::Message {
            id: message.id,
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
        }
    }

    pub fn preview(&self) -> &str {
        match self {
            LastMessage::Placeholder => PLACEHOLDER_TEXT,
            LastMessage::Message { content, .. } => content,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            LastMessage::Placeholder => None,
            LastMessage::Message { timestamp, .. } => Some(*timestamp),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub key: ConversationKey,
    pub counterpart: User,
    pub last_message: LastMessage,
    pub unread_count: usize,
    /// `false` when the counterpart was only seen in messages.
    pub in_directory: bool,
}

impl Conversation {
    pub fn last_message_time(&self) -> Option<DateTime<Utc>> {
        self.last_message.timestamp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationOrder {
    /// Latest activity first, then conversations without messages.
    #[default]
    RecentActivity,
    /// Directory order, regardless of activity.
    Directory,
}

#[derive(Default)]
struct Tally<'a> {
    last: Option<&'a Message>,
    unread: usize,
}

/// One entry per other directory user, plus one per counterpart that appears
/// in the snapshot but not in the directory. Ties in `RecentActivity` order
/// keep directory order.
pub fn aggregate_conversations(
    viewer: &UserId,
    snapshot: &MessageSnapshot,
    directory: &[User],
    order: ConversationOrder,
) -> Vec<Conversation> {
    let mut tallies: BTreeMap<&UserId, Tally<'_>> = BTreeMap::new();
    for message in snapshot.messages() {
        let Some(counterpart) = message.counterpart_of(viewer) else {
            continue;
        };
        let tally = tallies.entry(counterpart).or_default();
        let newer = tally
            .last
            .map_or(true, |last| (message.timestamp, message.id) > (last.timestamp, last.id));
        if newer {
            tally.last = Some(message);
        }
        if message.is_unread_for(viewer) {
            tally.unread += 1;
        }
    }

    let mut conversations = Vec::with_capacity(directory.len() + tallies.len());
    let mut listed: HashSet<&UserId> = HashSet::new();
    for user in directory {
        if &user.id == viewer || !listed.insert(&user.id) {
            continue;
        }
        let Ok(key) = ConversationKey::new(viewer, &user.id) else {
            continue;
        };
        let tally = tallies.remove(&user.id).unwrap_or_default();
        conversations.push(build(key, user.clone(), tally, true));
    }
    for (counterpart, tally) in tallies {
        let Ok(key) = ConversationKey::new(viewer, counterpart) else {
            continue;
        };
        conversations.push(build(key, User::placeholder(counterpart), tally, false));
    }

    if order == ConversationOrder::RecentActivity {
        conversations.sort_by(|a, b| match (a.last_message_time(), b.last_message_time()) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
    }
    conversations
}

fn build(
    key: ConversationKey,
    counterpart: User,
    tally: Tally<'_>,
    in_directory: bool,
) -> Conversation {
    Conversation {
        key,
        counterpart,
        last_message: tally
            .last
            .map_or(LastMessage::Placeholder, LastMessage::from_message),
        unread_count: tally.unread,
        in_directory,
    }
}

/// Case-insensitive substring match on counterpart name and primary category.
/// An empty query keeps everything.
pub fn filter_conversations(conversations: &[Conversation], query: &str) -> Vec<Conversation> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return conversations.to_vec();
    }
    conversations
        .iter()
        .filter(|conversation| {
            let user = &conversation.counterpart;
            user.name.to_lowercase().contains(&needle)
                || user
                    .primary_category
                    .as_deref()
                    .is_some_and(|category| category.to_lowercase().contains(&needle))
        })
        .cloned()
        .collect()
}

pub fn total_unread(conversations: &[Conversation]) -> usize {
    conversations.iter().map(|c| c.unread_count).sum()
}
