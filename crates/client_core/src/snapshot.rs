//! Validation of raw store documents into an immutable message snapshot.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use shared::{
    conversation::{ConversationKey, ConversationKeyError},
    domain::{MessageId, MessageKind, UserId},
    protocol::MessageRecord,
};
use thiserror::Error;

/// A record that cannot take part in aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityFault {
    #[error("message {} is missing required field `{field}`", .id.0)]
    MissingField { id: MessageId, field: &'static str },
    #[error("message {} has malformed participants: {reason}", .id.0)]
    MalformedParticipants {
        id: MessageId,
        reason: ConversationKeyError,
    },
    #[error("message {} participants do not match its sender and receiver", .id.0)]
    NonCanonicalParticipants { id: MessageId },
    #[error("message {} has unparseable timestamp {raw:?}", .id.0)]
    InvalidTimestamp { id: MessageId, raw: String },
    #[error("message {} has unsupported type {kind:?}", .id.0)]
    UnsupportedKind { id: MessageId, kind: String },
    #[error("message {} is addressed to its own sender", .id.0)]
    SelfAddressed { id: MessageId },
}

impl IntegrityFault {
    pub fn message_id(&self) -> MessageId {
        match self {
            IntegrityFault::MissingField { id, .. }
            | IntegrityFault::MalformedParticipants { id, .. }
            | IntegrityFault::NonCanonicalParticipants { id }
            | IntegrityFault::InvalidTimestamp { id, .. }
            | IntegrityFault::UnsupportedKind { id, .. }
            | IntegrityFault::SelfAddressed { id } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub participants: ConversationKey,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub sender_name: Option<String>,
    pub read_by: BTreeSet<UserId>,
}

impl Message {
    /// Validates a store document. The second value is `true` when the read
    /// set had to be repaired to include the sender.
    pub fn from_record(record: &MessageRecord) -> Result<(Self, bool), IntegrityFault> {
        let id = record.id;
        let missing = |field| IntegrityFault::MissingField { id, field };

        let sender_id = record.sender_id.clone().ok_or_else(|| missing("senderId"))?;
        let receiver_id = record
            .receiver_id
            .clone()
            .ok_or_else(|| missing("receiverId"))?;
        let raw_participants = record
            .participants
            .as_deref()
            .ok_or_else(|| missing("participants"))?;
        let content = record.content.clone().ok_or_else(|| missing("content"))?;
        let raw_timestamp = record
            .timestamp
            .as_deref()
            .ok_or_else(|| missing("timestamp"))?;

        if sender_id == receiver_id {
            return Err(IntegrityFault::SelfAddressed { id });
        }
        let participants = ConversationKey::from_participants(raw_participants)
            .map_err(|reason| IntegrityFault::MalformedParticipants { id, reason })?;
        if ConversationKey::new(&sender_id, &receiver_id).ok().as_ref() != Some(&participants) {
            return Err(IntegrityFault::NonCanonicalParticipants { id });
        }
        let timestamp =
            parse_timestamp(raw_timestamp).ok_or_else(|| IntegrityFault::InvalidTimestamp {
                id,
                raw: raw_timestamp.to_string(),
            })?;
        let kind = match record.kind.as_deref() {
            None => MessageKind::Text,
            Some(raw) => MessageKind::parse(raw).ok_or_else(|| IntegrityFault::UnsupportedKind {
                id,
                kind: raw.to_string(),
            })?,
        };

        let mut read_by: BTreeSet<UserId> = record
            .read_by
            .iter()
            .flatten()
            .filter(|reader| participants.contains(reader))
            .cloned()
            .collect();
        let repaired = read_by.insert(sender_id.clone());

        Ok((
            Self {
                id,
                sender_id,
                receiver_id,
                participants,
                content,
                timestamp,
                kind,
                sender_name: record.sender_name.clone(),
                read_by,
            },
            repaired,
        ))
    }

    /// Received by `viewer` and not yet acknowledged.
    pub fn is_unread_for(&self, viewer: &UserId) -> bool {
        self.participants.contains(viewer)
            && &self.sender_id != viewer
            && !self.read_by.contains(viewer)
    }

    pub fn counterpart_of(&self, viewer: &UserId) -> Option<&UserId> {
        self.participants.counterpart_of(viewer)
    }
}

/// Integer timestamps below this magnitude are epoch seconds, the rest epoch
/// milliseconds. 10^11 s is past the year 5000; 10^11 ms is March 1973.
const EPOCH_MILLIS_FLOOR: i64 = 100_000_000_000;

/// ISO-8601 / RFC 3339, or integer epoch seconds or milliseconds.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let value = raw.parse::<i64>().ok()?;
    if value.unsigned_abs() < EPOCH_MILLIS_FLOOR.unsigned_abs() {
        DateTime::from_timestamp(value, 0)
    } else {
        DateTime::from_timestamp_millis(value)
    }
}

/// Complete, validated result of one live-query delivery. Never mutated after
/// construction; consumers share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct MessageSnapshot {
    messages: Vec<Message>,
    faults: Vec<IntegrityFault>,
    repaired: Vec<MessageId>,
}

impl MessageSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Keeps the store's order. Records that fail validation are excluded and
    /// reported in `faults`; a duplicate id keeps its first valid occurrence.
    pub fn from_records(records: &[MessageRecord]) -> Self {
        let mut snapshot = Self::default();
        let mut seen = BTreeSet::new();
        for record in records {
            match Message::from_record(record) {
                Ok((message, repaired)) => {
                    if !seen.insert(message.id) {
                        continue;
                    }
                    if repaired {
                        snapshot.repaired.push(message.id);
                    }
                    snapshot.messages.push(message);
                }
                Err(fault) => snapshot.faults.push(fault),
            }
        }
        snapshot
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn faults(&self) -> &[IntegrityFault] {
        &self.faults
    }

    /// Ids whose read set did not contain the sender.
    pub fn repaired(&self) -> &[MessageId] {
        &self.repaired
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn in_conversation<'a>(
        &'a self,
        key: &'a ConversationKey,
    ) -> impl Iterator<Item = &'a Message> + 'a {
        self.messages
            .iter()
            .filter(move |message| &message.participants == key)
    }
}
