use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    conversation::ConversationKey,
    domain::{MessageId, MessageKind, User, UserId},
    error::ApiError,
};

/// Order in which a live query returns its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[serde(rename = "asc")]
    Ascending,
    #[serde(rename = "desc")]
    Descending,
    #[default]
    Unspecified,
}

impl SortOrder {
    pub fn as_query_value(self) -> &'static str {
        match self {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
            SortOrder::Unspecified => "unspecified",
        }
    }
}

/// Message document as held by the remote store.
///
/// Everything but the store-assigned id is optional: the store is shared by
/// many writers and a reader must not assume any document is well formed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_by: Option<Vec<UserId>>,
}

/// Body of `POST /messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub participants: Vec<UserId>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub read_by: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub message_id: MessageId,
    pub read_by: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMessagesQuery {
    pub participant: UserId,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageCreated {
        message_id: MessageId,
        participants: ConversationKey,
    },
    MessageRead {
        message_id: MessageId,
        participants: ConversationKey,
        reader: UserId,
    },
    UserUpdated {
        user: User,
    },
    Error(ApiError),
}

impl ServerEvent {
    /// Whether a connection authenticated as `user` should see this event.
    pub fn is_visible_to(&self, user: &UserId) -> bool {
        match self {
            ServerEvent::MessageCreated { participants, .. }
            | ServerEvent::MessageRead { participants, .. } => participants.contains(user),
            ServerEvent::UserUpdated { .. } | ServerEvent::Error(_) => true,
        }
    }

    /// Whether this event changes the result of a participant-scoped message query.
    pub fn touches_messages_of(&self, user: &UserId) -> bool {
        matches!(
            self,
            ServerEvent::MessageCreated { participants, .. }
                | ServerEvent::MessageRead { participants, .. } if participants.contains(user)
        )
    }
}

/// Wire format for message timestamps: RFC 3339, millisecond precision, `Z` suffix.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_tolerates_missing_fields() {
        let record: MessageRecord = serde_json::from_str(r#"{"id": 7}"#).expect("record");
        assert_eq!(record.id, MessageId(7));
        assert!(record.participants.is_none());
        assert!(record.read_by.is_none());
    }

    #[test]
    fn sort_order_uses_short_query_values() {
        let query: ListMessagesQuery =
            serde_json::from_str(r#"{"participant":"u1","order":"desc"}"#).expect("query");
        assert_eq!(query.order, SortOrder::Descending);
        let defaulted: ListMessagesQuery =
            serde_json::from_str(r#"{"participant":"u1"}"#).expect("query");
        assert_eq!(defaulted.order, SortOrder::Unspecified);
    }

    #[test]
    fn message_events_are_scoped_to_participants() {
        let key = ConversationKey::new(&UserId::from("a"), &UserId::from("b")).expect("key");
        let event = ServerEvent::MessageCreated {
            message_id: MessageId(1),
            participants: key,
        };
        assert!(event.is_visible_to(&UserId::from("a")));
        assert!(event.touches_messages_of(&UserId::from("b")));
        assert!(!event.is_visible_to(&UserId::from("c")));

        let profile = ServerEvent::UserUpdated {
            user: User::new("c", "Cleo"),
        };
        assert!(profile.is_visible_to(&UserId::from("a")));
        assert!(!profile.touches_messages_of(&UserId::from("a")));
    }

    #[test]
    fn timestamps_format_with_millis() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T10:15:30.5+02:00")
            .expect("ts")
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(&ts), "2024-03-01T08:15:30.500Z");
    }
}
