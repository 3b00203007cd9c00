use chrono::{DateTime, Utc};
use shared::{
    conversation::ConversationKey,
    domain::{MessageKind, UserId},
    protocol::CreateMessageRequest,
};

use crate::error::ValidationError;

/// A validated message ready to be written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub participants: ConversationKey,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub sender_name: Option<String>,
}

impl OutboundMessage {
    pub fn new(
        viewer: &UserId,
        counterpart: &UserId,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        let participants =
            ConversationKey::new(viewer, counterpart).map_err(|_| ValidationError::SelfMessage)?;
        Ok(Self {
            sender_id: viewer.clone(),
            receiver_id: counterpart.clone(),
            participants,
            content: content.to_string(),
            timestamp,
            kind: MessageKind::Text,
            sender_name: None,
        })
    }

    pub fn with_sender_name(mut self, sender_name: Option<String>) -> Self {
        self.sender_name = sender_name.filter(|name| !name.trim().is_empty());
        self
    }

    /// The sender is the only initial reader.
    pub fn into_request(self) -> CreateMessageRequest {
        CreateMessageRequest {
            read_by: vec![self.sender_id.clone()],
            participants: self.participants.to_vec(),
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            content: self.content,
            timestamp: self.timestamp,
            kind: self.kind,
            sender_name: self.sender_name,
        }
    }
}

/// Tentative half of a send: the compose field has been cleared and the
/// original text is held until the write commits or rolls back.
#[derive(Debug)]
#[must_use = "a pending send must be committed or rolled back"]
pub struct PendingSend {
    original: String,
}

impl PendingSend {
    pub fn original(&self) -> &str {
        &self.original
    }
}

#[derive(Debug, Clone, Default)]
pub struct Composer {
    draft: String,
}

impl Composer {
    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn begin(&mut self, content: &str) -> PendingSend {
        self.draft.clear();
        PendingSend {
            original: content.to_string(),
        }
    }

    pub fn commit(&mut self, pending: PendingSend) {
        drop(pending);
    }

    /// Puts the original text back unless something new was typed meanwhile.
    /// Returns whether the field was restored.
    pub fn rollback(&mut self, pending: PendingSend) -> bool {
        if !self.draft.is_empty() {
            return false;
        }
        self.draft = pending.original;
        true
    }
}
