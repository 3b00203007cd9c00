//! Narrow interfaces to the collaborators the engine depends on: the remote
//! message store, the user directory and the session/identity provider.

use std::{pin::Pin, sync::RwLock};

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use shared::{
    domain::{MessageId, User, UserId},
    protocol::{CreateMessageRequest, MessageRecord, SortOrder},
};

/// Participant predicate plus ordering. At most one live subscription exists
/// per distinct query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageQuery {
    pub participant: UserId,
    pub order: SortOrder,
}

impl MessageQuery {
    pub fn new(participant: UserId, order: SortOrder) -> Self {
        Self { participant, order }
    }
}

/// Full result sets of a live query, one item per change. The stream ending,
/// or yielding an error, means the live query was dropped.
pub type SnapshotFeed = Pin<Box<dyn Stream<Item = Result<Vec<MessageRecord>>> + Send>>;

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, request: CreateMessageRequest) -> Result<MessageId>;
    /// Adds `reader` to the message's read set. Additive and idempotent.
    async fn mark_read(&self, message_id: MessageId, reader: &UserId) -> Result<()>;
    async fn fetch_messages(&self, query: &MessageQuery) -> Result<Vec<MessageRecord>>;
    async fn open_feed(&self, query: &MessageQuery) -> Result<SnapshotFeed>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn list_users(&self) -> Result<Vec<User>>;
    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>>;
}

pub trait SessionProvider: Send + Sync {
    fn current_viewer_id(&self) -> Option<UserId>;
}

/// Session backed by an explicitly assigned identity.
#[derive(Debug, Default)]
pub struct StaticSession {
    viewer: RwLock<Option<UserId>>,
}

impl StaticSession {
    pub fn new(viewer: Option<UserId>) -> Self {
        Self {
            viewer: RwLock::new(viewer),
        }
    }

    pub fn set(&self, viewer: Option<UserId>) {
        let mut guard = self
            .viewer
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = viewer;
    }
}

impl SessionProvider for StaticSession {
    fn current_viewer_id(&self) -> Option<UserId> {
        self.viewer
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}
