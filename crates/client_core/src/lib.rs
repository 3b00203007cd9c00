//! Client-side messaging synchronization: live conversation list, open
//! thread, read receipts, optimistic sending and the global unread badge,
//! all derived from full snapshots pushed by the message store.

use shared::domain::{MessageId, UserId};

pub mod badge;
pub mod composer;
pub mod config;
pub mod conversations;
pub mod engine;
pub mod error;
pub mod http_store;
pub mod read_state;
pub mod snapshot;
pub mod store;
pub mod subscription;
pub mod thread;

pub use config::{ClientSettings, ResubscribePolicy};
pub use conversations::{filter_conversations, Conversation, ConversationOrder, LastMessage};
pub use engine::{ConversationListView, MarkReadReport, MessagingEngine, ThreadView};
pub use error::{SyncError, ValidationError};
pub use http_store::HttpMessageStore;
pub use snapshot::{IntegrityFault, Message, MessageSnapshot};
pub use store::{
    MessageQuery, MessageStore, SessionProvider, SnapshotFeed, StaticSession, UserDirectory,
};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    SubscriptionInterrupted { query: MessageQuery, reason: String },
    SubscriptionRestored { query: MessageQuery },
    IntegrityFault(IntegrityFault),
    MarkReadFailed { message_id: MessageId, error: String },
    SendFailed { counterpart: UserId, error: String },
    Error(String),
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
