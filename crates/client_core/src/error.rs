use thiserror::Error;

/// Precondition violations. These are rejected before any remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message content cannot be empty")]
    EmptyContent,
    #[error("cannot start a conversation with yourself")]
    SelfMessage,
    #[error("no viewer is signed in")]
    NoViewer,
    #[error("no conversation is selected")]
    NoConversationSelected,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("failed to send message: {source}")]
    Send { source: anyhow::Error },
    #[error("message store request failed: {source}")]
    Store { source: anyhow::Error },
}

impl SyncError {
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            SyncError::Validation(err) => Some(err),
            _ => None,
        }
    }
}
