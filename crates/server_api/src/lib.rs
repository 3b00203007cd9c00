use shared::{
    conversation::ConversationKey,
    domain::{MessageId, User, UserId},
    error::{ApiError, ErrorCode},
    protocol::{format_timestamp, CreateMessageRequest, MessageRecord, ServerEvent, SortOrder},
};
use storage::{NewMessage, Storage, StoredMessage};
use tracing::info;

pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy)]
pub struct MessageLimits {
    pub max_message_chars: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
        }
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub limits: MessageLimits,
}

pub async fn list_users(ctx: &ApiContext) -> Result<Vec<User>, ApiError> {
    ctx.storage.list_users().await.map_err(internal)
}

pub async fn get_user(ctx: &ApiContext, user_id: &UserId) -> Result<User, ApiError> {
    ctx.storage
        .load_user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("user {user_id} not found")))
}

pub async fn upsert_user(ctx: &ApiContext, user: User) -> Result<ServerEvent, ApiError> {
    if user.id.as_str().trim().is_empty() {
        return Err(ApiError::validation("user id cannot be empty"));
    }
    if user.name.trim().is_empty() {
        return Err(ApiError::validation("user name cannot be empty"));
    }
    ctx.storage.upsert_user(&user).await.map_err(internal)?;
    Ok(ServerEvent::UserUpdated { user })
}

/// Validates and stores a new message. The returned event carries the
/// canonical participants so it can be fanned out to both parties only.
pub async fn create_message(
    ctx: &ApiContext,
    req: CreateMessageRequest,
) -> Result<(MessageRecord, ServerEvent), ApiError> {
    let participants = ConversationKey::new(&req.sender_id, &req.receiver_id)
        .map_err(|err| ApiError::validation(err.to_string()))?;
    let claimed = ConversationKey::from_participants(&req.participants)
        .map_err(|err| ApiError::validation(format!("malformed participants: {err}")))?;
    if claimed != participants {
        return Err(ApiError::validation(
            "participants must equal the canonical sender/receiver pair",
        ));
    }
    if req.content.trim().is_empty() {
        return Err(ApiError::validation("message content cannot be empty"));
    }
    let chars = req.content.chars().count();
    if chars > ctx.limits.max_message_chars {
        return Err(ApiError::validation(format!(
            "message exceeds {} characters",
            ctx.limits.max_message_chars
        )));
    }
    if req.read_by.iter().any(|reader| reader != &req.sender_id) {
        return Err(ApiError::validation(
            "a new message may only be marked read by its sender",
        ));
    }

    let message_id = ctx
        .storage
        .insert_message(&NewMessage {
            sender_id: req.sender_id,
            receiver_id: req.receiver_id,
            content: req.content,
            kind: req.kind,
            sender_name: req.sender_name.filter(|name| !name.trim().is_empty()),
            sent_at: req.timestamp,
        })
        .await
        .map_err(internal)?;
    let stored = ctx
        .storage
        .load_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Internal, "stored message vanished"))?;

    info!(message_id = message_id.0, %participants, "message created");
    Ok((
        record_from_stored(stored),
        ServerEvent::MessageCreated {
            message_id,
            participants,
        },
    ))
}

/// Adds `reader` to the message's read set. The event is `None` when the
/// receipt already existed, so repeated calls do not wake subscribers.
pub async fn mark_read(
    ctx: &ApiContext,
    message_id: MessageId,
    reader: &UserId,
) -> Result<(Vec<UserId>, Option<ServerEvent>), ApiError> {
    let message = ctx
        .storage
        .load_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("message {} not found", message_id.0)))?;
    if !message.participants.contains(reader) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only conversation participants can mark a message read",
        ));
    }

    let added = ctx
        .storage
        .mark_message_read(message_id, reader)
        .await
        .map_err(internal)?;
    let read_by = ctx
        .storage
        .read_receipts(message_id)
        .await
        .map_err(internal)?;
    let event = added.then(|| ServerEvent::MessageRead {
        message_id,
        participants: message.participants,
        reader: reader.clone(),
    });
    Ok((read_by, event))
}

pub async fn list_messages(
    ctx: &ApiContext,
    participant: &UserId,
    order: SortOrder,
) -> Result<Vec<MessageRecord>, ApiError> {
    let messages = ctx
        .storage
        .list_messages_for_participant(participant, order)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(record_from_stored).collect())
}

pub fn record_from_stored(message: StoredMessage) -> MessageRecord {
    MessageRecord {
        id: message.message_id,
        sender_id: Some(message.sender_id),
        receiver_id: Some(message.receiver_id),
        participants: Some(message.participants.to_vec()),
        content: Some(message.content),
        timestamp: Some(format_timestamp(&message.sent_at)),
        kind: Some(message.kind.as_str().to_string()),
        sender_name: message.sender_name,
        read_by: Some(message.read_by),
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
