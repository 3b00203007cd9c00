use shared::domain::UserId;

use crate::snapshot::MessageSnapshot;

/// Total unread messages addressed to `viewer` across every conversation.
pub fn unread_badge(viewer: &UserId, snapshot: &MessageSnapshot) -> usize {
    snapshot
        .messages()
        .iter()
        .filter(|message| message.is_unread_for(viewer))
        .count()
}
