use shared::{conversation::ConversationKey, domain::UserId};

use crate::snapshot::{Message, MessageSnapshot};

/// Messages between `viewer` and `counterpart`, ascending by `(timestamp, id)`.
pub fn project_thread(
    viewer: &UserId,
    counterpart: &UserId,
    snapshot: &MessageSnapshot,
) -> Vec<Message> {
    let Ok(key) = ConversationKey::new(viewer, counterpart) else {
        return Vec::new();
    };
    let mut thread: Vec<Message> = snapshot.in_conversation(&key).cloned().collect();
    thread.sort_by(|a, b| (a.timestamp, a.id).cmp(&(b.timestamp, b.id)));
    thread
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{domain::MessageId, protocol::MessageRecord};

    fn uid(raw: &str) -> UserId {
        UserId::from(raw)
    }

    fn record(id: i64, sender: &str, receiver: &str, at: &str) -> MessageRecord {
        let key = ConversationKey::new(&uid(sender), &uid(receiver)).expect("key");
        MessageRecord {
            id: MessageId(id),
            sender_id: Some(uid(sender)),
            receiver_id: Some(uid(receiver)),
            participants: Some(key.to_vec()),
            content: Some(format!("m{id}")),
            timestamp: Some(at.to_string()),
            kind: None,
            sender_name: None,
            read_by: Some(vec![uid(sender)]),
        }
    }

    fn ids(thread: &[Message]) -> Vec<i64> {
        thread.iter().map(|m| m.id.0).collect()
    }

    #[test]
    fn thread_is_filtered_and_totally_ordered() {
        let snapshot = MessageSnapshot::from_records(&[
            record(5, "bob", "amy", "2024-01-01T10:00:02Z"),
            record(4, "amy", "bob", "2024-01-01T10:00:01Z"),
            record(3, "carol", "amy", "2024-01-01T10:00:00Z"),
            record(2, "bob", "amy", "2024-01-01T10:00:01Z"),
            record(1, "amy", "bob", "2024-01-01T10:00:03Z"),
        ]);
        let thread = project_thread(&uid("amy"), &uid("bob"), &snapshot);
        assert_eq!(ids(&thread), [2, 4, 5, 1]);

        let again = project_thread(&uid("amy"), &uid("bob"), &snapshot);
        assert_eq!(thread, again);
        assert_eq!(project_thread(&uid("bob"), &uid("amy"), &snapshot), thread);
    }

    #[test]
    fn projection_ignores_input_order() {
        let records = vec![
            record(1, "amy", "bob", "2024-01-01T10:00:00Z"),
            record(2, "bob", "amy", "2024-01-01T10:00:00Z"),
            record(3, "bob", "amy", "2024-01-01T09:00:00Z"),
        ];
        let mut reversed = records.clone();
        reversed.reverse();
        let forward =
            project_thread(&uid("amy"), &uid("bob"), &MessageSnapshot::from_records(&records));
        let backward =
            project_thread(&uid("amy"), &uid("bob"), &MessageSnapshot::from_records(&reversed));
        assert_eq!(ids(&forward), [3, 1, 2]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn self_thread_is_empty() {
        let snapshot =
            MessageSnapshot::from_records(&[record(1, "amy", "bob", "2024-01-01T10:00:00Z")]);
        assert!(project_thread(&uid("amy"), &uid("amy"), &snapshot).is_empty());
    }
}
