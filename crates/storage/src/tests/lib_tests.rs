use super::*;
use chrono::TimeZone;

fn uid(raw: &str) -> UserId {
    UserId::from(raw)
}

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().expect("timestamp")
}

fn new_message(sender: &str, receiver: &str, content: &str, sent_at_ms: i64) -> NewMessage {
    NewMessage {
        sender_id: uid(sender),
        receiver_id: uid(receiver),
        content: content.to_string(),
        kind: MessageKind::Text,
        sender_name: Some(sender.to_uppercase()),
        sent_at: at(sent_at_ms),
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn upserts_and_lists_users_by_name() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut zoe = User::new("u-zoe", "Zoe");
    storage.upsert_user(&zoe).await.expect("zoe");
    storage
        .upsert_user(&User::new("u-amir", "amir"))
        .await
        .expect("amir");

    zoe.is_online = true;
    zoe.primary_category = Some("Painter".into());
    storage.upsert_user(&zoe).await.expect("zoe update");

    let users = storage.list_users().await.expect("users");
    let names: Vec<_> = users.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["amir", "Zoe"]);

    let loaded = storage
        .load_user(&uid("u-zoe"))
        .await
        .expect("load")
        .expect("present");
    assert!(loaded.is_online);
    assert_eq!(loaded.primary_category.as_deref(), Some("Painter"));
    assert!(storage.load_user(&uid("ghost")).await.expect("load").is_none());
}

#[tokio::test]
async fn inserted_message_is_read_by_its_sender() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let id = storage
        .insert_message(&new_message("bob", "alice", "hi", 1_000))
        .await
        .expect("insert");

    let stored = storage
        .load_message(id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(stored.read_by, vec![uid("bob")]);
    assert_eq!(
        stored.participants,
        ConversationKey::new(&uid("alice"), &uid("bob")).expect("key")
    );
    assert_eq!(stored.sent_at, at(1_000));
    assert_eq!(stored.sender_name.as_deref(), Some("BOB"));
}

#[tokio::test]
async fn rejects_self_addressed_messages() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let err = storage
        .insert_message(&new_message("solo", "solo", "echo", 1))
        .await
        .expect_err("self message");
    assert!(err.to_string().contains("participants"));
}

#[tokio::test]
async fn mark_read_is_additive_and_idempotent() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let id = storage
        .insert_message(&new_message("carol", "dave", "ping", 5))
        .await
        .expect("insert");

    assert!(storage.mark_message_read(id, &uid("dave")).await.expect("first"));
    assert!(!storage.mark_message_read(id, &uid("dave")).await.expect("second"));

    let receipts = storage.read_receipts(id).await.expect("receipts");
    assert_eq!(receipts, vec![uid("carol"), uid("dave")]);
}

#[tokio::test]
async fn concurrent_mark_read_keeps_single_receipt() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let id = storage
        .insert_message(&new_message("carol", "dave", "ping", 5))
        .await
        .expect("insert");

    let dave = uid("dave");
    let (first, second) = tokio::join!(
        storage.mark_message_read(id, &dave),
        storage.mark_message_read(id, &dave)
    );
    let added = [first.expect("first"), second.expect("second")];
    assert_eq!(added.iter().filter(|added| **added).count(), 1);

    let receipts = storage.read_receipts(id).await.expect("receipts");
    assert_eq!(receipts.iter().filter(|u| **u == uid("dave")).count(), 1);
}

#[tokio::test]
async fn lists_participant_messages_in_requested_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = storage
        .insert_message(&new_message("alice", "bob", "one", 100))
        .await
        .expect("one");
    let tie = storage
        .insert_message(&new_message("bob", "alice", "two", 100))
        .await
        .expect("two");
    let last = storage
        .insert_message(&new_message("carol", "alice", "three", 300))
        .await
        .expect("three");
    storage
        .insert_message(&new_message("carol", "dave", "unrelated", 200))
        .await
        .expect("unrelated");

    let ascending = storage
        .list_messages_for_participant(&uid("alice"), SortOrder::Ascending)
        .await
        .expect("asc");
    let ids: Vec<_> = ascending.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![first, tie, last]);

    let descending = storage
        .list_messages_for_participant(&uid("alice"), SortOrder::Descending)
        .await
        .expect("desc");
    let ids: Vec<_> = descending.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![last, tie, first]);

    let unordered = storage
        .list_messages_for_participant(&uid("alice"), SortOrder::Unspecified)
        .await
        .expect("unspecified");
    assert_eq!(unordered.len(), 3);
    assert!(unordered
        .iter()
        .all(|m| m.participants.contains(&uid("alice"))));
}

#[tokio::test]
async fn listed_messages_carry_read_sets() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let id = storage
        .insert_message(&new_message("alice", "bob", "seen?", 10))
        .await
        .expect("insert");
    storage
        .mark_message_read(id, &uid("bob"))
        .await
        .expect("mark");

    let messages = storage
        .list_messages_for_participant(&uid("bob"), SortOrder::Ascending)
        .await
        .expect("list");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].read_by, vec![uid("alice"), uid("bob")]);
}
