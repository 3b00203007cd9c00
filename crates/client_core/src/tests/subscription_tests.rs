use super::*;
use crate::{
    config::ResubscribePolicy,
    test_support::{uid, MemoryStore},
};
use shared::protocol::{MessageRecord, SortOrder};
use std::time::Duration;
use tokio::sync::mpsc;

fn manager(store: &MemoryStore) -> (SubscriptionManager, broadcast::Receiver<ClientEvent>) {
    let (events, events_rx) = broadcast::channel(64);
    let policy = ResubscribePolicy::new(Duration::from_millis(5), Duration::from_millis(20));
    (
        SubscriptionManager::new(Arc::new(store.clone()), policy, events),
        events_rx,
    )
}

fn collector() -> (SnapshotCallback, mpsc::UnboundedReceiver<Arc<MessageSnapshot>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Box::new(move |snapshot| {
            let _ = tx.send(snapshot);
        }),
        rx,
    )
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Arc<MessageSnapshot>>) -> Arc<MessageSnapshot> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for snapshot")
        .expect("subscription dropped")
}

async fn next_event(rx: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn delivers_full_snapshot_on_every_change() {
    let store = MemoryStore::default();
    let (manager, _events) = manager(&store);
    let (callback, mut rx) = collector();
    manager.subscribe(MessageQuery::new(uid("amy"), SortOrder::Ascending), callback);

    assert!(next(&mut rx).await.is_empty());
    store.deliver("bob", "amy", "one");
    assert_eq!(next(&mut rx).await.len(), 1);
    store.deliver("amy", "bob", "two");
    assert_eq!(next(&mut rx).await.len(), 2);
}

#[tokio::test]
async fn same_query_replaces_the_previous_subscription() {
    let store = MemoryStore::default();
    let (manager, _events) = manager(&store);
    let query = MessageQuery::new(uid("amy"), SortOrder::Descending);

    let (first, mut first_rx) = collector();
    let first_id = manager.subscribe(query.clone(), first);
    next(&mut first_rx).await;

    let (second, mut second_rx) = collector();
    let second_id = manager.subscribe(query.clone(), second);
    assert_ne!(first_id, second_id);
    assert_eq!(manager.active_count(), 1);
    assert_eq!(manager.active_id(&query), Some(second_id));
    next(&mut second_rx).await;

    store.deliver("bob", "amy", "hello");
    assert_eq!(next(&mut second_rx).await.len(), 1);
    assert!(first_rx.try_recv().is_err());
}

#[tokio::test]
async fn different_orderings_are_independent_subscriptions() {
    let store = MemoryStore::default();
    let (manager, _events) = manager(&store);
    let (asc, _asc_rx) = collector();
    let (desc, _desc_rx) = collector();
    manager.subscribe(MessageQuery::new(uid("amy"), SortOrder::Ascending), asc);
    manager.subscribe(MessageQuery::new(uid("amy"), SortOrder::Descending), desc);
    assert_eq!(manager.active_count(), 2);

    manager.dispose_all();
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn dispose_stops_delivery_immediately() {
    let store = MemoryStore::default();
    let (manager, _events) = manager(&store);
    let query = MessageQuery::new(uid("amy"), SortOrder::Ascending);
    let (callback, mut rx) = collector();
    manager.subscribe(query.clone(), callback);
    next(&mut rx).await;

    assert!(manager.dispose(&query));
    assert!(!manager.is_active(&query));
    store.deliver("bob", "amy", "late");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert!(!manager.dispose(&query));
}

#[tokio::test]
async fn resubscribes_after_feed_drop_and_reports_recovery() {
    let store = MemoryStore::default();
    let (manager, mut events) = manager(&store);
    let (callback, mut rx) = collector();
    manager.subscribe(MessageQuery::new(uid("amy"), SortOrder::Ascending), callback);
    next(&mut rx).await;

    store.fail_next_feed_opens(2);
    store.interrupt_feeds();
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::SubscriptionInterrupted { .. }
    ));

    let restored = next(&mut rx).await;
    assert!(restored.is_empty());
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::SubscriptionRestored { .. }
    ));
    assert_eq!(store.feeds_opened(), 2);

    store.deliver("bob", "amy", "after reconnect");
    assert_eq!(next(&mut rx).await.len(), 1);
}

#[tokio::test]
async fn integrity_faults_are_reported_once_per_message() {
    let store = MemoryStore::default();
    let (manager, mut events) = manager(&store);
    let (callback, mut rx) = collector();
    manager.subscribe(MessageQuery::new(uid("amy"), SortOrder::Unspecified), callback);
    next(&mut rx).await;

    store.insert_raw(MessageRecord {
        id: MessageId(500),
        sender_id: Some(uid("bob")),
        receiver_id: Some(uid("amy")),
        participants: Some(vec![uid("bob"), uid("amy")]),
        content: Some("backwards".into()),
        timestamp: Some("2024-01-01T00:00:00Z".into()),
        kind: None,
        sender_name: None,
        read_by: None,
    });
    let snapshot = next(&mut rx).await;
    assert!(snapshot.is_empty());
    assert_eq!(snapshot.faults().len(), 1);
    match next_event(&mut events).await {
        ClientEvent::IntegrityFault(fault) => assert_eq!(fault.message_id(), MessageId(500)),
        other => panic!("unexpected event {other:?}"),
    }

    store.deliver("bob", "amy", "fine");
    let snapshot = next(&mut rx).await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.faults().len(), 1);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn dropping_the_manager_closes_feeds() {
    let store = MemoryStore::default();
    let (manager, _events) = manager(&store);
    let (callback, mut rx) = collector();
    manager.subscribe(MessageQuery::new(uid("amy"), SortOrder::Ascending), callback);
    next(&mut rx).await;
    assert_eq!(store.open_feed_count(), 1);

    drop(manager);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.open_feed_count(), 0);
}
