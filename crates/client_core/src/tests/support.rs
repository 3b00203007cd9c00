//! In-memory message store and directory with failure injection.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::{
    conversation::ConversationKey,
    domain::{MessageId, User, UserId},
    protocol::{format_timestamp, CreateMessageRequest, MessageRecord, SortOrder},
};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    config::ClientSettings,
    store::{MessageQuery, MessageStore, SnapshotFeed, UserDirectory},
    subscription::lock,
};

pub(crate) fn uid(raw: &str) -> UserId {
    UserId::from(raw)
}

pub(crate) fn test_settings() -> ClientSettings {
    ClientSettings {
        resubscribe_initial_delay_ms: 5,
        resubscribe_max_delay_ms: 20,
        ..ClientSettings::default()
    }
}

/// Waits until the watched value satisfies `pred`.
pub(crate) async fn wait_for<T: Clone>(
    rx: &mut watch::Receiver<T>,
    pred: impl FnMut(&T) -> bool,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for state")
        .expect("engine dropped")
        .clone()
}

struct Feed {
    query: MessageQuery,
    tx: mpsc::UnboundedSender<Result<Vec<MessageRecord>>>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    clock_ms: i64,
    records: Vec<MessageRecord>,
    users: Vec<User>,
    hidden_users: Vec<User>,
    feeds: Vec<Feed>,
    fail_create: bool,
    fail_mark_read: HashSet<MessageId>,
    fail_open_feed: usize,
    fail_list_users: bool,
    feeds_opened: usize,
    mark_read_calls: Vec<(MessageId, UserId)>,
    create_calls: usize,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    mark_read_gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
    fetch_gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
}

impl MemoryStore {
    pub(crate) fn with_users(users: &[(&str, &str)]) -> Self {
        let store = Self::default();
        lock(&store.inner).users = users.iter().map(|(id, name)| User::new(*id, *name)).collect();
        store
    }

    /// Known to `get_user` but not returned by `list_users`.
    pub(crate) fn add_hidden_user(&self, id: &str, name: &str) {
        lock(&self.inner).hidden_users.push(User::new(id, name));
    }

    /// Writes a well-formed message directly, bypassing any client.
    pub(crate) fn deliver(&self, sender: &str, receiver: &str, content: &str) -> MessageId {
        let sender = uid(sender);
        let receiver = uid(receiver);
        let mut inner = lock(&self.inner);
        inner.clock_ms += 1_000;
        let at = Utc
            .timestamp_millis_opt(1_700_000_000_000 + inner.clock_ms)
            .single()
            .expect("timestamp");
        let participants = ConversationKey::new(&sender, &receiver)
            .expect("distinct")
            .to_vec();
        inner.next_id += 1;
        let id = MessageId(inner.next_id);
        inner.records.push(MessageRecord {
            id,
            read_by: Some(vec![sender.clone()]),
            sender_id: Some(sender),
            receiver_id: Some(receiver),
            participants: Some(participants),
            content: Some(content.to_string()),
            timestamp: Some(format_timestamp(&at)),
            kind: Some("text".into()),
            sender_name: None,
        });
        Self::notify(&mut inner);
        id
    }

    /// Inserts an arbitrary document, malformed or not.
    pub(crate) fn insert_raw(&self, record: MessageRecord) {
        let mut inner = lock(&self.inner);
        inner.next_id = inner.next_id.max(record.id.0);
        inner.records.push(record);
        Self::notify(&mut inner);
    }

    pub(crate) fn fail_create(&self, fail: bool) {
        lock(&self.inner).fail_create = fail;
    }

    pub(crate) fn fail_mark_read(&self, id: MessageId) {
        lock(&self.inner).fail_mark_read.insert(id);
    }

    pub(crate) fn fail_next_feed_opens(&self, count: usize) {
        lock(&self.inner).fail_open_feed = count;
    }

    pub(crate) fn fail_list_users(&self, fail: bool) {
        lock(&self.inner).fail_list_users = fail;
    }

    /// Holds every mark-read write until permits are added to the returned gate.
    pub(crate) fn gate_mark_reads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *lock(&self.mark_read_gate) = Some(Arc::clone(&gate));
        gate
    }

    /// Holds every one-shot fetch until permits are added to the returned gate.
    /// Live queries are not affected.
    pub(crate) fn gate_fetches(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *lock(&self.fetch_gate) = Some(Arc::clone(&gate));
        gate
    }

    /// Drops every open live query with an error.
    pub(crate) fn interrupt_feeds(&self) {
        let mut inner = lock(&self.inner);
        for feed in inner.feeds.drain(..) {
            let _ = feed.tx.send(Err(anyhow!("connection reset")));
        }
    }

    pub(crate) fn open_feed_count(&self) -> usize {
        let mut inner = lock(&self.inner);
        inner.feeds.retain(|feed| !feed.tx.is_closed());
        inner.feeds.len()
    }

    pub(crate) fn feeds_opened(&self) -> usize {
        lock(&self.inner).feeds_opened
    }

    pub(crate) fn create_calls(&self) -> usize {
        lock(&self.inner).create_calls
    }

    pub(crate) fn mark_read_calls(&self) -> Vec<(MessageId, UserId)> {
        lock(&self.inner).mark_read_calls.clone()
    }

    pub(crate) fn record(&self, id: MessageId) -> Option<MessageRecord> {
        lock(&self.inner)
            .records
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    pub(crate) fn record_count(&self) -> usize {
        lock(&self.inner).records.len()
    }

    fn snapshot_for(records: &[MessageRecord], query: &MessageQuery) -> Vec<MessageRecord> {
        let who = &query.participant;
        let mut matching: Vec<MessageRecord> = records
            .iter()
            .filter(|record| {
                record
                    .participants
                    .as_ref()
                    .is_some_and(|participants| participants.contains(who))
                    || record.sender_id.as_ref() == Some(who)
                    || record.receiver_id.as_ref() == Some(who)
            })
            .cloned()
            .collect();
        match query.order {
            SortOrder::Ascending => {
                matching.sort_by(|a, b| (&a.timestamp, a.id).cmp(&(&b.timestamp, b.id)))
            }
            SortOrder::Descending => {
                matching.sort_by(|a, b| (&b.timestamp, b.id).cmp(&(&a.timestamp, a.id)))
            }
            SortOrder::Unspecified => {}
        }
        matching
    }

    fn notify(inner: &mut Inner) {
        let records = &inner.records;
        inner.feeds.retain(|feed| {
            feed.tx
                .send(Ok(Self::snapshot_for(records, &feed.query)))
                .is_ok()
        });
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_message(&self, request: CreateMessageRequest) -> Result<MessageId> {
        let mut inner = lock(&self.inner);
        inner.create_calls += 1;
        if inner.fail_create {
            return Err(anyhow!("simulated store failure"));
        }
        inner.next_id += 1;
        let id = MessageId(inner.next_id);
        let mut read_by = Vec::new();
        for reader in request.read_by {
            if !read_by.contains(&reader) {
                read_by.push(reader);
            }
        }
        inner.records.push(MessageRecord {
            id,
            sender_id: Some(request.sender_id),
            receiver_id: Some(request.receiver_id),
            participants: Some(request.participants),
            content: Some(request.content),
            timestamp: Some(format_timestamp(&request.timestamp)),
            kind: Some(request.kind.as_str().to_string()),
            sender_name: request.sender_name,
            read_by: Some(read_by),
        });
        Self::notify(&mut inner);
        Ok(id)
    }

    async fn mark_read(&self, message_id: MessageId, reader: &UserId) -> Result<()> {
        let gate = lock(&self.mark_read_gate).clone();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }
        let mut inner = lock(&self.inner);
        inner.mark_read_calls.push((message_id, reader.clone()));
        if inner.fail_mark_read.contains(&message_id) {
            return Err(anyhow!("simulated mark-read failure for {}", message_id.0));
        }
        let record = inner
            .records
            .iter_mut()
            .find(|record| record.id == message_id)
            .ok_or_else(|| anyhow!("message {} not found", message_id.0))?;
        let read_by = record.read_by.get_or_insert_with(Vec::new);
        if read_by.contains(reader) {
            return Ok(());
        }
        read_by.push(reader.clone());
        Self::notify(&mut inner);
        Ok(())
    }

    async fn fetch_messages(&self, query: &MessageQuery) -> Result<Vec<MessageRecord>> {
        let gate = lock(&self.fetch_gate).clone();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }
        let inner = lock(&self.inner);
        Ok(Self::snapshot_for(&inner.records, query))
    }

    async fn open_feed(&self, query: &MessageQuery) -> Result<SnapshotFeed> {
        let mut inner = lock(&self.inner);
        if inner.fail_open_feed > 0 {
            inner.fail_open_feed -= 1;
            return Err(anyhow!("simulated connect failure"));
        }
        inner.feeds_opened += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(Self::snapshot_for(&inner.records, query)));
        inner.feeds.push(Feed {
            query: query.clone(),
            tx,
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn list_users(&self) -> Result<Vec<User>> {
        let inner = lock(&self.inner);
        if inner.fail_list_users {
            return Err(anyhow!("simulated directory failure"));
        }
        Ok(inner.users.clone())
    }

    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>> {
        let inner = lock(&self.inner);
        Ok(inner
            .users
            .iter()
            .chain(inner.hidden_users.iter())
            .find(|user| &user.id == user_id)
            .cloned())
    }
}
