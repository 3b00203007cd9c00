use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
    },
};

use futures::StreamExt;
use shared::domain::MessageId;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    config::ResubscribePolicy,
    snapshot::MessageSnapshot,
    store::{MessageQuery, MessageStore},
    ClientEvent,
};

/// Receives every full snapshot of one live query, serialized per subscription.
/// A callback must not dispose subscriptions itself.
pub type SnapshotCallback = Box<dyn FnMut(Arc<MessageSnapshot>) + Send>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Callback slot shared between a handle and its delivery task. Delivery and
/// disposal contend for the same lock, so once `disarm` returns no callback
/// is running and none will run again.
struct Delivery {
    callback: Mutex<Option<SnapshotCallback>>,
}

impl Delivery {
    fn deliver(&self, snapshot: Arc<MessageSnapshot>) -> bool {
        let mut guard = lock(&self.callback);
        match guard.as_mut() {
            Some(callback) => {
                callback(snapshot);
                true
            }
            None => false,
        }
    }

    fn disarm(&self) {
        lock(&self.callback).take();
    }

    fn try_disarm(&self) {
        match self.callback.try_lock() {
            Ok(mut guard) => {
                guard.take();
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().take();
            }
            Err(TryLockError::WouldBlock) => {}
        }
    }

    fn is_armed(&self) -> bool {
        lock(&self.callback).is_some()
    }
}

struct ActiveSubscription {
    id: u64,
    delivery: Arc<Delivery>,
    task: JoinHandle<()>,
}

impl ActiveSubscription {
    fn dispose(self) {
        self.delivery.disarm();
        self.task.abort();
    }
}

/// Holds at most one live subscription per [`MessageQuery`].
pub struct SubscriptionManager {
    store: Arc<dyn MessageStore>,
    policy: ResubscribePolicy,
    events: broadcast::Sender<ClientEvent>,
    active: Mutex<HashMap<MessageQuery, ActiveSubscription>>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn MessageStore>,
        policy: ResubscribePolicy,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            store,
            policy,
            events,
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Starts a live query, disposing any subscription already held for the
    /// same query first. Must be called from within a Tokio runtime.
    pub fn subscribe(&self, query: MessageQuery, callback: SnapshotCallback) -> u64 {
        self.dispose(&query);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delivery = Arc::new(Delivery {
            callback: Mutex::new(Some(callback)),
        });
        let task = tokio::spawn(run_subscription(
            id,
            Arc::clone(&self.store),
            query.clone(),
            Arc::clone(&delivery),
            self.policy,
            self.events.clone(),
        ));
        let replaced = lock(&self.active).insert(
            query,
            ActiveSubscription { id, delivery, task },
        );
        if let Some(replaced) = replaced {
            replaced.dispose();
        }
        id
    }

    /// Stops delivery for `query`. No callback for it runs after this returns.
    pub fn dispose(&self, query: &MessageQuery) -> bool {
        let removed = lock(&self.active).remove(query);
        match removed {
            Some(subscription) => {
                subscription.dispose();
                true
            }
            None => false,
        }
    }

    pub fn dispose_all(&self) {
        let drained: Vec<_> = lock(&self.active).drain().map(|(_, sub)| sub).collect();
        for subscription in drained {
            subscription.dispose();
        }
    }

    pub fn is_active(&self, query: &MessageQuery) -> bool {
        lock(&self.active).contains_key(query)
    }

    pub fn active_id(&self, query: &MessageQuery) -> Option<u64> {
        lock(&self.active).get(query).map(|sub| sub.id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        let active = self
            .active
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, subscription) in active.drain() {
            // The manager can be dropped from inside one of its own callbacks.
            subscription.delivery.try_disarm();
            subscription.task.abort();
        }
    }
}

async fn run_subscription(
    id: u64,
    store: Arc<dyn MessageStore>,
    query: MessageQuery,
    delivery: Arc<Delivery>,
    policy: ResubscribePolicy,
    events: broadcast::Sender<ClientEvent>,
) {
    let participant = query.participant.clone();
    let order = query.order.as_query_value();
    let mut delay = policy.initial_delay;
    let mut interrupted = false;
    let mut reported: HashSet<MessageId> = HashSet::new();

    loop {
        let reason = match store.open_feed(&query).await {
            Ok(mut feed) => {
                info!(subscription = id, %participant, order, "subscription open");
                let mut reason = String::from("feed ended");
                while let Some(next) = feed.next().await {
                    let records = match next {
                        Ok(records) => records,
                        Err(err) => {
                            reason = format!("{err:#}");
                            break;
                        }
                    };
                    let snapshot = MessageSnapshot::from_records(&records);
                    for fault in snapshot.faults() {
                        if reported.insert(fault.message_id()) {
                            warn!(subscription = id, fault = %fault, "excluding malformed message");
                            let _ = events.send(ClientEvent::IntegrityFault(fault.clone()));
                        }
                    }
                    if interrupted {
                        interrupted = false;
                        info!(subscription = id, %participant, order, "subscription restored");
                        let _ = events.send(ClientEvent::SubscriptionRestored {
                            query: query.clone(),
                        });
                    }
                    delay = policy.initial_delay;
                    if !delivery.deliver(Arc::new(snapshot)) {
                        return;
                    }
                }
                reason
            }
            Err(err) => format!("{err:#}"),
        };

        if !delivery.is_armed() {
            return;
        }
        warn!(
            subscription = id,
            %participant,
            order,
            error = %reason,
            retry_in_ms = delay.as_millis() as u64,
            "subscription interrupted; resubscribing"
        );
        if !interrupted {
            interrupted = true;
            let _ = events.send(ClientEvent::SubscriptionInterrupted {
                query: query.clone(),
                reason,
            });
        }
        tokio::time::sleep(delay).await;
        delay = policy.next_delay(delay);
    }
}

#[cfg(test)]
#[path = "tests/subscription_tests.rs"]
mod tests;
