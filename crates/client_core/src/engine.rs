//! Wires the store, the subscription manager and the pure projections into
//! UI-facing reactive state.
//!
//! Every derived value published here is rebuilt from the latest snapshots
//! on each change. The only state carried between deliveries is what the
//! viewer did locally: the selection, the draft and pending read receipts.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, Weak},
};

use chrono::Utc;
use futures::{stream::FuturesUnordered, StreamExt};
use shared::{
    conversation::ConversationKey,
    domain::{MessageId, User, UserId},
    protocol::SortOrder,
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::{
    badge::unread_badge,
    composer::{Composer, OutboundMessage},
    config::ClientSettings,
    conversations::{aggregate_conversations, Conversation},
    error::{SyncError, ValidationError},
    read_state::{ReadPhase, ReadStateTracker},
    snapshot::{Message, MessageSnapshot},
    store::{MessageQuery, MessageStore, SessionProvider, UserDirectory},
    subscription::{lock, SubscriptionManager},
    thread::project_thread,
    ClientEvent,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationListView {
    pub viewer: Option<UserId>,
    pub conversations: Vec<Conversation>,
    /// A message snapshot has been delivered since sign-in.
    pub loaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadView {
    pub key: ConversationKey,
    pub counterpart: User,
    pub messages: Vec<Message>,
    pub unread_count: usize,
    pub phase: ReadPhase,
}

/// Outcome of the mark-read writes issued when a conversation was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkReadReport {
    pub marked: Vec<MessageId>,
    pub failed: Vec<MessageId>,
}

struct Selection {
    counterpart: UserId,
    key: ConversationKey,
    snapshot: Option<Arc<MessageSnapshot>>,
}

#[derive(Default)]
struct EngineState {
    generation: u64,
    viewer: Option<UserId>,
    directory: Vec<User>,
    list_snapshot: Option<Arc<MessageSnapshot>>,
    selection: Option<Selection>,
    read_state: ReadStateTracker,
    composer: Composer,
    looked_up: HashSet<UserId>,
}

fn list_query(viewer: &UserId) -> MessageQuery {
    MessageQuery::new(viewer.clone(), SortOrder::Descending)
}

fn badge_query(viewer: &UserId) -> MessageQuery {
    MessageQuery::new(viewer.clone(), SortOrder::Unspecified)
}

fn thread_query(viewer: &UserId) -> MessageQuery {
    MessageQuery::new(viewer.clone(), SortOrder::Ascending)
}

pub struct MessagingEngine {
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn UserDirectory>,
    session: Arc<dyn SessionProvider>,
    settings: ClientSettings,
    subscriptions: SubscriptionManager,
    state: Mutex<EngineState>,
    events: broadcast::Sender<ClientEvent>,
    list_tx: watch::Sender<ConversationListView>,
    thread_tx: watch::Sender<Option<ThreadView>>,
    badge_tx: watch::Sender<usize>,
    draft_tx: watch::Sender<String>,
    this: Weak<Self>,
}

impl MessagingEngine {
    pub fn new(
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn UserDirectory>,
        session: Arc<dyn SessionProvider>,
        settings: ClientSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let subscriptions = SubscriptionManager::new(
            Arc::clone(&store),
            settings.resubscribe_policy(),
            events.clone(),
        );
        Arc::new_cyclic(|this| Self {
            store,
            directory,
            session,
            settings,
            subscriptions,
            state: Mutex::new(EngineState::default()),
            events,
            list_tx: watch::channel(ConversationListView::default()).0,
            thread_tx: watch::channel(None).0,
            badge_tx: watch::channel(0).0,
            draft_tx: watch::channel(String::new()).0,
            this: this.clone(),
        })
    }

    pub fn conversations(&self) -> watch::Receiver<ConversationListView> {
        self.list_tx.subscribe()
    }

    pub fn thread(&self) -> watch::Receiver<Option<ThreadView>> {
        self.thread_tx.subscribe()
    }

    pub fn badge(&self) -> watch::Receiver<usize> {
        self.badge_tx.subscribe()
    }

    pub fn draft(&self) -> watch::Receiver<String> {
        self.draft_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn viewer(&self) -> Option<UserId> {
        lock(&self.state).viewer.clone()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.active_count()
    }

    /// Switches to `viewer`, disposing everything held for the previous one.
    /// A directory failure is reported but does not prevent signing in.
    pub async fn sign_in(&self, viewer: UserId) -> Result<(), SyncError> {
        if viewer.as_str().trim().is_empty() {
            return Err(ValidationError::NoViewer.into());
        }
        self.sign_out();
        let generation = {
            let mut state = lock(&self.state);
            state.viewer = Some(viewer.clone());
            self.publish(&state);
            state.generation
        };
        info!(viewer = %viewer, "signed in");

        if let Err(err) = self.refresh_directory().await {
            warn!(viewer = %viewer, error = %err, "failed to load user directory");
            let _ = self.events.send(ClientEvent::Error(err.to_string()));
        }
        if lock(&self.state).generation != generation {
            return Ok(());
        }

        let this = self.this.clone();
        self.subscriptions.subscribe(
            list_query(&viewer),
            Box::new(move |snapshot| {
                if let Some(engine) = this.upgrade() {
                    engine.on_list_snapshot(generation, snapshot);
                }
            }),
        );
        let this = self.this.clone();
        self.subscriptions.subscribe(
            badge_query(&viewer),
            Box::new(move |snapshot| {
                if let Some(engine) = this.upgrade() {
                    engine.on_badge_snapshot(generation, snapshot);
                }
            }),
        );
        Ok(())
    }

    pub fn sign_out(&self) {
        self.subscriptions.dispose_all();
        let mut state = lock(&self.state);
        let previous = state.viewer.take();
        let generation = state.generation + 1;
        *state = EngineState {
            generation,
            ..EngineState::default()
        };
        self.publish(&state);
        self.badge_tx.send_replace(0);
        self.draft_tx.send_replace(String::new());
        if let Some(previous) = previous {
            info!(viewer = %previous, "signed out");
        }
    }

    /// Follows the session provider: signs in, switches or signs out so that
    /// the engine's viewer matches `current_viewer_id()`.
    pub async fn sync_session(&self) -> Result<(), SyncError> {
        let current = self.session.current_viewer_id();
        if current == self.viewer() {
            return Ok(());
        }
        match current {
            Some(viewer) => self.sign_in(viewer).await,
            None => {
                self.sign_out();
                Ok(())
            }
        }
    }

    pub async fn refresh_directory(&self) -> Result<(), SyncError> {
        let generation = lock(&self.state).generation;
        let users = self
            .directory
            .list_users()
            .await
            .map_err(|source| SyncError::Store { source })?;
        let mut state = lock(&self.state);
        if state.generation == generation {
            debug!(users = users.len(), "directory refreshed");
            state.directory = users;
            self.publish(&state);
        }
        Ok(())
    }

    /// Makes `counterpart` the open conversation and marks its unread
    /// messages read. The conversation shows zero unread from the moment it
    /// is selected until every write has settled; failures are reported and
    /// left unread.
    pub async fn select_conversation(
        &self,
        counterpart: &UserId,
    ) -> Result<MarkReadReport, SyncError> {
        let (viewer, key, generation, ids) = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let viewer = state.viewer.clone().ok_or(ValidationError::NoViewer)?;
            let key = ConversationKey::new(&viewer, counterpart)
                .map_err(|_| ValidationError::SelfMessage)?;
            let kept_snapshot = match state.selection.take() {
                Some(previous) if previous.key == key => previous.snapshot,
                Some(previous) => {
                    state.read_state.close(&previous.key);
                    None
                }
                None => None,
            };
            let held = kept_snapshot
                .clone()
                .or_else(|| state.list_snapshot.clone())
                .unwrap_or_default();
            let ids = state.read_state.begin_opening(&viewer, &key, &held);
            state.selection = Some(Selection {
                counterpart: counterpart.clone(),
                key: key.clone(),
                snapshot: kept_snapshot,
            });
            self.publish(state);
            (viewer, key, state.generation, ids)
        };
        info!(
            viewer = %viewer,
            counterpart = %counterpart,
            unread = ids.len(),
            "conversation selected"
        );

        let this = self.this.clone();
        let thread_key = key.clone();
        self.subscriptions.subscribe(
            thread_query(&viewer),
            Box::new(move |snapshot| {
                if let Some(engine) = this.upgrade() {
                    engine.on_thread_snapshot(generation, &thread_key, snapshot);
                }
            }),
        );

        let (mut report, late) = tokio::join!(
            self.write_receipts(generation, &viewer, &key, ids),
            self.catch_up_opening(generation, &viewer, &key),
        );
        if !late.is_empty() {
            debug!(viewer = %viewer, count = late.len(), "marking late arrivals read");
            let more = self.write_receipts(generation, &viewer, &key, late).await;
            report.marked.extend(more.marked);
            report.failed.extend(more.failed);
        }
        Ok(report)
    }

    /// Reads the thread once more so messages the held snapshot had not seen
    /// yet are marked read as part of the same opening.
    async fn catch_up_opening(
        &self,
        generation: u64,
        viewer: &UserId,
        key: &ConversationKey,
    ) -> Vec<MessageId> {
        let fresh = match self.store.fetch_messages(&thread_query(viewer)).await {
            Ok(records) => Arc::new(MessageSnapshot::from_records(&records)),
            Err(err) => {
                warn!(viewer = %viewer, error = %err, "could not refresh messages while opening");
                return Vec::new();
            }
        };
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.generation != generation {
            return Vec::new();
        }
        let Some(selection) = state.selection.as_mut().filter(|s| &s.key == key) else {
            return Vec::new();
        };
        selection.snapshot.get_or_insert_with(|| Arc::clone(&fresh));
        let late = state.read_state.mark_arrivals(viewer, key, &fresh);
        self.publish(state);
        late
    }

    pub fn close_conversation(&self) {
        let viewer = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if let Some(selection) = state.selection.take() {
                state.read_state.close(&selection.key);
            }
            self.publish(state);
            state.viewer.clone()
        };
        if let Some(viewer) = viewer {
            self.subscriptions.dispose(&thread_query(&viewer));
        }
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        let mut state = lock(&self.state);
        state.composer.set_draft(text);
        self.draft_tx.send_replace(state.composer.draft().to_string());
    }

    /// Sends the current draft to the open conversation.
    pub async fn send_draft(&self) -> Result<MessageId, SyncError> {
        let (counterpart, draft) = {
            let state = lock(&self.state);
            if state.viewer.is_none() {
                return Err(ValidationError::NoViewer.into());
            }
            let selection = state
                .selection
                .as_ref()
                .ok_or(ValidationError::NoConversationSelected)?;
            (
                selection.counterpart.clone(),
                state.composer.draft().to_string(),
            )
        };
        self.send(&counterpart, &draft).await
    }

    /// Clears the compose field, then writes the message. On failure the
    /// original text is put back (unless the field was edited meanwhile) and
    /// the error is returned. Success needs no local patching: the new
    /// message arrives through the subscriptions.
    pub async fn send(&self, counterpart: &UserId, content: &str) -> Result<MessageId, SyncError> {
        let (outbound, pending, generation) = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let viewer = state.viewer.clone().ok_or(ValidationError::NoViewer)?;
            let sender_name = state
                .directory
                .iter()
                .find(|user| user.id == viewer)
                .map(|user| user.name.clone());
            let outbound = OutboundMessage::new(&viewer, counterpart, content, Utc::now())?
                .with_sender_name(sender_name);
            let pending = state.composer.begin(content);
            self.draft_tx.send_replace(String::new());
            (outbound, pending, state.generation)
        };

        match self.store.create_message(outbound.into_request()).await {
            Ok(message_id) => {
                lock(&self.state).composer.commit(pending);
                info!(message_id = message_id.0, counterpart = %counterpart, "message sent");
                Ok(message_id)
            }
            Err(source) => {
                let restored = {
                    let mut state = lock(&self.state);
                    if state.generation == generation {
                        let restored = state.composer.rollback(pending);
                        self.draft_tx.send_replace(state.composer.draft().to_string());
                        restored
                    } else {
                        drop(pending);
                        false
                    }
                };
                warn!(counterpart = %counterpart, error = %source, restored, "send failed; draft rolled back");
                let _ = self.events.send(ClientEvent::SendFailed {
                    counterpart: counterpart.clone(),
                    error: format!("{source:#}"),
                });
                Err(SyncError::Send { source })
            }
        }
    }

    fn on_list_snapshot(&self, generation: u64, snapshot: Arc<MessageSnapshot>) {
        let lookups = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if state.generation != generation {
                return;
            }
            let Some(viewer) = state.viewer.clone() else {
                return;
            };
            state.read_state.observe(&viewer, &snapshot);
            state.list_snapshot = Some(snapshot);
            let unknown = self.publish(state);
            unknown
                .into_iter()
                .filter(|id| state.looked_up.insert(id.clone()))
                .collect::<Vec<_>>()
        };
        for user_id in lookups {
            self.spawn_lookup(generation, user_id);
        }
    }

    fn on_badge_snapshot(&self, generation: u64, snapshot: Arc<MessageSnapshot>) {
        let state = lock(&self.state);
        if state.generation != generation {
            return;
        }
        if let Some(viewer) = state.viewer.as_ref() {
            self.badge_tx.send_replace(unread_badge(viewer, &snapshot));
        }
    }

    fn on_thread_snapshot(
        &self,
        generation: u64,
        key: &ConversationKey,
        snapshot: Arc<MessageSnapshot>,
    ) {
        let (viewer, arrivals) = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if state.generation != generation {
                return;
            }
            let Some(viewer) = state.viewer.clone() else {
                return;
            };
            let Some(selection) = state.selection.as_mut().filter(|s| &s.key == key) else {
                return;
            };
            selection.snapshot = Some(Arc::clone(&snapshot));
            state.read_state.observe(&viewer, &snapshot);
            let arrivals = if self.settings.mark_read_while_open {
                state.read_state.mark_arrivals(&viewer, key, &snapshot)
            } else {
                Vec::new()
            };
            self.publish(state);
            (viewer, arrivals)
        };
        if arrivals.is_empty() {
            return;
        }
        let Some(engine) = self.this.upgrade() else {
            return;
        };
        let key = key.clone();
        tokio::spawn(async move {
            engine
                .write_receipts(generation, &viewer, &key, arrivals)
                .await;
        });
    }

    /// Issues the writes concurrently; each settles independently.
    async fn write_receipts(
        &self,
        generation: u64,
        viewer: &UserId,
        key: &ConversationKey,
        ids: Vec<MessageId>,
    ) -> MarkReadReport {
        if ids.is_empty() {
            return MarkReadReport::default();
        }
        debug!(viewer = %viewer, count = ids.len(), "marking messages read");
        let mut pending: FuturesUnordered<_> = ids
            .into_iter()
            .map(|id| async move { (id, self.store.mark_read(id, viewer).await) })
            .collect();

        let mut report = MarkReadReport::default();
        while let Some((id, result)) = pending.next().await {
            let succeeded = match result {
                Ok(()) => {
                    report.marked.push(id);
                    true
                }
                Err(err) => {
                    warn!(viewer = %viewer, message_id = id.0, error = %err, "failed to mark message read");
                    let _ = self.events.send(ClientEvent::MarkReadFailed {
                        message_id: id,
                        error: format!("{err:#}"),
                    });
                    report.failed.push(id);
                    false
                }
            };
            let mut state = lock(&self.state);
            if state.generation == generation {
                state.read_state.complete(key, id, succeeded);
                self.publish(&state);
            }
        }
        report
    }

    fn spawn_lookup(&self, generation: u64, user_id: UserId) {
        let Some(engine) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            match engine.directory.get_user(&user_id).await {
                Ok(Some(user)) => {
                    let mut state = lock(&engine.state);
                    if state.generation != generation {
                        return;
                    }
                    if !state.directory.iter().any(|known| known.id == user.id) {
                        debug!(user_id = %user.id, "resolved counterpart profile");
                        state.directory.push(user);
                    }
                    engine.publish(&state);
                }
                Ok(None) => debug!(user_id = %user_id, "counterpart not in directory"),
                Err(err) => warn!(user_id = %user_id, error = %err, "counterpart lookup failed"),
            }
        });
    }

    /// Recomputes and publishes the list and thread views. Returns the
    /// counterparts that are missing from the directory.
    fn publish(&self, state: &EngineState) -> Vec<UserId> {
        let Some(viewer) = state.viewer.as_ref() else {
            self.list_tx.send_replace(ConversationListView::default());
            self.thread_tx.send_replace(None);
            return Vec::new();
        };
        let empty = MessageSnapshot::empty();
        let snapshot = state.list_snapshot.as_deref().unwrap_or(&empty);

        let mut conversations = aggregate_conversations(
            viewer,
            snapshot,
            &state.directory,
            self.settings.conversation_order,
        );
        for conversation in &mut conversations {
            if conversation.unread_count > 0 {
                conversation.unread_count =
                    state
                        .read_state
                        .displayed_unread(viewer, &conversation.key, snapshot);
            }
        }
        let unknown = conversations
            .iter()
            .filter(|conversation| !conversation.in_directory)
            .map(|conversation| conversation.counterpart.id.clone())
            .collect();

        let thread = state.selection.as_ref().map(|selection| {
            let thread_snapshot = selection.snapshot.as_deref().unwrap_or(snapshot);
            let counterpart = state
                .directory
                .iter()
                .find(|user| user.id == selection.counterpart)
                .cloned()
                .unwrap_or_else(|| User::placeholder(&selection.counterpart));
            ThreadView {
                key: selection.key.clone(),
                counterpart,
                messages: project_thread(viewer, &selection.counterpart, thread_snapshot),
                unread_count: state
                    .read_state
                    .displayed_unread(viewer, &selection.key, thread_snapshot),
                phase: state.read_state.phase(&selection.key).clone(),
            }
        });

        self.list_tx.send_replace(ConversationListView {
            viewer: Some(viewer.clone()),
            conversations,
            loaded: state.list_snapshot.is_some(),
        });
        self.thread_tx.send_replace(thread);
        unknown
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
