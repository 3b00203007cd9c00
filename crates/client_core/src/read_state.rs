//! Per-conversation read tracking from the viewer's side.
//!
//! Opening a conversation collects the counterpart's unread messages and
//! hands their ids out for mark-read writes. While those writes are
//! outstanding the conversation shows zero unread. Receipts that were written
//! but not yet reflected by a snapshot stay hidden. Failed ones come back as
//! unread on the next recomputation.

use std::collections::{BTreeSet, HashMap, HashSet};

use shared::{conversation::ConversationKey, domain::MessageId, domain::UserId};

use crate::snapshot::MessageSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPhase {
    Unopened,
    Opening { outstanding: BTreeSet<MessageId> },
    Open,
}

static UNOPENED: ReadPhase = ReadPhase::Unopened;

#[derive(Debug, Default)]
pub struct ReadStateTracker {
    phases: HashMap<ConversationKey, ReadPhase>,
    in_flight: HashSet<MessageId>,
    acknowledged: HashSet<MessageId>,
    failed: HashSet<MessageId>,
}

impl ReadStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, key: &ConversationKey) -> &ReadPhase {
        self.phases.get(key).unwrap_or(&UNOPENED)
    }

    pub fn is_open(&self, key: &ConversationKey) -> bool {
        !matches!(self.phase(key), ReadPhase::Unopened)
    }

    /// Unread messages from the counterpart that no write is pending for.
    fn pending_unread(
        &self,
        viewer: &UserId,
        key: &ConversationKey,
        snapshot: &MessageSnapshot,
        skip_failed: bool,
    ) -> BTreeSet<MessageId> {
        snapshot
            .in_conversation(key)
            .filter(|message| message.is_unread_for(viewer))
            .map(|message| message.id)
            .filter(|id| !self.in_flight.contains(id) && !self.acknowledged.contains(id))
            .filter(|id| !skip_failed || !self.failed.contains(id))
            .collect()
    }

    /// Enters `Opening` (or straight to `Open` when nothing is unread) and
    /// returns the ids to mark read. Earlier failures are retried.
    pub fn begin_opening(
        &mut self,
        viewer: &UserId,
        key: &ConversationKey,
        snapshot: &MessageSnapshot,
    ) -> Vec<MessageId> {
        let ids = self.pending_unread(viewer, key, snapshot, false);
        self.start_writes(key, ids)
    }

    /// Unread ids not yet handed out, once the conversation has started
    /// opening. Failures are not retried here; the next opening retries them.
    pub fn mark_arrivals(
        &mut self,
        viewer: &UserId,
        key: &ConversationKey,
        snapshot: &MessageSnapshot,
    ) -> Vec<MessageId> {
        if !self.is_open(key) {
            return Vec::new();
        }
        let ids = self.pending_unread(viewer, key, snapshot, true);
        self.start_writes(key, ids)
    }

    fn start_writes(&mut self, key: &ConversationKey, ids: BTreeSet<MessageId>) -> Vec<MessageId> {
        for id in &ids {
            self.failed.remove(id);
            self.in_flight.insert(*id);
        }
        let phase = self.phases.entry(key.clone()).or_insert(ReadPhase::Open);
        match phase {
            ReadPhase::Opening { outstanding } => outstanding.extend(ids.iter().copied()),
            _ if ids.is_empty() => *phase = ReadPhase::Open,
            _ => {
                *phase = ReadPhase::Opening {
                    outstanding: ids.clone(),
                }
            }
        }
        ids.into_iter().collect()
    }

    /// Records the outcome of one mark-read write.
    pub fn complete(&mut self, key: &ConversationKey, id: MessageId, succeeded: bool) {
        self.in_flight.remove(&id);
        if succeeded {
            self.acknowledged.insert(id);
        } else {
            self.failed.insert(id);
        }
        if let Some(phase) = self.phases.get_mut(key) {
            if let ReadPhase::Opening { outstanding } = phase {
                outstanding.remove(&id);
                if outstanding.is_empty() {
                    *phase = ReadPhase::Open;
                }
            }
        }
    }

    pub fn close(&mut self, key: &ConversationKey) {
        self.phases.remove(key);
    }

    /// Forgets acknowledgements the snapshot now reflects.
    pub fn observe(&mut self, viewer: &UserId, snapshot: &MessageSnapshot) {
        if self.acknowledged.is_empty() {
            return;
        }
        self.acknowledged.retain(|id| {
            snapshot
                .get(*id)
                .is_some_and(|message| message.is_unread_for(viewer))
        });
    }

    /// Unread count to show for `key`, given the snapshot's recomputed value.
    pub fn displayed_unread(
        &self,
        viewer: &UserId,
        key: &ConversationKey,
        snapshot: &MessageSnapshot,
    ) -> usize {
        if matches!(self.phase(key), ReadPhase::Opening { .. }) {
            return 0;
        }
        snapshot
            .in_conversation(key)
            .filter(|message| message.is_unread_for(viewer))
            .filter(|message| !self.acknowledged.contains(&message.id))
            .count()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
