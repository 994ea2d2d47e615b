use std::{
    collections::{HashMap, HashSet},
    sync::Mutex as StdMutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::domain::{Channel, MessageKind, UserId};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    crypto::CryptoProvider,
    lock,
    types::{LocalId, Message, MessageKey, Origin, ServerMessage, ViewChange},
};

pub const DEFAULT_RECONCILE_WINDOW: Duration = Duration::from_secs(5);
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// A locally composed message before it reaches the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Draft {
    pub fn now(sender_id: UserId, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// What [`MessageReconciler::confirm_or_append`] did with a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Duplicate,
    Confirmed { local_id: LocalId, index: usize },
    Inserted { index: usize },
    /// No view is held for the channel; the push was dropped.
    Untracked,
}

#[derive(Debug, Default)]
struct ConversationView {
    messages: Vec<Message>,
}

impl ConversationView {
    fn contains_server_id(&self, message: &ServerMessage) -> bool {
        self.messages
            .iter()
            .any(|existing| existing.server_id() == Some(&message.id))
    }

    // Ties keep arrival order: the new entry lands after every equal timestamp.
    fn insert_ordered(&mut self, message: Message) -> usize {
        let index = self
            .messages
            .partition_point(|existing| existing.timestamp <= message.timestamp);
        self.messages.insert(index, message);
        index
    }

    fn pending_match(&self, message: &ServerMessage, window: chrono::Duration) -> Option<usize> {
        if let Some(nonce) = message.client_nonce {
            let key = MessageKey::Local(LocalId(nonce));
            if let Some(index) = self
                .messages
                .iter()
                .position(|existing| existing.is_pending() && existing.key == key)
            {
                return Some(index);
            }
        }
        if message.kind != MessageKind::Normal {
            return None;
        }
        self.messages.iter().position(|existing| {
            existing.is_pending()
                && existing.sender_id.is_some()
                && existing.sender_id == message.sender_id
                && existing.content == message.content
                && (existing.timestamp - message.timestamp).abs() <= window
        })
    }

    fn position_of(&self, key: &MessageKey) -> Option<usize> {
        self.messages.iter().position(|existing| &existing.key == key)
    }
}

/// Merges history, optimistic sends, and pushes into one ordered view per
/// channel. Every operation completes synchronously so pushes are applied in
/// the order the transport delivers them.
pub struct MessageReconciler {
    views: StdMutex<HashMap<Channel, ConversationView>>,
    window: chrono::Duration,
    changes: broadcast::Sender<ViewChange>,
}

impl Default for MessageReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_RECONCILE_WINDOW)
    }
}

impl MessageReconciler {
    pub fn new(window: Duration) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            views: StdMutex::new(HashMap::new()),
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(5)),
            changes,
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ViewChange> {
        self.changes.subscribe()
    }

    fn emit(&self, change: ViewChange) {
        // No receivers just means no UI is watching.
        let _ = self.changes.send(change);
    }

    /// Seeds (or on refresh, replaces) the view for `channel`. Optimistic
    /// entries still awaiting their echo survive unless the history already
    /// contains them.
    pub fn load_history(&self, channel: Channel, history: Vec<ServerMessage>) {
        let len = {
            let mut views = lock(&self.views);
            let pending: Vec<Message> = views
                .remove(&channel)
                .map(|view| view.messages.into_iter().filter(Message::is_pending).collect())
                .unwrap_or_default();

            let mut seen = HashSet::new();
            let mut messages: Vec<Message> = history
                .into_iter()
                .filter(|message| seen.insert(message.id.clone()))
                .map(|message| message.into_message(channel, Origin::History))
                .collect();
            messages.sort_by_key(|message| message.timestamp);

            let mut view = ConversationView { messages };
            for optimistic in pending {
                let already_persisted = view.messages.iter().any(|existing| {
                    existing.sender_id == optimistic.sender_id
                        && existing.content == optimistic.content
                        && (existing.timestamp - optimistic.timestamp).abs() <= self.window
                });
                if !already_persisted {
                    view.insert_ordered(optimistic);
                }
            }
            let len = view.messages.len();
            views.insert(channel, view);
            len
        };
        debug!(%channel, len, "history loaded");
        self.emit(ViewChange::Reset { channel, len });
    }

    /// Creates the view if none is held: a send is an explicit user action.
    pub fn append_optimistic(&self, channel: Channel, draft: Draft) -> LocalId {
        let local_id = LocalId::generate();
        let key = MessageKey::Local(local_id);
        let index = lock(&self.views)
            .entry(channel)
            .or_default()
            .insert_ordered(Message {
                key: key.clone(),
                channel,
                sender_id: Some(draft.sender_id),
                content: draft.content,
                timestamp: draft.timestamp,
                kind: MessageKind::Normal,
                origin: Origin::Optimistic,
            });
        debug!(%channel, %local_id, index, "optimistic message appended");
        self.emit(ViewChange::Inserted {
            channel,
            key,
            index,
        });
        local_id
    }

    /// Applies one server message: ignored if its id is already present,
    /// replaces the matching pending send in place, otherwise inserted by
    /// timestamp. Pushes for a channel with no view (never opened, or
    /// forgotten) never recreate one.
    pub fn confirm_or_append(&self, channel: Channel, message: ServerMessage) -> Reconciled {
        let (outcome, change) = {
            let mut views = lock(&self.views);
            let Some(view) = views.get_mut(&channel) else {
                debug!(%channel, "push for untracked conversation ignored");
                return Reconciled::Untracked;
            };
            if view.contains_server_id(&message) {
                (Reconciled::Duplicate, None)
            } else if let Some(index) = view.pending_match(&message, self.window) {
                let id = message.id.clone();
                let replaced = std::mem::replace(
                    &mut view.messages[index],
                    message.into_message(channel, Origin::Push),
                );
                match replaced.key {
                    MessageKey::Local(local_id) => (
                        Reconciled::Confirmed { local_id, index },
                        Some(ViewChange::Confirmed {
                            channel,
                            local_id,
                            id,
                            index,
                        }),
                    ),
                    MessageKey::Server(_) => (Reconciled::Inserted { index }, None),
                }
            } else {
                let key = MessageKey::Server(message.id.clone());
                let index = view.insert_ordered(message.into_message(channel, Origin::Push));
                (
                    Reconciled::Inserted { index },
                    Some(ViewChange::Inserted {
                        channel,
                        key,
                        index,
                    }),
                )
            }
        };
        match change {
            Some(change) => self.emit(change),
            None => debug!(%channel, "duplicate push ignored"),
        }
        outcome
    }

    /// Entry point for raw push bodies. Malformed payloads are logged and
    /// dropped; the view is left untouched.
    pub fn ingest_raw(
        &self,
        channel: Channel,
        body: &str,
        crypto: &dyn CryptoProvider,
    ) -> Option<Reconciled> {
        match ServerMessage::parse(body, crypto, Utc::now()) {
            Ok(message) => Some(self.confirm_or_append(channel, message)),
            Err(err) => {
                warn!(%channel, "dropping malformed push: {err}");
                None
            }
        }
    }

    /// Removes a pending send and hands back its content for the composer.
    pub fn rollback_optimistic(&self, channel: Channel, local_id: LocalId) -> Option<String> {
        let removed = {
            let mut views = lock(&self.views);
            let view = views.get_mut(&channel)?;
            let index = view.position_of(&MessageKey::Local(local_id))?;
            if !view.messages[index].is_pending() {
                return None;
            }
            view.messages.remove(index)
        };
        debug!(%channel, %local_id, "optimistic message rolled back");
        self.emit(ViewChange::RolledBack {
            channel,
            local_id,
            content: removed.content.clone(),
        });
        Some(removed.content)
    }

    pub fn snapshot(&self, channel: Channel) -> Option<Vec<Message>> {
        lock(&self.views)
            .get(&channel)
            .map(|view| view.messages.clone())
    }

    pub fn has_view(&self, channel: Channel) -> bool {
        lock(&self.views).contains_key(&channel)
    }

    pub fn remove_view(&self, channel: Channel) -> bool {
        let removed = lock(&self.views).remove(&channel).is_some();
        if removed {
            self.emit(ViewChange::Discarded { channel });
        }
        removed
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
