use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use anyhow::Result;
use chrono::Utc;
use shared::{
    domain::{Channel, RoomId, UserId},
    protocol::{MemberRecord, OutboundChatMessage},
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::{
    backend::{Backend, HttpBackend},
    config::Settings,
    connection::{ConnectionManager, ConnectionState},
    crypto::CryptoProvider,
    error::{SyncError, SyncResult},
    lock,
    reconciler::{Draft, MessageReconciler},
    registry::SubscriptionRegistry,
    transport::{DestinationScheme, PushHandler, StompTransport},
    types::{LocalId, Message, ServerMessage, ViewChange},
};

/// Who is signed in. Injected at construction instead of read from ambient
/// storage.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub auth_token: String,
}

/// Drives the lifecycle of each visible conversation: history load,
/// subscription, sends, teardown.
pub struct ConversationSessionController {
    identity: SessionIdentity,
    connection: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    reconciler: Arc<MessageReconciler>,
    backend: Arc<dyn Backend>,
    crypto: Arc<dyn CryptoProvider>,
    generations: StdMutex<HashMap<Channel, u64>>,
}

impl ConversationSessionController {
    pub fn new(
        identity: SessionIdentity,
        connection: Arc<ConnectionManager>,
        registry: Arc<SubscriptionRegistry>,
        reconciler: Arc<MessageReconciler>,
        backend: Arc<dyn Backend>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            connection,
            registry,
            reconciler,
            backend,
            crypto,
            generations: StdMutex::new(HashMap::new()),
        })
    }

    /// Wires the STOMP transport and HTTP backend described by `settings`.
    pub fn from_settings(settings: &Settings, identity: SessionIdentity) -> Result<Arc<Self>> {
        let transport = Arc::new(StompTransport::new(&settings.resolved_ws_url()?)?);
        let backend = Arc::new(HttpBackend::new(
            settings.server_url.clone(),
            identity.auth_token.clone(),
            settings.request_timeout(),
        )?);
        let connection = ConnectionManager::with_timeout(transport, settings.connect_timeout());
        let registry = SubscriptionRegistry::new(Arc::clone(&connection), DestinationScheme::default());
        let reconciler = Arc::new(MessageReconciler::new(settings.reconcile_window()));
        Ok(Self::new(
            identity,
            connection,
            registry,
            reconciler,
            backend,
            settings.crypto_provider()?,
        ))
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn reconciler(&self) -> &Arc<MessageReconciler> {
        &self.reconciler
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ViewChange> {
        self.reconciler.subscribe_changes()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn view(&self, channel: Channel) -> Option<Vec<Message>> {
        self.reconciler.snapshot(channel)
    }

    fn bump_generation(&self, channel: Channel) -> u64 {
        let mut generations = lock(&self.generations);
        let generation = generations.entry(channel).or_insert(0);
        *generation += 1;
        *generation
    }

    fn is_current(&self, channel: Channel, generation: u64) -> bool {
        lock(&self.generations).get(&channel).copied() == Some(generation)
    }

    fn push_handler(&self, channel: Channel) -> PushHandler {
        let reconciler = Arc::clone(&self.reconciler);
        let crypto = Arc::clone(&self.crypto);
        Arc::new(move |body: &str| {
            reconciler.ingest_raw(channel, body, crypto.as_ref());
        })
    }

    /// Loads history, makes sure the shared connection is up, and subscribes.
    /// A `close` issued while this is suspended makes it return
    /// [`SyncError::Cancelled`] without subscribing. A close during the
    /// history fetch also leaves the view untouched; a close while connecting
    /// comes after the view was seeded, and that view is retained like any
    /// other closed conversation.
    pub async fn open(&self, channel: Channel) -> SyncResult<Vec<Message>> {
        let generation = self.bump_generation(channel);
        info!(%channel, generation, "opening conversation");

        let records = self
            .backend
            .fetch_history(channel)
            .await
            .map_err(|err| SyncError::HistoryLoad {
                channel,
                reason: format!("{err:#}"),
            })?;
        if !self.is_current(channel, generation) {
            debug!(%channel, generation, "discarding stale history response");
            return Err(SyncError::Cancelled(channel));
        }

        let received_at = Utc::now();
        let history: Vec<ServerMessage> = records
            .into_iter()
            .filter_map(|record| {
                ServerMessage::from_value(record, self.crypto.as_ref(), received_at)
                    .map_err(|err| warn!(%channel, "dropping malformed history record: {err}"))
                    .ok()
            })
            .collect();
        self.reconciler.load_history(channel, history);

        if !self.connection.is_connected() {
            self.connection.connect(&self.identity.auth_token).await?;
        }
        if !self.is_current(channel, generation) {
            debug!(%channel, generation, "conversation closed while connecting");
            return Err(SyncError::Cancelled(channel));
        }

        self.registry
            .subscribe(channel, self.push_handler(channel))
            .map_err(|err| match err {
                SyncError::Subscription { .. } => err,
                other => SyncError::Subscription {
                    channel,
                    reason: other.to_string(),
                },
            })?;

        Ok(self.reconciler.snapshot(channel).unwrap_or_default())
    }

    /// Stops live delivery for `channel`. The shared connection and the
    /// retained view are left alone.
    pub fn close(&self, channel: Channel) {
        self.bump_generation(channel);
        if self.registry.unsubscribe(channel) {
            info!(%channel, "conversation closed");
        }
    }

    /// Closes `channel` and drops its retained view.
    pub fn forget(&self, channel: Channel) {
        self.close(channel);
        self.reconciler.remove_view(channel);
    }

    /// Shows the message immediately, then publishes it. On publish failure
    /// the optimistic entry is rolled back, which hands the text back to the
    /// composer through [`ViewChange::RolledBack`].
    pub async fn send(&self, channel: Channel, content: impl Into<String>) -> SyncResult<LocalId> {
        let destination = self
            .registry
            .scheme()
            .publish_path(channel)
            .ok_or(SyncError::UnsupportedChannel(channel))?;
        let draft = Draft::now(self.identity.user_id, content);
        let local_id = self.reconciler.append_optimistic(channel, draft.clone());

        let result = match self.crypto.encode_content(&draft.content) {
            Ok(wire_content) => {
                let body = OutboundChatMessage {
                    sender_id: draft.sender_id,
                    content: wire_content,
                    timestamp: draft.timestamp,
                    client_nonce: local_id.0,
                };
                match serde_json::to_string(&body) {
                    Ok(body) => self.connection.publish(&destination, body).await,
                    Err(err) => Err(SyncError::Encoding(err.to_string())),
                }
            }
            Err(err) => Err(SyncError::Encoding(format!("{err:#}"))),
        };

        match result {
            Ok(()) => {
                debug!(%channel, %local_id, "message published");
                Ok(local_id)
            }
            Err(err) => {
                warn!(%channel, %local_id, "send failed, rolling back: {err}");
                self.reconciler.rollback_optimistic(channel, local_id);
                Err(err)
            }
        }
    }

    pub async fn members(&self, room_id: RoomId) -> Result<Vec<MemberRecord>> {
        self.backend.fetch_members(room_id).await
    }

    /// Membership effects arrive later as system messages on the group channel.
    pub async fn join_group(&self, room_id: RoomId) -> Result<()> {
        self.backend.join_group(room_id).await
    }

    pub async fn leave_group(&self, room_id: RoomId) -> Result<()> {
        self.backend.leave_group(room_id).await
    }

    /// Logout/unmount teardown: every subscription, then the connection.
    pub async fn shutdown(&self) {
        {
            let mut generations = lock(&self.generations);
            for generation in generations.values_mut() {
                *generation += 1;
            }
        }
        self.registry.unsubscribe_all();
        self.connection.disconnect().await;
        info!(user_id = %self.identity.user_id, "session shut down");
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
