use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    error::{SyncError, SyncResult},
    lock,
    transport::{DropNotifier, LiveToken, PushHandler, Transport},
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

type ConnectAttempt = Shared<BoxFuture<'static, SyncResult<()>>>;

/// Run by [`ConnectionManager::disconnect`] before any listen is cancelled.
pub(crate) type TeardownHook = Box<dyn Fn() + Send + Sync>;

/// Owns the single duplex connection shared by every open conversation.
///
/// Constructed once per signed-in session and passed explicitly to the
/// registry and session controller; [`ConnectionManager::disconnect`] is the
/// teardown at logout.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    connect_timeout: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    closing: Arc<AtomicBool>,
    epoch: AtomicU64,
    inflight: StdMutex<Option<ConnectAttempt>>,
    live: StdMutex<HashMap<LiveToken, String>>,
    teardown_hooks: StdMutex<Vec<TeardownHook>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::with_timeout(transport, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(transport: Arc<dyn Transport>, connect_timeout: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            transport,
            connect_timeout,
            state: Arc::new(state),
            closing: Arc::new(AtomicBool::new(false)),
            epoch: AtomicU64::new(0),
            inflight: StdMutex::new(None),
            live: StdMutex::new(HashMap::new()),
            teardown_hooks: StdMutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Incremented on every successful handshake. Listens issued under an
    /// older epoch died with their connection.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Concurrent callers while a handshake is in flight all await that same
    /// handshake.
    pub async fn connect(self: &Arc<Self>, credential_token: &str) -> SyncResult<()> {
        let attempt = {
            let mut inflight = lock(&self.inflight);
            if let Some(attempt) = inflight.as_ref() {
                attempt.clone()
            } else if self.is_connected() {
                return Ok(());
            } else {
                self.state.send_replace(ConnectionState::Connecting);
                let manager = Arc::clone(self);
                let token = credential_token.to_string();
                let attempt = async move { manager.run_handshake(token).await }
                    .boxed()
                    .shared();
                *inflight = Some(attempt.clone());
                attempt
            }
        };
        attempt.await
    }

    async fn run_handshake(self: Arc<Self>, token: String) -> SyncResult<()> {
        self.closing.store(false, Ordering::SeqCst);
        info!("connecting transport");
        let lost = Arc::new(AtomicBool::new(false));
        let outcome = tokio::time::timeout(
            self.connect_timeout,
            self.transport
                .connect(&token, self.drop_notifier(Arc::clone(&lost))),
        )
        .await;

        let mut result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(SyncError::Connection(format!("{err:#}"))),
            Err(_) => {
                self.transport.close().await;
                Err(SyncError::Connection(format!(
                    "handshake timed out after {}ms",
                    self.connect_timeout.as_millis()
                )))
            }
        };

        let aborted = self.closing.load(Ordering::SeqCst);
        if aborted && result.is_ok() {
            self.transport.close().await;
            result = Err(SyncError::Connection(
                "disconnected while the handshake was in flight".into(),
            ));
        }

        let mut inflight = lock(&self.inflight);
        inflight.take();
        match result {
            Ok(()) => {
                lock(&self.live).clear();
                let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                self.state.send_replace(ConnectionState::Connected);
                // The socket may die before Connected is published.
                if lost.load(Ordering::SeqCst) {
                    self.state.send_replace(ConnectionState::Error);
                    warn!(epoch, "transport dropped right after handshake");
                    return Err(SyncError::Connection(
                        "connection lost right after the handshake".into(),
                    ));
                }
                info!(epoch, "transport connected");
                Ok(())
            }
            Err(err) if aborted => {
                self.state.send_replace(ConnectionState::Disconnected);
                debug!("connect abandoned: {err}");
                Err(err)
            }
            Err(err) => {
                self.state.send_replace(ConnectionState::Error);
                warn!("connect failed: {err}");
                Err(err)
            }
        }
    }

    fn drop_notifier(&self, lost: Arc<AtomicBool>) -> DropNotifier {
        let state = Arc::clone(&self.state);
        let closing = Arc::clone(&self.closing);
        Arc::new(move |reason: String| {
            lost.store(true, Ordering::SeqCst);
            if closing.load(Ordering::SeqCst) {
                debug!(%reason, "transport closed");
                state.send_replace(ConnectionState::Disconnected);
            } else {
                warn!(%reason, "transport dropped");
                state.send_replace(ConnectionState::Error);
            }
        })
    }

    pub(crate) fn on_disconnect(&self, hook: TeardownHook) {
        lock(&self.teardown_hooks).push(hook);
    }

    /// Starts one listen on `destination`. Only the subscription registry
    /// should call this.
    pub(crate) fn listen(&self, destination: &str, handler: PushHandler) -> SyncResult<LiveToken> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let token = self
            .transport
            .subscribe(destination, handler)
            .map_err(|err| SyncError::Connection(format!("{err:#}")))?;
        lock(&self.live).insert(token.clone(), destination.to_string());
        debug!(destination, token = %token.0, "listen started");
        Ok(token)
    }

    /// No-op for tokens from a previous connection or already cancelled.
    pub(crate) fn cancel(&self, token: &LiveToken) {
        let Some(destination) = lock(&self.live).remove(token) else {
            return;
        };
        match self.transport.unsubscribe(token) {
            Ok(()) => debug!(%destination, token = %token.0, "listen cancelled"),
            Err(err) => warn!(%destination, token = %token.0, "failed to cancel listen: {err:#}"),
        }
    }

    pub fn live_listens(&self) -> usize {
        lock(&self.live).len()
    }

    /// Fire-and-forget send. Fails immediately with
    /// [`SyncError::NotConnected`] rather than dropping the payload.
    pub async fn publish(&self, destination: &str, payload: String) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.transport
            .publish(destination, payload)
            .await
            .map_err(|err| SyncError::Connection(format!("{err:#}")))
    }

    /// Cancels every live listen, then releases the transport. Idempotent.
    pub async fn disconnect(&self) {
        self.closing.store(true, Ordering::SeqCst);
        for hook in lock(&self.teardown_hooks).iter() {
            hook();
        }
        let tokens: Vec<LiveToken> = lock(&self.live).drain().map(|(token, _)| token).collect();
        for token in &tokens {
            if let Err(err) = self.transport.unsubscribe(token) {
                debug!(token = %token.0, "unsubscribe during disconnect failed: {err:#}");
            }
        }
        self.transport.close().await;
        let previous = self.state.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            info!(cancelled = tokens.len(), "transport disconnected");
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
