use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod backend;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod stomp;
pub mod transport;
pub mod types;

pub use backend::{Backend, HttpBackend};
pub use config::{load_settings, load_settings_from, Settings};
pub use connection::{ConnectionManager, ConnectionState, DEFAULT_CONNECT_TIMEOUT};
pub use crypto::{CryptoProvider, PassthroughCrypto, StaticKeyObfuscation};
pub use error::{MalformedMessage, SyncError, SyncResult};
pub use reconciler::{Draft, MessageReconciler, Reconciled, DEFAULT_RECONCILE_WINDOW};
pub use registry::{Subscription, SubscriptionRegistry};
pub use session::{ConversationSessionController, SessionIdentity};
pub use transport::{
    DestinationScheme, DropNotifier, LiveToken, PushHandler, StompTransport, Transport,
};
pub use types::{LocalId, Message, MessageKey, Origin, ServerMessage, ViewChange};

// Critical sections never await and never panic, so a poisoned lock still
// holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
