use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use shared::domain::Channel;
use tracing::{debug, info};

use crate::{
    connection::ConnectionManager,
    error::{SyncError, SyncResult},
    lock,
    transport::{DestinationScheme, LiveToken, PushHandler},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub channel: Channel,
    pub destination: String,
    pub token: LiveToken,
    epoch: u64,
}

/// Sole owner of the channel to subscription map. Every mutation runs under
/// one lock, so two changes to the same channel never interleave.
pub struct SubscriptionRegistry {
    connection: Arc<ConnectionManager>,
    scheme: DestinationScheme,
    active: StdMutex<HashMap<Channel, Subscription>>,
}

impl SubscriptionRegistry {
    /// Registers with `connection` so that a disconnect also empties the map.
    pub fn new(connection: Arc<ConnectionManager>, scheme: DestinationScheme) -> Arc<Self> {
        let registry = Arc::new(Self {
            connection,
            scheme,
            active: StdMutex::new(HashMap::new()),
        });
        let weak = Arc::downgrade(&registry);
        registry.connection.on_disconnect(Box::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.drop_all_on_disconnect();
            }
        }));
        registry
    }

    // The connection cancels the listens itself right after this runs.
    fn drop_all_on_disconnect(&self) {
        let dropped = lock(&self.active).drain().count();
        if dropped > 0 {
            debug!(count = dropped, "subscriptions torn down by disconnect");
        }
    }

    pub fn scheme(&self) -> &DestinationScheme {
        &self.scheme
    }

    /// Replaces any existing subscription for `channel`: the old listen is
    /// cancelled before the new one is issued.
    pub fn subscribe(&self, channel: Channel, handler: PushHandler) -> SyncResult<Subscription> {
        let mut active = lock(&self.active);
        if !self.connection.is_connected() {
            return Err(SyncError::NotConnected);
        }
        if let Some(previous) = active.remove(&channel) {
            debug!(%channel, token = %previous.token.0, "replacing existing subscription");
            self.connection.cancel(&previous.token);
        }

        let destination = self.scheme.subscribe_path(channel);
        let token = self
            .connection
            .listen(&destination, handler)
            .map_err(|err| match err {
                SyncError::NotConnected => SyncError::NotConnected,
                other => SyncError::Subscription {
                    channel,
                    reason: other.to_string(),
                },
            })?;
        let subscription = Subscription {
            channel,
            destination,
            token,
            epoch: self.connection.epoch(),
        };
        info!(%channel, destination = %subscription.destination, "subscribed");
        active.insert(channel, subscription.clone());
        Ok(subscription)
    }

    /// Returns whether a subscription was removed.
    pub fn unsubscribe(&self, channel: Channel) -> bool {
        let removed = lock(&self.active).remove(&channel);
        match removed {
            Some(subscription) => {
                self.connection.cancel(&subscription.token);
                info!(%channel, "unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe_all(&self) {
        let drained: Vec<Subscription> = lock(&self.active).drain().map(|(_, sub)| sub).collect();
        for subscription in &drained {
            self.connection.cancel(&subscription.token);
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "unsubscribed all channels");
        }
    }

    /// True only for a subscription issued on the current connection.
    pub fn is_subscribed(&self, channel: Channel) -> bool {
        let epoch = self.connection.epoch();
        self.connection.is_connected()
            && lock(&self.active)
                .get(&channel)
                .is_some_and(|sub| sub.epoch == epoch)
    }

    pub fn subscription(&self, channel: Channel) -> Option<Subscription> {
        lock(&self.active).get(&channel).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
