use shared::domain::Channel;
use thiserror::Error;

/// Failures surfaced to callers of the sync layer. Nothing here is retried
/// internally; retry and backoff belong to the UI.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("not connected")]
    NotConnected,
    #[error("failed to load history for {channel}: {reason}")]
    HistoryLoad { channel: Channel, reason: String },
    #[error("failed to subscribe to {channel}: {reason}")]
    Subscription { channel: Channel, reason: String },
    #[error("open of {0} was superseded before it completed")]
    Cancelled(Channel),
    #[error("channel {0} does not accept outbound messages")]
    UnsupportedChannel(Channel),
    #[error("failed to encode outbound message: {0}")]
    Encoding(String),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// A pushed or fetched record that failed shape validation. Logged and
/// dropped; never returned from a public operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedMessage {
    #[error("payload is not a message record: {0}")]
    Undecodable(String),
    #[error("message record is missing `{0}`")]
    MissingField(&'static str),
    #[error("message content could not be decoded: {0}")]
    Content(String),
}
