use std::fmt;

use chrono::{DateTime, Utc};
use shared::{
    domain::{Channel, MessageKind, UserId},
    protocol::{MessageId, MessageRecord},
};
use uuid::Uuid;

use crate::{crypto::CryptoProvider, error::MalformedMessage};

/// Client-generated id of an optimistic message. Also sent to the backend as
/// the correlation nonce of the publish that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(pub Uuid);

impl LocalId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Server(MessageId),
    Local(LocalId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    History,
    Optimistic,
    Push,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub channel: Channel,
    pub sender_id: Option<UserId>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub origin: Origin,
}

impl Message {
    pub fn server_id(&self) -> Option<&MessageId> {
        match &self.key {
            MessageKey::Server(id) => Some(id),
            MessageKey::Local(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.origin == Origin::Optimistic
    }
}

/// A message record that passed boundary validation, with plaintext content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub id: MessageId,
    pub sender_id: Option<UserId>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub client_nonce: Option<Uuid>,
}

impl ServerMessage {
    /// Records without a timestamp are stamped with `received_at`.
    pub fn decode(
        record: MessageRecord,
        crypto: &dyn CryptoProvider,
        received_at: DateTime<Utc>,
    ) -> Result<Self, MalformedMessage> {
        let id = record.id.ok_or(MalformedMessage::MissingField("id"))?;
        let content = record
            .content
            .ok_or(MalformedMessage::MissingField("content"))?;
        let content = crypto
            .decode_content(&content)
            .map_err(|err| MalformedMessage::Content(err.to_string()))?;
        Ok(Self {
            id,
            sender_id: record.sender_id,
            content,
            timestamp: record.timestamp.unwrap_or(received_at),
            kind: record.kind,
            client_nonce: record.client_nonce,
        })
    }

    pub fn parse(
        body: &str,
        crypto: &dyn CryptoProvider,
        received_at: DateTime<Utc>,
    ) -> Result<Self, MalformedMessage> {
        let record: MessageRecord = serde_json::from_str(body)
            .map_err(|err| MalformedMessage::Undecodable(err.to_string()))?;
        Self::decode(record, crypto, received_at)
    }

    /// Validates one element of a fetched history array.
    pub fn from_value(
        value: serde_json::Value,
        crypto: &dyn CryptoProvider,
        received_at: DateTime<Utc>,
    ) -> Result<Self, MalformedMessage> {
        let record: MessageRecord = serde_json::from_value(value)
            .map_err(|err| MalformedMessage::Undecodable(err.to_string()))?;
        Self::decode(record, crypto, received_at)
    }

    pub(crate) fn into_message(self, channel: Channel, origin: Origin) -> Message {
        Message {
            key: MessageKey::Server(self.id),
            channel,
            sender_id: self.sender_id,
            content: self.content,
            timestamp: self.timestamp,
            kind: self.kind,
            origin,
        }
    }
}

/// Mutation notifications for a conversation view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewChange {
    Reset {
        channel: Channel,
        len: usize,
    },
    Inserted {
        channel: Channel,
        key: MessageKey,
        index: usize,
    },
    Confirmed {
        channel: Channel,
        local_id: LocalId,
        id: MessageId,
        index: usize,
    },
    /// The composer should get `content` back.
    RolledBack {
        channel: Channel,
        local_id: LocalId,
        content: String,
    },
    Discarded {
        channel: Channel,
    },
}

impl ViewChange {
    pub fn channel(&self) -> Channel {
        match self {
            ViewChange::Reset { channel, .. }
            | ViewChange::Inserted { channel, .. }
            | ViewChange::Confirmed { channel, .. }
            | ViewChange::RolledBack { channel, .. }
            | ViewChange::Discarded { channel } => *channel,
        }
    }
}
