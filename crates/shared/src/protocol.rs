use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{MessageKind, UserId};

/// Server-assigned message id. The backend emits numeric ids for persisted
/// chat rows and string ids for some generated system events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    Text(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(id) => write!(f, "{id}"),
            MessageId::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        MessageId::Number(value)
    }
}

/// A message record exactly as the backend sends it, either in a history
/// response or as a pushed frame body. Every field is optional here; shape
/// checks happen when the record is accepted into a conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<Uuid>,
}

/// Body published for a chat send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundChatMessage {
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub client_nonce: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    pub user_id: UserId,
    pub name: String,
}
