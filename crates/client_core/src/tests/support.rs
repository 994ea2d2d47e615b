use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{Channel, RoomId, UserId},
    protocol::{MemberRecord, MessageId, MessageRecord},
};
use tokio::sync::Notify;

use crate::{
    backend::Backend,
    transport::{DropNotifier, LiveToken, PushHandler, Transport},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportOp {
    Connect,
    Subscribe { destination: String, token: String },
    Unsubscribe { token: String },
    Publish { destination: String, body: String },
    Close,
}

/// In-memory transport that records every call in order and lets tests push
/// frames to whatever handlers are currently live.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    ops: Mutex<Vec<TransportOp>>,
    handlers: Mutex<HashMap<String, (String, PushHandler)>>,
    next_token: AtomicU64,
    pub connect_calls: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_publish: AtomicBool,
    pub hang_connect: AtomicBool,
    connect_gate: Mutex<Option<Arc<Notify>>>,
    on_drop: Mutex<Option<DropNotifier>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Holds every `connect` until the returned notify is signalled.
    pub fn gate_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.connect_gate.lock().expect("gate") = Some(Arc::clone(&gate));
        gate
    }

    pub fn ops(&self) -> Vec<TransportOp> {
        self.ops.lock().expect("ops").clone()
    }

    pub fn live_destinations(&self) -> Vec<String> {
        let mut destinations: Vec<String> = self
            .handlers
            .lock()
            .expect("handlers")
            .values()
            .map(|(destination, _)| destination.clone())
            .collect();
        destinations.sort();
        destinations
    }

    /// Returns how many handlers received the body.
    pub fn deliver(&self, destination: &str, body: &str) -> usize {
        let handlers: Vec<PushHandler> = self
            .handlers
            .lock()
            .expect("handlers")
            .values()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in &handlers {
            handler(body);
        }
        handlers.len()
    }

    pub fn drop_connection(&self, reason: &str) {
        self.handlers.lock().expect("handlers").clear();
        let on_drop = self.on_drop.lock().expect("on_drop").clone();
        if let Some(on_drop) = on_drop {
            on_drop(reason.to_string());
        }
    }

    fn record(&self, op: TransportOp) {
        self.ops.lock().expect("ops").push(op);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _auth_token: &str, on_drop: DropNotifier) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.record(TransportOp::Connect);
        let gate = self.connect_gate.lock().expect("gate").clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(anyhow!("handshake refused"));
        }
        *self.on_drop.lock().expect("on_drop") = Some(on_drop);
        Ok(())
    }

    fn subscribe(&self, destination: &str, handler: PushHandler) -> Result<LiveToken> {
        let token = format!("t{}", self.next_token.fetch_add(1, Ordering::SeqCst));
        self.record(TransportOp::Subscribe {
            destination: destination.to_string(),
            token: token.clone(),
        });
        self.handlers
            .lock()
            .expect("handlers")
            .insert(token.clone(), (destination.to_string(), handler));
        Ok(LiveToken(token))
    }

    fn unsubscribe(&self, token: &LiveToken) -> Result<()> {
        self.record(TransportOp::Unsubscribe {
            token: token.0.clone(),
        });
        self.handlers.lock().expect("handlers").remove(&token.0);
        Ok(())
    }

    async fn publish(&self, destination: &str, body: String) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(anyhow!("socket write failed"));
        }
        self.record(TransportOp::Publish {
            destination: destination.to_string(),
            body,
        });
        Ok(())
    }

    async fn close(&self) {
        self.record(TransportOp::Close);
        self.handlers.lock().expect("handlers").clear();
        self.on_drop.lock().expect("on_drop").take();
    }
}

#[derive(Default)]
pub(crate) struct ScriptedBackend {
    pub history: Mutex<HashMap<Channel, Vec<Value>>>,
    pub fail_history: AtomicBool,
    pub fetch_started: Arc<Notify>,
    history_gate: Mutex<Option<Arc<Notify>>>,
    pub commands: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_history(self: Arc<Self>, channel: Channel, records: Vec<MessageRecord>) -> Arc<Self> {
        let raw = records
            .iter()
            .map(|record| serde_json::to_value(record).expect("record json"))
            .collect();
        self.with_raw_history(channel, raw)
    }

    pub fn with_raw_history(self: Arc<Self>, channel: Channel, raw: Vec<Value>) -> Arc<Self> {
        self.history.lock().expect("history").insert(channel, raw);
        self
    }

    pub fn gate_history(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.history_gate.lock().expect("gate") = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn fetch_history(&self, channel: Channel) -> Result<Vec<Value>> {
        self.fetch_started.notify_one();
        let gate = self.history_gate.lock().expect("gate").clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(anyhow!("backend returned 503 Service Unavailable"));
        }
        Ok(self
            .history
            .lock()
            .expect("history")
            .get(&channel)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_members(&self, room_id: RoomId) -> Result<Vec<MemberRecord>> {
        Ok(vec![MemberRecord {
            user_id: UserId(room_id.0 * 10),
            name: "coach".into(),
        }])
    }

    async fn join_group(&self, room_id: RoomId) -> Result<()> {
        self.commands.lock().expect("commands").push(format!("join:{room_id}"));
        Ok(())
    }

    async fn leave_group(&self, room_id: RoomId) -> Result<()> {
        self.commands.lock().expect("commands").push(format!("leave:{room_id}"));
        Ok(())
    }
}

pub(crate) fn record(id: i64, sender: i64, content: &str, at: &str) -> MessageRecord {
    MessageRecord {
        id: Some(MessageId::Number(id)),
        sender_id: Some(UserId(sender)),
        content: Some(content.to_string()),
        timestamp: Some(at.parse().expect("timestamp")),
        ..MessageRecord::default()
    }
}

pub(crate) fn record_json(id: i64, sender: i64, content: &str, at: &str) -> String {
    serde_json::to_string(&record(id, sender, content, at)).expect("json")
}
