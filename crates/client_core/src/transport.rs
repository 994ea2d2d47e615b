use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::domain::Channel;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    lock,
    stomp::{Command, Frame},
};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Invoked synchronously with each pushed frame body, in transport order.
pub type PushHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Invoked once when an established connection is lost.
pub type DropNotifier = Arc<dyn Fn(String) + Send + Sync>;

/// Transport-issued handle used to cancel one listen.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LiveToken(pub String);

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, auth_token: &str, on_drop: DropNotifier) -> Result<()>;
    fn subscribe(&self, destination: &str, handler: PushHandler) -> Result<LiveToken>;
    fn unsubscribe(&self, token: &LiveToken) -> Result<()>;
    async fn publish(&self, destination: &str, body: String) -> Result<()>;
    /// Safe to call when nothing is connected.
    async fn close(&self);
}

/// Maps channels to broker destinations. Each channel has exactly one
/// subscribe path for its lifetime.
#[derive(Debug, Clone)]
pub struct DestinationScheme {
    topic_prefix: String,
    app_prefix: String,
    user_prefix: String,
}

impl Default for DestinationScheme {
    fn default() -> Self {
        Self {
            topic_prefix: "/topic".into(),
            app_prefix: "/app".into(),
            user_prefix: "/user".into(),
        }
    }
}

impl DestinationScheme {
    pub fn subscribe_path(&self, channel: Channel) -> String {
        match channel {
            Channel::Direct(match_id) => format!("{}/match/{match_id}", self.topic_prefix),
            Channel::Group(room_id) => format!("{}/group/{room_id}", self.topic_prefix),
            Channel::Notification(user_id) => {
                format!("{}/{user_id}/queue/notifications", self.user_prefix)
            }
        }
    }

    pub fn publish_path(&self, channel: Channel) -> Option<String> {
        match channel {
            Channel::Direct(match_id) => Some(format!("{}/chat/match/{match_id}", self.app_prefix)),
            Channel::Group(room_id) => Some(format!("{}/chat/group/{room_id}", self.app_prefix)),
            Channel::Notification(_) => None,
        }
    }
}

enum WriterCommand {
    Frame(Frame, Option<oneshot::Sender<Result<()>>>),
    Disconnect,
}

struct ActiveSocket {
    commands: mpsc::UnboundedSender<WriterCommand>,
    handlers: Arc<StdMutex<HashMap<String, PushHandler>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// STOMP 1.2 over a single tokio-tungstenite WebSocket.
pub struct StompTransport {
    ws_url: Url,
    next_subscription: AtomicU64,
    active: StdMutex<Option<ActiveSocket>>,
}

impl StompTransport {
    pub fn new(ws_url: &str) -> Result<Self> {
        let ws_url = Url::parse(ws_url).with_context(|| format!("invalid websocket url: {ws_url}"))?;
        if !matches!(ws_url.scheme(), "ws" | "wss") {
            return Err(anyhow!("websocket url must start with ws:// or wss://"));
        }
        Ok(Self {
            ws_url,
            next_subscription: AtomicU64::new(0),
            active: StdMutex::new(None),
        })
    }

    fn send_command(&self, command: WriterCommand) -> Result<()> {
        let guard = lock(&self.active);
        let active = guard
            .as_ref()
            .ok_or_else(|| anyhow!("transport is not connected"))?;
        active
            .commands
            .send(command)
            .map_err(|_| anyhow!("transport writer has stopped"))
    }

    async fn shutdown(active: ActiveSocket) {
        let _ = active.commands.send(WriterCommand::Disconnect);
        active.reader.abort();
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, active.writer)
            .await
            .is_err()
        {
            debug!("stomp writer did not drain before shutdown");
        }
    }
}

#[async_trait]
impl Transport for StompTransport {
    async fn connect(&self, auth_token: &str, on_drop: DropNotifier) -> Result<()> {
        let stale = lock(&self.active).take();
        if let Some(stale) = stale {
            Self::shutdown(stale).await;
        }

        let (ws_stream, _) = connect_async(self.ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.ws_url))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let connect = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", self.ws_url.host_str().unwrap_or("localhost"))
            .header("heart-beat", "0,0")
            .header("Authorization", format!("Bearer {auth_token}"));
        ws_writer
            .send(Message::Text(connect.encode()))
            .await
            .context("failed to send CONNECT frame")?;

        loop {
            match ws_reader.next().await {
                Some(Ok(Message::Text(text))) => match Frame::decode(&text)? {
                    None => continue,
                    Some(frame) if frame.command == Command::Connected => break,
                    Some(frame) if frame.command == Command::Error => {
                        return Err(anyhow!(
                            "broker rejected handshake: {}",
                            frame.get("message").unwrap_or(frame.body.as_str())
                        ));
                    }
                    Some(frame) => {
                        return Err(anyhow!(
                            "unexpected {} frame during handshake",
                            frame.command
                        ));
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(anyhow!("websocket closed during handshake"));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err).context("websocket handshake failed"),
            }
        }
        info!(url = %self.ws_url, "stomp session established");

        let (commands, mut command_rx) = mpsc::unbounded_channel::<WriterCommand>();
        let writer = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    WriterCommand::Frame(frame, ack) => {
                        let result = ws_writer
                            .send(Message::Text(frame.encode()))
                            .await
                            .map_err(|err| anyhow!("websocket send failed: {err}"));
                        let failed = result.is_err();
                        if let Err(err) = &result {
                            error!("{err:#}");
                        }
                        if let Some(ack) = ack {
                            let _ = ack.send(result);
                        }
                        if failed {
                            break;
                        }
                    }
                    WriterCommand::Disconnect => {
                        let frame = Frame::new(Command::Disconnect);
                        let _ = ws_writer.send(Message::Text(frame.encode())).await;
                        let _ = ws_writer.close().await;
                        break;
                    }
                }
            }
        });

        let handlers: Arc<StdMutex<HashMap<String, PushHandler>>> =
            Arc::new(StdMutex::new(HashMap::new()));
        let reader_handlers = Arc::clone(&handlers);
        let reader = tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                        Ok(Some(frame)) if frame.command == Command::Message => {
                            let Some(subscription) = frame.get("subscription") else {
                                warn!("MESSAGE frame without subscription header dropped");
                                continue;
                            };
                            let handler = lock(&reader_handlers).get(subscription).cloned();
                            match handler {
                                Some(handler) => handler(&frame.body),
                                None => debug!(subscription, "push for cancelled subscription"),
                            }
                        }
                        Ok(Some(frame)) if frame.command == Command::Error => {
                            break format!(
                                "broker error: {}",
                                frame.get("message").unwrap_or(frame.body.as_str())
                            );
                        }
                        Ok(_) => {}
                        Err(err) => warn!("undecodable stomp frame dropped: {err}"),
                    },
                    Some(Ok(Message::Close(_))) | None => break "websocket closed".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        error!("websocket receive failed: {err}");
                        break format!("websocket receive failed: {err}");
                    }
                }
            };
            on_drop(reason);
        });

        *lock(&self.active) = Some(ActiveSocket {
            commands,
            handlers,
            reader,
            writer,
        });
        Ok(())
    }

    fn subscribe(&self, destination: &str, handler: PushHandler) -> Result<LiveToken> {
        let id = format!(
            "sub-{}",
            self.next_subscription.fetch_add(1, Ordering::SeqCst)
        );
        let guard = lock(&self.active);
        let active = guard
            .as_ref()
            .ok_or_else(|| anyhow!("transport is not connected"))?;
        lock(&active.handlers).insert(id.clone(), handler);
        let frame = Frame::new(Command::Subscribe)
            .header("id", id.clone())
            .header("destination", destination)
            .header("ack", "auto");
        if active
            .commands
            .send(WriterCommand::Frame(frame, None))
            .is_err()
        {
            lock(&active.handlers).remove(&id);
            return Err(anyhow!("transport writer has stopped"));
        }
        Ok(LiveToken(id))
    }

    fn unsubscribe(&self, token: &LiveToken) -> Result<()> {
        let guard = lock(&self.active);
        let Some(active) = guard.as_ref() else {
            return Ok(());
        };
        lock(&active.handlers).remove(&token.0);
        let frame = Frame::new(Command::Unsubscribe).header("id", token.0.clone());
        active
            .commands
            .send(WriterCommand::Frame(frame, None))
            .map_err(|_| anyhow!("transport writer has stopped"))
    }

    async fn publish(&self, destination: &str, body: String) -> Result<()> {
        let frame = Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_command(WriterCommand::Frame(frame, Some(ack_tx)))?;
        ack_rx
            .await
            .map_err(|_| anyhow!("transport writer stopped before flushing frame"))?
    }

    async fn close(&self) {
        let active = lock(&self.active).take();
        if let Some(active) = active {
            Self::shutdown(active).await;
            info!(url = %self.ws_url, "stomp session closed");
        }
    }
}
