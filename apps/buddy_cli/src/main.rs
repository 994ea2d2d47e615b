use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::{
    load_settings_from, ConversationSessionController, Message, MessageKey, SessionIdentity,
    ViewChange,
};
use shared::domain::{Channel, MatchId, RoomId, UserId};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream, LinesStream},
    StreamExt,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Terminal chat client: opens one conversation, prints it live, and sends
/// every stdin line.
#[derive(Parser, Debug)]
struct Args {
    /// Settings file; defaults to ./buddyfinder.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    user_id: i64,
    #[arg(long, env = "BUDDY_TOKEN")]
    token: String,
    #[arg(long, conflicts_with = "room_id")]
    match_id: Option<i64>,
    #[arg(long)]
    room_id: Option<i64>,
    /// Only listen for notifications.
    #[arg(long, conflicts_with_all = ["match_id", "room_id"])]
    notifications: bool,
}

impl Args {
    fn channel(&self) -> Result<Channel> {
        match (self.match_id, self.room_id, self.notifications) {
            (Some(match_id), None, false) => Ok(Channel::Direct(MatchId(match_id))),
            (None, Some(room_id), false) => Ok(Channel::Group(RoomId(room_id))),
            (None, None, true) => Ok(Channel::Notification(UserId(self.user_id))),
            _ => Err(anyhow!(
                "pass exactly one of --match-id, --room-id or --notifications"
            )),
        }
    }
}

fn print_message(message: &Message) {
    let sender = message
        .sender_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "system".into());
    let marker = if message.is_pending() { " (sending)" } else { "" };
    println!(
        "[{}] {sender}: {}{marker}",
        message.timestamp.format("%H:%M:%S"),
        message.content
    );
}

/// Looks the message up by key; its index may have shifted by the time the
/// view is read.
fn inserted_message(view: Vec<Message>, key: &MessageKey) -> Option<Message> {
    view.into_iter().find(|message| &message.key == key)
}

async fn run_command(
    session: &ConversationSessionController,
    channel: Channel,
    line: &str,
) -> Result<bool> {
    let room = match channel {
        Channel::Group(room_id) => Some(room_id),
        _ => None,
    };
    match (line, room) {
        ("/quit", _) => return Ok(false),
        ("/members", Some(room_id)) => {
            for member in session.members(room_id).await? {
                println!("  {} {}", member.user_id, member.name);
            }
        }
        ("/join", Some(room_id)) => session.join_group(room_id).await?,
        ("/leave", Some(room_id)) => session.leave_group(room_id).await?,
        ("/members" | "/join" | "/leave", None) => {
            println!("only available in group rooms");
        }
        ("", _) => {}
        (text, _) => {
            session.send(channel, text).await?;
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let channel = args.channel()?;
    let settings = load_settings_from(args.config.as_deref())?;

    let session = ConversationSessionController::from_settings(
        &settings,
        SessionIdentity {
            user_id: UserId(args.user_id),
            auth_token: args.token.clone(),
        },
    )?;
    let mut changes = BroadcastStream::new(session.subscribe_changes());

    for message in session.open(channel).await? {
        print_message(&message);
    }
    println!("-- connected to {channel}, type to send, /quit to leave --");

    let mut lines = LinesStream::new(BufReader::new(stdin()).lines());
    loop {
        tokio::select! {
            change = changes.next() => match change {
                Some(Ok(ViewChange::Inserted { channel: changed, key, .. })) if changed == channel => {
                    let message = session.view(channel).and_then(|view| inserted_message(view, &key));
                    if let Some(message) = message {
                        print_message(&message);
                    }
                }
                Some(Ok(ViewChange::RolledBack { channel: changed, content, .. })) if changed == channel => {
                    println!("!! not delivered: {content}");
                }
                Some(Ok(_)) => {}
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(skipped, "view updates lagged");
                }
                None => break,
            },
            line = lines.next() => match line {
                Some(Ok(line)) => match run_command(&session, channel, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => println!("!! {err:#}"),
                },
                Some(Err(err)) => {
                    warn!("stdin read failed: {err}");
                    break;
                }
                None => break,
            },
        }
    }

    session.shutdown().await;
    Ok(())
}
