use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;
use shared::{
    domain::{Channel, RoomId},
    error::ApiError,
    protocol::MemberRecord,
};
use tracing::debug;

/// REST collaborator: source of truth for history and group membership.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Raw history elements. Each one is validated separately by the caller so
    /// a single bad record cannot reject the whole page.
    async fn fetch_history(&self, channel: Channel) -> Result<Vec<Value>>;
    async fn fetch_members(&self, room_id: RoomId) -> Result<Vec<MemberRecord>>;
    async fn join_group(&self, room_id: RoomId) -> Result<()>;
    async fn leave_group(&self, room_id: RoomId) -> Result<()>;
}

pub struct HttpBackend {
    http: Client,
    server_url: String,
    auth_token: String,
}

impl HttpBackend {
    pub fn new(
        server_url: impl Into<String>,
        auth_token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let server_url = server_url.into();
        if !(server_url.starts_with("http://") || server_url.starts_with("https://")) {
            return Err(anyhow!("server_url must start with http:// or https://"));
        }
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
        })
    }

    fn history_path(channel: Channel) -> String {
        match channel {
            Channel::Direct(match_id) => format!("/api/matches/{match_id}/messages"),
            Channel::Group(room_id) => format!("/api/groups/{room_id}/messages"),
            Channel::Notification(user_id) => format!("/api/users/{user_id}/notifications"),
        }
    }

    async fn post_command(&self, path: String) -> Result<()> {
        let res = self
            .http
            .post(format!("{}{path}", self.server_url))
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))?;
        ensure_success(res).await?;
        Ok(())
    }
}

async fn ensure_success(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(anyhow!("backend returned {status}: {api_error}")),
        Err(_) => Err(anyhow!("backend returned {status}")),
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch_history(&self, channel: Channel) -> Result<Vec<Value>> {
        let path = Self::history_path(channel);
        let res = self
            .http
            .get(format!("{}{path}", self.server_url))
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))?;
        let records: Vec<Value> = ensure_success(res)
            .await?
            .json()
            .await
            .context("history response is not a json array")?;
        debug!(%channel, count = records.len(), "history fetched");
        Ok(records)
    }

    async fn fetch_members(&self, room_id: RoomId) -> Result<Vec<MemberRecord>> {
        let path = format!("/api/groups/{room_id}/members");
        let res = self
            .http
            .get(format!("{}{path}", self.server_url))
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))?;
        ensure_success(res)
            .await?
            .json()
            .await
            .context("members response is not a list of members")
    }

    async fn join_group(&self, room_id: RoomId) -> Result<()> {
        self.post_command(format!("/api/groups/{room_id}/join"))
            .await
    }

    async fn leave_group(&self, room_id: RoomId) -> Result<()> {
        self.post_command(format!("/api/groups/{room_id}/leave"))
            .await
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
