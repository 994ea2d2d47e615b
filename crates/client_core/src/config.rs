use std::{fs, path::Path, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::crypto::{CryptoProvider, PassthroughCrypto, StaticKeyObfuscation};

pub const DEFAULT_SETTINGS_FILE: &str = "buddyfinder.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    /// Derived from `server_url` when unset.
    pub ws_url: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub reconcile_window_ms: u64,
    pub payload_secret: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            ws_url: None,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 15_000,
            reconcile_window_ms: 5_000,
            payload_secret: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    server_url: Option<String>,
    ws_url: Option<String>,
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    reconcile_window_ms: Option<u64>,
    payload_secret: Option<String>,
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconcile_window(&self) -> Duration {
        Duration::from_millis(self.reconcile_window_ms)
    }

    pub fn resolved_ws_url(&self) -> Result<String> {
        if let Some(ws_url) = &self.ws_url {
            return Ok(ws_url.clone());
        }
        let server_url = self.server_url.trim_end_matches('/');
        let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        Ok(format!("{ws_url}/ws"))
    }

    pub fn crypto_provider(&self) -> Result<Arc<dyn CryptoProvider>> {
        match self.payload_secret.as_deref() {
            Some(secret) if !secret.is_empty() => {
                Ok(Arc::new(StaticKeyObfuscation::from_secret(secret)?))
            }
            _ => Ok(Arc::new(PassthroughCrypto)),
        }
    }

    fn merge_file(&mut self, file: FileSettings) {
        if let Some(v) = file.server_url {
            self.server_url = v;
        }
        if let Some(v) = file.ws_url {
            self.ws_url = Some(v);
        }
        if let Some(v) = file.connect_timeout_ms {
            self.connect_timeout_ms = v;
        }
        if let Some(v) = file.request_timeout_ms {
            self.request_timeout_ms = v;
        }
        if let Some(v) = file.reconcile_window_ms {
            self.reconcile_window_ms = v;
        }
        if let Some(v) = file.payload_secret {
            self.payload_secret = Some(v);
        }
    }

    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("BUDDY__SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = var("BUDDY__WS_URL") {
            self.ws_url = Some(v);
        }
        if let Some(v) = var("BUDDY__CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.connect_timeout_ms = v;
        }
        if let Some(v) = var("BUDDY__REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.request_timeout_ms = v;
        }
        if let Some(v) = var("BUDDY__RECONCILE_WINDOW_MS").and_then(|v| v.parse().ok()) {
            self.reconcile_window_ms = v;
        }
        if let Some(v) = var("BUDDY__PAYLOAD_SECRET") {
            self.payload_secret = Some(v);
        }
    }
}

/// Defaults, then `buddyfinder.toml` in the working directory if present,
/// then `BUDDY__*` environment variables.
pub fn load_settings() -> Result<Settings> {
    load_settings_from(None)
}

/// An explicit `path` must exist; the default file is optional.
pub fn load_settings_from(path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();

    let raw = match path {
        Some(path) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))?,
        ),
        None => fs::read_to_string(DEFAULT_SETTINGS_FILE).ok(),
    };
    if let Some(raw) = raw {
        let file: FileSettings = toml::from_str(&raw).context("invalid settings file")?;
        settings.merge_file(file);
    }

    settings.apply_env(|key| std::env::var(key).ok());
    Ok(settings)
}
