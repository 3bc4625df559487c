use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::backoff::ReconnectPolicy;

const DEFAULT_CONFIG_FILE: &str = "chat_client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// REST base, e.g. `http://127.0.0.1:8080/api`.
    pub server_url: String,
    /// Path of the streaming endpoint on the same host.
    pub socket_path: String,
    pub reconnect_attempts: u32,
    pub reconnect_initial_delay_ms: u64,
    pub handshake_timeout_ms: u64,
    pub event_buffer: usize,
    /// Connect in the background when a chat is opened while idle.
    pub auto_connect: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080/api".into(),
            socket_path: "/chat".into(),
            reconnect_attempts: 5,
            reconnect_initial_delay_ms: 1_000,
            handshake_timeout_ms: 10_000,
            event_buffer: 1024,
            auto_connect: true,
        }
    }
}

impl ClientSettings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.reconnect_attempts,
            Duration::from_millis(self.reconnect_initial_delay_ms),
        )
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn api_base_url(&self) -> String {
        self.server_url.trim_end_matches('/').to_string()
    }

    /// Streaming endpoint on the server's host: http becomes ws, https
    /// becomes wss.
    pub fn websocket_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server url: {}", self.server_url))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(anyhow!(
                    "server url must use http:// or https://, got {other}://"
                ))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot use {scheme} for {}", self.server_url))?;
        url.set_path(&self.socket_path);
        url.set_query(None);
        url.set_fragment(None);
        Ok(url.to_string())
    }
}

pub fn config_path() -> PathBuf {
    std::env::var("CHAT_CLIENT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Defaults, then the config file if present, then environment overrides.
pub fn load_settings() -> ClientSettings {
    load_settings_from(&config_path(), |key| std::env::var(key).ok())
}

pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> ClientSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<ClientSettings>(&raw) {
            Ok(file_settings) => file_settings,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring invalid config file");
                ClientSettings::default()
            }
        },
        Err(_) => ClientSettings::default(),
    };
    apply_env_overrides(&mut settings, env);
    settings
}

fn apply_env_overrides(settings: &mut ClientSettings, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = env("APP__SOCKET_PATH") {
        settings.socket_path = v;
    }

    if let Some(v) = env("APP__RECONNECT_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.reconnect_attempts = parsed;
        }
    }
    if let Some(v) = env("APP__RECONNECT_INITIAL_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_initial_delay_ms = parsed;
        }
    }
    if let Some(v) = env("APP__HANDSHAKE_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.handshake_timeout_ms = parsed;
        }
    }
    if let Some(v) = env("APP__EVENT_BUFFER") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.event_buffer = parsed;
        }
    }
    if let Some(v) = env("APP__AUTO_CONNECT") {
        if let Ok(parsed) = v.parse::<bool>() {
            settings.auto_connect = parsed;
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
