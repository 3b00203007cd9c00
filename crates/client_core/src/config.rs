use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::conversations::ConversationOrder;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub viewer_id: Option<String>,
    pub resubscribe_initial_delay_ms: u64,
    pub resubscribe_max_delay_ms: u64,
    pub event_buffer: usize,
    pub conversation_order: ConversationOrder,
    pub mark_read_while_open: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            viewer_id: None,
            resubscribe_initial_delay_ms: 250,
            resubscribe_max_delay_ms: 10_000,
            event_buffer: 1024,
            conversation_order: ConversationOrder::RecentActivity,
            mark_read_while_open: true,
        }
    }
}

impl ClientSettings {
    /// Loads `client.toml` from the working directory when present, then
    /// `CLIENT__*` environment variables (for example `CLIENT__SERVER_URL`).
    pub fn load() -> Result<Self> {
        Config::builder()
            .add_source(File::with_name("client").required(false))
            .add_source(
                Environment::with_prefix("CLIENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read client settings")?
            .try_deserialize::<Self>()
            .context("invalid client settings")
            .map(Self::sanitized)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()
            .context("failed to parse client settings")?
            .try_deserialize::<Self>()
            .context("invalid client settings")
            .map(Self::sanitized)
    }

    pub fn resubscribe_policy(&self) -> ResubscribePolicy {
        ResubscribePolicy::new(
            Duration::from_millis(self.resubscribe_initial_delay_ms),
            Duration::from_millis(self.resubscribe_max_delay_ms),
        )
    }

    fn sanitized(mut self) -> Self {
        self.event_buffer = self.event_buffer.max(1);
        self.viewer_id = self.viewer_id.filter(|id| !id.trim().is_empty());
        self
    }
}

/// Exponential backoff between attempts to re-establish a dropped live query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResubscribePolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ResubscribePolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        let initial_delay = initial_delay.max(Duration::from_millis(1));
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
        }
    }

    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

impl Default for ResubscribePolicy {
    fn default() -> Self {
        ClientSettings::default().resubscribe_policy()
    }
}
