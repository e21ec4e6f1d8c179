use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StageError};

/// Top-level stagewatch configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Reconnect schedule for the event transport.
    #[serde(default)]
    pub transport: RetryConfig,
    /// Retry schedule for the layout fetch.
    #[serde(default)]
    pub layout_retry: RetryConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub tui: TuiConfig,
}

/// Where the layout, the event stream and the resync data come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// HTTP endpoint serving the layout snapshot as JSON.
    #[serde(default)]
    pub layout_url: Option<String>,
    /// Local JSON file with the layout snapshot. Takes precedence over `layout_url`.
    #[serde(default)]
    pub layout_file: Option<String>,
    /// SSE endpoint emitting status events.
    #[serde(default)]
    pub events_url: Option<String>,
    /// HTTP endpoint returning the current status of every node.
    /// Without it, reconnects degrade to best effort with a visibility gap.
    #[serde(default)]
    pub resync_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            layout_url: None,
            layout_file: None,
            events_url: None,
            resync_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 { 10 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of distinct unknown node ids held in the pending buffer.
    #[serde(default = "default_max_pending_nodes")]
    pub max_pending_nodes: usize,
    /// Capacity of the transport → engine channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Capacity of the session event bus.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_pending_nodes: default_max_pending_nodes(),
            event_buffer: default_event_buffer(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

fn default_max_pending_nodes() -> usize { 1024 }
fn default_event_buffer() -> usize { 256 }
fn default_bus_capacity() -> usize { 256 }

/// Exponential backoff with jitter, capped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Give up after this many consecutive failures. Unset retries forever.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): doubles per attempt up
    /// to `max_backoff_ms`, then scaled by a 0.8x to 1.2x jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_backoff_ms);
        // Add jitter: 0.8x to 1.2x
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    }

    /// Whether `failures` consecutive failures exhaust the retry budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_retries.map(|max| failures > max).unwrap_or(false)
    }
}

fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuiConfig {
    /// Redraw interval for spinners, in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Horizontal layout units per terminal column.
    #[serde(default = "default_x_scale")]
    pub x_scale: f64,
    /// Vertical layout units per terminal row.
    #[serde(default = "default_y_scale")]
    pub y_scale: f64,
}

impl Default for TuiConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            x_scale: default_x_scale(),
            y_scale: default_y_scale(),
        }
    }
}

fn default_tick_ms() -> u64 { 100 }
fn default_x_scale() -> f64 { 6.0 }
fn default_y_scale() -> f64 { 25.0 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StageError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded)
            .map_err(|e| StageError::Config(e.to_string()))
    }

    /// Like [`AppConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(StageError::ConfigNotFound(p)) => {
                debug!(path = %p, "Config file not found, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
