//! # Runtime Configuration Module
//!
//! Defaults for every registration and client call made through a
//! [`Dispatcher`](crate::dispatcher::Dispatcher).
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `BUSRPC_*` environment variables.
//!
//! ## Environment Variables
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `BUSRPC_SUBJECT_PREFIX` | First token of generated subjects | `busrpc` |
//! | `BUSRPC_QUEUE_GROUP` | Competing-consumer group for handlers | `busrpc` |
//! | `BUSRPC_HANDLER_WORKERS` | Worker coroutines per method | `5` |
//! | `BUSRPC_HANDLER_TIMEOUT_MS` | Timeout budget handed to handlers | `5000` |
//! | `BUSRPC_REQUEST_TIMEOUT_MS` | Client wait for a reply | `3000` |
//! | `BUSRPC_STACK_SIZE` | Worker coroutine stack, decimal or `0x` hex | `0x10000` |
//! | `BUSRPC_REPLY_POOL_IDLE` | Envelopes kept idle in the reply pool | `1024` |
//! | `BUSRPC_REPLY_ON_CODEC_ERROR` | Answer codec failures instead of dropping | `false` |
//!
//! ## Example Configuration
//!
//! ```yaml
//! subject_prefix: billing
//! concurrency: 8
//! handler_timeout_ms: 2000
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Runtime-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// First token of `{prefix}.{Service}.{Method}` subjects
    pub subject_prefix: String,
    /// Queue group shared by every handler unless overridden
    pub queue_group: String,
    /// Worker coroutines per registered subject
    pub concurrency: usize,
    /// Timeout budget carried by each handler's [`RequestContext`](crate::RequestContext)
    pub handler_timeout_ms: u64,
    /// How long the client waits for a reply
    pub request_timeout_ms: u64,
    /// Stack size for worker coroutines in bytes
    pub stack_size: usize,
    /// Upper bound of idle envelopes retained by the reply pool
    pub pool_max_idle: usize,
    /// Reply with an error envelope when a request cannot be decoded or a
    /// result cannot be encoded, instead of dropping the message
    pub reply_on_codec_error: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            subject_prefix: "busrpc".to_string(),
            queue_group: "busrpc".to_string(),
            concurrency: 5,
            handler_timeout_ms: 5_000,
            request_timeout_ms: 3_000,
            stack_size: 0x10000, // 64KB
            pool_max_idle: 1024,
            reply_on_codec_error: false,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load a YAML file; keys that are absent keep their defaults.
    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read runtime config: {}", path.display()))?;
        Self::from_yaml_str(&contents)
            .with_context(|| format!("Failed to parse runtime config: {}", path.display()))
    }

    /// Parse YAML text; keys that are absent keep their defaults.
    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// File (when given) first, then environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay any `BUSRPC_*` variables that are set and parse cleanly.
    pub fn apply_env(&mut self) {
        if let Ok(prefix) = env::var("BUSRPC_SUBJECT_PREFIX") {
            self.subject_prefix = prefix;
        }
        if let Ok(group) = env::var("BUSRPC_QUEUE_GROUP") {
            self.queue_group = group;
        }
        if let Some(workers) = env_parse("BUSRPC_HANDLER_WORKERS") {
            self.concurrency = workers;
        }
        if let Some(ms) = env_parse("BUSRPC_HANDLER_TIMEOUT_MS") {
            self.handler_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("BUSRPC_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = ms;
        }
        if let Some(size) = env::var("BUSRPC_STACK_SIZE")
            .ok()
            .and_then(|s| parse_size(&s))
        {
            self.stack_size = size;
        }
        if let Some(idle) = env_parse("BUSRPC_REPLY_POOL_IDLE") {
            self.pool_max_idle = idle;
        }
        if let Some(flag) = env_parse("BUSRPC_REPLY_ON_CODEC_ERROR") {
            self.reply_on_codec_error = flag;
        }
    }

    /// Reject values the runtime cannot honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.concurrency > 0, "concurrency must be at least 1");
        anyhow::ensure!(
            self.handler_timeout_ms > 0,
            "handler_timeout_ms must be positive"
        );
        anyhow::ensure!(
            self.request_timeout_ms > 0,
            "request_timeout_ms must be positive"
        );
        anyhow::ensure!(
            !self.queue_group.trim().is_empty(),
            "queue_group must not be empty"
        );
        Ok(())
    }

    #[must_use]
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Subject for one method of a service: `{prefix}.{service}.{method}`.
    #[must_use]
    pub fn subject_for(&self, service: &str, method: &str) -> String {
        if self.subject_prefix.is_empty() {
            format!("{service}.{method}")
        } else {
            format!("{}.{service}.{method}", self.subject_prefix)
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse a byte size given in decimal or `0x`-prefixed hex.
pub(crate) fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}
