//! Client configuration.
//!
//! [`ReplyConfig`] holds the recognised options of a [`RequestReplyClient`](crate::client::RequestReplyClient). It
//! deserializes from any serde format with every field optional, so configuration files only need to name what they
//! change.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use lib_reply::config::ReplyConfig;
//!
//! let config = ReplyConfig::from_json_str(r#"{ "max_attempts": 5, "backoff": "exponential" }"#)?;
//! let policy = config.retry_policy()?;
//!
//! assert_eq!(config.reply_topic, "response-topic");
//! assert_eq!(policy.max_attempts(), 5);
//! assert_eq!(policy.per_attempt_timeout(), Duration::from_secs(30));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    error::{CodecError, ConfigError},
    retry::{Backoff, RetryPolicy},
};

/// The reply topic used when none is configured.
pub const DEFAULT_REPLY_TOPIC: &str = "response-topic";

/// Backoff strategy names accepted in configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Wait `backoff_base_ms` before every retry.
    #[default]
    Fixed,
    /// Double the wait on every retry, starting at `backoff_base_ms` and capped at `backoff_cap_ms`.
    Exponential,
}

/// Configuration of a request-reply client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyConfig {
    /// Topic replies are consumed from.
    pub reply_topic: String,
    /// Publish attempts per call, including the first. Must be at least 1.
    pub max_attempts: u32,
    /// How long each attempt waits for a reply, in milliseconds.
    pub per_attempt_timeout_ms: u64,
    /// Delay before the first retry, in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound for exponential backoff delays, in milliseconds.
    pub backoff_cap_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffKind,
    /// Whether backoff delays are randomly jittered.
    pub jitter: bool,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        ReplyConfig {
            reply_topic: DEFAULT_REPLY_TOPIC.to_string(),
            max_attempts: 3,
            per_attempt_timeout_ms: 30_000,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 30_000,
            backoff: BackoffKind::Fixed,
            jitter: false,
        }
    }
}

impl ReplyConfig {
    /// Parses a configuration from JSON.
    pub fn from_json_str(s: &str) -> Result<Self, CodecError> {
        serde_json::from_str(s).map_err(CodecError::Decode)
    }

    /// Checks every option is within range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reply_topic.is_empty() {
            return Err(ConfigError::new("reply_topic must not be empty"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::new("max_attempts must be at least 1"));
        }
        if self.per_attempt_timeout_ms == 0 {
            return Err(ConfigError::new("per_attempt_timeout_ms must be positive"));
        }
        if self.backoff == BackoffKind::Exponential && self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ConfigError::new(format!(
                "backoff_cap_ms ({}) is below backoff_base_ms ({})",
                self.backoff_cap_ms, self.backoff_base_ms
            )));
        }
        Ok(())
    }

    /// Validates the configuration and builds the retry policy it describes.
    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        self.validate()?;
        let base = Duration::from_millis(self.backoff_base_ms);
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed(base),
            BackoffKind::Exponential => {
                Backoff::exponential(base, Duration::from_millis(self.backoff_cap_ms))
            }
        };
        Ok(RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.per_attempt_timeout_ms),
        )
        .with_backoff(backoff)
        .with_jitter(self.jitter))
    }
}
