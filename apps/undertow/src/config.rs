use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionConfig;
use crate::protocol::DEFAULT_MAX_MESSAGE_BYTES;
use crate::server::ServerConfig;
use crate::sync::SequencerConfig;

pub const ENV_HEARTBEAT_MS: &str = "UNDERTOW_HEARTBEAT_MS";
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "UNDERTOW_HANDSHAKE_TIMEOUT_MS";
pub const ENV_BACKOFF_BASE_MS: &str = "UNDERTOW_BACKOFF_BASE_MS";
pub const ENV_BACKOFF_CAP_MS: &str = "UNDERTOW_BACKOFF_CAP_MS";
pub const ENV_MAX_ATTEMPTS: &str = "UNDERTOW_MAX_ATTEMPTS";
pub const ENV_QUEUE_LIMIT: &str = "UNDERTOW_QUEUE_LIMIT";
pub const ENV_ACK_WINDOW: &str = "UNDERTOW_ACK_WINDOW";
pub const ENV_REORDER_LIMIT: &str = "UNDERTOW_REORDER_LIMIT";
pub const ENV_RESUME_WINDOW_MS: &str = "UNDERTOW_RESUME_WINDOW_MS";
pub const ENV_MAX_SESSIONS: &str = "UNDERTOW_MAX_SESSIONS";
pub const ENV_SECRET: &str = "UNDERTOW_SECRET";
pub const ENV_MAX_MESSAGE_BYTES: &str = "UNDERTOW_MAX_MESSAGE_BYTES";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is not valid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitsConfig {
    /// Upper bound on one reassembled logical message.
    pub max_message_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

/// Undertow runtime configuration: defaults, then `UNDERTOW_*` variables, then CLI flags.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub sync: SequencerConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let connection = &mut config.connection;
        override_millis(&lookup, ENV_HEARTBEAT_MS, &mut connection.heartbeat_interval)?;
        override_millis(&lookup, ENV_HANDSHAKE_TIMEOUT_MS, &mut connection.handshake_timeout)?;
        override_millis(&lookup, ENV_BACKOFF_BASE_MS, &mut connection.backoff.base)?;
        override_millis(&lookup, ENV_BACKOFF_CAP_MS, &mut connection.backoff.cap)?;
        override_parsed(&lookup, ENV_MAX_ATTEMPTS, &mut connection.backoff.max_attempts)?;
        override_parsed(&lookup, ENV_QUEUE_LIMIT, &mut connection.queue_limit)?;
        override_parsed(&lookup, ENV_ACK_WINDOW, &mut config.sync.ack_window)?;
        override_parsed(&lookup, ENV_REORDER_LIMIT, &mut config.sync.reorder_limit)?;
        override_millis(&lookup, ENV_RESUME_WINDOW_MS, &mut config.server.resume_window)?;
        override_parsed(&lookup, ENV_MAX_SESSIONS, &mut config.server.max_sessions)?;
        if let Some(secret) = lookup(ENV_SECRET).filter(|secret| !secret.is_empty()) {
            config.server.secret = secret;
        }
        override_parsed(&lookup, ENV_MAX_MESSAGE_BYTES, &mut config.limits.max_message_bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let backoff = &self.connection.backoff;
        if backoff.base > backoff.cap {
            return Err(ConfigError::Invalid {
                var: ENV_BACKOFF_BASE_MS,
                value: backoff.base.as_millis().to_string(),
                reason: format!("exceeds the backoff cap of {} ms", backoff.cap.as_millis()),
            });
        }
        if self.sync.ack_window == 0 {
            return Err(ConfigError::Invalid {
                var: ENV_ACK_WINDOW,
                value: "0".into(),
                reason: "the server could never send a batch".into(),
            });
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, var: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(());
    };
    *slot = raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
        var,
        value: raw.clone(),
        reason: err.to_string(),
    })?;
    Ok(())
}

fn override_millis<F>(lookup: &F, var: &'static str, slot: &mut Duration) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut millis = slot.as_millis() as u64;
    override_parsed(lookup, var, &mut millis)?;
    *slot = Duration::from_millis(millis);
    Ok(())
}
