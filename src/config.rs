//! Session configuration
//!
//! Every field has a default; `from_env` overrides them from `AVSYNC_*`
//! variables. Endpoint URLs are passed through untouched.

use crate::error::ConfigError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for `frame_rate`.
pub const MAX_FRAME_RATE: u32 = 240;
/// Upper bound for `frame_buffer_ms`.
pub const MAX_FRAME_BUFFER_MS: u64 = 10_000;

/// Configuration for one avatar session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Control channel endpoint (text/speech events).
    pub control_url: String,
    /// Frame channel endpoint (generated face frames).
    pub frame_url: String,
    /// Identity sent in the control handshake.
    pub user_id: String,
    /// Voice selected in the control handshake.
    pub voice: String,
    /// Avatar selected on the frame channel.
    pub avatar: String,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Display ticks per second.
    pub frame_rate: u32,
    /// How much video the frame buffer may hold, in milliseconds at `frame_rate`.
    pub frame_buffer_ms: u64,
    /// Interval of the periodic statistics log.
    pub stats_interval: Duration,
    /// Write played chunks and rendered frames under this directory.
    pub record_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            control_url: "ws://127.0.0.1:8000/ws".to_string(),
            frame_url: "ws://127.0.0.1:8001/ws".to_string(),
            user_id: "guest".to_string(),
            voice: "default".to_string(),
            avatar: "default".to_string(),
            reconnect_delay: Duration::from_secs(2),
            frame_rate: 30,
            frame_buffer_ms: 300,
            stats_interval: Duration::from_secs(30),
            record_dir: None,
        }
    }
}

impl SessionConfig {
    /// Build a config from the process environment on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("AVSYNC_CONTROL_URL") {
            config.control_url = url;
        }
        if let Some(url) = lookup("AVSYNC_FRAME_URL") {
            config.frame_url = url;
        }
        if let Some(user_id) = lookup("AVSYNC_USER_ID") {
            config.user_id = user_id;
        }
        if let Some(voice) = lookup("AVSYNC_VOICE") {
            config.voice = voice;
        }
        if let Some(avatar) = lookup("AVSYNC_AVATAR") {
            config.avatar = avatar;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "AVSYNC_RECONNECT_MS")? {
            if ms == 0 {
                return Err(invalid("AVSYNC_RECONNECT_MS", ms));
            }
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(fps) = parse_var::<u32, _>(&lookup, "AVSYNC_FRAME_RATE")? {
            if fps == 0 || fps > MAX_FRAME_RATE {
                return Err(invalid("AVSYNC_FRAME_RATE", fps));
            }
            config.frame_rate = fps;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "AVSYNC_FRAME_BUFFER_MS")? {
            if ms > MAX_FRAME_BUFFER_MS {
                return Err(invalid("AVSYNC_FRAME_BUFFER_MS", ms));
            }
            config.frame_buffer_ms = ms;
        }
        if let Some(dir) = lookup("AVSYNC_RECORD_DIR") {
            if !dir.is_empty() {
                config.record_dir = Some(PathBuf::from(dir));
            }
        }

        if config.control_url.is_empty() {
            return Err(ConfigError::Missing { name: "AVSYNC_CONTROL_URL" });
        }
        if config.frame_url.is_empty() {
            return Err(ConfigError::Missing { name: "AVSYNC_FRAME_URL" });
        }

        Ok(config)
    }

    /// Duration of one display tick.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }

    /// Number of frames the buffer may hold.
    pub fn frame_capacity(&self) -> usize {
        let frames = u64::from(self.frame_rate)
            .checked_mul(self.frame_buffer_ms)
            .map_or(u64::MAX, |n| n.div_ceil(1000));
        usize::try_from(frames).unwrap_or(usize::MAX).max(1)
    }
}

fn invalid(name: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::Invalid { name, value: value.to_string() }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(None),
    }
}
