//! Configuration types for RestBlock
//!
//! `DriverConfig` carries the process-wide knobs of the block driver: socket
//! timeouts, retry budget, worker pool size and the completion policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Block driver configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Socket send/receive timeout in seconds (0 = no timeout)
    pub request_timeout_secs: u64,
    /// Number of attempts for one range request
    pub request_retries: u32,
    /// Timeout for establishing a connection in seconds (0 = blocking)
    pub connect_timeout_secs: u64,
    /// Worker threads (and connections) per attached device
    pub thread_pool_size: usize,
    /// Maximum number of attached devices
    pub max_devices: usize,
    /// How request failures are reported to the block layer
    pub completion: CompletionPolicy,
    /// Initial debug level of newly attached devices
    pub log_level: DebugLevel,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            request_retries: 3,
            connect_timeout_secs: 30,
            thread_pool_size: 8,
            max_devices: 64,
            completion: CompletionPolicy::Unconditional,
            log_level: DebugLevel::Info,
        }
    }
}

impl DriverConfig {
    /// Socket I/O timeout, `None` when disabled
    #[must_use]
    pub const fn request_timeout(&self) -> Option<Duration> {
        if self.request_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.request_timeout_secs))
        }
    }

    /// Connect timeout, `None` for a plain blocking connect
    #[must_use]
    pub const fn connect_timeout(&self) -> Option<Duration> {
        if self.connect_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.connect_timeout_secs))
        }
    }
}

/// Completion reporting policy for worker threads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionPolicy {
    /// Every request completes successfully; range failures are only logged
    #[default]
    Unconditional,
    /// The range operation's error is handed to the completion callback
    Strict,
}

/// Per-device debug level
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugLevel {
    Error = 0,
    Warn = 1,
    #[default]
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl DebugLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    /// Decode the value stored by [`DebugLevel::as_u8`]
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Error,
            1 => Self::Warn,
            2 => Self::Info,
            3 => Self::Debug,
            _ => Self::Trace,
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DebugLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DebugLevel {
    type Err = String;

    /// Accepts level names or syslog severities (0-7)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(severity) = s.parse::<u8>() {
            return match severity {
                0..=3 => Ok(Self::Error),
                4 => Ok(Self::Warn),
                5 | 6 => Ok(Self::Info),
                7 => Ok(Self::Debug),
                _ => Err(format!("severity out of range: {severity}")),
            };
        }
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" | "notice" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!("unknown debug level: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DriverConfig::default();
        assert_eq!(config.request_retries, 3);
        assert_eq!(config.thread_pool_size, 8);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.completion, CompletionPolicy::Unconditional);
    }

    #[test]
    fn test_zero_timeouts_disable() {
        let config = DriverConfig {
            request_timeout_secs: 0,
            connect_timeout_secs: 0,
            ..DriverConfig::default()
        };
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.connect_timeout(), None);
    }

    #[test]
    fn test_partial_toml() {
        let config: DriverConfig = toml::from_str(
            r#"
            thread_pool_size = 2
            completion = "strict"
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.thread_pool_size, 2);
        assert_eq!(config.completion, CompletionPolicy::Strict);
        assert_eq!(config.log_level, DebugLevel::Debug);
        assert_eq!(config.request_retries, 3);
    }

    #[test]
    fn test_debug_level_parse() {
        assert_eq!("DEBUG".parse::<DebugLevel>(), Ok(DebugLevel::Debug));
        assert_eq!("7".parse::<DebugLevel>(), Ok(DebugLevel::Debug));
        assert_eq!("4".parse::<DebugLevel>(), Ok(DebugLevel::Warn));
        assert_eq!("notice".parse::<DebugLevel>(), Ok(DebugLevel::Info));
        assert!("9".parse::<DebugLevel>().is_err());
        assert!("loud".parse::<DebugLevel>().is_err());
        assert_eq!(DebugLevel::from_u8(DebugLevel::Warn.as_u8()), DebugLevel::Warn);
    }
}
