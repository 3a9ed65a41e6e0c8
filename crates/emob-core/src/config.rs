//! Centralized configuration for the emob link layer
//!
//! Durations are stored as millisecond integers so configuration files stay
//! readable (`duration_ms = 3000`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF};
use crate::{EmobError, Result};

// ----------------------------------------------------------------------------
// Scan Configuration
// ----------------------------------------------------------------------------

/// Configuration for discovery sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// How long a scan runs before it times out
    pub duration_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { duration_ms: 3_000 }
    }
}

impl ScanConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

// ----------------------------------------------------------------------------
// Retry Configuration
// ----------------------------------------------------------------------------

/// Configuration for the busy-retry loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Fixed wait between attempts
    pub backoff_ms: u64,
    /// Retry cap; `None` retries for as long as the transport is busy
    pub max_retries: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_ms: DEFAULT_RETRY_BACKOFF.as_millis() as u64,
            max_retries: Some(DEFAULT_MAX_RETRIES),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

// ----------------------------------------------------------------------------
// Client Configuration
// ----------------------------------------------------------------------------

/// Configuration for the client role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Optional bound on connect through ready; off unless set
    pub connect_timeout_ms: Option<u64>,
    /// Placeholder payload of the handshake frame
    pub handshake_token: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: None,
            handshake_token: "Hello".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

// ----------------------------------------------------------------------------
// Server Configuration
// ----------------------------------------------------------------------------

/// Configuration for the server role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Payload of the handshake acknowledgment
    pub ack_token: String,
    /// Name included in the scan response
    pub device_name: String,
    /// Capacity of the message broadcast channel
    pub message_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ack_token: "Ack".to_string(),
            device_name: "emob".to_string(),
            message_buffer_size: 64,
        }
    }
}

// ----------------------------------------------------------------------------
// Top-level Configuration
// ----------------------------------------------------------------------------

/// Complete emob configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmobConfig {
    pub scan: ScanConfig,
    pub retry: RetryConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl EmobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set scan duration
    pub fn with_scan_duration(mut self, duration: Duration) -> Self {
        self.scan.duration_ms = duration.as_millis() as u64;
        self
    }

    /// Set busy-retry backoff
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry.backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set or remove the retry cap
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    /// Opt in to a connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.client.connect_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the advertised device name
    pub fn with_device_name<T: Into<String>>(mut self, name: T) -> Self {
        self.server.device_name = name.into();
        self
    }

    /// Reject values the drivers cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.scan.duration_ms == 0 {
            return Err(EmobError::config_error("scan.duration_ms must be positive"));
        }
        if self.retry.backoff_ms == 0 {
            return Err(EmobError::config_error("retry.backoff_ms must be positive"));
        }
        if self.client.connect_timeout_ms == Some(0) {
            return Err(EmobError::config_error(
                "client.connect_timeout_ms must be positive when set",
            ));
        }
        if self.server.message_buffer_size == 0 {
            return Err(EmobError::config_error(
                "server.message_buffer_size must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EmobConfig::default();
        assert_eq!(config.scan.duration(), Duration::from_secs(3));
        assert_eq!(config.retry.backoff(), Duration::from_millis(100));
        assert_eq!(config.retry.max_retries, Some(100));
        assert_eq!(config.client.connect_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = EmobConfig::new()
            .with_scan_duration(Duration::from_secs(10))
            .with_max_retries(None)
            .with_connect_timeout(Duration::from_secs(5));

        assert_eq!(config.scan.duration_ms, 10_000);
        assert_eq!(config.retry.max_retries, None);
        assert_eq!(config.client.connect_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_validate_rejects_zero_backoff() {
        let config = EmobConfig::new().with_retry_backoff(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(EmobError::Configuration { .. })
        ));
    }

    #[test]
    fn test_partial_toml() {
        let config: EmobConfig = toml::from_str(
            r#"
            [scan]
            duration_ms = 5000

            [server]
            device_name = "kitchen"
            "#,
        )
        .unwrap();

        assert_eq!(config.scan.duration_ms, 5_000);
        assert_eq!(config.server.device_name, "kitchen");
        assert_eq!(config.retry, RetryConfig::default());
    }
}
