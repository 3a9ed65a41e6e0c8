//! Configuration loading for the CLI
//!
//! The file is TOML with the sections of [`EmobConfig`]; every key is
//! optional and falls back to its default.
//!
//! ```toml
//! [scan]
//! duration_ms = 5000
//!
//! [retry]
//! backoff_ms = 100
//! max_retries = 50
//!
//! [client]
//! connect_timeout_ms = 10000
//! ```

use std::path::Path;

use emob_core::EmobConfig;
use tracing::info;

use crate::error::{CliError, Result};

/// Parse and validate configuration text
pub fn parse_config(text: &str) -> Result<EmobConfig> {
    let config: EmobConfig = toml::from_str(text)?;
    config
        .validate()
        .map_err(|e| CliError::Config(e.to_string()))?;
    Ok(config)
}

/// Load configuration from a TOML file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<EmobConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        CliError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    parse_config(&text)
}

/// Load from `path` if given, otherwise use defaults
pub fn load_configuration(path: Option<&str>) -> Result<EmobConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            load_from_file(path)
        }
        None => {
            info!("Using default configuration");
            Ok(EmobConfig::default())
        }
    }
}
