//! Error handling for the emob CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("emob error: {0}")]
    Emob(#[from] emob_core::EmobError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("No emob device with address {0} found")]
    PeerNotFound(String),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
