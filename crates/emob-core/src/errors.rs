//! Error types for the emob protocol
//!
//! Every failure the link layer can produce is a variant of [`EmobError`].
//! Variants only hold plain data so the error can be cloned into the
//! observable state values (`ScanState::Failed`, `ConnectionState::Failed`).

use thiserror::Error;

use crate::protocol::Header;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Core error type for the emob protocol
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmobError {
    /// Frame decode saw a header tag outside the known set
    #[error("Unknown header: 0x{tag:02X}")]
    UnknownHeader { tag: u8 },

    /// Frame decode saw a reserved header that is not supported yet
    #[error("Header {header:?} is reserved and not implemented")]
    Unimplemented { header: Header },

    /// Buffer too short to hold a header byte
    #[error("Empty frame")]
    EmptyFrame,

    /// Scan duration elapsed without the consumer stopping the session
    #[error("No device found before the scan timed out")]
    DeviceNotFound,

    /// The discovery mechanism reported a hard failure
    #[error("Scan failed. errorCode = {code}")]
    Scanner { code: i32 },

    /// Transport level connect failed
    #[error("Connection failed. status = {status}")]
    Connection { status: i32 },

    /// The remote GATT table does not expose the emob service
    #[error("EmobService is not found. status = {status}")]
    ServiceNotFound { status: i32 },

    /// Operation requires an established connection
    #[error("Not connected")]
    NotConnected,

    /// A connection is already being established or is established
    #[error("Connection already in progress")]
    ConnectionInProgress,

    /// A scan session is already active on this scanner
    #[error("Scan already in progress")]
    ScanInProgress,

    /// The transport kept answering busy until the retry cap was reached
    #[error("Transport still busy after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    /// The transport rejected a write with a non-busy failure status
    #[error("Write failed. status = {status}")]
    WriteFailed { status: i32 },

    /// The caller lacks the capability grant for a transport operation
    #[error("Permission denied for {operation}")]
    PermissionDenied { operation: String },

    /// Opt-in connect timeout elapsed before the link became ready
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectTimeout { duration_ms: u64 },

    /// Internal channel closed while a task was still waiting on it
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Transport implementation error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl EmobError {
    /// Create a transport error with a message
    pub fn transport<T: Into<String>>(message: T) -> Self {
        EmobError::Transport(message.into())
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        EmobError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a permission error for the named operation
    pub fn permission_denied<T: Into<String>>(operation: T) -> Self {
        EmobError::PermissionDenied {
            operation: operation.into(),
        }
    }

    /// Create a channel closed error
    pub fn channel_closed<T: Into<String>>(what: T) -> Self {
        EmobError::ChannelClosed(what.into())
    }

    /// Whether the error is a per-frame decode failure
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            EmobError::UnknownHeader { .. }
                | EmobError::Unimplemented { .. }
                | EmobError::EmptyFrame
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, EmobError>;
pub type EmobResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_codes() {
        assert_eq!(
            EmobError::Scanner { code: 2 }.to_string(),
            "Scan failed. errorCode = 2"
        );
        assert_eq!(
            EmobError::UnknownHeader { tag: 0x05 }.to_string(),
            "Unknown header: 0x05"
        );
    }

    #[test]
    fn test_decode_error_classification() {
        assert!(EmobError::UnknownHeader { tag: 9 }.is_decode_error());
        assert!(EmobError::Unimplemented {
            header: Header::EncryptedText
        }
        .is_decode_error());
        assert!(!EmobError::DeviceNotFound.is_decode_error());
    }
}
