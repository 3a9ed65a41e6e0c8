//! emob Core Protocol Implementation
//!
//! This crate provides the transport-independent part of the emob
//! short-range messaging protocol:
//!
//! - [`protocol`] - frame codec and GATT service layout
//! - [`retry`] - busy-retry discipline for transport writes
//! - [`state`] - observable scanner, client and server state
//! - [`transport`] - capability traits the radio layer implements
//! - [`message`] and [`message_log`] - chat messages and their merged view
//! - [`config`] - configuration with serde support

pub mod config;
pub mod errors;
pub mod message;
pub mod message_log;
pub mod protocol;
pub mod retry;
pub mod state;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::EmobConfig;
pub use errors::{EmobError, EmobResult, Result};
pub use message::{Author, Message};
pub use message_log::{MessageLog, MessageLogView};
pub use protocol::{Frame, FrameCodec, Header};
pub use retry::{GattStatus, RetryWriter};
pub use state::{ConnectionState, PeerRegistry, ScanState, ServerState};
pub use types::{DeviceAddress, PeerDevice, PeerHandle, Timestamp};
