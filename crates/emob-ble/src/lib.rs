//! Bluetooth Low Energy link layer for emob
//!
//! This crate drives the emob protocol over a transport implementing the
//! capability traits from `emob-core`.
//!
//! ## Architecture
//!
//! - [`scope`] - supervised task group every driver spawns into
//! - [`scanner`] - time-bounded discovery of emob advertisers
//! - [`client`] - single outgoing connection with handshake and chat
//! - [`server`] - advertising listener serving many peers
//! - [`loopback`] - in-process radio for tests and demos
//! - [`platform`] - central role on the host adapter via btleplug
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use emob_ble::{BleScope, ClientConnection, LoopbackRadio, Scanner, ServerConnection};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let radio = LoopbackRadio::new();
//! let scope = BleScope::current();
//!
//! let peripheral = Arc::new(radio.peripheral("Server", "AA:00"));
//! let server = ServerConnection::new(peripheral, scope.clone());
//! server.open().await?;
//!
//! let central = Arc::new(radio.central("Phone", "BB:00"));
//! let scanner = Scanner::new(central.clone(), scope.clone());
//! let mut scan = scanner.scan(Duration::from_secs(3)).await?;
//! if let Some(Ok(peer)) = scan.next().await {
//!     scan.stop().await;
//!     let client = ClientConnection::new(central, scope);
//!     client.connect_and_wait(peer).await?;
//!     client.send_message("Hello").await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! The host adapter is only used in the central role; btleplug cannot
//! advertise or serve GATT attributes.

pub mod client;
pub mod loopback;
pub mod platform;
pub mod scanner;
pub mod scope;
pub mod server;

pub use client::ClientConnection;
pub use loopback::{LoopbackCentral, LoopbackLink, LoopbackPeripheral, LoopbackRadio};
pub use platform::{BtleplugCentral, BtleplugLink};
pub use scanner::{ScanSession, Scanner};
pub use scope::BleScope;
pub use server::ServerConnection;
