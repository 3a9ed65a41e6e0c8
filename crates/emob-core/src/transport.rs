//! Transport capability contract
//!
//! The protocol drivers never touch a radio directly. They talk to these
//! traits, and every transport callback (scan result, connection change,
//! service discovery, notification, write request) arrives as an event on a
//! per-session channel consumed by a single task. Implementations push
//! events in the order the radio reports them.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ServiceDefinition;
use crate::retry::GattStatus;
use crate::types::PeerDevice;
use crate::Result;

// ----------------------------------------------------------------------------
// Central Role
// ----------------------------------------------------------------------------

/// Callback events of a filtered discovery
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// An advertiser matching the filter was seen; may repeat
    Found(PeerDevice),
    /// Discovery failed hard (radio off, too many scanners, ...)
    Failed { code: i32 },
}

/// Callback events of one client link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Transport connection changed; `status` is a raw GATT status
    ConnectionStateChanged { status: i32, connected: bool },
    /// Service discovery finished
    ServicesDiscovered { status: i32, service_found: bool },
    /// Notification on the emob characteristic
    CharacteristicChanged { value: Vec<u8> },
}

pub type DiscoveryEvents = mpsc::UnboundedReceiver<DiscoveryEvent>;
pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// Scanning and connecting side of a transport
#[async_trait]
pub trait Central: Send + Sync + 'static {
    type Link: GattLink;

    /// Start discovery filtered on `service`
    async fn start_discovery(&self, service: Uuid) -> Result<DiscoveryEvents>;

    /// Stop discovery; no further events are delivered afterwards
    async fn stop_discovery(&self);

    /// Open a transport connection. Progress arrives on the returned events.
    async fn connect(&self, peer: &PeerDevice) -> Result<(Self::Link, LinkEvents)>;
}

/// One open client connection
#[async_trait]
pub trait GattLink: Send + Sync + 'static {
    /// Kick off service discovery; the result arrives as a [`LinkEvent`]
    async fn discover_services(&self) -> bool;

    /// Turn local notification delivery on or off
    async fn set_characteristic_notification(&self, enable: bool) -> bool;

    /// Write frame bytes to the emob characteristic
    async fn write_characteristic(&self, value: &[u8]) -> GattStatus;

    /// Write the notification descriptor
    async fn write_descriptor(&self, value: &[u8]) -> GattStatus;

    async fn disconnect(&self);

    /// Release the transport handle
    async fn close(&self);
}

// ----------------------------------------------------------------------------
// Peripheral Role
// ----------------------------------------------------------------------------

/// A write request received by the server
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub device: PeerDevice,
    pub request_id: i32,
    pub prepared_write: bool,
    pub response_needed: bool,
    pub offset: i32,
    pub value: Option<Vec<u8>>,
}

/// Callback events of the peripheral listener and advertiser
#[derive(Debug, Clone)]
pub enum ServerEvent {
    AdvertiseStarted,
    AdvertiseFailed { code: i32 },
    ConnectionStateChanged {
        device: PeerDevice,
        status: i32,
        connected: bool,
    },
    CharacteristicWriteRequest(WriteRequest),
    DescriptorWriteRequest(WriteRequest),
    NotificationSent { device: PeerDevice, status: i32 },
    MtuChanged { device: PeerDevice, mtu: u16 },
}

pub type ServerEvents = mpsc::UnboundedReceiver<ServerEvent>;

/// Advertising and accepting side of a transport
#[async_trait]
pub trait Peripheral: Send + Sync + 'static {
    /// Open the listener and register `service`
    async fn open_server(&self, service: &ServiceDefinition) -> Result<ServerEvents>;

    /// Begin advertising; the outcome arrives as a [`ServerEvent`]
    async fn start_advertising(&self, service: Uuid, device_name: &str) -> Result<()>;

    /// May fail with `PermissionDenied`
    async fn stop_advertising(&self) -> Result<()>;

    /// Release the listener; may fail with `PermissionDenied`
    async fn close_server(&self) -> Result<()>;

    /// Answer a write request
    async fn send_response(
        &self,
        device: &PeerDevice,
        request_id: i32,
        status: i32,
        offset: i32,
        value: Option<&[u8]>,
    ) -> bool;

    /// Notify a subscribed peer
    async fn notify(&self, device: &PeerDevice, value: &[u8]) -> GattStatus;
}
