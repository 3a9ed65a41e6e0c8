//! Core types for the emob protocol
//!
//! Newtypes for transport addresses and timestamps, and the [`PeerDevice`]
//! record that identifies a remote radio endpoint.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::ops::{Add, Sub};
use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Device Address
// ----------------------------------------------------------------------------

/// Transport level unique identifier of a radio endpoint
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Create an address from its transport representation
    pub fn new<T: Into<String>>(address: T) -> Self {
        Self(address.into())
    }

    /// Borrow the address string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

// ----------------------------------------------------------------------------
// Peer Handle
// ----------------------------------------------------------------------------

/// Opaque handle to the transport object behind a peer
///
/// Transports stash whatever they need here (a platform peripheral, a
/// loopback endpoint id) and downcast it back when connecting.
#[derive(Clone)]
pub struct PeerHandle(Arc<dyn Any + Send + Sync>);

impl PeerHandle {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    /// Borrow the inner transport object if it has type `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PeerHandle(..)")
    }
}

// ----------------------------------------------------------------------------
// Peer Device
// ----------------------------------------------------------------------------

/// Placeholder used when the remote does not expose a name
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";

/// A remote radio endpoint
///
/// Equality and hashing only look at the address.
#[derive(Debug, Clone)]
pub struct PeerDevice {
    name: String,
    address: DeviceAddress,
    handle: Option<PeerHandle>,
}

impl PeerDevice {
    /// Create a peer; a missing name falls back to [`UNKNOWN_DEVICE_NAME`]
    pub fn new<A: Into<DeviceAddress>>(name: Option<String>, address: A) -> Self {
        Self {
            name: name.unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string()),
            address: address.into(),
            handle: None,
        }
    }

    /// Attach the transport handle
    pub fn with_handle(mut self, handle: PeerHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn handle(&self) -> Option<&PeerHandle> {
        self.handle.as_ref()
    }
}

impl PartialEq for PeerDevice {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for PeerDevice {}

impl Hash for PeerDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for PeerDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0 + other)
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_peer_identity_is_address() {
        let a = PeerDevice::new(Some("Pixel".to_string()), "AA:BB");
        let b = PeerDevice::new(None, "AA:BB");
        let c = PeerDevice::new(Some("Pixel".to_string()), "CC:DD");

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_missing_name_defaults() {
        let peer = PeerDevice::new(None, "AA:BB");
        assert_eq!(peer.name(), UNKNOWN_DEVICE_NAME);
        assert_eq!(peer.to_string(), "Unknown (AA:BB)");
    }

    #[test]
    fn test_handle_downcast() {
        let peer = PeerDevice::new(None, "AA:BB").with_handle(PeerHandle::new(42u32));
        let handle = peer.handle().unwrap();
        assert_eq!(handle.downcast_ref::<u32>(), Some(&42));
        assert!(handle.downcast_ref::<String>().is_none());
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::new(1_000);
        assert_eq!((t + 500) - t, 500);
        assert_eq!(t - (t + 1), 0);
    }
}
