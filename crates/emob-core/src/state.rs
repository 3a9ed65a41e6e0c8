//! Observable state of the scanner, client and server roles
//!
//! Each role publishes one of these values through a watch channel. They are
//! closed sum types so transition code can match exhaustively.

use smallvec::SmallVec;

use crate::types::{DeviceAddress, PeerDevice};
use crate::EmobError;

// ----------------------------------------------------------------------------
// Client Connection State
// ----------------------------------------------------------------------------

/// Lifecycle of one outbound connection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    /// Transport connecting or service discovery still running
    Connecting(PeerDevice),
    /// Service located, notifications on, handshake sent
    Connected(PeerDevice),
    Disconnected(PeerDevice),
    Failed(PeerDevice, EmobError),
}

impl ConnectionState {
    /// Get current state name for logging
    pub fn state_name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting(_) => "Connecting",
            ConnectionState::Connected(_) => "Connected",
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Failed(..) => "Failed",
        }
    }

    /// Peer this state refers to, if any
    pub fn peer(&self) -> Option<&PeerDevice> {
        match self {
            ConnectionState::Idle => None,
            ConnectionState::Connecting(peer)
            | ConnectionState::Connected(peer)
            | ConnectionState::Disconnected(peer)
            | ConnectionState::Failed(peer, _) => Some(peer),
        }
    }

    /// Check if state allows message sending
    pub fn can_send_messages(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    /// Whether a fresh connect may start from here
    pub fn can_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Idle | ConnectionState::Disconnected(_) | ConnectionState::Failed(..)
        )
    }

    /// Connecting or connected
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting(_) | ConnectionState::Connected(_)
        )
    }

    pub fn failure(&self) -> Option<&EmobError> {
        match self {
            ConnectionState::Failed(_, cause) => Some(cause),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Scan State
// ----------------------------------------------------------------------------

/// State of a scanner
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Idle,
    Scanning,
    /// Last session ended on a timeout or a scanner failure
    Failed(EmobError),
}

impl ScanState {
    pub fn is_scanning(&self) -> bool {
        matches!(self, ScanState::Scanning)
    }
}

// ----------------------------------------------------------------------------
// Server State
// ----------------------------------------------------------------------------

/// Connected peers keyed by address, in connection order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerRegistry {
    peers: SmallVec<[PeerDevice; 4]>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer unless its address is present; returns whether it was added
    pub fn insert(&mut self, peer: PeerDevice) -> bool {
        if self.contains(peer.address()) {
            return false;
        }
        self.peers.push(peer);
        true
    }

    /// Remove the peer with `address`; returns whether one was removed
    pub fn remove(&mut self, address: &DeviceAddress) -> bool {
        match self.peers.iter().position(|p| p.address() == address) {
            Some(index) => {
                self.peers.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.peers.iter().any(|p| p.address() == address)
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&PeerDevice> {
        self.peers.iter().find(|p| p.address() == address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerDevice> {
        self.peers.iter()
    }

    /// Addresses in connection order
    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.peers.iter().map(|p| p.address().clone()).collect()
    }
}

/// State of the server role
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerState {
    pub is_running: bool,
    pub advertising: bool,
    pub connected_peers: PeerRegistry,
}

impl ServerState {
    /// Running and visible to scanners
    pub fn is_serving(&self) -> bool {
        self.is_running && self.advertising
    }
}
