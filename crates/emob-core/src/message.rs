//! Chat messages exchanged over an emob link

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{DeviceAddress, PeerDevice, Timestamp};

/// Display label for messages written on this device
pub const LOCAL_DEVICE_NAME: &str = "My Device";

// ----------------------------------------------------------------------------
// Author
// ----------------------------------------------------------------------------

/// Who wrote a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Author {
    /// Written on this device
    Local,
    /// Delivered by a remote peer
    Peer(PeerDevice),
}

impl Author {
    /// Human readable author name
    pub fn name(&self) -> &str {
        match self {
            Author::Local => LOCAL_DEVICE_NAME,
            Author::Peer(peer) => peer.name(),
        }
    }

    /// Address of the remote author, if any
    pub fn address(&self) -> Option<&DeviceAddress> {
        match self {
            Author::Local => None,
            Author::Peer(peer) => Some(peer.address()),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Author::Local)
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// Immutable chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    author: Author,
    text: String,
    timestamp: Timestamp,
}

impl Message {
    pub fn new(author: Author, text: String, timestamp: Timestamp) -> Self {
        Self {
            author,
            text,
            timestamp,
        }
    }

    /// Message authored on this device, stamped now
    pub fn local<T: Into<String>>(text: T) -> Self {
        Self::new(Author::Local, text.into(), Timestamp::now())
    }

    /// Message delivered by `peer`, stamped now
    pub fn from_peer<T: Into<String>>(peer: PeerDevice, text: T) -> Self {
        Self::new(Author::Peer(peer), text.into(), Timestamp::now())
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.timestamp, self.author.name(), self.text)
    }
}

/// Serializable record of a message, for logs and CLI output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub author: String,
    pub address: Option<DeviceAddress>,
    pub text: String,
    pub timestamp: Timestamp,
}

impl From<&Message> for MessageRecord {
    fn from(message: &Message) -> Self {
        Self {
            author: message.author.name().to_string(),
            address: message.author.address().cloned(),
            text: message.text.clone(),
            timestamp: message.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_message() {
        let message = Message::local("hi");
        assert!(message.author().is_local());
        assert_eq!(message.author().name(), LOCAL_DEVICE_NAME);
        assert_eq!(message.text(), "hi");
    }

    #[test]
    fn test_peer_record() {
        let peer = PeerDevice::new(Some("Pixel".to_string()), "AA:BB");
        let message = Message::new(Author::Peer(peer), "yo".to_string(), Timestamp::new(7));
        let record = MessageRecord::from(&message);

        assert_eq!(record.author, "Pixel");
        assert_eq!(record.address, Some(DeviceAddress::new("AA:BB")));
        assert_eq!(message.to_string(), "[7] Pixel: yo");
    }
}
