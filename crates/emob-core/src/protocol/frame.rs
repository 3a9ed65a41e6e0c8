//! Frame codec for the emob wire protocol
//!
//! A frame is one header byte followed by the raw payload. There is no
//! length prefix: the payload runs to the end of the buffer, so a frame
//! always occupies `1 + payload.len()` bytes. The transport delivers whole
//! buffers per write or notification.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::{EmobError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Size of the header tag
pub const HEADER_SIZE: usize = 1;

// ----------------------------------------------------------------------------
// Header
// ----------------------------------------------------------------------------

/// Single byte frame header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Header {
    /// UTF-8 text payload
    PlainText = 0x00,
    /// Handshake key material
    KeyExchange = 0x01,
    /// Reserved for encrypted text, not decodable yet
    EncryptedText = 0x02,
}

impl Header {
    /// Wire value of this header
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Header {
    type Error = EmobError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0x00 => Ok(Header::PlainText),
            0x01 => Ok(Header::KeyExchange),
            0x02 => Ok(Header::EncryptedText),
            _ => Err(EmobError::UnknownHeader { tag }),
        }
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One protocol message unit exchanged over the characteristic
#[derive(Clone, PartialEq, Eq)]
pub enum Frame {
    /// Chat text
    PlainText(String),
    /// Handshake placeholder carrying opaque key material
    KeyExchange(Vec<u8>),
}

impl Frame {
    /// Build a text frame
    pub fn plain_text<T: Into<String>>(text: T) -> Self {
        Frame::PlainText(text.into())
    }

    /// Build a key exchange frame
    pub fn key_exchange<K: Into<Vec<u8>>>(key: K) -> Self {
        Frame::KeyExchange(key.into())
    }

    /// Header tag of this frame
    pub fn header(&self) -> Header {
        match self {
            Frame::PlainText(_) => Header::PlainText,
            Frame::KeyExchange(_) => Header::KeyExchange,
        }
    }

    /// Payload bytes as they go on the wire
    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::PlainText(text) => text.as_bytes(),
            Frame::KeyExchange(key) => key,
        }
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload().len()
    }

    /// Encode to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        FrameCodec::encode(self)
    }

    /// Decode from wire bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        FrameCodec::decode(data)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::PlainText(text) => write!(f, "PlainText(text={:?})", text),
            Frame::KeyExchange(key) => {
                write!(f, "KeyExchange(key={})", hex::encode_upper(key))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Wire Format Codec
// ----------------------------------------------------------------------------

/// Binary encoder/decoder for [`Frame`]
///
/// Multi-byte fields added by future protocol revisions are little-endian.
/// Today the only fixed field is the one-byte header.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame as `[header][payload]`
    pub fn encode(frame: &Frame) -> Vec<u8> {
        let payload = frame.payload();
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.push(frame.header().tag());
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Decode a frame from a whole transport buffer
    ///
    /// Fails with [`EmobError::UnknownHeader`] for tags outside the known set
    /// and with [`EmobError::Unimplemented`] for the reserved
    /// `EncryptedText` tag, which must never be read as plain text.
    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        let (&tag, payload) = bytes.split_first().ok_or(EmobError::EmptyFrame)?;

        match Header::try_from(tag)? {
            // Invalid sequences become U+FFFD rather than failing the frame
            Header::PlainText => Ok(Frame::PlainText(
                String::from_utf8_lossy(payload).into_owned(),
            )),
            Header::KeyExchange => Ok(Frame::KeyExchange(payload.to_vec())),
            header @ Header::EncryptedText => Err(EmobError::Unimplemented { header }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let bytes = FrameCodec::encode(&Frame::plain_text("Hi"));
        assert_eq!(bytes, vec![0x00, b'H', b'i']);

        let bytes = FrameCodec::encode(&Frame::key_exchange(b"Ack".to_vec()));
        assert_eq!(bytes, vec![0x01, b'A', b'c', b'k']);
    }

    #[test]
    fn test_size_is_header_plus_payload() {
        let frame = Frame::plain_text("Hello");
        assert_eq!(frame.size(), 6);
        assert_eq!(frame.to_bytes().len(), frame.size());
    }

    #[test]
    fn test_empty_payload_is_valid() {
        assert_eq!(FrameCodec::decode(&[0x00]).unwrap(), Frame::plain_text(""));
        assert_eq!(
            FrameCodec::decode(&[0x01]).unwrap(),
            Frame::key_exchange(Vec::new())
        );
    }

    #[test]
    fn test_unknown_header() {
        for tag in [0x03u8, 0x05, 0x7F, 0xFF] {
            assert_eq!(
                FrameCodec::decode(&[tag, 1, 2, 3]),
                Err(EmobError::UnknownHeader { tag })
            );
        }
    }

    #[test]
    fn test_reserved_header_is_not_plain_text() {
        let result = FrameCodec::decode(&[0x02, b'H', b'i']);
        assert_eq!(
            result,
            Err(EmobError::Unimplemented {
                header: Header::EncryptedText
            })
        );
    }

    #[test]
    fn test_empty_buffer() {
        assert_eq!(FrameCodec::decode(&[]), Err(EmobError::EmptyFrame));
    }

    #[test]
    fn test_invalid_utf8_text_is_replaced() {
        let frame = FrameCodec::decode(&[0x00, b'H', 0xFF, b'i']).unwrap();
        assert_eq!(frame, Frame::plain_text("H\u{FFFD}i"));
    }

    #[test]
    fn test_key_exchange_debug_is_hex() {
        let frame = Frame::key_exchange(vec![0xAB, 0x01]);
        assert_eq!(format!("{:?}", frame), "KeyExchange(key=AB01)");
    }
}
