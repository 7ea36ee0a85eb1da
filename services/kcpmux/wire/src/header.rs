//! The fixed 4-byte datagram header.
//!
//! Only the first byte carries information; the remaining three are reserved,
//! written as zero and ignored on read.

use bytes::BufMut;

/// Header size in bytes
pub const HEADER_SIZE: usize = 4;

/// Size of a little-endian connection id on the wire
pub const CONV_SIZE: usize = 4;

/// Size of the session id carried by a CONNECT request
pub const SESSION_ID_SIZE: usize = 16;

/// Receive buffer size used by the socket loops
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Datagram commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Engine segment for an established session
    Data = 0x00,
    /// Connect request (session id) or connect reply (conv)
    Connect = 0x01,
    /// The listener has no session for the conv in a DATA frame
    ConnectRejected = 0x02,
}

impl TryFrom<u8> for Command {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Command::Data),
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::ConnectRejected),
            _ => Err(crate::WireError::Command(value)),
        }
    }
}

impl Command {
    /// Write the header for this command
    pub fn put_header<B: BufMut>(self, buf: &mut B) {
        buf.put_u8(self as u8);
        buf.put_bytes(0, HEADER_SIZE - 1);
    }

    /// Split a datagram into its command and payload
    pub fn split(datagram: &[u8]) -> Result<(Command, &[u8]), crate::WireError> {
        if datagram.len() < HEADER_SIZE {
            return Err(crate::WireError::Truncated(datagram.len()));
        }
        let command = Command::try_from(datagram[0])?;
        Ok((command, &datagram[HEADER_SIZE..]))
    }
}
