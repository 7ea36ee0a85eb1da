//! Typed view of a single datagram.

use crate::header::{Command, CONV_SIZE, HEADER_SIZE, SESSION_ID_SIZE};
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// A decoded datagram, borrowing the receive buffer where possible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Engine traffic for an established session.
    ///
    /// `segment` is the complete engine datagram. The engine writes its
    /// connection id into the first four bytes, which is where `conv` is
    /// read from, so the same bytes serve as routing key and engine header.
    Data {
        /// Connection id (little-endian prefix of `segment`)
        conv: u32,
        /// Raw engine bytes, including the conv prefix
        segment: &'a [u8],
    },
    /// Dialer asks for a new session
    ConnectRequest {
        /// Correlation token chosen by the dialer
        session_id: Uuid,
    },
    /// Listener accepted the request and assigned a conv
    ConnectAccepted {
        /// Assigned connection id
        conv: u32,
    },
    /// Listener has no session for this conv
    ConnectRejected {
        /// The unknown connection id
        conv: u32,
    },
}

impl<'a> Frame<'a> {
    /// Parse a datagram
    pub fn decode(datagram: &'a [u8]) -> Result<Self, WireError> {
        let (command, payload) = Command::split(datagram)?;
        match command {
            Command::Data => {
                let conv = read_conv(command, payload, false)?;
                Ok(Frame::Data {
                    conv,
                    segment: payload,
                })
            }
            Command::Connect => match payload.len() {
                SESSION_ID_SIZE => {
                    let mut id = [0u8; SESSION_ID_SIZE];
                    id.copy_from_slice(payload);
                    Ok(Frame::ConnectRequest {
                        session_id: Uuid::from_bytes(id),
                    })
                }
                CONV_SIZE => Ok(Frame::ConnectAccepted {
                    conv: read_conv(command, payload, true)?,
                }),
                len => Err(WireError::PayloadLength { command, len }),
            },
            Command::ConnectRejected => Ok(Frame::ConnectRejected {
                conv: read_conv(command, payload, true)?,
            }),
        }
    }

    /// The command byte this frame travels under
    pub fn command(&self) -> Command {
        match self {
            Frame::Data { .. } => Command::Data,
            Frame::ConnectRequest { .. } | Frame::ConnectAccepted { .. } => Command::Connect,
            Frame::ConnectRejected { .. } => Command::ConnectRejected,
        }
    }

    /// Encoded size in bytes
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE
            + match self {
                Frame::Data { segment, .. } => segment.len(),
                Frame::ConnectRequest { .. } => SESSION_ID_SIZE,
                Frame::ConnectAccepted { .. } | Frame::ConnectRejected { .. } => CONV_SIZE,
            }
    }

    /// Encode into a fresh datagram
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.command().put_header(&mut buf);
        match self {
            // The conv already sits at the front of the segment.
            Frame::Data { segment, .. } => buf.put_slice(segment),
            Frame::ConnectRequest { session_id } => buf.put_slice(session_id.as_bytes()),
            Frame::ConnectAccepted { conv } | Frame::ConnectRejected { conv } => {
                buf.put_u32_le(*conv)
            }
        }
        buf.freeze()
    }
}

/// Read the little-endian conv at the start of `payload`.
///
/// With `exact` the payload must consist of the conv alone.
fn read_conv(command: Command, payload: &[u8], exact: bool) -> Result<u32, WireError> {
    let len = payload.len();
    if len < CONV_SIZE || (exact && len != CONV_SIZE) {
        return Err(WireError::PayloadLength { command, len });
    }
    let mut raw = [0u8; CONV_SIZE];
    raw.copy_from_slice(&payload[..CONV_SIZE]);
    Ok(u32::from_le_bytes(raw))
}
