//! Datagram framing for kcpmux.
//!
//! Every UDP datagram exchanged between a dialer and a listener starts with a
//! fixed 4-byte header (one command byte plus three reserved bytes), followed
//! by a command-specific payload. The crate only transforms bytes; it never
//! touches a socket.
//!
//! ## Wire Format
//!
//! ```text
//! +---------+-----------------+--------------------------------------------+
//! | u8 cmd  | 3 reserved (0)  | payload                                    |
//! +---------+-----------------+--------------------------------------------+
//!
//! cmd 0x00 DATA              payload = engine segment (starts with u32 LE conv)
//! cmd 0x01 CONNECT  request  payload = 16-byte session id
//! cmd 0x01 CONNECT  reply    payload = u32 LE conv
//! cmd 0x02 CONNECT_REJECTED  payload = u32 LE conv the listener does not know
//! ```
//!
//! All multi-byte integers are little-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod header;

// Re-export main types
pub use error::WireError;
pub use frame::Frame;
pub use header::{Command, CONV_SIZE, HEADER_SIZE, MAX_DATAGRAM_SIZE, SESSION_ID_SIZE};
