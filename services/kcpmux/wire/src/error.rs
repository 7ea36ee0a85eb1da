//! Wire protocol error types.

use crate::header::Command;
use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Datagram shorter than the fixed header
    #[error("datagram too short: {0} bytes")]
    Truncated(usize),

    /// Unknown command byte
    #[error("unknown command {0:#04x}")]
    Command(u8),

    /// Payload length does not fit the command
    #[error("invalid {command:?} payload length {len}")]
    PayloadLength {
        /// Command carried in the header
        command: Command,
        /// Payload length found after the header
        len: usize,
    },
}
