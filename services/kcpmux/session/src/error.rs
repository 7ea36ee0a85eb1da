//! Session layer errors.

use mux_wire::{Command, WireError};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by sessions, the listener and the dialer
#[derive(Error, Debug)]
pub enum SessionError {
    /// No CONNECT reply arrived in time
    #[error("connect to {remote} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Dialed address
        remote: SocketAddr,
        /// Configured handshake timeout
        timeout: Duration,
    },

    /// The CONNECT reply could not be parsed
    #[error("malformed handshake reply: {0}")]
    Handshake(#[from] WireError),

    /// The reply parsed, but is not a CONNECT reply
    #[error("unexpected handshake reply {command:?} ({len} bytes)")]
    UnexpectedReply {
        /// Command of the reply
        command: Command,
        /// Datagram length
        len: usize,
    },

    /// The application tried to send the keepalive message
    #[error("message is reserved for keepalive")]
    ReservedMessage,

    /// The application tried to send an empty message, which signals close
    #[error("empty messages are reserved for close; use close()")]
    EmptyMessage,

    /// Every conv is taken by a live session
    #[error("no free conv left in the session table")]
    ConvExhausted,

    /// The ARQ engine refused an operation
    #[error("engine error: {0}")]
    Engine(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Socket I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
