//! Reliable sessions multiplexed over one UDP socket.
//!
//! Each session runs its own ARQ engine (KCP by default) and is addressed by
//! a 32-bit `conv`. A [`Listener`] serves any number of sessions from a single
//! socket; a [`Dialer`] performs the connect handshake and owns one session.
//!
//! ## Features
//!
//! - **Connect handshake**: CONNECT request/reply allocating a conv
//! - **Session table**: concurrent conv allocation with wrap-around
//! - **Keepalive**: single-byte in-band keepalive after a quiet interval
//! - **Idle timeout**: sessions close themselves when the peer goes silent
//! - **Graceful close**: in-band close signal, drain tracking and teardown
//! - **Address migration**: accepted sessions follow the peer's source address
//!
//! ## Example
//!
//! ```rust,no_run
//! use mux_session::{dial, ChannelAcceptor, Listener, SessionConfig, SessionEvent};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> Result<(), mux_session::SessionError> {
//! let (acceptor, _accepted, mut server_events) = ChannelAcceptor::new();
//! let listener = Listener::bind_port(12345, SessionConfig::default(), Arc::new(acceptor)).await?;
//! let addr = listener.local_addr();
//! Arc::new(listener).spawn();
//!
//! let (tx, _client_events) = mpsc::unbounded_channel::<SessionEvent>();
//! let session = dial(addr, SessionConfig::default(), Arc::new(tx)).await?;
//! session.send(b"hello")?;
//!
//! while let Some(event) = server_events.recv().await {
//!     match event {
//!         SessionEvent::Received { conv, message } => {
//!             println!("conv {} sent {} bytes", conv, message.len());
//!         }
//!         SessionEvent::Closed { conv } => println!("conv {} closed", conv),
//!     }
//! }
//! session.close().wait().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dialer;
pub mod engine;
pub mod error;
pub mod keepalive;
pub mod listener;
pub mod session;
pub mod table;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types
pub use config::{EngineConfig, SessionConfig};
pub use dialer::{dial, Dialer};
pub use engine::{ArqEngine, EngineFactory, KcpEngine, KcpEngineFactory};
pub use error::SessionError;
pub use listener::{AcceptHandler, ChannelAcceptor, Listener};
pub use session::{CloseHandle, Role, Session, SessionEvent, SessionHandler, SessionStats};
pub use table::SessionTable;
pub use transport::{bind_dialer_socket, bind_listener_socket, DatagramSink, SegmentOutput};
