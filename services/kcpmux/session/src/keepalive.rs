//! Reserved in-band messages and the timer policy around them.
//!
//! Two message shapes never reach the application: the empty message, which
//! tells the peer this side is closing, and the single byte `0xFF`, which
//! only keeps the session from going idle.

use std::time::Duration;

/// Keepalive message sent through the engine
pub const KEEPALIVE_MESSAGE: [u8; 1] = [0xFF];

/// Close signal sent through the engine
pub const CLOSE_MESSAGE: [u8; 0] = [];

/// Whether `message` is the keepalive sentinel
pub fn is_keepalive(message: &[u8]) -> bool {
    message == KEEPALIVE_MESSAGE
}

/// How an inbound engine message is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Close,
    KeepAlive,
    Application,
}

pub(crate) fn classify(message: &[u8]) -> MessageKind {
    if message.is_empty() {
        MessageKind::Close
    } else if is_keepalive(message) {
        MessageKind::KeepAlive
    } else {
        MessageKind::Application
    }
}

/// A keepalive is due once the last send is strictly older than the interval
pub(crate) fn keepalive_due(since_last_send: Duration, interval: Option<Duration>) -> bool {
    interval.is_some_and(|interval| since_last_send > interval)
}

/// The session is idle once the last receive is strictly older than the timeout
pub(crate) fn idle_expired(since_last_receive: Duration, idle_timeout: Duration) -> bool {
    since_last_receive > idle_timeout
}
