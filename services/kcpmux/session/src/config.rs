//! Session and engine tuning.

use crate::error::SessionError;
use mux_wire::HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default keepalive interval in seconds
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: i64 = 30;
/// Default idle timeout in seconds
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 180;
/// Lowest idle timeout a session accepts
pub const MIN_IDLE_TIMEOUT_SECS: u64 = 10;
/// Default time allowed for the engine to drain after close
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
/// Default pump period
pub const DEFAULT_PUMP_INTERVAL_MS: u64 = 50;
/// Default time to wait for a CONNECT reply
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 3000;

/// KCP segment overhead; the MTU must leave room for at least one payload byte
const ENGINE_OVERHEAD: usize = 24;

/// Configuration of the ARQ engine of every session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Datagram size including the 4-byte wire header
    pub mtu: usize,
    /// Send window in packets
    pub send_window: u16,
    /// Receive window in packets
    pub recv_window: u16,
    /// No-delay mode
    pub nodelay: bool,
    /// Internal engine clock interval in milliseconds
    pub interval_ms: i32,
    /// Duplicate-ack count that triggers fast retransmit (0 disables)
    pub fast_resend: i32,
    /// Disable congestion control
    pub no_congestion_window: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: 1200,
            send_window: 1024,
            recv_window: 1024,
            nodelay: true,
            interval_ms: 20,
            fast_resend: 2,
            no_congestion_window: true,
        }
    }
}

impl EngineConfig {
    /// MTU handed to the engine after reserving room for the wire header
    pub fn engine_mtu(&self) -> usize {
        self.mtu.saturating_sub(HEADER_SIZE)
    }

    /// Check that the engine can be built from these values
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.mtu <= HEADER_SIZE + ENGINE_OVERHEAD {
            return Err(SessionError::Config(format!(
                "mtu {} leaves no room for payload",
                self.mtu
            )));
        }
        if self.send_window == 0 || self.recv_window == 0 {
            return Err(SessionError::Config("window sizes must be positive".into()));
        }
        if self.interval_ms <= 0 {
            return Err(SessionError::Config(format!(
                "engine interval {}ms must be positive",
                self.interval_ms
            )));
        }
        Ok(())
    }
}

/// Configuration for a session and the handshake that creates it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keepalive interval in seconds; zero or negative disables keepalives
    pub keepalive_interval_secs: i64,
    /// Close the session after this long without inbound traffic (floored at 10)
    pub idle_timeout_secs: u64,
    /// Give up waiting for unacknowledged data this long after close began
    pub drain_timeout_secs: u64,
    /// Period of the per-session pump
    pub pump_interval_ms: u64,
    /// Time to wait for the CONNECT reply when dialing
    pub handshake_timeout_ms: u64,
    /// ARQ engine tuning
    pub engine: EngineConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            pump_interval_ms: DEFAULT_PUMP_INTERVAL_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            engine: EngineConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Keepalive interval, `None` when disabled
    pub fn keepalive_interval(&self) -> Option<Duration> {
        keepalive_interval_from_secs(self.keepalive_interval_secs)
    }

    /// Idle timeout after applying the floor
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(floor_idle_timeout_secs(self.idle_timeout_secs))
    }

    /// Drain deadline after close
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Pump period, at least one millisecond
    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms.max(1))
    }

    /// CONNECT reply timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), SessionError> {
        self.engine.validate()
    }
}

pub(crate) fn keepalive_interval_from_secs(secs: i64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs as u64))
}

pub(crate) fn floor_idle_timeout_secs(secs: u64) -> u64 {
    secs.max(MIN_IDLE_TIMEOUT_SECS)
}
