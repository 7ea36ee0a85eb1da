//! The ARQ engine seam.
//!
//! Reliability, ordering, retransmission and windowing are delegated to an
//! engine the session drives. Production sessions use KCP through
//! [`KcpEngine`]; any other engine can be plugged in with an
//! [`EngineFactory`].
//!
//! The engine emits its datagrams by writing them to the [`SegmentOutput`]
//! it was created with, synchronously from inside `send`, `input`, `flush`
//! and `update`. Every datagram must carry the session's conv in its first
//! four bytes (little-endian), which is where the listener routes from.

use crate::config::EngineConfig;
use crate::error::SessionError;
use crate::transport::SegmentOutput;
use kcp::Kcp;

/// Operations a session needs from its reliability engine
pub trait ArqEngine: Send + 'static {
    /// Queue one message for reliable delivery
    fn send(&mut self, message: &[u8]) -> Result<(), SessionError>;
    /// Feed one inbound engine datagram
    fn input(&mut self, segment: &[u8]) -> Result<(), SessionError>;
    /// Advance the engine clock (milliseconds, wrapping)
    fn update(&mut self, now_ms: u32) -> Result<(), SessionError>;
    /// Emit pending output without waiting for the next clock tick
    fn flush(&mut self) -> Result<(), SessionError>;
    /// Size of the next complete message, if one is ready
    fn peek_size(&self) -> Option<usize>;
    /// Move the next complete message into `buf`, returning its length
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SessionError>;
    /// Amount of outbound data not yet acknowledged by the peer
    fn wait_snd(&self) -> usize;
}

/// Builds one engine per session
pub trait EngineFactory: Send + Sync + 'static {
    /// Create an engine for `conv` that writes its datagrams to `output`
    fn create(
        &self,
        conv: u32,
        output: SegmentOutput,
        config: &EngineConfig,
    ) -> Result<Box<dyn ArqEngine>, SessionError>;
}

/// Factory for [`KcpEngine`]
#[derive(Debug, Default, Clone, Copy)]
pub struct KcpEngineFactory;

impl EngineFactory for KcpEngineFactory {
    fn create(
        &self,
        conv: u32,
        output: SegmentOutput,
        config: &EngineConfig,
    ) -> Result<Box<dyn ArqEngine>, SessionError> {
        Ok(Box::new(KcpEngine::new(conv, output, config)?))
    }
}

/// KCP in message mode
pub struct KcpEngine {
    kcp: Kcp<SegmentOutput>,
}

impl KcpEngine {
    /// Build a KCP instance with the configured MTU, windows and no-delay profile
    pub fn new(
        conv: u32,
        output: SegmentOutput,
        config: &EngineConfig,
    ) -> Result<Self, SessionError> {
        let mut kcp = Kcp::new(conv, output);
        kcp.set_mtu(config.engine_mtu()).map_err(engine_error)?;
        kcp.set_wndsize(config.send_window, config.recv_window);
        kcp.set_nodelay(
            config.nodelay,
            config.interval_ms,
            config.fast_resend,
            config.no_congestion_window,
        );
        Ok(Self { kcp })
    }
}

impl ArqEngine for KcpEngine {
    fn send(&mut self, message: &[u8]) -> Result<(), SessionError> {
        self.kcp.send(message).map(|_| ()).map_err(engine_error)
    }

    fn input(&mut self, segment: &[u8]) -> Result<(), SessionError> {
        self.kcp.input(segment).map(|_| ()).map_err(engine_error)
    }

    fn update(&mut self, now_ms: u32) -> Result<(), SessionError> {
        self.kcp.update(now_ms).map_err(engine_error)
    }

    fn flush(&mut self) -> Result<(), SessionError> {
        self.kcp.flush().map_err(engine_error)
    }

    fn peek_size(&self) -> Option<usize> {
        self.kcp.peeksize().ok()
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        self.kcp.recv(buf).map_err(engine_error)
    }

    fn wait_snd(&self) -> usize {
        self.kcp.wait_snd()
    }
}

fn engine_error(e: kcp::Error) -> SessionError {
    SessionError::Engine(e.to_string())
}
