//! Test doubles: a recording sink and a loss-free loopback engine.

use crate::config::{EngineConfig, SessionConfig};
use crate::engine::{ArqEngine, EngineFactory};
use crate::error::SessionError;
use crate::session::{Role, Session};
use crate::transport::{DatagramSink, SegmentOutput};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Records every datagram instead of sending it
#[derive(Default)]
pub(crate) struct RecordingSink {
    sent: Mutex<Vec<(SocketAddr, Bytes)>>,
}

impl RecordingSink {
    pub(crate) fn take(&self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl DatagramSink for RecordingSink {
    fn send_datagram(&self, datagram: &[u8], to: SocketAddr) {
        self.sent
            .lock()
            .unwrap()
            .push((to, Bytes::copy_from_slice(datagram)));
    }
}

/// Engine datagram as the loopback engine lays it out: conv, then the message
pub(crate) fn segment(conv: u32, message: &[u8]) -> Vec<u8> {
    let mut segment = conv.to_le_bytes().to_vec();
    segment.extend_from_slice(message);
    segment
}

/// One datagram per message, no loss and no acknowledgements.
///
/// Outbound data counts as unacknowledged for as long as the shared
/// `unacked` counter says so. While `faulty` is set, ticks fail and `recv`
/// reports one byte fewer than the message it consumed.
pub(crate) struct LoopbackEngine {
    conv: u32,
    output: SegmentOutput,
    outbound: VecDeque<Vec<u8>>,
    inbound: VecDeque<Vec<u8>>,
    unacked: Arc<AtomicUsize>,
    faulty: Arc<AtomicBool>,
}

impl LoopbackEngine {
    fn is_faulty(&self) -> bool {
        self.faulty.load(Ordering::SeqCst)
    }
}

impl ArqEngine for LoopbackEngine {
    fn send(&mut self, message: &[u8]) -> Result<(), SessionError> {
        self.outbound.push_back(message.to_vec());
        Ok(())
    }

    fn input(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if data.len() < 4 {
            return Err(SessionError::Engine("short segment".into()));
        }
        let conv = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if conv != self.conv {
            return Err(SessionError::Engine(format!("conv {} is not {}", conv, self.conv)));
        }
        self.inbound.push_back(data[4..].to_vec());
        Ok(())
    }

    fn update(&mut self, _now_ms: u32) -> Result<(), SessionError> {
        if self.is_faulty() {
            return Err(SessionError::Engine("tick failed".into()));
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<(), SessionError> {
        while let Some(message) = self.outbound.pop_front() {
            self.output.emit(&segment(self.conv, &message));
        }
        Ok(())
    }

    fn peek_size(&self) -> Option<usize> {
        self.inbound.front().map(Vec::len)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let message = self
            .inbound
            .pop_front()
            .ok_or_else(|| SessionError::Engine("nothing to receive".into()))?;
        buf[..message.len()].copy_from_slice(&message);
        if self.is_faulty() {
            return Ok(message.len().saturating_sub(1));
        }
        Ok(message.len())
    }

    fn wait_snd(&self) -> usize {
        self.unacked.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub(crate) struct LoopbackEngineFactory {
    pub(crate) unacked: Arc<AtomicUsize>,
    pub(crate) faulty: Arc<AtomicBool>,
}

impl EngineFactory for LoopbackEngineFactory {
    fn create(
        &self,
        conv: u32,
        output: SegmentOutput,
        _config: &EngineConfig,
    ) -> Result<Box<dyn ArqEngine>, SessionError> {
        Ok(Box::new(LoopbackEngine {
            conv,
            output,
            outbound: VecDeque::new(),
            inbound: VecDeque::new(),
            unacked: self.unacked.clone(),
            faulty: self.faulty.clone(),
        }))
    }
}

/// Accepted session on the loopback engine
pub(crate) fn loopback_session(conv: u32, sink: Arc<RecordingSink>) -> Arc<Session> {
    Session::new(
        conv,
        Uuid::new_v4(),
        SocketAddr::from(([127, 0, 0, 1], 9)),
        sink,
        &SessionConfig::default(),
        &LoopbackEngineFactory::default(),
        Role::Accepted,
        None,
    )
    .unwrap()
}
