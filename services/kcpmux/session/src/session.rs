//! One reliable, ordered session over a shared UDP socket.
//!
//! A [`Session`] owns its ARQ engine and guards it, together with the close
//! state and timer policy, behind a single mutex. Every engine call (send,
//! input, drain, tick) happens under that mutex; socket writes triggered by
//! the engine are non-blocking, so nothing ever waits on I/O while holding it.
//!
//! Closing has two observable stages:
//! - *closing*: the application called [`Session::close`], the peer sent the
//!   close signal, or the session went idle. The close notification fires
//!   once, at this point.
//! - *drained*: the engine has no unacknowledged data left (or the drain
//!   deadline passed). The teardown hook runs, the [`CloseHandle`] resolves
//!   and the pump stops.

use crate::config::{floor_idle_timeout_secs, keepalive_interval_from_secs, SessionConfig};
use crate::engine::{ArqEngine, EngineFactory};
use crate::error::SessionError;
use crate::keepalive::{self, MessageKind, CLOSE_MESSAGE, KEEPALIVE_MESSAGE};
use crate::transport::{DatagramSink, Link, SegmentOutput};
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

/// Application callbacks of a session.
///
/// Callbacks run after the session lock is released, so they may call back
/// into the session (`send`, `close`).
pub trait SessionHandler: Send + Sync + 'static {
    /// A complete application message arrived
    fn on_receive(&self, session: &Arc<Session>, message: Bytes);
    /// The session started closing; fires at most once per session
    fn on_close(&self, session: &Arc<Session>);
}

/// Events emitted by sessions when the handler is a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A message was delivered
    Received {
        /// Session conv
        conv: u32,
        /// Message bytes
        message: Bytes,
    },
    /// The session started closing
    Closed {
        /// Session conv
        conv: u32,
    },
}

impl SessionHandler for mpsc::UnboundedSender<SessionEvent> {
    fn on_receive(&self, session: &Arc<Session>, message: Bytes) {
        let conv = session.conv();
        if self.send(SessionEvent::Received { conv, message }).is_err() {
            debug!(conv, "event receiver dropped, discarding message");
        }
    }

    fn on_close(&self, session: &Arc<Session>) {
        let conv = session.conv();
        if self.send(SessionEvent::Closed { conv }).is_err() {
            debug!(conv, "event receiver dropped, discarding close");
        }
    }
}

/// Which side of the handshake created the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created by a listener; follows the peer's source address
    Accepted,
    /// Created by a dialer; keeps the dialed address
    Dialed,
}

/// Statistics for a session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// DATA datagrams fed to the engine
    pub datagrams_in: u64,
    /// Engine bytes fed to the engine
    pub bytes_in: u64,
    /// DATA datagrams written to the socket
    pub datagrams_out: u64,
    /// Bytes written to the socket, headers included
    pub bytes_out: u64,
    /// Messages handed to the application
    pub messages_delivered: u64,
    /// Keepalive messages sent
    pub keepalives_sent: u64,
}

/// Runs once when the session is drained; the listener removes it from its table
pub(crate) type TeardownHook = Box<dyn Fn(&Session) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpStep {
    Continue,
    Stop,
}

/// Resolves once the session has drained after close
#[derive(Debug, Clone)]
pub struct CloseHandle {
    drained: watch::Receiver<bool>,
}

impl CloseHandle {
    /// Whether the engine has drained
    pub fn is_drained(&self) -> bool {
        *self.drained.borrow()
    }

    /// Wait until the engine has drained.
    ///
    /// Returns early if the session is dropped without draining.
    pub async fn wait(mut self) {
        if self.drained.wait_for(|drained| *drained).await.is_err() {
            debug!("session dropped before draining");
        }
    }
}

/// State guarded by the session lock
struct SessionState {
    engine: Box<dyn ArqEngine>,
    closed_by_application: bool,
    close_started: Option<Instant>,
    keepalive_interval: Option<Duration>,
    idle_timeout: Duration,
}

impl SessionState {
    /// Queue a message and push it out without waiting for the next tick
    fn send_message(&mut self, message: &[u8]) -> Result<(), SessionError> {
        self.engine.send(message)?;
        self.engine.flush()
    }
}

/// A reliable session identified by its conv
pub struct Session {
    conv: u32,
    session_id: Uuid,
    role: Role,
    link: Arc<Link>,
    state: Mutex<SessionState>,
    closing: AtomicBool,
    drained: AtomicBool,
    close_notified: AtomicBool,
    drained_tx: watch::Sender<bool>,
    handler: RwLock<Option<Arc<dyn SessionHandler>>>,
    teardown: Option<TeardownHook>,
    pump_interval: Duration,
    drain_timeout: Duration,
    datagrams_in: AtomicU64,
    bytes_in: AtomicU64,
    messages_delivered: AtomicU64,
    keepalives_sent: AtomicU64,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conv: u32,
        session_id: Uuid,
        remote: SocketAddr,
        sink: Arc<dyn DatagramSink>,
        config: &SessionConfig,
        engine_factory: &dyn EngineFactory,
        role: Role,
        teardown: Option<TeardownHook>,
    ) -> Result<Arc<Self>, SessionError> {
        let link = Arc::new(Link::new(conv, sink, remote));
        let mut engine =
            engine_factory.create(conv, SegmentOutput::new(link.clone()), &config.engine)?;
        // Engines must see the clock once before they accept a flush.
        engine.update(link.engine_clock())?;

        let (drained_tx, _) = watch::channel(false);
        debug!(conv, %session_id, %remote, ?role, "session created");

        Ok(Arc::new(Self {
            conv,
            session_id,
            role,
            link,
            state: Mutex::new(SessionState {
                engine,
                closed_by_application: false,
                close_started: None,
                keepalive_interval: config.keepalive_interval(),
                idle_timeout: config.idle_timeout(),
            }),
            closing: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            close_notified: AtomicBool::new(false),
            drained_tx,
            handler: RwLock::new(None),
            teardown,
            pump_interval: config.pump_interval(),
            drain_timeout: config.drain_timeout(),
            datagrams_in: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            keepalives_sent: AtomicU64::new(0),
        }))
    }

    /// Connection id
    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// Handshake correlation id
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Side of the handshake that created this session
    pub fn role(&self) -> Role {
        self.role
    }

    /// Latest known peer address
    pub fn remote_addr(&self) -> SocketAddr {
        self.link.remote()
    }

    /// Whether closing has begun, locally or by the peer
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Whether the engine has drained and the session is torn down
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    /// Snapshot of the traffic counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            datagrams_in: self.datagrams_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            datagrams_out: self.link.datagrams_out(),
            bytes_out: self.link.bytes_out(),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            keepalives_sent: self.keepalives_sent.load(Ordering::Relaxed),
        }
    }

    /// Install the application callbacks
    pub fn set_handler(&self, handler: Arc<dyn SessionHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Change the keepalive interval; zero or negative disables keepalives
    pub fn set_keepalive_interval_secs(&self, secs: i64) {
        self.lock_state().keepalive_interval = keepalive_interval_from_secs(secs);
    }

    /// Change the idle timeout (floored at 10 seconds)
    pub fn set_idle_timeout_secs(&self, secs: u64) {
        self.lock_state().idle_timeout = Duration::from_secs(floor_idle_timeout_secs(secs));
    }

    /// Send one message reliably.
    ///
    /// The empty message and the single byte `0xFF` are reserved for the
    /// close and keepalive signals and are rejected before the engine sees them.
    pub fn send(&self, message: &[u8]) -> Result<(), SessionError> {
        if message.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if keepalive::is_keepalive(message) {
            return Err(SessionError::ReservedMessage);
        }
        self.lock_state().send_message(message)
    }

    /// Start a graceful close.
    ///
    /// The first call sends the close signal to the peer and fires the close
    /// notification; later calls do nothing. Every call returns a handle to
    /// the same drain signal.
    pub fn close(self: &Arc<Self>) -> CloseHandle {
        let started = {
            let mut state = self.lock_state();
            self.begin_close(&mut state)
        };
        if started {
            info!(conv = self.conv, remote = %self.remote_addr(), "closing session");
            self.notify_closed();
        }
        self.close_handle()
    }

    /// Handle to the drain signal, without starting a close
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            drained: self.drained_tx.subscribe(),
        }
    }

    /// Feed one inbound engine datagram and deliver whatever it completes
    pub(crate) fn input(self: &Arc<Self>, segment: &[u8], from: Option<SocketAddr>) {
        if let (Role::Accepted, Some(from)) = (self.role, from) {
            if let Some(previous) = self.link.migrate(from) {
                info!(conv = self.conv, "peer moved from {} to {}", previous, from);
            }
        }
        self.link.touch_receive();
        self.datagrams_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(segment.len() as u64, Ordering::Relaxed);

        let mut delivered = Vec::new();
        let mut peer_closed = false;
        {
            let mut state = self.lock_state();
            if let Err(e) = state.engine.input(segment) {
                let len = segment.len();
                debug!(conv = self.conv, "engine rejected {} byte segment: {}", len, e);
                return;
            }

            while let Some(size) = state.engine.peek_size() {
                let mut buf = vec![0u8; size];
                match state.engine.recv(&mut buf) {
                    Ok(read) if read == size => {}
                    Ok(read) => {
                        warn!(conv = self.conv, "engine returned {} of {} bytes", read, size);
                        break;
                    }
                    Err(e) => {
                        warn!(conv = self.conv, "failed to drain message: {}", e);
                        break;
                    }
                }

                match keepalive::classify(&buf) {
                    MessageKind::Close => {
                        // Echo the close signal so the peer learns we are done
                        // even if it did not start the close.
                        if self.begin_close(&mut state) {
                            debug!(conv = self.conv, "peer closed, close signal echoed");
                        }
                        peer_closed = true;
                        break;
                    }
                    MessageKind::KeepAlive => trace!(conv = self.conv, "keepalive received"),
                    MessageKind::Application => delivered.push(Bytes::from(buf)),
                }
            }
        }

        if !delivered.is_empty() {
            self.messages_delivered.fetch_add(delivered.len() as u64, Ordering::Relaxed);
            match self.handler() {
                Some(handler) => {
                    for message in delivered {
                        handler.on_receive(self, message);
                    }
                }
                None => {
                    let dropped = delivered.len();
                    debug!(conv = self.conv, "no handler installed, dropped {} messages", dropped);
                }
            }
        }
        if peer_closed {
            info!(conv = self.conv, "session closed by peer");
            self.notify_closed();
        }
    }

    /// The listener no longer knows this session: stop without draining
    pub(crate) fn reject(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            state.closed_by_application = true;
            self.closing.store(true, Ordering::Release);
            self.finish_drain();
        }
        self.notify_closed();
    }

    /// One pump period: engine tick, then drain check or idle and keepalive policy
    pub(crate) fn pump_once(self: &Arc<Self>) -> PumpStep {
        if self.is_drained() {
            return PumpStep::Stop;
        }

        let mut idle_closed = false;
        {
            let mut state = self.lock_state();
            // Tick first so acknowledgements owed to the peer leave before
            // a drained session stops ticking for good.
            if let Err(e) = state.engine.update(self.link.engine_clock()) {
                warn!(conv = self.conv, "engine tick failed: {}", e);
            }

            if state.closed_by_application {
                let pending = state.engine.wait_snd();
                let overdue = state
                    .close_started
                    .is_some_and(|started| started.elapsed() >= self.drain_timeout);
                if pending == 0 || overdue {
                    if pending > 0 {
                        warn!(
                            conv = self.conv,
                            "drain deadline passed with {} segments unacknowledged",
                            pending
                        );
                    }
                    self.finish_drain();
                    return PumpStep::Stop;
                }
            } else if keepalive::idle_expired(self.link.since_last_receive(), state.idle_timeout) {
                info!(conv = self.conv, "no traffic for {:?}, closing", state.idle_timeout);
                idle_closed = self.begin_close(&mut state);
            } else if keepalive::keepalive_due(
                self.link.since_last_send(),
                state.keepalive_interval,
            ) {
                match state.send_message(&KEEPALIVE_MESSAGE) {
                    Ok(()) => {
                        self.keepalives_sent.fetch_add(1, Ordering::Relaxed);
                        trace!(conv = self.conv, "keepalive sent");
                    }
                    Err(e) => warn!(conv = self.conv, "failed to send keepalive: {}", e),
                }
            }
        }

        if idle_closed {
            self.notify_closed();
        }
        PumpStep::Continue
    }

    /// Drive the pump every period until the session drains
    pub(crate) fn spawn_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        let span = tracing::debug_span!("pump", conv = self.conv);
        tokio::spawn(
            async move {
                let period = session.pump_interval;
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if session.pump_once() == PumpStep::Stop {
                        break;
                    }
                }
                debug!("pump stopped");
            }
            .instrument(span),
        )
    }

    /// Mark closing and queue the close signal; false if already closing
    fn begin_close(&self, state: &mut SessionState) -> bool {
        if state.closed_by_application {
            return false;
        }
        state.closed_by_application = true;
        state.close_started = Some(Instant::now());
        self.closing.store(true, Ordering::Release);
        if let Err(e) = state.send_message(&CLOSE_MESSAGE) {
            warn!(conv = self.conv, "failed to send close signal: {}", e);
        }
        true
    }

    fn finish_drain(&self) {
        if self.drained.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(teardown) = &self.teardown {
            teardown(self);
        }
        self.drained_tx.send_replace(true);
        info!(conv = self.conv, "session drained");
    }

    fn notify_closed(self: &Arc<Self>) {
        if self.close_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handler) = self.handler() {
            handler.on_close(self);
        }
    }

    fn handler(&self) -> Option<Arc<dyn SessionHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("conv", &self.conv)
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("remote", &self.remote_addr())
            .field("closing", &self.is_closed())
            .field("drained", &self.is_drained())
            .finish()
    }
}
