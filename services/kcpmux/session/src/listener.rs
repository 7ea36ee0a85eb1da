//! Accepting side: one UDP socket shared by every accepted session.

use crate::config::SessionConfig;
use crate::engine::{EngineFactory, KcpEngineFactory};
use crate::error::SessionError;
use crate::session::{Role, Session, SessionEvent, SessionHandler, TeardownHook};
use crate::table::SessionTable;
use crate::transport::{bind_listener_socket, DatagramSink};
use mux_wire::{Frame, MAX_DATAGRAM_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

/// Called for every accepted session before the CONNECT reply goes out
pub trait AcceptHandler: Send + Sync + 'static {
    /// Inspect the new session and return the handler for its traffic
    fn on_accept(&self, session: &Arc<Session>) -> Arc<dyn SessionHandler>;
}

/// Forwards accepted sessions and all of their events over channels
#[derive(Debug, Clone)]
pub struct ChannelAcceptor {
    accepted: mpsc::UnboundedSender<Arc<Session>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelAcceptor {
    /// Acceptor plus the receivers for accepted sessions and session events
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<Arc<Session>>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (accepted, accepted_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        (Self { accepted, events }, accepted_rx, events_rx)
    }
}

impl AcceptHandler for ChannelAcceptor {
    fn on_accept(&self, session: &Arc<Session>) -> Arc<dyn SessionHandler> {
        if self.accepted.send(session.clone()).is_err() {
            debug!(conv = session.conv(), "accept receiver dropped");
        }
        Arc::new(self.events.clone())
    }
}

/// Owns the bound socket and demultiplexes its datagrams by conv
pub struct Listener {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: SessionConfig,
    table: Arc<SessionTable>,
    acceptor: Arc<dyn AcceptHandler>,
    engine_factory: Arc<dyn EngineFactory>,
}

impl Listener {
    /// Bind to `addr`
    pub async fn bind(
        addr: SocketAddr,
        config: SessionConfig,
        acceptor: Arc<dyn AcceptHandler>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(socket, config, acceptor)
    }

    /// Bind to `port` on all interfaces, dual-stack when available
    pub async fn bind_port(
        port: u16,
        config: SessionConfig,
        acceptor: Arc<dyn AcceptHandler>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let socket = bind_listener_socket(port).await?;
        Self::from_socket(socket, config, acceptor)
    }

    /// Use an already bound socket
    pub fn from_socket(
        socket: UdpSocket,
        config: SessionConfig,
        acceptor: Arc<dyn AcceptHandler>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            config,
            table: Arc::new(SessionTable::new()),
            acceptor,
            engine_factory: Arc::new(KcpEngineFactory),
        })
    }

    /// Replace the ARQ engine used for accepted sessions
    pub fn with_engine_factory(mut self, engine_factory: Arc<dyn EngineFactory>) -> Self {
        self.engine_factory = engine_factory;
        self
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live sessions
    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Run the receive loop on its own task
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let span = tracing::info_span!("listener", addr = %self.local_addr);
        tokio::spawn(async move { self.run().await }.instrument(span))
    }

    /// Receive loop; runs until the task is dropped
    pub async fn run(&self) {
        info!("listening on {}", self.local_addr);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, from)) => self.handle_datagram(&buf[..len], from),
                Err(e) => {
                    error!("receive on {} failed: {}", self.local_addr, e);
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        trace!("{} bytes from {}", datagram.len(), from);
        match Frame::decode(datagram) {
            Ok(Frame::Data { conv, segment }) => match self.table.get(conv) {
                Some(session) => session.input(segment, Some(from)),
                None => {
                    warn!("data for unknown conv {} from {}, rejecting", conv, from);
                    let reply = Frame::ConnectRejected { conv }.encode();
                    self.socket.send_datagram(&reply, from);
                }
            },
            Ok(Frame::ConnectRequest { session_id }) => self.accept(session_id, from),
            Ok(frame) => warn!("unexpected {:?} from {}, dropped", frame.command(), from),
            Err(e) => warn!("dropped {} byte datagram from {}: {}", datagram.len(), from, e),
        }
    }

    fn accept(&self, session_id: Uuid, from: SocketAddr) {
        let table = Arc::downgrade(&self.table);
        let sink: Arc<dyn DatagramSink> = self.socket.clone();
        let allocated = self.table.allocate(|conv| {
            let teardown: TeardownHook = Box::new(move |session: &Session| {
                if let Some(table) = table.upgrade() {
                    table.remove(session.conv(), session);
                }
            });
            Session::new(
                conv,
                session_id,
                from,
                sink,
                &self.config,
                self.engine_factory.as_ref(),
                Role::Accepted,
                Some(teardown),
            )
        });

        let session = match allocated {
            Ok(session) => session,
            Err(e) => {
                warn!("failed to accept {} ({}): {}", from, session_id, e);
                return;
            }
        };
        let conv = session.conv();
        info!(conv, %session_id, "accepted session from {}", from);

        session.set_handler(self.acceptor.on_accept(&session));
        session.spawn_pump();
        let reply = Frame::ConnectAccepted { conv }.encode();
        self.socket.send_datagram(&reply, from);
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.table.len())
            .finish()
    }
}
