//! Dialing side: connect handshake plus a private socket per session.

use crate::config::SessionConfig;
use crate::engine::{EngineFactory, KcpEngineFactory};
use crate::error::SessionError;
use crate::session::{Role, Session, SessionHandler};
use crate::transport::bind_dialer_socket;
use mux_wire::{Frame, MAX_DATAGRAM_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

/// Opens sessions to a remote listener
#[derive(Clone)]
pub struct Dialer {
    config: SessionConfig,
    engine_factory: Arc<dyn EngineFactory>,
}

impl Dialer {
    /// Dialer using KCP with `config`
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            engine_factory: Arc::new(KcpEngineFactory),
        }
    }

    /// Replace the ARQ engine
    pub fn with_engine_factory(mut self, engine_factory: Arc<dyn EngineFactory>) -> Self {
        self.engine_factory = engine_factory;
        self
    }

    /// Run the connect handshake against `remote`.
    ///
    /// On success the session's pump and receive loop are already running
    /// and `handler` is installed. The handshake is attempted once; retries
    /// are left to the caller.
    pub async fn dial(
        &self,
        remote: SocketAddr,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Arc<Session>, SessionError> {
        self.config.validate()?;
        let socket = Arc::new(bind_dialer_socket(remote).await?);
        let session_id = Uuid::new_v4();
        debug!(%session_id, "dialing {} from {}", remote, socket.local_addr()?);

        socket
            .send_to(&Frame::ConnectRequest { session_id }.encode(), remote)
            .await?;

        let timeout = self.config.handshake_timeout();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| SessionError::ConnectTimeout { remote, timeout })??;
        trace!("handshake reply of {} bytes from {}", len, from);

        let conv = match Frame::decode(&buf[..len])? {
            Frame::ConnectAccepted { conv } => conv,
            frame => {
                return Err(SessionError::UnexpectedReply {
                    command: frame.command(),
                    len,
                })
            }
        };

        let session = Session::new(
            conv,
            session_id,
            remote,
            socket.clone(),
            &self.config,
            self.engine_factory.as_ref(),
            Role::Dialed,
            None,
        )?;
        session.set_handler(handler);
        session.spawn_pump();

        let span = tracing::debug_span!("dialer", conv);
        tokio::spawn(receive_loop(socket, session.clone()).instrument(span));

        info!(conv, %session_id, "connected to {}", remote);
        Ok(session)
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer").field("config", &self.config).finish()
    }
}

/// Dial `remote` with KCP and `config`
pub async fn dial(
    remote: SocketAddr,
    config: SessionConfig,
    handler: Arc<dyn SessionHandler>,
) -> Result<Arc<Session>, SessionError> {
    Dialer::new(config).dial(remote, handler).await
}

/// Feed the session until it drains or the listener disowns it
async fn receive_loop(socket: Arc<UdpSocket>, session: Arc<Session>) {
    let conv = session.conv();
    let drained = session.close_handle().wait();
    tokio::pin!(drained);
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (len, from) = tokio::select! {
            _ = &mut drained => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    error!("receive failed: {}", e);
                    tokio::task::yield_now().await;
                    continue;
                }
            },
        };

        match Frame::decode(&buf[..len]) {
            Ok(Frame::Data { conv: c, segment }) if c == conv => {
                session.input(segment, Some(from))
            }
            Ok(Frame::ConnectRejected { conv: c }) if c == conv => {
                warn!("listener {} no longer knows this session", from);
                session.reject();
                break;
            }
            Ok(frame) => debug!("ignored {:?} from {}", frame.command(), from),
            Err(e) => warn!("dropped {} byte datagram from {}: {}", len, from, e),
        }
    }
    debug!("receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEvent;
    use crate::testing::{segment, LoopbackEngineFactory};
    use bytes::Bytes;
    use mux_wire::Command;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Raw socket standing in for a listener
    async fn fake_listener() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    async fn recv_from(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (buf[..len].to_vec(), from)
    }

    fn dialer(config: SessionConfig) -> Dialer {
        Dialer::new(config).with_engine_factory(Arc::new(LoopbackEngineFactory::default()))
    }

    fn spawn_dial(
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> tokio::task::JoinHandle<Result<Arc<Session>, SessionError>> {
        tokio::spawn(async move { dialer(SessionConfig::default()).dial(addr, Arc::new(tx)).await })
    }

    /// Answer the next CONNECT with `reply` and return the dialer's address
    async fn answer_connect(server: &UdpSocket, reply: &[u8]) -> SocketAddr {
        let (request, from) = recv_from(server).await;
        assert!(matches!(
            Frame::decode(&request).unwrap(),
            Frame::ConnectRequest { .. }
        ));
        server.send_to(reply, from).await.unwrap();
        from
    }

    #[tokio::test]
    async fn test_dial_uses_assigned_conv() {
        let (server, addr) = fake_listener().await;
        let (tx, mut events) = mpsc::unbounded_channel::<SessionEvent>();

        let dialing = spawn_dial(addr, tx);
        let client = answer_connect(&server, &Frame::ConnectAccepted { conv: 77 }.encode()).await;
        let session = dialing.await.unwrap().unwrap();

        assert_eq!(session.conv(), 77);
        assert_eq!(session.remote_addr(), addr);

        let data = segment(77, b"welcome");
        let frame = Frame::Data {
            conv: 77,
            segment: &data,
        };
        server.send_to(&frame.encode(), client).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            SessionEvent::Received {
                conv: 77,
                message: Bytes::from_static(b"welcome")
            }
        );

        session.send(b"thanks").unwrap();
        let (datagram, _) = recv_from(&server).await;
        assert_eq!(&datagram[8..], b"thanks");
    }

    #[tokio::test]
    async fn test_dial_times_out() {
        let (_server, addr) = fake_listener().await;
        let config = SessionConfig {
            handshake_timeout_ms: 200,
            ..Default::default()
        };
        let (tx, _events) = mpsc::unbounded_channel::<SessionEvent>();

        let started = tokio::time::Instant::now();
        let result = dialer(config).dial(addr, Arc::new(tx)).await;

        assert!(matches!(
            result,
            Err(SessionError::ConnectTimeout { remote, timeout })
                if remote == addr && timeout == Duration::from_millis(200)
        ));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_dial_rejects_malformed_reply() {
        let (server, addr) = fake_listener().await;
        let (tx, _events) = mpsc::unbounded_channel::<SessionEvent>();

        let dialing = spawn_dial(addr, tx);
        answer_connect(&server, &[0x01, 0, 0, 0, 1, 2]).await;

        assert!(matches!(
            dialing.await.unwrap(),
            Err(SessionError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_rejects_unexpected_command() {
        let (server, addr) = fake_listener().await;
        let (tx, _events) = mpsc::unbounded_channel::<SessionEvent>();

        let dialing = spawn_dial(addr, tx);
        answer_connect(&server, &Frame::ConnectRejected { conv: 1 }.encode()).await;

        assert!(matches!(
            dialing.await.unwrap(),
            Err(SessionError::UnexpectedReply {
                command: Command::ConnectRejected,
                len: 8
            })
        ));
    }

    #[tokio::test]
    async fn test_rejection_terminates_session() {
        let (server, addr) = fake_listener().await;
        let (tx, mut events) = mpsc::unbounded_channel::<SessionEvent>();

        let dialing = spawn_dial(addr, tx);
        let client = answer_connect(&server, &Frame::ConnectAccepted { conv: 5 }.encode()).await;
        let session = dialing.await.unwrap().unwrap();

        // a rejection for somebody else's conv is ignored
        server
            .send_to(&Frame::ConnectRejected { conv: 6 }.encode(), client)
            .await
            .unwrap();
        server
            .send_to(&Frame::ConnectRejected { conv: 5 }.encode(), client)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), session.close_handle().wait())
            .await
            .unwrap();
        assert!(session.is_closed());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Closed { conv: 5 });
    }
}
