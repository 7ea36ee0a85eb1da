//! UDP transport for sessions.
//!
//! Sessions never own a socket. They hold a [`DatagramSink`] shared with the
//! listener or dialer that created them, plus the per-session route state
//! (current remote address, send/receive timestamps) kept in a [`Link`].

use mux_wire::Frame;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Fire-and-forget datagram output, introduced so tests can record traffic
/// instead of touching a socket
pub trait DatagramSink: Send + Sync + 'static {
    /// Send one datagram. Must not block; failures are logged, never retried.
    fn send_datagram(&self, datagram: &[u8], to: SocketAddr);
}

impl DatagramSink for UdpSocket {
    fn send_datagram(&self, datagram: &[u8], to: SocketAddr) {
        report_send(self.try_send_to(datagram, to), datagram.len(), to);
    }
}

/// Log the outcome of one non-blocking send; true if the datagram left
fn report_send(result: io::Result<usize>, len: usize, to: SocketAddr) -> bool {
    match result {
        Ok(_) => {
            trace!("sent {} bytes to {}", len, to);
            true
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            // Handshake replies are never resent.
            warn!("socket not writable, dropped {} bytes to {}", len, to);
            false
        }
        Err(e) => {
            warn!("failed to send {} bytes to {}: {}", len, to, e);
            false
        }
    }
}

/// Bind the listening socket, preferring a dual-stack IPv6 socket
pub async fn bind_listener_socket(port: u16) -> io::Result<UdpSocket> {
    match bind_dual_stack(port) {
        Ok(socket) => {
            info!("bound dual-stack socket on port {}", port);
            Ok(socket)
        }
        Err(e) => {
            debug!("IPv6 bind on port {} failed ({}), falling back to IPv4", port, e);
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await
        }
    }
}

/// `[::]:port` with `IPV6_V6ONLY` cleared, so IPv4 peers arrive as mapped
/// addresses whatever the OS default is
fn bind_dual_stack(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(false)?;
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)).into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Bind an ephemeral socket of the same address family as `remote`
pub async fn bind_dialer_socket(remote: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    UdpSocket::bind(local).await
}

/// Route state of one session, shared between the session and the output
/// handed to its engine
pub(crate) struct Link {
    conv: u32,
    sink: Arc<dyn DatagramSink>,
    remote: Mutex<SocketAddr>,
    epoch: Instant,
    last_send_ms: AtomicU64,
    last_recv_ms: AtomicU64,
    datagrams_out: AtomicU64,
    bytes_out: AtomicU64,
}

impl Link {
    pub(crate) fn new(conv: u32, sink: Arc<dyn DatagramSink>, remote: SocketAddr) -> Self {
        Self {
            conv,
            sink,
            remote: Mutex::new(remote),
            epoch: Instant::now(),
            last_send_ms: AtomicU64::new(0),
            last_recv_ms: AtomicU64::new(0),
            datagrams_out: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub(crate) fn remote(&self) -> SocketAddr {
        *self.remote.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the latest source address; returns the previous one if it changed
    pub(crate) fn migrate(&self, from: SocketAddr) -> Option<SocketAddr> {
        let mut remote = self.remote.lock().unwrap_or_else(PoisonError::into_inner);
        if *remote == from {
            return None;
        }
        Some(std::mem::replace(&mut *remote, from))
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Millisecond clock for the engine; wraps like the engine expects
    pub(crate) fn engine_clock(&self) -> u32 {
        self.now_ms() as u32
    }

    pub(crate) fn touch_receive(&self) {
        self.last_recv_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn elapsed_since(&self, stamp: &AtomicU64) -> Duration {
        Duration::from_millis(self.now_ms().saturating_sub(stamp.load(Ordering::Relaxed)))
    }

    pub(crate) fn since_last_send(&self) -> Duration {
        self.elapsed_since(&self.last_send_ms)
    }

    pub(crate) fn since_last_receive(&self) -> Duration {
        self.elapsed_since(&self.last_recv_ms)
    }

    pub(crate) fn datagrams_out(&self) -> u64 {
        self.datagrams_out.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    fn emit(&self, segment: &[u8]) {
        let datagram = Frame::Data {
            conv: self.conv,
            segment,
        }
        .encode();
        self.sink.send_datagram(&datagram, self.remote());
        self.last_send_ms.store(self.now_ms(), Ordering::Relaxed);
        self.datagrams_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(datagram.len() as u64, Ordering::Relaxed);
    }
}

/// Output callback given to an ARQ engine.
///
/// Each write is one engine datagram; it is framed as DATA and sent to the
/// session's current remote address before the write returns.
pub struct SegmentOutput {
    link: Arc<Link>,
}

impl SegmentOutput {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    /// Frame and send one engine datagram
    pub fn emit(&self, segment: &[u8]) {
        self.link.emit(segment);
    }
}

impl io::Write for SegmentOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.emit(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use std::io::Write;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_frames_segments_for_current_remote() {
        let sink = Arc::new(RecordingSink::default());
        let link = Arc::new(Link::new(5, sink.clone(), addr(4000)));
        let mut output = SegmentOutput::new(link.clone());

        output.write_all(&[5, 0, 0, 0, 0xAB]).unwrap();
        assert_eq!(link.migrate(addr(4001)), Some(addr(4000)));
        assert_eq!(link.migrate(addr(4001)), None);
        output.write_all(&[5, 0, 0, 0, 0xCD]).unwrap();

        let sent = sink.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, addr(4000));
        assert_eq!(&sent[0].1[..], &[0, 0, 0, 0, 5, 0, 0, 0, 0xAB]);
        assert_eq!(sent[1].0, addr(4001));
        assert_eq!(link.datagrams_out(), 2);
        assert_eq!(link.bytes_out(), 18);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_receive_clocks() {
        let sink = Arc::new(RecordingSink::default());
        let link = Arc::new(Link::new(1, sink, addr(4000)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(link.since_last_send(), Duration::from_secs(5));
        link.touch_receive();
        SegmentOutput::new(link.clone()).emit(&[1, 0, 0, 0]);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(link.since_last_send(), Duration::from_secs(2));
        assert_eq!(link.since_last_receive(), Duration::from_secs(2));
    }

    async fn recv_from(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 16];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (buf[..len].to_vec(), from)
    }

    #[tokio::test]
    async fn test_udp_sink_delivers_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // a socket the driver has never polled reports WouldBlock
        sender.writable().await.unwrap();

        sender.send_datagram(b"ping", receiver.local_addr().unwrap());

        let (datagram, from) = recv_from(&receiver).await;
        assert_eq!(datagram, b"ping");
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[test]
    fn test_unwritable_socket_counts_as_dropped() {
        let to = addr(4000);

        assert!(report_send(Ok(4), 4, to));
        assert!(!report_send(Err(io::ErrorKind::WouldBlock.into()), 4, to));
        assert!(!report_send(
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
            4,
            to
        ));
    }

    #[tokio::test]
    async fn test_listener_socket_reaches_ipv4_clients() {
        let listener = bind_listener_socket(0).await.unwrap();
        let local = listener.local_addr().unwrap();
        if local.is_ipv6() {
            assert!(!socket2::SockRef::from(&listener).only_v6().unwrap());
        }

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"v4", (Ipv4Addr::LOCALHOST, local.port()))
            .await
            .unwrap();

        let (datagram, from) = recv_from(&listener).await;
        assert_eq!(datagram, b"v4");
        assert_eq!(from.port(), client.local_addr().unwrap().port());
    }
}
