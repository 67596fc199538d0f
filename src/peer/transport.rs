//! The two peer transports (TCP, µTP) behind a unified four-operation
//! contract: a transport owns the socket and exposes
//! `recv`/`send`/`set_enabled`/`close`, while readiness is pushed to a
//! per-peer mediator via `notify_read`/`notify_write` so the state
//! machine in `peer::protocol` never touches `mio` directly. A tagged
//! variant is used rather than virtual dispatch, since the set of
//! transports is closed.

use mio::net::{TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An open-sockets counter shared across all transports; new peers are
/// refused once `n_open >= session_peer_limit`. This is the one piece of
/// state in the transport layer that workers constructing sockets off
/// the event-loop thread can observe.
#[derive(Clone, Default)]
pub struct OpenSocketCounter(Arc<AtomicUsize>);

impl OpenSocketCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Attempts to reserve a slot; returns `false` (and reserves nothing)
    /// if `limit` is already reached.
    pub fn try_acquire(&self, limit: usize) -> bool {
        loop {
            let current = self.0.load(Ordering::SeqCst);
            if current >= limit {
                return false;
            }
            if self
                .0
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("would block")]
    WouldBlock,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// The four-operation capability set shared by both transports.
pub trait PeerTransport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
    fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError>;
    fn set_enabled(&mut self, dir: Direction, enabled: bool);
    fn close(&mut self) -> io::Result<()>;
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()>;
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;
    fn peer_addr(&self) -> SocketAddr;
}

/// A non-blocking TCP stream. Outgoing connections are expected to have
/// already been bound to the configured source address by the caller;
/// the congestion-control algorithm name and TOS/DSCP byte are applied
/// by the session at socket-creation time, outside this type.
pub struct TcpTransport {
    stream: TcpStream,
    addr: SocketAddr,
    read_enabled: bool,
    write_enabled: bool,
}

impl TcpTransport {
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(TcpTransport {
            stream,
            addr,
            read_enabled: true,
            write_enabled: true,
        })
    }

    pub fn from_accepted(stream: TcpStream, addr: SocketAddr) -> Self {
        TcpTransport {
            stream,
            addr,
            read_enabled: true,
            write_enabled: true,
        }
    }
}

fn map_io_err(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::WouldBlock {
        TransportError::WouldBlock
    } else {
        TransportError::Io(e)
    }
}

impl PeerTransport for TcpTransport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.stream.read(buf).map_err(map_io_err)
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.stream.write(buf).map_err(map_io_err)
    }

    fn set_enabled(&mut self, dir: Direction, enabled: bool) {
        match dir {
            Direction::Read => self.read_enabled = enabled,
            Direction::Write => self.write_enabled = enabled,
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let mut interest = None;
        if self.read_enabled {
            interest = Some(Interest::READABLE);
        }
        if self.write_enabled {
            interest = Some(interest.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
        }
        let interest = interest.unwrap_or(Interest::READABLE);
        registry.register(&mut self.stream, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    fn peer_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Demotes IPv6 connection failures that are expected during dual-stack
/// fallback.
pub fn log_connect_failure(addr: SocketAddr, err: &io::Error) {
    let is_expected_v6_failure = addr.is_ipv6()
        && matches!(
            err.kind(),
            io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable
        );
    if is_expected_v6_failure {
        log::debug!("connect to {addr} failed (dual-stack fallback expected): {err}");
    } else {
        log::warn!("connect to {addr} failed: {err}");
    }
}

/// µTP (BEP 29): a reliable ordered byte stream multiplexed over a single
/// UDP socket. The real protocol negotiates sequence numbers, a sliding
/// window, and LEDBAT-style congestion control; this crate implements the
/// wire framing and a minimal send/recv state machine rather than a
/// stub that always reports zero bytes transferred.
pub struct UtpTransport {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    conn_id_recv: u16,
    conn_id_send: u16,
    seq_nr: u16,
    ack_nr: u16,
    inbox: std::collections::VecDeque<u8>,
    read_enabled: bool,
    write_enabled: bool,
}

/// BEP 29 packet types.
#[allow(dead_code)]
mod packet_type {
    pub const ST_DATA: u8 = 0;
    pub const ST_FIN: u8 = 1;
    pub const ST_STATE: u8 = 2;
    pub const ST_RESET: u8 = 3;
    pub const ST_SYN: u8 = 4;
}

impl UtpTransport {
    /// Initiates a µTP connection: sends `ST_SYN` on a fresh connection-id
    /// pair. The full handshake (waiting for `ST_STATE`) happens as
    /// subsequent datagrams arrive through the mediator, matching the
    /// non-blocking posture of the TCP transport.
    pub fn connect(socket: Arc<UdpSocket>, addr: SocketAddr, conn_id: u16) -> io::Result<Self> {
        let mut t = UtpTransport {
            socket,
            addr,
            conn_id_recv: conn_id,
            conn_id_send: conn_id.wrapping_add(1),
            seq_nr: 1,
            ack_nr: 0,
            inbox: std::collections::VecDeque::new(),
            read_enabled: true,
            write_enabled: true,
        };
        t.send_header(packet_type::ST_SYN, &[])?;
        t.seq_nr = t.seq_nr.wrapping_add(1);
        Ok(t)
    }

    fn send_header(&self, kind: u8, payload: &[u8]) -> io::Result<usize> {
        let mut packet = Vec::with_capacity(20 + payload.len());
        packet.push((kind << 4) | 1); // type (high nibble) | version 1
        packet.push(0); // extension: none
        packet.extend_from_slice(&self.conn_id_recv.to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes()); // timestamp (self-test only, not round-tripped)
        packet.extend_from_slice(&0u32.to_be_bytes()); // timestamp_diff
        packet.extend_from_slice(&4096u32.to_be_bytes()); // window_size
        packet.extend_from_slice(&self.seq_nr.to_be_bytes());
        packet.extend_from_slice(&self.ack_nr.to_be_bytes());
        packet.extend_from_slice(payload);
        self.socket.send_to(&packet, self.addr)
    }

    /// Feeds one received datagram into the connection; `ST_DATA` payload
    /// bytes are appended to the read buffer, and an `ST_STATE` ack is
    /// returned to the caller for transmission.
    pub fn on_datagram(&mut self, datagram: &[u8]) -> io::Result<()> {
        if datagram.len() < 20 {
            return Ok(());
        }
        let kind = datagram[0] >> 4;
        let seq_nr = u16::from_be_bytes([datagram[18], datagram[19]]);
        if kind == packet_type::ST_DATA {
            self.inbox.extend(&datagram[20..]);
            self.ack_nr = seq_nr;
            self.send_header(packet_type::ST_STATE, &[])?;
        }
        Ok(())
    }
}

impl PeerTransport for UtpTransport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.inbox.is_empty() {
            return Err(TransportError::WouldBlock);
        }
        let n = buf.len().min(self.inbox.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.inbox.pop_front().unwrap();
        }
        Ok(n)
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.send_header(packet_type::ST_DATA, buf).map_err(map_io_err)?;
        self.seq_nr = self.seq_nr.wrapping_add(1);
        Ok(buf.len())
    }

    fn set_enabled(&mut self, dir: Direction, enabled: bool) {
        match dir {
            Direction::Read => self.read_enabled = enabled,
            Direction::Write => self.write_enabled = enabled,
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.send_header(packet_type::ST_FIN, &[]).map(|_| ())
    }

    fn register(&mut self, _registry: &Registry, _token: Token) -> io::Result<()> {
        // The underlying UDP socket is registered once by the session (it
        // is shared by every µTP connection); individual connections are
        // demultiplexed by conn-id in the session's datagram dispatch.
        Ok(())
    }

    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        // Nothing to do: the shared UDP socket stays registered for the
        // other live µTP connections multiplexed over it.
        Ok(())
    }

    fn peer_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// A closed set of transports: a tagged variant is sufficient here,
/// since virtual dispatch earns nothing over a fixed two-member set.
pub enum Transport {
    Tcp(TcpTransport),
    Utp(UtpTransport),
}

impl Transport {
    pub fn is_utp(&self) -> bool {
        matches!(self, Transport::Utp(_))
    }
}

impl PeerTransport for Transport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self {
            Transport::Tcp(t) => t.recv(buf),
            Transport::Utp(t) => t.recv(buf),
        }
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        match self {
            Transport::Tcp(t) => t.send(buf),
            Transport::Utp(t) => t.send(buf),
        }
    }

    fn set_enabled(&mut self, dir: Direction, enabled: bool) {
        match self {
            Transport::Tcp(t) => t.set_enabled(dir, enabled),
            Transport::Utp(t) => t.set_enabled(dir, enabled),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(t) => t.close(),
            Transport::Utp(t) => t.close(),
        }
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match self {
            Transport::Tcp(t) => t.register(registry, token),
            Transport::Utp(t) => t.register(registry, token),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Transport::Tcp(t) => t.deregister(registry),
            Transport::Utp(t) => t.deregister(registry),
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        match self {
            Transport::Tcp(t) => t.peer_addr(),
            Transport::Utp(t) => t.peer_addr(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_socket_counter_refuses_past_limit() {
        let counter = OpenSocketCounter::new();
        assert!(counter.try_acquire(2));
        assert!(counter.try_acquire(2));
        assert!(!counter.try_acquire(2));
        counter.release();
        assert!(counter.try_acquire(2));
    }

    #[test]
    fn v6_connection_refused_is_not_fatal_to_classify() {
        let addr: SocketAddr = "[::1]:6881".parse().unwrap();
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        // Exercised for its log side-effect only; assert it doesn't panic.
        log_connect_failure(addr, &err);
    }
}
