//! UDP tracker protocol (BEP 15), raw big-endian binary framing.
//!
//! BEP 15 is a binary protocol, not bencode, so each datagram is laid out
//! by hand with `byteorder` — the same crate used for the peer wire
//! protocol's big-endian integers — instead of going through the bencode
//! codec.

use crate::torrent::metainfo::Metainfo;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use rand::Rng;
use std::io::Cursor;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;
/// Connection ids are valid for two minutes per BEP 15.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum UdpTrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request timed out")]
    Timeout,
    #[error("transaction id mismatch")]
    TransactionMismatch,
    #[error("tracker reported error: {0}")]
    TrackerError(String),
    #[error("malformed response")]
    Malformed,
}

pub struct UdpTrackerClient {
    socket: UdpSocket,
    poll: Poll,
    connection_id: Option<(u64, Instant)>,
}

impl UdpTrackerClient {
    pub fn new() -> Result<Self, UdpTrackerError> {
        let mut socket = UdpSocket::bind("0.0.0.0:0".parse().unwrap())?;
        let poll = Poll::new()?;
        poll.registry().register(&mut socket, Token(0), Interest::READABLE)?;
        Ok(UdpTrackerClient {
            socket,
            poll,
            connection_id: None,
        })
    }

    fn connection_id(&mut self, addr: SocketAddr, deadline: Instant) -> Result<u64, UdpTrackerError> {
        if let Some((id, at)) = self.connection_id {
            if at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }
        let id = self.connect(addr, deadline)?;
        self.connection_id = Some((id, Instant::now()));
        Ok(id)
    }

    fn connect(&mut self, addr: SocketAddr, deadline: Instant) -> Result<u64, UdpTrackerError> {
        let txn_id: u32 = rand::thread_rng().gen();
        let mut req = Vec::with_capacity(16);
        req.write_u64::<BigEndian>(PROTOCOL_ID)?;
        req.write_u32::<BigEndian>(ACTION_CONNECT)?;
        req.write_u32::<BigEndian>(txn_id)?;

        let body = self.send_and_wait(addr, &req, deadline)?;
        let mut cur = Cursor::new(&body);
        let action = cur.read_u32::<BigEndian>()?;
        let resp_txn = cur.read_u32::<BigEndian>()?;
        if resp_txn != txn_id {
            return Err(UdpTrackerError::TransactionMismatch);
        }
        if action == ACTION_ERROR {
            return Err(UdpTrackerError::TrackerError(read_remaining_str(&mut cur)));
        }
        if action != ACTION_CONNECT {
            return Err(UdpTrackerError::Malformed);
        }
        Ok(cur.read_u64::<BigEndian>()?)
    }

    pub fn announce(
        &mut self,
        addr: SocketAddr,
        metainfo: &Metainfo,
        peer_id: [u8; 20],
        port: u16,
        uploaded: u64,
        downloaded: u64,
        left: u64,
        event: crate::tracker::AnnounceEvent,
        deadline: Instant,
    ) -> Result<AnnounceResult, UdpTrackerError> {
        let connection_id = self.connection_id(addr, deadline)?;
        let txn_id: u32 = rand::thread_rng().gen();
        let mut req = Vec::with_capacity(98);
        req.write_u64::<BigEndian>(connection_id)?;
        req.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
        req.write_u32::<BigEndian>(txn_id)?;
        req.extend_from_slice(&metainfo.info_hash);
        req.extend_from_slice(&peer_id);
        req.write_u64::<BigEndian>(downloaded)?;
        req.write_u64::<BigEndian>(left)?;
        req.write_u64::<BigEndian>(uploaded)?;
        req.write_u32::<BigEndian>(event_code(event))?;
        req.write_u32::<BigEndian>(0)?; // ip address: 0 = tracker should use sender's
        req.write_u32::<BigEndian>(rand::thread_rng().gen())?; // key
        req.write_i32::<BigEndian>(-1)?; // num_want: -1 = default
        req.write_u16::<BigEndian>(port)?;

        let body = self.send_and_wait(addr, &req, deadline)?;
        let mut cur = Cursor::new(&body);
        let action = cur.read_u32::<BigEndian>()?;
        let resp_txn = cur.read_u32::<BigEndian>()?;
        if resp_txn != txn_id {
            return Err(UdpTrackerError::TransactionMismatch);
        }
        if action == ACTION_ERROR {
            return Err(UdpTrackerError::TrackerError(read_remaining_str(&mut cur)));
        }
        if action != ACTION_ANNOUNCE {
            return Err(UdpTrackerError::Malformed);
        }
        let interval = cur.read_u32::<BigEndian>()? as u64;
        let leechers = cur.read_u32::<BigEndian>()? as u64;
        let seeders = cur.read_u32::<BigEndian>()? as u64;
        let mut peers = Vec::new();
        while (cur.position() as usize) + 6 <= body.len() {
            let a = cur.read_u8()?;
            let b = cur.read_u8()?;
            let c = cur.read_u8()?;
            let d = cur.read_u8()?;
            let p = cur.read_u16::<BigEndian>()?;
            peers.push(SocketAddr::from((std::net::Ipv4Addr::new(a, b, c, d), p)));
        }
        Ok(AnnounceResult {
            interval,
            leechers,
            seeders,
            peers,
        })
    }

    pub fn scrape(
        &mut self,
        addr: SocketAddr,
        info_hashes: &[[u8; 20]],
        deadline: Instant,
    ) -> Result<Vec<ScrapeResult>, UdpTrackerError> {
        let connection_id = self.connection_id(addr, deadline)?;
        let txn_id: u32 = rand::thread_rng().gen();
        let mut req = Vec::with_capacity(16 + info_hashes.len() * 20);
        req.write_u64::<BigEndian>(connection_id)?;
        req.write_u32::<BigEndian>(ACTION_SCRAPE)?;
        req.write_u32::<BigEndian>(txn_id)?;
        for h in info_hashes {
            req.extend_from_slice(h);
        }

        let body = self.send_and_wait(addr, &req, deadline)?;
        let mut cur = Cursor::new(&body);
        let action = cur.read_u32::<BigEndian>()?;
        let resp_txn = cur.read_u32::<BigEndian>()?;
        if resp_txn != txn_id {
            return Err(UdpTrackerError::TransactionMismatch);
        }
        if action == ACTION_ERROR {
            return Err(UdpTrackerError::TrackerError(read_remaining_str(&mut cur)));
        }
        if action != ACTION_SCRAPE {
            return Err(UdpTrackerError::Malformed);
        }
        let mut results = Vec::with_capacity(info_hashes.len());
        for _ in info_hashes {
            results.push(ScrapeResult {
                seeders: cur.read_u32::<BigEndian>()? as u64,
                completed: cur.read_u32::<BigEndian>()? as u64,
                leechers: cur.read_u32::<BigEndian>()? as u64,
            });
        }
        Ok(results)
    }

    fn send_and_wait(&mut self, addr: SocketAddr, req: &[u8], deadline: Instant) -> Result<Vec<u8>, UdpTrackerError> {
        // BEP 15's recommended retransmission schedule (15 * 2^n seconds,
        // capped by the caller's overall deadline), up to 5 attempts.
        let mut attempt = 0u32;
        let mut events = Events::with_capacity(16);
        loop {
            self.socket.send_to(req, addr)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(UdpTrackerError::Timeout);
            }
            let retry_wait = Duration::from_secs(15 * (1u64 << attempt.min(3)));
            let wait = remaining.min(retry_wait);
            self.poll.poll(&mut events, Some(wait))?;
            if events.is_empty() {
                attempt += 1;
                if attempt >= 5 || Instant::now() >= deadline {
                    return Err(UdpTrackerError::Timeout);
                }
                continue;
            }
            let mut buf = [0u8; 1500];
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) if from == addr => return Ok(buf[..n].to_vec()),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn event_code(event: crate::tracker::AnnounceEvent) -> u32 {
    match event {
        crate::tracker::AnnounceEvent::None => 0,
        crate::tracker::AnnounceEvent::Completed => 1,
        crate::tracker::AnnounceEvent::Started => 2,
        crate::tracker::AnnounceEvent::Stopped => 3,
    }
}

fn read_remaining_str(cur: &mut Cursor<&Vec<u8>>) -> String {
    let pos = cur.position() as usize;
    let bytes = &cur.get_ref()[pos..];
    String::from_utf8_lossy(bytes).into_owned()
}

#[derive(Debug, Clone)]
pub struct AnnounceResult {
    pub interval: u64,
    pub leechers: u64,
    pub seeders: u64,
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct ScrapeResult {
    pub seeders: u64,
    pub completed: u64,
    pub leechers: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_codes_match_bep15() {
        assert_eq!(event_code(crate::tracker::AnnounceEvent::None), 0);
        assert_eq!(event_code(crate::tracker::AnnounceEvent::Completed), 1);
        assert_eq!(event_code(crate::tracker::AnnounceEvent::Started), 2);
        assert_eq!(event_code(crate::tracker::AnnounceEvent::Stopped), 3);
    }

    #[test]
    fn connect_request_layout_is_16_bytes() {
        let mut req = Vec::with_capacity(16);
        req.write_u64::<BigEndian>(PROTOCOL_ID).unwrap();
        req.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
        req.write_u32::<BigEndian>(42).unwrap();
        assert_eq!(req.len(), 16);
        assert_eq!(&req[0..8], &PROTOCOL_ID.to_be_bytes());
    }
}
