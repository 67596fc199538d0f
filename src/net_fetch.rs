//! The single blocking HTTP GET primitive used by everything that reaches
//! outside the process for a one-shot fetch: `blocklist-update`,
//! `port-test`, and `torrent-add`'s URL-source case. Lives on its own so
//! `Session`'s fetch worker pool can call it without `session` depending
//! on `rpc` (the RPC layer depends on `session`, not the other way
//! around).
//!
//! A private `mio::Poll` loop drives the request/response cycle, the same
//! technique `tracker::http`'s announce client and `rsbtd`'s own RPC
//! listener use for their non-blocking byte streams. Callers run this on
//! a worker thread, never the event-loop thread — see `Session`'s fetch
//! job pool in `session.rs`.

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Loader interface for the persisted blocklist file. Parsing the rule
/// format into an actual IP-range matcher is out of scope; this only
/// counts applicable rules so `blocklist-update` has a size to report.
pub struct BlocklistUpdater;

impl BlocklistUpdater {
    pub fn apply(bytes: &[u8]) -> usize {
        bytes
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty() && !line.starts_with(b"#"))
            .count()
    }
}

pub fn gunzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

pub fn fetch(url: &url::Url, timeout: Duration) -> io::Result<Vec<u8>> {
    let host = url.host_str().ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no host"))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let addr: SocketAddr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unresolvable host"))?;

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(128);
    let mut stream = TcpStream::connect(addr)?;
    let token = Token(0);
    poll.registry()
        .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;

    let path = url.path();
    let query = url.query().map(|q| format!("?{q}")).unwrap_or_default();
    let request = format!("GET {path}{query} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");

    let deadline = Instant::now() + timeout;
    let mut sent = false;
    let mut buf = Vec::new();
    let mut read_buf = [0u8; 4096];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "request timed out"));
        }
        poll.poll(&mut events, Some(remaining))?;
        if events.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "request timed out"));
        }
        for ev in events.iter() {
            if ev.token() != token {
                continue;
            }
            if ev.is_writable() && !sent {
                stream.write_all(request.as_bytes())?;
                sent = true;
                poll.registry().reregister(&mut stream, token, Interest::READABLE)?;
            }
            if ev.is_readable() {
                loop {
                    match stream.read(&mut read_buf) {
                        Ok(0) => return extract_body(&buf),
                        Ok(n) => buf.extend_from_slice(&read_buf[..n]),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

fn extract_body(raw: &[u8]) -> io::Result<Vec<u8>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(raw) {
        Ok(httparse::Status::Complete(offset)) => Ok(raw[offset..].to_vec()),
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, "malformed http response")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocklist_updater_ignores_blank_and_comment_lines() {
        let text = b"# comment\n1.2.3.4-1.2.3.9\n\nrange:5.6.7.8-5.6.7.9\n";
        assert_eq!(BlocklistUpdater::apply(text), 2);
    }
}
