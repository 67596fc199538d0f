//! HTTP(S) tracker announce/scrape.
//!
//! Decodes responses through the crate's own bencode `Value` codec rather
//! than a per-message `serde` struct, and drives the non-blocking socket
//! with a read-to-completion loop bounded by the announce/scrape timeouts.

use crate::torrent::metainfo::Metainfo;
use crate::value::{self, Value};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};
use thiserror::Error;
use urlencoding::encode_binary;

#[derive(Debug, Error)]
pub enum HttpTrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("request timed out")]
    Timeout,
    #[error("malformed tracker response")]
    Malformed,
    #[error("tracker reported failure: {0}")]
    Failure(String),
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub tracker_id: Option<String>,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub peers: Vec<Peer>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScrapeResponse {
    pub complete: u64,
    pub incomplete: u64,
    pub downloaded: u64,
}

pub struct AnnounceParams<'a> {
    pub metainfo: &'a Metainfo,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: crate::tracker::AnnounceEvent,
    pub numwant: u64,
    pub key: u32,
    pub tracker_id: Option<&'a str>,
    pub compact: bool,
}

pub fn announce(url_str: &str, params: &AnnounceParams<'_>) -> Result<AnnounceResponse, HttpTrackerError> {
    let url = url::Url::parse(url_str)?;
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact={}&numwant={}&key={:08x}",
        encode_binary(&params.metainfo.info_hash),
        encode_binary(&params.peer_id),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
        if params.compact { 1 } else { 0 },
        params.numwant,
        params.key,
    );
    if !matches!(params.event, crate::tracker::AnnounceEvent::None) {
        query.push_str(&format!("&event={}", params.event.as_str()));
    }
    if let Some(tid) = params.tracker_id {
        query.push_str(&format!("&trackerid={}", urlencoding::encode(tid)));
    }

    let body = http_get(&url, &query, crate::tracker::ANNOUNCE_TIMEOUT)?;
    parse_announce_response(&body)
}

pub fn scrape(scrape_url: &str, info_hashes: &[[u8; 20]]) -> Result<Vec<([u8; 20], ScrapeResponse)>, HttpTrackerError> {
    let url = url::Url::parse(scrape_url)?;
    let query: String = info_hashes
        .iter()
        .map(|h| format!("info_hash={}", encode_binary(h)))
        .collect::<Vec<_>>()
        .join("&");
    let body = http_get(&url, &query, crate::tracker::SCRAPE_TIMEOUT)?;
    parse_scrape_response(&body)
}

fn http_get(url: &url::Url, query: &str, timeout: Duration) -> Result<Vec<u8>, HttpTrackerError> {
    let host = url.host_str().ok_or(HttpTrackerError::Malformed)?;
    let port = url.port_or_known_default().unwrap_or(80);
    let addr: SocketAddr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or(HttpTrackerError::Malformed)?;

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(128);
    let mut stream = TcpStream::connect(addr)?;
    let token = Token(0);
    poll.registry()
        .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;

    let path = url.path();
    let sep = if url.query().is_some() { "&" } else { "?" };
    let request = format!(
        "GET {path}{sep}{query} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"
    );

    let deadline = Instant::now() + timeout;
    let mut sent = false;
    let mut buf = Vec::new();
    let mut read_buf = [0u8; 4096];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HttpTrackerError::Timeout);
        }
        poll.poll(&mut events, Some(remaining))?;
        if events.is_empty() {
            return Err(HttpTrackerError::Timeout);
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
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }
}

fn extract_body(raw: &[u8]) -> Result<Vec<u8>, HttpTrackerError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(raw).map_err(|_| HttpTrackerError::Malformed)? {
        httparse::Status::Complete(offset) => Ok(raw[offset..].to_vec()),
        httparse::Status::Partial => Err(HttpTrackerError::Malformed),
    }
}

fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, HttpTrackerError> {
    let value = value::bencode_decode(body).map_err(|_| HttpTrackerError::Malformed)?;
    let map = value.as_map().ok_or(HttpTrackerError::Malformed)?;

    if let Some(reason) = map.get(crate::quark::intern_str("failure reason")).and_then(Value::as_str) {
        return Err(HttpTrackerError::Failure(reason.to_string()));
    }

    let interval = map
        .get(crate::quark::intern_str("interval"))
        .and_then(|v| v.as_i64())
        .ok_or(HttpTrackerError::Malformed)? as u64;
    let min_interval = map
        .get(crate::quark::intern_str("min interval"))
        .and_then(|v| v.as_i64())
        .map(|v| v as u64);
    let tracker_id = map
        .get(crate::quark::intern_str("tracker id"))
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    let complete = map.get(crate::quark::intern_str("complete")).and_then(|v| v.as_i64()).map(|v| v as u64);
    let incomplete = map.get(crate::quark::intern_str("incomplete")).and_then(|v| v.as_i64()).map(|v| v as u64);
    let warning = map
        .get(crate::quark::intern_str("warning message"))
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    let peers = match map.get(crate::quark::intern_str("peers")) {
        Some(Value::Str(bytes)) => decode_compact_peers(bytes)?,
        Some(Value::List(list)) => list
            .iter()
            .filter_map(|p| {
                let m = p.as_map()?;
                let ip = m.get(crate::quark::intern_str("ip"))?.as_str()?;
                let port = m.get(crate::quark::intern_str("port"))?.as_i64()? as u16;
                let addr: SocketAddr = format!("{ip}:{port}").parse().ok()?;
                Some(Peer { addr })
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval,
        min_interval,
        tracker_id,
        complete,
        incomplete,
        peers,
        warning,
    })
}

fn decode_compact_peers(bytes: &[u8]) -> Result<Vec<Peer>, HttpTrackerError> {
    if bytes.len() % 6 != 0 {
        return Err(HttpTrackerError::Malformed);
    }
    Ok(bytes
        .chunks(6)
        .map(|c| {
            let ip = std::net::Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            Peer {
                addr: SocketAddr::from((ip, port)),
            }
        })
        .collect())
}

fn parse_scrape_response(body: &[u8]) -> Result<Vec<([u8; 20], ScrapeResponse)>, HttpTrackerError> {
    let value = value::bencode_decode(body).map_err(|_| HttpTrackerError::Malformed)?;
    let root = value.as_map().ok_or(HttpTrackerError::Malformed)?;
    let files = root
        .get(crate::quark::intern_str("files"))
        .and_then(Value::as_map)
        .ok_or(HttpTrackerError::Malformed)?;

    files
        .iter()
        .map(|(key, v)| {
            let hash_bytes = crate::quark::get(key);
            if hash_bytes.len() != 20 {
                return Err(HttpTrackerError::Malformed);
            }
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&hash_bytes);
            let m = v.as_map().ok_or(HttpTrackerError::Malformed)?;
            let complete = m.get(crate::quark::intern_str("complete")).and_then(|v| v.as_i64()).unwrap_or(0) as u64;
            let incomplete = m.get(crate::quark::intern_str("incomplete")).and_then(|v| v.as_i64()).unwrap_or(0) as u64;
            let downloaded = m.get(crate::quark::intern_str("downloaded")).and_then(|v| v.as_i64()).unwrap_or(0) as u64;
            Ok((
                hash,
                ScrapeResponse {
                    complete,
                    incomplete,
                    downloaded,
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueMap;

    #[test]
    fn parses_failure_reason() {
        let mut map = ValueMap::new();
        map.insert_str("failure reason", Value::string("unregistered torrent"));
        let body = value::bencode_encode(&Value::Map(map));
        let err = parse_announce_response(&body).unwrap_err();
        assert!(matches!(err, HttpTrackerError::Failure(_)));
    }

    #[test]
    fn parses_compact_peer_list() {
        let mut map = ValueMap::new();
        map.insert_str("interval", Value::Int(1800));
        map.insert_str("peers", Value::Str(vec![127, 0, 0, 1, 0x1A, 0xE1]));
        let body = value::bencode_encode(&Value::Map(map));
        let resp = parse_announce_response(&body).unwrap();
        assert_eq!(resp.interval, 1800);
        assert_eq!(resp.peers.len(), 1);
        assert_eq!(resp.peers[0].addr.port(), 0x1AE1);
    }

    #[test]
    fn parses_scrape_files_map() {
        let mut file = ValueMap::new();
        file.insert_str("complete", Value::Int(5));
        file.insert_str("incomplete", Value::Int(2));
        file.insert_str("downloaded", Value::Int(100));
        let mut files = ValueMap::new();
        files.insert(crate::quark::intern(&[9u8; 20]), Value::Map(file));
        let mut root = ValueMap::new();
        root.insert_str("files", Value::Map(files));
        let body = value::bencode_encode(&Value::Map(root));
        let result = parse_scrape_response(&body).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].0, [9u8; 20]);
        assert_eq!(result[0].1.complete, 5);
    }
}
