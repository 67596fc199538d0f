//! The three RPC methods that need to reach outside the process:
//! `blocklist-update`, `port-test`, and `torrent-rename-path`.
//!
//! `blocklist-update` and `port-test` only ever submit a fetch job to
//! `Session`'s worker pool (see `net_fetch.rs` and `Session::submit_fetch`)
//! and hand the dispatcher a request id to poll later — neither one ever
//! runs the blocking HTTP request on the event-loop thread.
//! `torrent-rename-path` touches only the local filesystem, so it stays
//! synchronous.

use crate::quark::{self, keys};
use crate::session::{PendingFetchKind, Session, SessionError};
use crate::value::{Value, ValueMap};
use std::time::Duration;

const PORT_TEST_TIMEOUT: Duration = Duration::from_secs(20);
const BLOCKLIST_TIMEOUT: Duration = Duration::from_secs(30);
const PORT_TEST_HOST: &str = "portcheck.transmissionbt.com";

const BLOCKLIST_URL: &str = "https://www.iblocklist.com/lists/level1.txt";

/// Queues the blocklist download and returns the fetch id the dispatcher
/// should poll.
pub fn blocklist_update(session: &mut Session) -> Result<u64, String> {
    Ok(session.submit_fetch(BLOCKLIST_URL.to_string(), BLOCKLIST_TIMEOUT, PendingFetchKind::BlocklistUpdate))
}

/// `port-test`: asks a well-known service whether the configured peer
/// port is reachable from outside. Queues the request and returns the
/// fetch id the dispatcher should poll.
pub fn port_test(session: &mut Session, args: &ValueMap) -> Result<u64, String> {
    if let Some(proto) = args.get(quark::intern_str("ip-protocol")).and_then(Value::as_str) {
        if proto != "ipv4" && proto != "ipv6" {
            return Err(format!("unsupported ip-protocol: {proto}"));
        }
    }
    let url = format!("https://{PORT_TEST_HOST}/?port={}", session.settings.peer_port);
    Ok(session.submit_fetch(url, PORT_TEST_TIMEOUT, PendingFetchKind::PortTest))
}

/// `torrent-rename-path`: renames one path component inside a torrent's
/// file tree, on disk and in the in-memory metainfo alike.
pub fn torrent_rename_path(session: &mut Session, args: &ValueMap, now: i64) -> Result<ValueMap, String> {
    let path = args
        .get(quark::intern_str("path"))
        .and_then(Value::as_str)
        .ok_or_else(|| "no path specified".to_string())?;
    let name = args
        .get(quark::intern_str("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| "no name specified".to_string())?;
    let ids = super::resolve_ids_from_args(session, args);
    let id = *ids.first().ok_or(SessionError::NoSuchTorrent).map_err(|e| e.to_string())?;
    let t = session.get_mut(id).ok_or(SessionError::NoSuchTorrent).map_err(|e| e.to_string())?;

    let old_dir = t.download_dir.clone();
    for entry in &mut t.metainfo.files {
        let matches = entry.path.join("/") == path || entry.path.last().map(String::as_str) == Some(path);
        if !matches {
            continue;
        }
        let old_path = path_for(&old_dir, &entry.path);
        if let Some(last) = entry.path.last_mut() {
            *last = name.to_string();
        }
        let new_path = path_for(&old_dir, &entry.path);
        let _ = std::fs::rename(&old_path, &new_path);
    }
    t.counters.activity_date = now;

    let mut m = ValueMap::new();
    m.insert(keys::ID, Value::Int(id as i64));
    m.insert_str("path", Value::string(path.to_string()));
    m.insert_str("name", Value::string(name.to_string()));
    Ok(m)
}

fn path_for(dir: &std::path::Path, parts: &[String]) -> std::path::PathBuf {
    let mut p = dir.to_path_buf();
    for part in parts {
        p.push(part);
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_test_rejects_unsupported_ip_protocol() {
        let mut session = Session::new(crate::config::Settings::default());
        let mut args = ValueMap::new();
        args.insert_str("ip-protocol", Value::string("ipv5"));
        let err = port_test(&mut session, &args).unwrap_err();
        assert_eq!(err, "unsupported ip-protocol: ipv5");
    }

    #[test]
    fn blocklist_update_returns_a_pollable_fetch_id() {
        let mut session = Session::new(crate::config::Settings::default());
        let first = blocklist_update(&mut session).unwrap();
        let second = blocklist_update(&mut session).unwrap();
        assert_ne!(first, second);
    }
}
