//! `torrent-add`: validates exactly one of
//! `filename`/`metainfo`, dispatches to the right `Session::add_from_*`,
//! and shapes the `torrent-added`/`torrent-duplicate` response.
//!
//! `filename` can be a local path, a magnet URI, or an HTTP(S)/FTP URL;
//! the URL case is the one method-table entry inside `torrent-add` that's
//! asynchronous, so it submits a fetch job on `Session`'s worker pool
//! instead of downloading the torrent file inline.

use base64::Engine;
use crate::quark::{self, keys};
use crate::session::{AddOutcome, PendingFetchKind, Session, SessionError, TorrentAddOptions};
use crate::value::{Value, ValueMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

const URL_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Either the request resolved immediately (local file, magnet, inline
/// base64 metainfo) or it's a URL source now queued on the fetch worker
/// pool, identified by the returned id.
pub enum TorrentAddResult {
    Done(ValueMap),
    Pending(u64),
}

pub fn handle(session: &mut Session, args: &ValueMap, now: i64) -> Result<TorrentAddResult, String> {
    let filename = args.get(quark::intern_str("filename")).and_then(Value::as_str);
    let metainfo_b64 = args.get(quark::intern_str("metainfo")).and_then(Value::as_str);
    if filename.is_none() && metainfo_b64.is_none() {
        return Err("no filename or metainfo specified".to_string());
    }

    let opts = parse_options(args)?;

    if let Some(name) = filename {
        if let Some(uri) = name.strip_prefix("magnet:") {
            let outcome = session.add_from_magnet(&format!("magnet:{uri}"), opts, now).map_err(map_err)?;
            return Ok(TorrentAddResult::Done(outcome_to_value_map(session, outcome)));
        }
        if is_url_source(name) {
            let fetch_id =
                session.submit_fetch(name.to_string(), URL_FETCH_TIMEOUT, PendingFetchKind::TorrentAddUrl { opts, now });
            return Ok(TorrentAddResult::Pending(fetch_id));
        }
        let outcome = session.add_from_file(Path::new(name), opts, now).map_err(map_err)?;
        return Ok(TorrentAddResult::Done(outcome_to_value_map(session, outcome)));
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(metainfo_b64.unwrap())
        .map_err(|_| "invalid or corrupt torrent file".to_string())?;
    let outcome = session.add_from_metainfo_bytes(&bytes, opts, now).map_err(map_err)?;
    Ok(TorrentAddResult::Done(outcome_to_value_map(session, outcome)))
}

/// `filename` is a fetchable URL rather than a local path when it carries
/// one of the schemes the spec calls out: HTTP(S) or FTP. Magnet URIs are
/// handled separately before this check runs.
fn is_url_source(name: &str) -> bool {
    ["http://", "https://", "ftp://"].iter().any(|scheme| name.starts_with(scheme))
}

fn parse_options(args: &ValueMap) -> Result<TorrentAddOptions, String> {
    let download_dir = args
        .get(quark::intern_str("download-dir"))
        .and_then(Value::as_str)
        .map(PathBuf::from);
    if let Some(dir) = &download_dir {
        if dir.is_relative() {
            return Err("download directory path is not absolute".to_string());
        }
    }
    let paused = args.get(quark::intern_str("paused")).and_then(Value::as_bool).unwrap_or(false);
    let peer_limit = args
        .get(quark::intern_str("peer-limit"))
        .and_then(Value::as_i64)
        .map(|n| n as u32);
    let bandwidth_priority = args
        .get(quark::intern_str("bandwidth_priority"))
        .and_then(Value::as_i64)
        .map(|n| n as i8);
    let labels = args
        .get(quark::intern_str("labels"))
        .and_then(Value::as_list)
        .map(|l| l.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let sequential_download = args
        .get(quark::intern_str("sequential_download"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(TorrentAddOptions {
        download_dir,
        paused,
        peer_limit,
        bandwidth_priority,
        labels,
        sequential_download,
    })
}

fn outcome_to_value_map(session: &Session, outcome: AddOutcome) -> ValueMap {
    let (key, id) = match outcome {
        AddOutcome::Added(id) => (keys::TORRENT_ADDED, id),
        AddOutcome::Duplicate(id) => (keys::TORRENT_DUPLICATE, id),
    };
    let mut inner = ValueMap::new();
    inner.insert(keys::ID, Value::Int(id as i64));
    if let Some(t) = session.get(id) {
        inner.insert(keys::NAME, Value::string(t.name().to_string()));
        inner.insert(keys::HASH_STRING, Value::string(t.metainfo.info_hash_hex()));
    }
    let mut outer = ValueMap::new();
    outer.insert(key, Value::Map(inner));
    outer
}

fn map_err(e: SessionError) -> String {
    e.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::value::Value as V;

    fn sample_torrent_bytes() -> Vec<u8> {
        let mut info = ValueMap::new();
        info.insert_str("name", V::string("t"));
        info.insert_str("piece length", V::Int(16384));
        info.insert_str("pieces", V::Str(vec![5u8; 20]));
        info.insert_str("length", V::Int(16384));
        let mut root = ValueMap::new();
        root.insert(quark::intern_str("info"), V::Map(info));
        crate::value::bencode_encode(&V::Map(root))
    }

    fn base64_encode(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    fn session_with_tmp() -> (Session, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.config_dir = dir.path().to_path_buf();
        settings.download_dir = dir.path().join("d");
        (Session::new(settings), dir)
    }

    #[test]
    fn rejects_when_neither_filename_nor_metainfo_given() {
        let (mut session, _dir) = session_with_tmp();
        let args = ValueMap::new();
        let err = handle(&mut session, &args, 1000).unwrap_err();
        assert_eq!(err, "no filename or metainfo specified");
    }

    #[test]
    fn adds_from_base64_metainfo_and_reports_torrent_added() {
        let (mut session, _dir) = session_with_tmp();
        let encoded = base64_encode(&sample_torrent_bytes());
        let mut args = ValueMap::new();
        args.insert_str("metainfo", V::string(encoded));
        let resp = match handle(&mut session, &args, 1000).unwrap() {
            TorrentAddResult::Done(m) => m,
            TorrentAddResult::Pending(_) => panic!("expected an immediate result"),
        };
        assert!(resp.get(keys::TORRENT_ADDED).is_some());
    }

    #[test]
    fn duplicate_info_hash_reports_torrent_duplicate() {
        let (mut session, _dir) = session_with_tmp();
        let encoded = base64_encode(&sample_torrent_bytes());
        let mut args = ValueMap::new();
        args.insert_str("metainfo", V::string(encoded.clone()));
        handle(&mut session, &args, 1000).unwrap();
        let mut args2 = ValueMap::new();
        args2.insert_str("metainfo", V::string(encoded));
        let resp = match handle(&mut session, &args2, 1001).unwrap() {
            TorrentAddResult::Done(m) => m,
            TorrentAddResult::Pending(_) => panic!("expected an immediate result"),
        };
        assert!(resp.get(keys::TORRENT_DUPLICATE).is_some());
    }

    #[test]
    fn http_url_filename_is_queued_as_a_pending_fetch() {
        let (mut session, _dir) = session_with_tmp();
        let mut args = ValueMap::new();
        args.insert_str("filename", V::string("http://example.com/movie.torrent"));
        match handle(&mut session, &args, 1000).unwrap() {
            TorrentAddResult::Pending(_) => {}
            TorrentAddResult::Done(_) => panic!("expected a pending fetch"),
        }
    }
}
