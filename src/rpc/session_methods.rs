//! The session-scoped synchronous handlers: session-get/
//! set/stats/close, free-space, group-get/set, queue-move-*, and the
//! torrent-foreach helpers `torrent-start/stop/remove` share.

use super::{resolve_ids_from_args, RPC_VERSION, RPC_VERSION_MINIMUM, RPC_VERSION_SEMVER};
use crate::quark;
use crate::session::{BandwidthGroup, QueueMove, Session, SessionError};
use crate::torrent::Torrent;
use crate::value::{Value, ValueMap};
use std::path::PathBuf;
use std::time::Instant;

pub fn session_get(session: &Session) -> Result<ValueMap, String> {
    let s = &session.settings;
    let mut m = ValueMap::new();
    m.insert_str("rpc-version", Value::Int(RPC_VERSION));
    m.insert_str("rpc-version-minimum", Value::Int(RPC_VERSION_MINIMUM));
    m.insert_str("rpc-version-semver", Value::string(RPC_VERSION_SEMVER));
    m.insert_str("download-dir", Value::string(s.download_dir.display().to_string()));
    m.insert_str("peer-port", Value::Int(s.peer_port as i64));
    m.insert_str("peer-limit-global", Value::Int(s.peer_limit_global as i64));
    m.insert_str("peer-limit-per-torrent", Value::Int(s.peer_limit_per_torrent as i64));
    m.insert_str("dht-enabled", Value::Bool(s.dht_enabled));
    m.insert_str("lpd-enabled", Value::Bool(s.lpd_enabled));
    m.insert_str("utp-enabled", Value::Bool(s.utp_enabled));
    m.insert_str("port-forwarding-enabled", Value::Bool(s.port_forwarding_enabled));
    m.insert_str("seedRatioLimit", Value::Double(s.ratio_limit));
    m.insert_str("seedRatioLimited", Value::Bool(s.ratio_limit_enabled));
    m.insert_str("version", Value::string(format!("rsbtd {}", RPC_VERSION_SEMVER)));
    Ok(m)
}

pub fn session_set(session: &mut Session, args: &ValueMap) -> Result<(), String> {
    let s = &mut session.settings;
    if let Some(dir) = args.get(quark::intern_str("download-dir")).and_then(Value::as_str) {
        s.download_dir = PathBuf::from(dir);
    }
    if let Some(n) = args.get(quark::intern_str("peer-limit-global")).and_then(Value::as_i64) {
        s.peer_limit_global = n as u32;
    }
    if let Some(n) = args.get(quark::intern_str("peer-limit-per-torrent")).and_then(Value::as_i64) {
        s.peer_limit_per_torrent = n as u32;
    }
    if let Some(b) = args.get(quark::intern_str("dht-enabled")).and_then(Value::as_bool) {
        s.dht_enabled = b;
    }
    if let Some(b) = args.get(quark::intern_str("lpd-enabled")).and_then(Value::as_bool) {
        s.lpd_enabled = b;
    }
    if let Some(b) = args.get(quark::intern_str("utp-enabled")).and_then(Value::as_bool) {
        s.utp_enabled = b;
    }
    if let Some(d) = args.get(quark::intern_str("seedRatioLimit")).and_then(Value::as_f64) {
        s.ratio_limit = d;
    }
    if let Some(b) = args.get(quark::intern_str("seedRatioLimited")).and_then(Value::as_bool) {
        s.ratio_limit_enabled = b;
    }
    Ok(())
}

pub fn session_stats(session: &Session) -> Result<ValueMap, String> {
    let stats = &session.session_stats;
    let seconds_active = session.uptime().as_secs();

    let mut current = ValueMap::new();
    current.insert_str("uploadedBytes", Value::Int(stats.uploaded_bytes as i64));
    current.insert_str("downloadedBytes", Value::Int(stats.downloaded_bytes as i64));
    current.insert_str("filesAdded", Value::Int(stats.files_added as i64));
    current.insert_str("secondsActive", Value::Int(seconds_active as i64));
    current.insert_str("sessionCount", Value::Int(1));

    let mut cumulative = ValueMap::new();
    cumulative.insert_str(
        "uploadedBytes",
        Value::Int((stats.cumulative_uploaded_bytes + stats.uploaded_bytes) as i64),
    );
    cumulative.insert_str(
        "downloadedBytes",
        Value::Int((stats.cumulative_downloaded_bytes + stats.downloaded_bytes) as i64),
    );
    cumulative.insert_str(
        "filesAdded",
        Value::Int((stats.cumulative_files_added + stats.files_added) as i64),
    );
    cumulative.insert_str(
        "secondsActive",
        Value::Int((stats.cumulative_seconds_active + seconds_active) as i64),
    );
    cumulative.insert_str("sessionCount", Value::Int((stats.cumulative_session_count + 1) as i64));

    let mut m = ValueMap::new();
    m.insert_str("activeTorrentCount", Value::Int(session_active_count(session) as i64));
    m.insert_str("torrentCount", Value::Int(session.len() as i64));
    m.insert_str("uploadedBytes", Value::Int(stats.uploaded_bytes as i64));
    m.insert_str("downloadedBytes", Value::Int(stats.downloaded_bytes as i64));
    m.insert_str("secondsActive", Value::Int(seconds_active as i64));
    m.insert_str("current-stats", Value::Map(current));
    m.insert_str("cumulative-stats", Value::Map(cumulative));
    Ok(m)
}

fn session_active_count(session: &Session) -> usize {
    session
        .resolve_ids(&crate::session::IdSelector::All)
        .into_iter()
        .filter(|&id| session.get(id).map(|t| t.activity.is_active()).unwrap_or(false))
        .count()
}

/// Reports free and total capacity for the filesystem containing `path`.
pub fn free_space(args: &ValueMap) -> Result<ValueMap, String> {
    let path = args
        .get(quark::intern_str("path"))
        .and_then(Value::as_str)
        .ok_or_else(|| "no path specified".to_string())?;
    let (free, total) = Session::free_space(std::path::Path::new(path)).map_err(session_error_message)?;
    let mut m = ValueMap::new();
    m.insert_str("path", Value::string(path.to_string()));
    m.insert_str("size-bytes", Value::Int(free as i64));
    m.insert_str("total_size", Value::Int(total as i64));
    Ok(m)
}

pub fn group_get(session: &Session, args: &ValueMap) -> Result<ValueMap, String> {
    let name = args
        .get(quark::intern_str("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| "no group name specified".to_string())?;
    let group = session.group_get(name).ok_or_else(|| "no such bandwidth group".to_string())?;
    Ok(group_to_value_map(group))
}

fn group_to_value_map(group: &BandwidthGroup) -> ValueMap {
    let mut m = ValueMap::new();
    m.insert_str("name", Value::string(group.name.clone()));
    if let Some(v) = group.up_limit_kbps {
        m.insert_str("uploadLimit", Value::Int(v as i64));
    }
    if let Some(v) = group.down_limit_kbps {
        m.insert_str("downloadLimit", Value::Int(v as i64));
    }
    m.insert_str("uploadLimited", Value::Bool(group.up_limited));
    m.insert_str("downloadLimited", Value::Bool(group.down_limited));
    m
}

pub fn group_set(session: &mut Session, args: &ValueMap) -> Result<(), String> {
    let name = args
        .get(quark::intern_str("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| "no group name specified".to_string())?
        .to_string();
    let mut group = session.group_get(&name).cloned().unwrap_or_else(|| BandwidthGroup {
        name: name.clone(),
        ..BandwidthGroup::default()
    });
    if let Some(n) = args.get(quark::intern_str("uploadLimit")).and_then(Value::as_i64) {
        group.up_limit_kbps = Some(n as u64);
    }
    if let Some(n) = args.get(quark::intern_str("downloadLimit")).and_then(Value::as_i64) {
        group.down_limit_kbps = Some(n as u64);
    }
    if let Some(b) = args.get(quark::intern_str("uploadLimited")).and_then(Value::as_bool) {
        group.up_limited = b;
    }
    if let Some(b) = args.get(quark::intern_str("downloadLimited")).and_then(Value::as_bool) {
        group.down_limited = b;
    }
    session.group_set(group);
    Ok(())
}

pub fn queue_move(session: &mut Session, args: &ValueMap, direction: QueueMove) -> Result<(), String> {
    let ids = resolve_ids_from_args(session, args);
    // Transmission applies queue moves in the order given, which for
    // "top"/"bottom" keeps the caller's relative order stable.
    for id in ids {
        session.queue_move(id, direction).map_err(session_error_message)?;
    }
    Ok(())
}

pub fn torrent_remove(session: &mut Session, args: &ValueMap, now: Instant) -> Result<(), String> {
    let delete_local_data = args
        .get(quark::intern_str("delete-local-data"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let ids = resolve_ids_from_args(session, args);
    for id in ids {
        session.remove_torrent(id, delete_local_data, now).map_err(session_error_message)?;
    }
    Ok(())
}

/// Shared helper behind `torrent-start`/`torrent-start-now`/`torrent-stop`:
/// applies `f` to every torrent matched by `ids`.
pub fn torrent_foreach(
    session: &mut Session,
    args: &ValueMap,
    f: impl Fn(&mut Torrent) -> Result<(), String>,
) -> Result<(), String> {
    let ids = resolve_ids_from_args(session, args);
    for id in ids {
        if let Some(t) = session.get_mut(id) {
            f(t)?;
        }
    }
    Ok(())
}

pub fn session_error_message(e: SessionError) -> String {
    e.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::session::TorrentAddOptions;
    use crate::torrent::Metainfo;
    use crate::value::{Value as V, ValueMap as VM};
    use tempfile::tempdir;

    fn sample_metainfo() -> Metainfo {
        let mut info = VM::new();
        info.insert_str("name", V::string("t"));
        info.insert_str("piece length", V::Int(16384));
        info.insert_str("pieces", V::Str(vec![1u8; 20]));
        info.insert_str("length", V::Int(16384));
        let mut root = VM::new();
        root.insert(quark::intern_str("info"), V::Map(info));
        Metainfo::from_bencode(&crate::value::bencode_encode(&V::Map(root))).unwrap()
    }

    #[test]
    fn free_space_rejects_missing_path() {
        let args = ValueMap::new();
        assert!(free_space(&args).is_err());
    }

    #[test]
    fn free_space_reports_size_and_total_for_tmp() {
        let mut args = ValueMap::new();
        args.insert_str("path", Value::string("/tmp"));
        let m = free_space(&args).unwrap();
        let size = m.get(quark::intern_str("size-bytes")).and_then(Value::as_i64).unwrap();
        let total = m.get(quark::intern_str("total_size")).and_then(Value::as_i64).unwrap();
        assert!(size >= 0);
        assert!(total >= size);
    }

    #[test]
    fn queue_move_down_via_rpc_swaps_positions() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.config_dir = dir.path().to_path_buf();
        settings.download_dir = dir.path().join("d");
        let mut session = Session::new(settings);
        let first = match session.add_from_metainfo(sample_metainfo(), TorrentAddOptions::default(), 1).unwrap() {
            crate::session::AddOutcome::Added(id) => id,
            _ => unreachable!(),
        };
        session.get_mut(first).unwrap().queue_position = 0;

        let mut args = ValueMap::new();
        args.insert_str("ids", Value::List(vec![Value::Int(first as i64)]));
        queue_move(&mut session, &args, QueueMove::Down).unwrap();
        // only one torrent, nothing to swap with, position stays put
        assert_eq!(session.get(first).unwrap().queue_position, 0);
    }

    #[test]
    fn session_stats_reports_current_and_cumulative_blocks() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.config_dir = dir.path().to_path_buf();
        let mut session = Session::new(settings);
        session.session_stats.uploaded_bytes = 42;

        let m = session_stats(&session).unwrap();
        let current = m.get(quark::intern_str("current-stats")).and_then(Value::as_map).unwrap();
        let cumulative = m.get(quark::intern_str("cumulative-stats")).and_then(Value::as_map).unwrap();
        assert_eq!(current.get(quark::intern_str("uploadedBytes")).and_then(Value::as_i64), Some(42));
        assert_eq!(cumulative.get(quark::intern_str("uploadedBytes")).and_then(Value::as_i64), Some(42));
        assert_eq!(cumulative.get(quark::intern_str("sessionCount")).and_then(Value::as_i64), Some(1));
    }
}
