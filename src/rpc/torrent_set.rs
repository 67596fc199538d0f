//! `torrent-set` and `torrent-set-location`: per-torrent
//! mutable attributes RPC callers can adjust without a full remove/re-add.

use crate::quark;
use crate::session::{IdSelector, Session, SessionError};
use crate::torrent::Priority;
use crate::value::{Value, ValueMap};
use std::path::Path;

pub fn handle(session: &mut Session, args: &ValueMap) -> Result<(), String> {
    let ids = super::resolve_ids_from_args(session, args);
    for id in ids {
        apply_one(session, id, args).map_err(session_error_message)?;
    }
    Ok(())
}

fn apply_one(session: &mut Session, id: crate::torrent::TorrentId, args: &ValueMap) -> Result<(), SessionError> {
    let t = session.get_mut(id).ok_or(SessionError::NoSuchTorrent)?;

    if let Some(p) = args.get(quark::intern_str("bandwidth_priority")).and_then(Value::as_i64) {
        t.bandwidth_priority = p as i8;
    }
    if let Some(name) = args.get(quark::intern_str("group")).and_then(Value::as_str) {
        t.bandwidth_group = Some(name.to_string());
    }
    if let Some(labels) = args.get(quark::intern_str("labels")).and_then(Value::as_list) {
        let labels: Vec<String> = labels.iter().filter_map(Value::as_str).map(str::to_string).collect();
        t.set_labels(labels)?;
    }
    if let Some(indices) = args.get(quark::intern_str("files-wanted")).and_then(Value::as_list) {
        for idx in indices.iter().filter_map(Value::as_i64) {
            t.set_file_wanted(idx as usize, true)?;
        }
    }
    if let Some(indices) = args.get(quark::intern_str("files-unwanted")).and_then(Value::as_list) {
        for idx in indices.iter().filter_map(Value::as_i64) {
            t.set_file_wanted(idx as usize, false)?;
        }
    }
    if let Some(indices) = args.get(quark::intern_str("priority-high")).and_then(Value::as_list) {
        for idx in indices.iter().filter_map(Value::as_i64) {
            t.set_file_priority(idx as usize, Priority::High)?;
        }
    }
    if let Some(indices) = args.get(quark::intern_str("priority-normal")).and_then(Value::as_list) {
        for idx in indices.iter().filter_map(Value::as_i64) {
            t.set_file_priority(idx as usize, Priority::Normal)?;
        }
    }
    if let Some(indices) = args.get(quark::intern_str("priority-low")).and_then(Value::as_list) {
        for idx in indices.iter().filter_map(Value::as_i64) {
            t.set_file_priority(idx as usize, Priority::Low)?;
        }
    }
    if let Some(n) = args.get(quark::intern_str("peer-limit")).and_then(Value::as_i64) {
        t.peer_limit = n as u32;
    }
    if let Some(b) = args
        .get(quark::intern_str("sequential_download"))
        .and_then(Value::as_bool)
    {
        t.sequential_download = b;
    }
    if let Some(urls) = args.get(quark::intern_str("trackerList")).and_then(Value::as_str) {
        let tiers: Vec<Vec<String>> = urls
            .split("\n\n")
            .map(|tier| tier.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
            .filter(|tier: &Vec<String>| !tier.is_empty())
            .collect();
        t.trackers = crate::tracker::TrackerEntry::from_announce_lists(&None, &tiers);
    }

    Ok(())
}

/// `torrent-set-location`: moves a torrent's on-disk directory reference
/// without touching the files themselves.
pub fn set_location(session: &mut Session, args: &ValueMap) -> Result<(), String> {
    let location = args
        .get(quark::intern_str("location"))
        .and_then(Value::as_str)
        .ok_or_else(|| "no location specified".to_string())?;
    let ids = match args.get(quark::intern_str("ids")) {
        None => session.resolve_ids(&IdSelector::All),
        _ => super::resolve_ids_from_args(session, args),
    };
    for id in ids {
        session
            .set_location(id, Path::new(location))
            .map_err(session_error_message)?;
    }
    Ok(())
}

fn session_error_message(e: SessionError) -> String {
    e.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::session::{AddOutcome, TorrentAddOptions};
    use crate::value::{Value as V, ValueMap as VM};
    use tempfile::tempdir;

    fn sample_metainfo() -> crate::torrent::Metainfo {
        let mut info = VM::new();
        info.insert_str("name", V::string("t"));
        info.insert_str("piece length", V::Int(16384));
        info.insert_str("pieces", V::Str(vec![3u8; 20]));
        info.insert_str("length", V::Int(16384));
        let mut root = VM::new();
        root.insert(quark::intern_str("info"), V::Map(info));
        crate::torrent::Metainfo::from_bencode(&crate::value::bencode_encode(&V::Map(root))).unwrap()
    }

    fn session_with_one_torrent() -> (Session, tempfile::TempDir, crate::torrent::TorrentId) {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.config_dir = dir.path().to_path_buf();
        settings.download_dir = dir.path().join("d");
        let mut session = Session::new(settings);
        let id = match session.add_from_metainfo(sample_metainfo(), TorrentAddOptions::default(), 1000).unwrap() {
            AddOutcome::Added(id) => id,
            _ => unreachable!(),
        };
        (session, dir, id)
    }

    #[test]
    fn sets_labels_and_bandwidth_priority() {
        let (mut session, _dir, id) = session_with_one_torrent();
        let mut args = ValueMap::new();
        args.insert_str("ids", V::List(vec![V::Int(id as i64)]));
        args.insert_str("labels", V::List(vec![V::string("movies")]));
        args.insert_str("bandwidth_priority", V::Int(1));
        handle(&mut session, &args).unwrap();
        let t = session.get(id).unwrap();
        assert_eq!(t.labels, vec!["movies".to_string()]);
        assert_eq!(t.bandwidth_priority, 1);
    }

    #[test]
    fn set_location_rejects_relative_paths() {
        let (mut session, _dir, id) = session_with_one_torrent();
        let mut args = ValueMap::new();
        args.insert_str("ids", V::List(vec![V::Int(id as i64)]));
        args.insert_str("location", V::string("relative/dir"));
        let err = set_location(&mut session, &args).unwrap_err();
        assert_eq!(err, "new location path is not absolute");
    }
}
