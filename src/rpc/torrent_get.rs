//! `torrent-get`: field-set parsing, id
//! resolution, and per-torrent projection in both `object` and `table`
//! formats.

use crate::quark::{self, keys, Quark};
use crate::session::{IdSelector, Session};
use crate::torrent::Torrent;
use crate::value::{Value, ValueMap};
use std::time::Instant;

pub fn handle(session: &Session, args: &ValueMap, now_instant: Instant) -> Result<ValueMap, String> {
    let fields = args
        .get(quark::intern_str("fields"))
        .and_then(Value::as_list)
        .ok_or_else(|| "no fields specified".to_string())?;
    if fields.is_empty() {
        return Err("no fields specified".to_string());
    }
    let canon_fields: Vec<Quark> = fields
        .iter()
        .filter_map(Value::as_bytes)
        .map(canonicalize)
        .collect();

    let wants_recently_active = matches!(
        args.get(quark::intern_str("ids")).and_then(Value::as_str),
        Some("recently-active") | Some("recently_active")
    );
    let ids = super::resolve_ids_from_args(session, args);
    let table_format = matches!(
        args.get(quark::intern_str("format")).and_then(Value::as_str),
        Some("table")
    );

    let mut response = ValueMap::new();
    if table_format {
        response.insert(keys::TORRENTS, table_rows(session, &ids, &canon_fields));
    } else {
        let list: Vec<Value> = ids
            .iter()
            .filter_map(|&id| session.get(id))
            .map(|t| Value::Map(project_object(t, &canon_fields)))
            .collect();
        response.insert(keys::TORRENTS, Value::List(list));
    }

    if wants_recently_active {
        let removed: Vec<Value> = session
            .removed_since(now_instant)
            .into_iter()
            .map(|id| Value::Int(id as i64))
            .collect();
        response.insert(keys::REMOVED, Value::List(removed));
    }

    Ok(response)
}

/// Resolves a requested field name (snake, kebab, or legacy camelCase) to
/// its canonical snake_case quark: the `builtin!` table always declares
/// the snake form first, so it carries the smaller id of the pair.
fn canonicalize(name: &[u8]) -> Quark {
    let q = quark::resolve_field(name);
    let alt = quark::convert(q);
    q.min(alt)
}

fn table_rows(session: &Session, ids: &[crate::torrent::TorrentId], fields: &[Quark]) -> Value {
    let header = Value::List(fields.iter().map(|&f| Value::string(quark::get_str(f))).collect());
    let rows = ids
        .iter()
        .filter_map(|&id| session.get(id))
        .map(|t| Value::List(fields.iter().map(|&f| field_value(t, f)).collect()));
    Value::List(std::iter::once(header).chain(rows).collect())
}

fn project_object(t: &Torrent, fields: &[Quark]) -> ValueMap {
    let mut m = ValueMap::new();
    for &canon in fields {
        let value = field_value(t, canon);
        let camel = quark::convert(canon);
        if camel != canon {
            m.insert(canon, value.clone());
            m.insert(camel, value);
        } else {
            m.insert(canon, value);
        }
    }
    m
}

fn field_value(t: &Torrent, field: Quark) -> Value {
    match field {
        keys::ID => Value::Int(t.id as i64),
        keys::NAME => Value::string(t.name().to_string()),
        keys::HASH_STRING => Value::string(t.metainfo.info_hash_hex()),
        keys::INFO_HASH => Value::string(t.metainfo.info_hash_hex()),
        keys::STATUS => Value::Int(t.status_code()),
        keys::ERROR => Value::Int(t.error_fields().0),
        keys::ERROR_STRING => Value::string(t.error_fields().1),
        keys::ADDED_DATE => Value::Int(t.counters.added_date),
        keys::ACTIVITY_DATE => Value::Int(t.counters.activity_date),
        keys::DONE_DATE => Value::Int(t.counters.done_date),
        keys::DOWNLOADED_EVER => Value::Int(t.counters.downloaded_ever as i64),
        keys::UPLOADED_EVER => Value::Int(t.counters.uploaded_ever as i64),
        keys::CORRUPT_EVER => Value::Int(t.counters.corrupt_ever as i64),
        keys::LEFT_UNTIL_DONE => Value::Int(t.left_until_done() as i64),
        keys::SIZE_WHEN_DONE => Value::Int(t.size_when_done() as i64),
        keys::HAVE_VALID => Value::Int(t.have_valid() as i64),
        keys::HAVE_UNCHECKED => Value::Int(t.have_unchecked_bytes as i64),
        keys::SECONDS_DOWNLOADING => Value::Int(t.counters.seconds_downloading as i64),
        keys::SECONDS_SEEDING => Value::Int(t.counters.seconds_seeding as i64),
        keys::BANDWIDTH_PRIORITY => Value::Int(t.bandwidth_priority as i64),
        keys::QUEUE_POSITION => Value::Int(t.queue_position as i64),
        keys::LABELS => Value::List(t.labels.iter().cloned().map(Value::string).collect()),
        keys::FILES => Value::List(
            t.metainfo
                .files
                .iter()
                .zip(&t.files)
                .map(|(entry, state)| {
                    let mut fm = ValueMap::new();
                    fm.insert_str("name", Value::string(entry.path.join("/")));
                    fm.insert_str("length", Value::Int(entry.length as i64));
                    fm.insert_str("wanted", Value::Bool(state.wanted));
                    Value::Map(fm)
                })
                .collect(),
        ),
        keys::DOWNLOAD_DIR => Value::string(t.download_dir.display().to_string()),
        keys::SEQUENTIAL_DOWNLOAD => Value::Bool(t.sequential_download),
        keys::PEER_LIMIT => Value::Int(t.peer_limit as i64),
        keys::RATE_UPLOAD => Value::Int(0),
        keys::RATE_DOWNLOAD => Value::Int(0),
        keys::BANDWIDTH_GROUP => t
            .bandwidth_group
            .clone()
            .map(Value::string)
            .unwrap_or_else(|| Value::string("")),
        keys::TRACKER_LIST => Value::string(
            t.trackers
                .iter()
                .map(|tr| tr.announce_url.clone())
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        keys::PIECE_COUNT => Value::Int(t.metainfo.piece_count() as i64),
        keys::PIECE_SIZE => Value::Int(t.metainfo.piece_length as i64),
        _ => Value::Null,
    }
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
        info.insert_str("name", V::string("movie.mkv"));
        info.insert_str("piece length", V::Int(16384));
        info.insert_str("pieces", V::Str(vec![9u8; 20]));
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
    fn missing_fields_argument_is_rejected() {
        let (session, _dir, _id) = session_with_one_torrent();
        let args = ValueMap::new();
        let err = handle(&session, &args, Instant::now()).unwrap_err();
        assert_eq!(err, "no fields specified");
    }

    #[test]
    fn object_format_emits_both_snake_and_camel_keys_for_paired_fields() {
        let (session, _dir, id) = session_with_one_torrent();
        let mut args = ValueMap::new();
        args.insert_str("fields", V::List(vec![V::string("id"), V::string("addedDate")]));
        args.insert_str("ids", V::List(vec![V::Int(id as i64)]));
        let resp = handle(&session, &args, Instant::now()).unwrap();
        let torrents = resp.get(keys::TORRENTS).unwrap().as_list().unwrap();
        let t0 = torrents[0].as_map().unwrap();
        assert!(t0.get(quark::intern_str("added_date")).is_some());
        assert!(t0.get(quark::intern_str("addedDate")).is_some());
        assert_eq!(t0.get(quark::intern_str("id")).and_then(Value::as_i64), Some(id as i64));
    }

    #[test]
    fn table_format_emits_a_header_row_then_one_row_per_torrent() {
        let (session, _dir, id) = session_with_one_torrent();
        let mut args = ValueMap::new();
        args.insert_str("fields", V::List(vec![V::string("id"), V::string("name")]));
        args.insert_str("format", V::string("table"));
        let resp = handle(&session, &args, Instant::now()).unwrap();
        let rows = resp.get(keys::TORRENTS).unwrap().as_list().unwrap();
        let header = rows[0].as_list().unwrap();
        assert_eq!(header[0].as_str(), Some("id"));
        assert_eq!(header[1].as_str(), Some("name"));
        let row1 = rows[1].as_list().unwrap();
        assert_eq!(row1[0].as_i64(), Some(id as i64));
        assert_eq!(row1[1].as_str(), Some("movie.mkv"));
    }
}
