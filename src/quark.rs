//! Process-wide bidirectional string <-> integer id table.
//!
//! Every reusable byte-string label in the engine (RPC field names,
//! settings keys, resume-file keys, metainfo keys) is represented as a
//! [`Quark`] rather than a `String` so that maps, comparisons, and wire
//! serialization never pay for repeated string allocation or comparison.
//! The built-in entries are assigned fixed ids at build time (see the
//! `builtin!` table below) to keep serialized forms stable across
//! releases, mirroring `libtransmission`'s `tr_quark` table.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::OnceLock;

/// A small dense integer id for a reusable byte-string label.
pub type Quark = u32;

macro_rules! builtin {
    ($($name:ident => $lit:literal),* $(,)?) => {
        #[allow(non_upper_case_globals)]
        mod builtin_index {
            #![allow(dead_code)]
            builtin!(@count 0usize; $($name)*);
        }
        #[allow(non_upper_case_globals)]
        pub mod keys {
            use super::Quark;
            builtin!(@decl 0u32; $($name)*);
        }
        fn builtin_strings() -> &'static [&'static str] {
            &[$($lit),*]
        }
    };
    (@count $n:expr; ) => {};
    (@count $n:expr; $head:ident $($tail:ident)*) => {
        builtin!(@count $n + 1usize; $($tail)*);
    };
    (@decl $n:expr; ) => {};
    (@decl $n:expr; $head:ident $($tail:ident)*) => {
        pub const $head: Quark = $n;
        builtin!(@decl $n + 1u32; $($tail)*);
    };
}

// Subset of libtransmission's quark.h grounded on the real key set: the
// fields this crate's RPC, resume, and settings code actually reference.
// Ids are stable for the lifetime of a process build; do not reorder.
builtin! {
    NONE => "",
    ID => "id",
    NAME => "name",
    HASH_STRING => "hashString",
    INFO_HASH => "info_hash",
    STATUS => "status",
    ERROR => "error",
    ERROR_STRING => "error-string",
    ADDED_DATE => "added_date",
    ADDED_DATE_CAMEL => "addedDate",
    ACTIVITY_DATE => "activity_date",
    ACTIVITY_DATE_CAMEL => "activityDate",
    DONE_DATE => "done_date",
    DONE_DATE_CAMEL => "doneDate",
    DOWNLOADED_EVER => "downloaded_ever",
    DOWNLOADED_EVER_CAMEL => "downloadedEver",
    UPLOADED_EVER => "uploaded_ever",
    UPLOADED_EVER_CAMEL => "uploadedEver",
    CORRUPT_EVER => "corrupt_ever",
    CORRUPT_EVER_CAMEL => "corruptEver",
    LEFT_UNTIL_DONE => "left_until_done",
    LEFT_UNTIL_DONE_CAMEL => "leftUntilDone",
    SIZE_WHEN_DONE => "size_when_done",
    SIZE_WHEN_DONE_CAMEL => "sizeWhenDone",
    HAVE_VALID => "have_valid",
    HAVE_VALID_CAMEL => "haveValid",
    HAVE_UNCHECKED => "have_unchecked",
    HAVE_UNCHECKED_CAMEL => "haveUnchecked",
    SECONDS_DOWNLOADING => "seconds_downloading",
    SECONDS_DOWNLOADING_CAMEL => "secondsDownloading",
    SECONDS_SEEDING => "seconds_seeding",
    SECONDS_SEEDING_CAMEL => "secondsSeeding",
    BANDWIDTH_PRIORITY => "bandwidth_priority",
    BANDWIDTH_PRIORITY_CAMEL => "bandwidthPriority",
    QUEUE_POSITION => "queue_position",
    QUEUE_POSITION_CAMEL => "queuePosition",
    LABELS => "labels",
    FILES => "files",
    FILES_WANTED => "files-wanted",
    FILES_UNWANTED => "files-unwanted",
    PRIORITY_HIGH => "priority-high",
    PRIORITY_NORMAL => "priority-normal",
    PRIORITY_LOW => "priority-low",
    DOWNLOAD_DIR => "download-dir",
    SEQUENTIAL_DOWNLOAD => "sequential_download",
    SEQUENTIAL_DOWNLOAD_CAMEL => "sequentialDownload",
    PEER_LIMIT => "peer-limit",
    RATE_UPLOAD => "rateUpload",
    RATE_DOWNLOAD => "rateDownload",
    METHOD => "method",
    ARGUMENTS => "arguments",
    TAG => "tag",
    RESULT => "result",
    FIELDS => "fields",
    FORMAT => "format",
    IDS => "ids",
    REMOVED => "removed",
    TORRENTS => "torrents",
    TORRENT_ADDED => "torrent-added",
    TORRENT_DUPLICATE => "torrent-duplicate",
    FILENAME => "filename",
    METAINFO => "metainfo",
    PAUSED => "paused",
    DELETE_LOCAL_DATA => "delete-local-data",
    LOCATION => "location",
    BANDWIDTH_GROUP => "group",
    TRACKER_LIST => "trackerList",
    PATH => "path",
    SIZE_BYTES => "size-bytes",
    TOTAL_SIZE => "total_size",
    PIECE_COUNT => "pieceCount",
    PIECE_SIZE => "pieceSize",
    EDIT_DATE => "edit_date",
}

struct Table {
    by_bytes: RwLock<HashMap<Box<[u8]>, Quark>>,
    by_id: RwLock<Vec<Box<[u8]>>>,
}

fn table() -> &'static Table {
    static TABLE: OnceLock<Table> = OnceLock::new();
    TABLE.get_or_init(|| {
        let strings = builtin_strings();
        let mut by_bytes = HashMap::with_capacity(strings.len() * 2);
        let mut by_id = Vec::with_capacity(strings.len() * 2);
        for (i, s) in strings.iter().enumerate() {
            by_bytes.insert(s.as_bytes().to_vec().into_boxed_slice(), i as Quark);
            by_id.push(s.as_bytes().to_vec().into_boxed_slice());
        }
        Table {
            by_bytes: RwLock::new(by_bytes),
            by_id: RwLock::new(by_id),
        }
    })
}

/// Looks up an existing quark for `bytes` without interning it.
pub fn lookup(bytes: &[u8]) -> Option<Quark> {
    table().by_bytes.read().unwrap().get(bytes).copied()
}

/// Returns the quark id for `bytes`, interning it if this is the first
/// time this byte string has been seen. Allocates at most once per
/// distinct input.
pub fn intern(bytes: &[u8]) -> Quark {
    if let Some(q) = lookup(bytes) {
        return q;
    }
    let t = table();
    let mut by_bytes = t.by_bytes.write().unwrap();
    // Re-check under the write lock: another thread may have interned it
    // between our lookup and acquiring the lock.
    if let Some(q) = by_bytes.get(bytes) {
        return *q;
    }
    let mut by_id = t.by_id.write().unwrap();
    let id = by_id.len() as Quark;
    let boxed: Box<[u8]> = bytes.to_vec().into_boxed_slice();
    by_id.push(boxed.clone());
    by_bytes.insert(boxed, id);
    id
}

/// Returns the bytes for a previously-assigned quark id.
pub fn get(id: Quark) -> Box<[u8]> {
    table().by_id.read().unwrap()[id as usize].clone()
}

pub fn get_str(id: Quark) -> String {
    String::from_utf8_lossy(&get(id)).into_owned()
}

pub fn intern_str(s: &str) -> Quark {
    intern(s.as_bytes())
}

/// Maps a deprecated camelCase (or kebab-case) quark id to its canonical
/// snake_case replacement, and vice versa. RPC accepts both forms on
/// input; emission writes whichever form the caller expects, and in some
/// responses writes both deliberately for backward compatibility.
pub fn convert(id: Quark) -> Quark {
    use keys::*;
    match id {
        ADDED_DATE_CAMEL => ADDED_DATE,
        ADDED_DATE => ADDED_DATE_CAMEL,
        ACTIVITY_DATE_CAMEL => ACTIVITY_DATE,
        ACTIVITY_DATE => ACTIVITY_DATE_CAMEL,
        DONE_DATE_CAMEL => DONE_DATE,
        DONE_DATE => DONE_DATE_CAMEL,
        DOWNLOADED_EVER_CAMEL => DOWNLOADED_EVER,
        DOWNLOADED_EVER => DOWNLOADED_EVER_CAMEL,
        UPLOADED_EVER_CAMEL => UPLOADED_EVER,
        UPLOADED_EVER => UPLOADED_EVER_CAMEL,
        CORRUPT_EVER_CAMEL => CORRUPT_EVER,
        CORRUPT_EVER => CORRUPT_EVER_CAMEL,
        LEFT_UNTIL_DONE_CAMEL => LEFT_UNTIL_DONE,
        LEFT_UNTIL_DONE => LEFT_UNTIL_DONE_CAMEL,
        SIZE_WHEN_DONE_CAMEL => SIZE_WHEN_DONE,
        SIZE_WHEN_DONE => SIZE_WHEN_DONE_CAMEL,
        HAVE_VALID_CAMEL => HAVE_VALID,
        HAVE_VALID => HAVE_VALID_CAMEL,
        HAVE_UNCHECKED_CAMEL => HAVE_UNCHECKED,
        HAVE_UNCHECKED => HAVE_UNCHECKED_CAMEL,
        SECONDS_DOWNLOADING_CAMEL => SECONDS_DOWNLOADING,
        SECONDS_DOWNLOADING => SECONDS_DOWNLOADING_CAMEL,
        SECONDS_SEEDING_CAMEL => SECONDS_SEEDING,
        SECONDS_SEEDING => SECONDS_SEEDING_CAMEL,
        BANDWIDTH_PRIORITY_CAMEL => BANDWIDTH_PRIORITY,
        BANDWIDTH_PRIORITY => BANDWIDTH_PRIORITY_CAMEL,
        QUEUE_POSITION_CAMEL => QUEUE_POSITION,
        QUEUE_POSITION => QUEUE_POSITION_CAMEL,
        SEQUENTIAL_DOWNLOAD_CAMEL => SEQUENTIAL_DOWNLOAD,
        SEQUENTIAL_DOWNLOAD => SEQUENTIAL_DOWNLOAD_CAMEL,
        other => other,
    }
}

/// A quark id together with its legacy alias, if any is known.
pub fn aliases(id: Quark) -> Vec<Quark> {
    let alt = convert(id);
    if alt == id {
        vec![id]
    } else {
        vec![id, alt]
    }
}

/// Resolves a field name from an RPC request to a quark, accepting both
/// snake_case and kebab-case forms by trying the literal bytes first and
/// then the `-`<->`_` transposition.
pub fn resolve_field(name: &[u8]) -> Quark {
    if let Some(q) = lookup(name) {
        return q;
    }
    let transposed: Vec<u8> = name
        .iter()
        .map(|&b| match b {
            b'-' => b'_',
            b'_' => b'-',
            other => other,
        })
        .collect();
    if let Some(q) = lookup(&transposed) {
        return q;
    }
    intern(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let a = intern(b"some_new_key");
        let b = intern(b"some_new_key");
        assert_eq!(a, b);
        assert_eq!(&*get(a), b"some_new_key");
    }

    #[test]
    fn lookup_does_not_allocate_new_entries() {
        assert_eq!(lookup(b"definitely-not-interned-yet"), None);
        assert_eq!(lookup(b"definitely-not-interned-yet"), None);
    }

    #[test]
    fn builtin_ids_round_trip() {
        assert_eq!(lookup(b"id"), Some(keys::ID));
        assert_eq!(&*get(keys::ID), b"id");
    }

    #[test]
    fn convert_maps_camel_to_snake_and_back() {
        assert_eq!(convert(keys::ADDED_DATE_CAMEL), keys::ADDED_DATE);
        assert_eq!(convert(keys::ADDED_DATE), keys::ADDED_DATE_CAMEL);
        assert_eq!(convert(keys::ID), keys::ID);
    }

    #[test]
    fn resolve_field_accepts_either_case_style() {
        assert_eq!(resolve_field(b"download-dir"), keys::DOWNLOAD_DIR);
        assert_eq!(resolve_field(b"download_dir"), keys::DOWNLOAD_DIR);
    }
}
