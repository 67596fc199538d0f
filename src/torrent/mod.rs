//! The torrent object: aggregate runtime state of one torrent.

pub mod metainfo;

pub use metainfo::{FileEntry, Metainfo, MetainfoError};

use crate::bitfield::BitField;
use crate::tracker::TrackerEntry;

pub type TorrentId = u32;

/// Per-piece priority. Transmission's three-level scheme: a whole file
/// can be deprioritized (`Low`) or excluded from download (`Unwanted`,
/// tracked separately via the want flag) without blocking completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone)]
pub struct FileState {
    pub wanted: bool,
    pub priority: Priority,
}

impl Default for FileState {
    fn default() -> Self {
        FileState {
            wanted: true,
            priority: Priority::Normal,
        }
    }
}

/// Activity states: `stopped | checking | downloading | seeding |
/// queued-check | queued-down | queued-seed`, plus a soft-error state for
/// local storage failures that is orthogonal to the lifecycle but still
/// halts downloading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Stopped,
    QueuedCheck,
    Checking,
    QueuedDown,
    Downloading,
    QueuedSeed,
    Seeding,
    SoftError(String),
}

impl Activity {
    pub fn is_checking(&self) -> bool {
        matches!(self, Activity::Checking)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Activity::Downloading | Activity::Seeding | Activity::Checking
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub uploaded_ever: u64,
    pub downloaded_ever: u64,
    pub corrupt_ever: u64,
    pub seconds_downloading: u64,
    pub seconds_seeding: u64,
    pub activity_date: i64,
    pub added_date: i64,
    pub done_date: i64,
}

pub struct Torrent {
    pub id: TorrentId,
    pub metainfo: Metainfo,
    pub activity: Activity,
    /// Which pieces have been hash-verified. Length always equals
    /// `metainfo.piece_count()` once the piece layout is known.
    pub bitfield: BitField,
    /// Pieces whose blocks are all present on disk but not yet
    /// hash-verified: `have_valid + have_unchecked <= total_size`.
    pub have_unchecked_bytes: u64,
    pub files: Vec<FileState>,
    pub trackers: Vec<TrackerEntry>,
    pub counters: Counters,
    pub queue_position: u32,
    pub labels: Vec<String>,
    pub bandwidth_group: Option<String>,
    pub bandwidth_priority: i8,
    pub peer_limit: u32,
    pub sequential_download: bool,
    pub download_dir: std::path::PathBuf,
    checked_pieces: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("labels cannot contain comma (,) character")]
    LabelHasComma,
    #[error("labels cannot be empty")]
    LabelEmpty,
    #[error("file index {0} is out of range")]
    FileIndexOutOfRange(usize),
}

impl Torrent {
    pub fn new(id: TorrentId, metainfo: Metainfo, download_dir: std::path::PathBuf, now: i64) -> Torrent {
        let piece_count = metainfo.piece_count();
        let files = metainfo.files.iter().map(|_| FileState::default()).collect();
        Torrent {
            id,
            bitfield: BitField::new(piece_count),
            have_unchecked_bytes: 0,
            files,
            trackers: TrackerEntry::from_announce_lists(&metainfo.announce, &metainfo.announce_list),
            metainfo,
            activity: Activity::QueuedCheck,
            counters: Counters {
                added_date: now,
                activity_date: now,
                ..Default::default()
            },
            queue_position: id,
            labels: Vec::new(),
            bandwidth_group: None,
            bandwidth_priority: 0,
            peer_limit: 50,
            sequential_download: false,
            download_dir,
            checked_pieces: 0,
        }
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.metainfo.info_hash
    }

    pub fn name(&self) -> &str {
        &self.metainfo.name
    }

    pub fn have_valid(&self) -> u64 {
        self.bitfield
            .pieces()
            .into_iter()
            .map(|p| self.metainfo.piece_size(p as u32) as u64)
            .sum()
    }

    /// Total size of files the caller actually wants, i.e. excluding
    /// files deselected via `files-unwanted`.
    pub fn size_when_done(&self) -> u64 {
        self.files
            .iter()
            .zip(&self.metainfo.files)
            .filter(|(f, _)| f.wanted)
            .map(|(_, entry)| entry.length)
            .sum()
    }

    /// `left_until_done = size_when_done - have_valid`.
    pub fn left_until_done(&self) -> u64 {
        self.size_when_done().saturating_sub(self.have_valid())
    }

    pub fn is_done(&self) -> bool {
        self.left_until_done() == 0
    }

    /// Records the result of checking one piece during the initial/ forced
    /// verify pass. Drives the `checking -> {downloading, seeding,
    /// queued-*}` transition: activity only leaves `Checking` after every
    /// piece has been processed once.
    pub fn record_piece_checked(&mut self, piece: usize, valid: bool, now: i64) {
        if valid {
            self.bitfield.set(piece);
        }
        self.checked_pieces += 1;
        if self.checked_pieces >= self.metainfo.piece_count() {
            self.finish_checking(now);
        }
    }

    pub fn finish_checking(&mut self, now: i64) {
        if self.is_done() {
            self.transition_to_seeding(now);
        } else {
            self.activity = Activity::Downloading;
        }
    }

    pub fn transition_to_seeding(&mut self, now: i64) {
        let was_done_before = self.activity == Activity::Seeding;
        self.activity = Activity::Seeding;
        // done_date becomes non-zero exactly once per completion cycle.
        if self.counters.done_date == 0 && !was_done_before {
            self.counters.done_date = now;
        }
    }

    pub fn record_piece_corrupt(&mut self, piece: usize, piece_bytes: u64) {
        self.bitfield.unset(piece);
        self.counters.corrupt_ever += piece_bytes;
    }

    /// Marks a piece verified during live downloading/seeding, as opposed
    /// to `record_piece_checked`'s bookkeeping for the initial hash-check
    /// pass (this never touches `checked_pieces`, so it can't trigger
    /// `finish_checking` early or double-count).
    pub fn mark_piece_verified(&mut self, piece: usize, now: i64) {
        self.bitfield.set(piece);
        self.counters.activity_date = now;
        if self.is_done() {
            self.transition_to_seeding(now);
        }
    }

    pub fn set_labels(&mut self, labels: Vec<String>) -> Result<(), TorrentError> {
        for l in &labels {
            if l.is_empty() {
                return Err(TorrentError::LabelEmpty);
            }
            if l.contains(',') {
                return Err(TorrentError::LabelHasComma);
            }
        }
        self.labels = labels;
        Ok(())
    }

    pub fn set_file_wanted(&mut self, index: usize, wanted: bool) -> Result<(), TorrentError> {
        let f = self
            .files
            .get_mut(index)
            .ok_or(TorrentError::FileIndexOutOfRange(index))?;
        f.wanted = wanted;
        Ok(())
    }

    pub fn set_file_priority(&mut self, index: usize, priority: Priority) -> Result<(), TorrentError> {
        let f = self
            .files
            .get_mut(index)
            .ok_or(TorrentError::FileIndexOutOfRange(index))?;
        f.priority = priority;
        Ok(())
    }

    pub fn stop(&mut self) {
        self.activity = Activity::Stopped;
    }

    pub fn start(&mut self) {
        self.activity = if self.is_done() {
            Activity::QueuedSeed
        } else {
            Activity::QueuedDown
        };
    }

    pub fn set_soft_error(&mut self, message: String) {
        self.activity = Activity::SoftError(message);
    }

    /// Transmission-style numeric status for RPC projection: a `SoftError`
    /// halts downloading the same way `Stopped` does, so it reports as 0
    /// with the accompanying `error`/`error-string` fields carrying the
    /// message.
    pub fn status_code(&self) -> i64 {
        match self.activity {
            Activity::Stopped | Activity::SoftError(_) => 0,
            Activity::QueuedCheck => 1,
            Activity::Checking => 2,
            Activity::QueuedDown => 3,
            Activity::Downloading => 4,
            Activity::QueuedSeed => 5,
            Activity::Seeding => 6,
        }
    }

    /// `(error_code, error_string)` pair for RPC projection: `1` (generic
    /// local error) with the soft-error message, or `0`/empty otherwise.
    pub fn error_fields(&self) -> (i64, String) {
        match &self.activity {
            Activity::SoftError(msg) => (1, msg.clone()),
            _ => (0, String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quark;
    use crate::value::{Value, ValueMap};

    fn metainfo_with_pieces(n: usize) -> Metainfo {
        let mut info = ValueMap::new();
        info.insert_str("name", Value::string("t"));
        info.insert_str("piece length", Value::Int(16384));
        info.insert_str("pieces", Value::Str(vec![1u8; 20 * n]));
        info.insert_str("length", Value::Int(16384 * n as i64));
        let mut root = ValueMap::new();
        root.insert(quark::intern_str("info"), Value::Map(info));
        let bytes = crate::value::bencode_encode(&Value::Map(root));
        Metainfo::from_bencode(&bytes).unwrap()
    }

    #[test]
    fn checking_transitions_to_downloading_when_incomplete() {
        let mi = metainfo_with_pieces(2);
        let mut t = Torrent::new(1, mi, "/tmp".into(), 1000);
        t.record_piece_checked(0, true, 1001);
        assert_eq!(t.activity, Activity::Checking);
        t.record_piece_checked(1, false, 1002);
        assert_eq!(t.activity, Activity::Downloading);
    }

    #[test]
    fn checking_transitions_to_seeding_when_complete() {
        let mi = metainfo_with_pieces(1);
        let mut t = Torrent::new(1, mi, "/tmp".into(), 1000);
        t.record_piece_checked(0, true, 1001);
        assert_eq!(t.activity, Activity::Seeding);
        assert_eq!(t.counters.done_date, 1001);
    }

    #[test]
    fn done_date_is_set_once() {
        let mi = metainfo_with_pieces(1);
        let mut t = Torrent::new(1, mi, "/tmp".into(), 1000);
        t.record_piece_checked(0, true, 1001);
        let first_done = t.counters.done_date;
        t.transition_to_seeding(2000);
        assert_eq!(t.counters.done_date, first_done);
    }

    #[test]
    fn label_validation_rejects_comma_and_empty() {
        let mi = metainfo_with_pieces(1);
        let mut t = Torrent::new(1, mi, "/tmp".into(), 1000);
        assert!(matches!(
            t.set_labels(vec!["a,b".into()]),
            Err(TorrentError::LabelHasComma)
        ));
        assert!(matches!(
            t.set_labels(vec!["".into()]),
            Err(TorrentError::LabelEmpty)
        ));
        assert!(t.set_labels(vec!["ok".into()]).is_ok());
    }

    #[test]
    fn left_until_done_respects_file_wants() {
        let mi = metainfo_with_pieces(1);
        let mut t = Torrent::new(1, mi, "/tmp".into(), 1000);
        assert_eq!(t.left_until_done(), 16384);
        t.set_file_wanted(0, false).unwrap();
        assert_eq!(t.left_until_done(), 0);
    }

    #[test]
    fn status_code_matches_activity_and_soft_error_reports_zero() {
        let mi = metainfo_with_pieces(1);
        let mut t = Torrent::new(1, mi, "/tmp".into(), 1000);
        assert_eq!(t.status_code(), 1); // QueuedCheck
        t.activity = Activity::Downloading;
        assert_eq!(t.status_code(), 4);
        t.set_soft_error("disk full".into());
        assert_eq!(t.status_code(), 0);
        assert_eq!(t.error_fields(), (1, "disk full".to_string()));
    }
}
