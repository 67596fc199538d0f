//! Verified-write storage pipeline: block writes into a
//! size-bounded cache that flushes to the file-mapped on-disk layout,
//! per-piece SHA-1 verification, and the resume-file format.
//!
//! Hashing happens one piece at a time against that piece's byte range
//! mapped across the torrent's (possibly multi-file) layout, so that
//! `bitfield[P] = 1` implies the hash of piece `P` alone matches — not a
//! whole-file digest.

use crate::torrent::metainfo::Metainfo;
use crate::quark;
use crate::value::{self, Value, ValueMap};
use sha1::{Digest, Sha1};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no space left on device")]
    DiskFull,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("piece index {0} out of range")]
    PieceOutOfRange(u32),
}

impl StorageError {
    /// Disk-full and permission errors are the two kinds that transition
    /// a torrent to the soft-error state; everything else is a plain I/O
    /// failure worth logging but not halting the torrent.
    pub fn is_soft_error(&self) -> bool {
        matches!(self, StorageError::DiskFull | StorageError::PermissionDenied(_))
    }
}

fn classify_io_error(e: io::Error) -> StorageError {
    // ENOSPC's numeric value (28) is stable across Linux/macOS; matching
    // on it directly avoids depending on `io::ErrorKind::StorageFull`
    // (stable only since Rust 1.74) or a new libc dependency for one
    // constant.
    if e.raw_os_error() == Some(28) {
        return StorageError::DiskFull;
    }
    match e.kind() {
        io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(e.to_string()),
        _ => StorageError::Io(e),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    Ok,
    Bad,
}

struct FileLayout {
    /// (absolute path, length, cumulative start offset within the torrent)
    entries: Vec<(PathBuf, u64, u64)>,
    total_size: u64,
}

impl FileLayout {
    fn new(metainfo: &Metainfo, download_dir: &Path) -> Self {
        let mut entries = Vec::new();
        let mut offset = 0u64;
        for (path, len) in metainfo
            .download_paths(download_dir)
            .into_iter()
            .zip(metainfo.files.iter().map(|f| f.length))
        {
            entries.push((path, len, offset));
            offset += len;
        }
        FileLayout { entries, total_size: offset }
    }

    /// Invokes `f(path, file_offset, len)` for each file segment touched by
    /// the global byte range `[global_offset, global_offset+length)`.
    fn for_each_range(
        &self,
        global_offset: u64,
        length: u64,
        mut f: impl FnMut(&Path, u64, u64) -> io::Result<()>,
    ) -> io::Result<()> {
        let end = global_offset + length;
        for (path, len, start) in &self.entries {
            let file_end = start + len;
            if *start >= end || file_end <= global_offset {
                continue;
            }
            let range_start = global_offset.max(*start);
            let range_end = end.min(file_end);
            f(path, range_start - start, range_end - range_start)?;
        }
        Ok(())
    }
}

/// Bytes accumulated for one piece before it has been verified.
struct PieceBuffer {
    data: Vec<u8>,
    written: Vec<bool>,
    block_size: u32,
}

impl PieceBuffer {
    fn new(piece_len: u32, block_size: u32) -> Self {
        let n_blocks = piece_len.div_ceil(block_size) as usize;
        PieceBuffer {
            data: vec![0u8; piece_len as usize],
            written: vec![false; n_blocks],
            block_size,
        }
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) {
        let end = (offset as usize + bytes.len()).min(self.data.len());
        self.data[offset as usize..end].copy_from_slice(&bytes[..end - offset as usize]);
        let block_idx = (offset / self.block_size) as usize;
        if block_idx < self.written.len() {
            self.written[block_idx] = true;
        }
    }

    fn is_complete(&self) -> bool {
        self.written.iter().all(|&b| b)
    }
}

/// The storage layer's three operations (`write_block`, `read_block`,
/// `verify_piece`), plus resume persistence.
pub struct Storage {
    layout: FileLayout,
    piece_length: u32,
    piece_hashes: Vec<[u8; 20]>,
    cache: HashMap<u32, PieceBuffer>,
    cache_order: VecDeque<u32>,
    cache_limit_bytes: usize,
    open_files: HashMap<PathBuf, File>,
    block_size: u32,
}

impl Storage {
    pub fn new(metainfo: &Metainfo, download_dir: &Path, cache_size_mb: usize) -> io::Result<Self> {
        std::fs::create_dir_all(download_dir)?;
        Ok(Storage {
            layout: FileLayout::new(metainfo, download_dir),
            piece_length: metainfo.piece_length,
            piece_hashes: metainfo.piece_hashes.clone(),
            cache: HashMap::new(),
            cache_order: VecDeque::new(),
            cache_limit_bytes: cache_size_mb * 1024 * 1024,
            open_files: HashMap::new(),
            block_size: 16 * 1024,
        })
    }

    fn piece_len(&self, piece: u32) -> Result<u32, StorageError> {
        let count = self.piece_hashes.len() as u32;
        if piece >= count {
            return Err(StorageError::PieceOutOfRange(piece));
        }
        if piece + 1 == count {
            let full = self.piece_length as u64 * (count as u64 - 1);
            Ok((self.layout.total_size - full) as u32)
        } else {
            Ok(self.piece_length)
        }
    }

    pub fn write_block(&mut self, piece: u32, offset: u32, bytes: &[u8]) -> Result<(), StorageError> {
        let piece_len = self.piece_len(piece)?;
        let block_size = self.block_size;
        let buf = self
            .cache
            .entry(piece)
            .or_insert_with(|| PieceBuffer::new(piece_len, block_size));
        buf.write(offset, bytes);
        if !self.cache_order.contains(&piece) {
            self.cache_order.push_back(piece);
        }
        self.evict_if_over_budget()?;
        Ok(())
    }

    /// Whether every block of `piece` has been written to the in-memory
    /// cache, i.e. it's ready for `verify_piece`. A piece that has already
    /// been flushed and evicted from the cache (already verified) reports
    /// `false` here; callers track verified state via the torrent bitfield.
    pub fn piece_is_complete(&self, piece: u32) -> bool {
        self.cache.get(&piece).map(|b| b.is_complete()).unwrap_or(false)
    }

    fn cache_bytes(&self) -> usize {
        self.cache.values().map(|b| b.data.len()).sum()
    }

    /// Bytes of pieces that are fully written to the cache but have not yet
    /// gone through `verify_piece` — the `have_unchecked` half of the
    /// `have_valid + have_unchecked <= total_size` invariant.
    pub fn unverified_bytes(&self) -> u64 {
        self.cache
            .values()
            .filter(|b| b.is_complete())
            .map(|b| b.data.len() as u64)
            .sum()
    }

    fn evict_if_over_budget(&mut self) -> Result<(), StorageError> {
        while self.cache_bytes() > self.cache_limit_bytes {
            let Some(piece) = self.cache_order.pop_front() else { break };
            let complete = self.cache.get(&piece).map(|b| b.is_complete()).unwrap_or(false);
            if complete {
                self.flush_piece_to_disk(piece)?;
                self.cache.remove(&piece);
            } else {
                // Incomplete pieces must stay resident to keep accepting
                // blocks; push back to the end of the queue rather than
                // spin if it's the only entry over budget.
                self.cache_order.push_back(piece);
                break;
            }
        }
        Ok(())
    }

    fn flush_piece_to_disk(&mut self, piece: u32) -> Result<(), StorageError> {
        let Some(buf) = self.cache.get(&piece) else { return Ok(()) };
        let global_offset = piece as u64 * self.piece_length as u64;
        let data = buf.data.clone();
        self.write_at(global_offset, &data)
    }

    fn write_at(&mut self, global_offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let open_files = &mut self.open_files;
        let mut pos_in_data = 0usize;
        self.layout
            .for_each_range(global_offset, data.len() as u64, |path, file_offset, len| {
                let file = open_or_create(open_files, path)?;
                file.seek(SeekFrom::Start(file_offset))?;
                file.write_all(&data[pos_in_data..pos_in_data + len as usize])?;
                pos_in_data += len as usize;
                Ok(())
            })
            .map_err(classify_io_error)
    }

    fn read_at(&mut self, global_offset: u64, length: u32) -> Result<Vec<u8>, StorageError> {
        let mut out = vec![0u8; length as usize];
        let open_files = &mut self.open_files;
        let mut pos = 0usize;
        self.layout
            .for_each_range(global_offset, length as u64, |path, file_offset, len| {
                let file = open_or_create(open_files, path)?;
                file.seek(SeekFrom::Start(file_offset))?;
                file.read_exact(&mut out[pos..pos + len as usize])?;
                pos += len as usize;
                Ok(())
            })
            .map_err(classify_io_error)?;
        Ok(out)
    }

    pub fn read_block(&mut self, piece: u32, offset: u32, length: u32) -> Result<Vec<u8>, StorageError> {
        self.piece_len(piece)?;
        if let Some(buf) = self.cache.get(&piece) {
            let end = (offset as usize + length as usize).min(buf.data.len());
            return Ok(buf.data[offset as usize..end].to_vec());
        }
        let global_offset = piece as u64 * self.piece_length as u64 + offset as u64;
        self.read_at(global_offset, length)
    }

    /// Hashes one piece and compares it against the metainfo hash. On
    /// success the piece is durably flushed; on failure the in-memory
    /// buffer is discarded so its blocks re-enter the request pool
    ///.
    pub fn verify_piece(&mut self, piece: u32) -> Result<VerifyResult, StorageError> {
        let piece_len = self.piece_len(piece)?;
        let expected = *self
            .piece_hashes
            .get(piece as usize)
            .ok_or(StorageError::PieceOutOfRange(piece))?;

        let bytes = if let Some(buf) = self.cache.get(&piece) {
            buf.data.clone()
        } else {
            let global_offset = piece as u64 * self.piece_length as u64;
            self.read_at(global_offset, piece_len)?
        };

        let mut hasher = Sha1::new();
        hasher.update(&bytes);
        let actual: [u8; 20] = hasher.finalize().into();

        if actual == expected {
            self.write_at(piece as u64 * self.piece_length as u64, &bytes)?;
            self.cache.remove(&piece);
            Ok(VerifyResult::Ok)
        } else {
            self.cache.remove(&piece);
            Ok(VerifyResult::Bad)
        }
    }
}

fn open_or_create<'a>(open_files: &'a mut HashMap<PathBuf, File>, path: &Path) -> io::Result<&'a mut File> {
    use std::collections::hash_map::Entry;
    match open_files.entry(path.to_path_buf()) {
        Entry::Occupied(e) => Ok(e.into_mut()),
        Entry::Vacant(e) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
            Ok(e.insert(file))
        }
    }
}

// ---------------------------------------------------------------------
// Resume file
// ---------------------------------------------------------------------

pub struct ResumeRecord {
    pub info_hash: [u8; 20],
    pub bitfield_bytes: Vec<u8>,
    pub file_wanted: Vec<bool>,
    pub file_priority: Vec<i8>,
    pub uploaded_ever: u64,
    pub downloaded_ever: u64,
    pub corrupt_ever: u64,
    pub labels: Vec<String>,
    pub bandwidth_group: Option<String>,
    pub queue_position: u32,
    pub sequential_download: bool,
    pub edit_date: i64,
}

pub fn encode_resume(record: &ResumeRecord) -> Vec<u8> {
    let mut map = ValueMap::new();
    map.insert_str("info_hash", Value::Str(record.info_hash.to_vec()));
    map.insert_str("bitfield", Value::Str(record.bitfield_bytes.clone()));
    map.insert_str(
        "file_wanted",
        Value::List(record.file_wanted.iter().map(|&b| Value::Bool(b)).collect()),
    );
    map.insert_str(
        "file_priority",
        Value::List(record.file_priority.iter().map(|&p| Value::Int(p as i64)).collect()),
    );
    map.insert_str("uploaded_ever", Value::Int(record.uploaded_ever as i64));
    map.insert_str("downloaded_ever", Value::Int(record.downloaded_ever as i64));
    map.insert_str("corrupt_ever", Value::Int(record.corrupt_ever as i64));
    map.insert_str(
        "labels",
        Value::List(record.labels.iter().map(|l| Value::string(l.clone())).collect()),
    );
    if let Some(group) = &record.bandwidth_group {
        map.insert_str("group", Value::string(group.clone()));
    }
    map.insert_str("queue_position", Value::Int(record.queue_position as i64));
    map.insert_str("sequential_download", Value::Bool(record.sequential_download));
    map.insert_str("edit_date", Value::Int(record.edit_date));
    value::bencode_encode(&Value::Map(map))
}

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("bencode error: {0}")]
    Bencode(#[from] value::BencodeError),
    #[error("resume record is missing field `{0}`")]
    MissingField(&'static str),
}

pub fn decode_resume(bytes: &[u8]) -> Result<ResumeRecord, ResumeError> {
    let v = value::bencode_decode(bytes)?;
    let map = v.as_map().ok_or(ResumeError::MissingField("root"))?;
    let info_hash_bytes = map
        .get(quark::intern_str("info_hash"))
        .and_then(Value::as_bytes)
        .filter(|b| b.len() == 20)
        .ok_or(ResumeError::MissingField("info_hash"))?;
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(info_hash_bytes);

    let bitfield_bytes = map
        .get(quark::intern_str("bitfield"))
        .and_then(Value::as_bytes)
        .map(|b| b.to_vec())
        .unwrap_or_default();
    let file_wanted = map
        .get(quark::intern_str("file_wanted"))
        .and_then(Value::as_list)
        .map(|l| l.iter().map(|v| v.as_bool().unwrap_or(true)).collect())
        .unwrap_or_default();
    let file_priority = map
        .get(quark::intern_str("file_priority"))
        .and_then(Value::as_list)
        .map(|l| l.iter().map(|v| v.as_i64().unwrap_or(0) as i8).collect())
        .unwrap_or_default();
    let labels = map
        .get(quark::intern_str("labels"))
        .and_then(Value::as_list)
        .map(|l| l.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect())
        .unwrap_or_default();
    let bandwidth_group = map
        .get(quark::intern_str("group"))
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    Ok(ResumeRecord {
        info_hash,
        bitfield_bytes,
        file_wanted,
        file_priority,
        uploaded_ever: map.get(quark::intern_str("uploaded_ever")).and_then(Value::as_i64).unwrap_or(0) as u64,
        downloaded_ever: map.get(quark::intern_str("downloaded_ever")).and_then(Value::as_i64).unwrap_or(0) as u64,
        corrupt_ever: map.get(quark::intern_str("corrupt_ever")).and_then(Value::as_i64).unwrap_or(0) as u64,
        labels,
        bandwidth_group,
        queue_position: map.get(quark::intern_str("queue_position")).and_then(Value::as_i64).unwrap_or(0) as u32,
        sequential_download: map
            .get(quark::intern_str("sequential_download"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        edit_date: map.get(quark::intern_str("edit_date")).and_then(Value::as_i64).unwrap_or(0),
    })
}

/// Reads a torrent's resume file from `dir/<info_hash_hex>.resume`,
/// verifying that the metainfo still hashes to the same info-hash before
/// the caller trusts it.
pub fn load_resume_if_matching(dir: &Path, info_hash: &[u8; 20]) -> Option<ResumeRecord> {
    let hex: String = info_hash.iter().map(|b| format!("{:02x}", b)).collect();
    let path = dir.join(format!("{hex}.resume"));
    let bytes = std::fs::read(path).ok()?;
    let record = decode_resume(&bytes).ok()?;
    if &record.info_hash == info_hash {
        Some(record)
    } else {
        None
    }
}

pub fn save_resume(dir: &Path, record: &ResumeRecord) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let hex: String = record.info_hash.iter().map(|b| format!("{:02x}", b)).collect();
    let path = dir.join(format!("{hex}.resume"));
    std::fs::write(path, encode_resume(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Value, ValueMap};
    use sha1::{Digest, Sha1};
    use tempfile::tempdir;

    fn metainfo_single_file(data: &[u8], piece_length: u32) -> Metainfo {
        let mut pieces = Vec::new();
        for chunk in data.chunks(piece_length as usize) {
            let mut h = Sha1::new();
            h.update(chunk);
            pieces.extend_from_slice(&h.finalize());
        }
        let mut info = ValueMap::new();
        info.insert_str("name", Value::string("f.bin"));
        info.insert_str("piece length", Value::Int(piece_length as i64));
        info.insert_str("pieces", Value::Str(pieces));
        info.insert_str("length", Value::Int(data.len() as i64));
        let mut root = ValueMap::new();
        root.insert(quark::intern_str("info"), Value::Map(info));
        let bytes = value::bencode_encode(&Value::Map(root));
        Metainfo::from_bencode(&bytes).unwrap()
    }

    #[test]
    fn write_then_verify_round_trips_a_single_piece() {
        let dir = tempdir().unwrap();
        let data = vec![0xABu8; 16384];
        let mi = metainfo_single_file(&data, 16384);
        let mut storage = Storage::new(&mi, dir.path(), 1).unwrap();
        storage.write_block(0, 0, &data).unwrap();
        assert_eq!(storage.verify_piece(0).unwrap(), VerifyResult::Ok);
        let read = storage.read_block(0, 0, 16384).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn corrupt_piece_fails_verification() {
        let dir = tempdir().unwrap();
        let data = vec![0xABu8; 16384];
        let mi = metainfo_single_file(&data, 16384);
        let mut storage = Storage::new(&mi, dir.path(), 1).unwrap();
        storage.write_block(0, 0, &vec![0x00u8; 16384]).unwrap();
        assert_eq!(storage.verify_piece(0).unwrap(), VerifyResult::Bad);
    }

    #[test]
    fn each_piece_is_hashed_independently() {
        let dir = tempdir().unwrap();
        let mut data = vec![0x11u8; 16384];
        data.extend(vec![0x22u8; 16384]);
        let mi = metainfo_single_file(&data, 16384);
        let mut storage = Storage::new(&mi, dir.path(), 2).unwrap();
        storage.write_block(0, 0, &data[0..16384]).unwrap();
        storage.write_block(1, 0, &vec![0x00u8; 16384]).unwrap();
        assert_eq!(storage.verify_piece(0).unwrap(), VerifyResult::Ok);
        assert_eq!(storage.verify_piece(1).unwrap(), VerifyResult::Bad);
    }

    #[test]
    fn resume_record_round_trips() {
        let record = ResumeRecord {
            info_hash: [5u8; 20],
            bitfield_bytes: vec![0xFF, 0x00],
            file_wanted: vec![true, false],
            file_priority: vec![0, 1],
            uploaded_ever: 100,
            downloaded_ever: 200,
            corrupt_ever: 3,
            labels: vec!["a".into(), "b".into()],
            bandwidth_group: Some("slow".into()),
            queue_position: 2,
            sequential_download: true,
            edit_date: 12345,
        };
        let bytes = encode_resume(&record);
        let decoded = decode_resume(&bytes).unwrap();
        assert_eq!(decoded.info_hash, record.info_hash);
        assert_eq!(decoded.uploaded_ever, 100);
        assert_eq!(decoded.labels, vec!["a", "b"]);
        assert!(decoded.sequential_download);
    }
}
