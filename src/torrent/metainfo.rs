//! Parsing of `.torrent` metainfo files and magnet URIs into the
//! immutable half of a torrent's identity.

use crate::value::{self, Value};
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode parse error: {0}")]
    Bencode(#[from] value::BencodeError),
    #[error("metainfo is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("metainfo field `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("piece hash list length is not a multiple of 20")]
    BadPieceHashes,
    #[error("not a valid magnet uri")]
    BadMagnet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: [u8; 20],
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    /// Single-file torrents have one entry whose path is just the name.
    pub files: Vec<FileEntry>,
    pub private: bool,
    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
}

impl Metainfo {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length in bytes of `piece`, accounting for the shorter final piece.
    pub fn piece_size(&self, piece: u32) -> u32 {
        let total = self.total_size();
        let start = piece as u64 * self.piece_length as u64;
        let remaining = total.saturating_sub(start);
        remaining.min(self.piece_length as u64) as u32
    }

    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parses a complete `.torrent` file's bytes into a `Metainfo`.
    pub fn from_bencode(bytes: &[u8]) -> Result<Metainfo, MetainfoError> {
        let root = value::bencode_decode(bytes)?;
        let root_map = root.as_map().ok_or(MetainfoError::WrongType("root"))?;

        let info_key = crate::quark::intern_str("info");
        let info_value = root_map
            .get(info_key)
            .ok_or(MetainfoError::MissingField("info"))?;
        let info_map = info_value.as_map().ok_or(MetainfoError::WrongType("info"))?;

        // The info-hash is SHA-1 over the exact bencoded `info` dictionary,
        // so we re-encode the parsed value rather than slicing the
        // original bytes; our bencode encoder reproduces byte-identical
        // output for any dictionary because dict keys are always emitted
        // in byte-lex order, which is how `.torrent` files are written.
        let info_bytes = value::bencode_encode(info_value);
        let mut hasher = Sha1::new();
        hasher.update(&info_bytes);
        let info_hash: [u8; 20] = hasher.finalize().into();

        let name = str_field(info_map, "name")?;
        let piece_length = int_field(info_map, "piece length")? as u32;
        let pieces_bytes = bytes_field(info_map, "pieces")?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(MetainfoError::BadPieceHashes);
        }
        let piece_hashes = pieces_bytes
            .chunks(20)
            .map(|c| {
                let mut h = [0u8; 20];
                h.copy_from_slice(c);
                h
            })
            .collect();

        let private = info_map
            .get(crate::quark::intern_str("private"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            != 0;

        let files = if let Some(files_val) = info_map.get(crate::quark::intern_str("files")) {
            let list = files_val.as_list().ok_or(MetainfoError::WrongType("files"))?;
            list.iter()
                .map(|f| {
                    let m = f.as_map().ok_or(MetainfoError::WrongType("files[]"))?;
                    let length = int_field(m, "length")? as u64;
                    let path_list = m
                        .get(crate::quark::intern_str("path"))
                        .and_then(|v| v.as_list())
                        .ok_or(MetainfoError::MissingField("path"))?;
                    let path = path_list
                        .iter()
                        .map(|p| p.as_str().map(|s| s.to_string()))
                        .collect::<Option<Vec<_>>>()
                        .ok_or(MetainfoError::WrongType("path[]"))?;
                    Ok(FileEntry { path, length })
                })
                .collect::<Result<Vec<_>, MetainfoError>>()?
        } else {
            let length = int_field(info_map, "length")? as u64;
            vec![FileEntry {
                path: vec![name.clone()],
                length,
            }]
        };

        let announce = root_map
            .get(crate::quark::intern_str("announce"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let announce_list = root_map
            .get(crate::quark::intern_str("announce-list"))
            .and_then(|v| v.as_list())
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| tier.as_list())
                    .map(|tier| {
                        tier.iter()
                            .filter_map(|u| u.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default();

        let comment = root_map
            .get(crate::quark::intern_str("comment"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let created_by = root_map
            .get(crate::quark::intern_str("created by"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let creation_date = root_map
            .get(crate::quark::intern_str("creation date"))
            .and_then(|v| v.as_i64());

        Ok(Metainfo {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            files,
            private,
            announce,
            announce_list,
            comment,
            created_by,
            creation_date,
        })
    }

    pub fn from_file(path: &std::path::Path) -> Result<Metainfo, anyhow::Error> {
        let bytes = std::fs::read(path)?;
        Ok(Metainfo::from_bencode(&bytes)?)
    }

    /// Builds a placeholder metainfo for a magnet link before metadata has
    /// arrived over `ut_metadata` (BEP 9): only the info-hash, display
    /// name, and announce list are known.
    pub fn from_magnet(uri: &str) -> Result<Metainfo, MetainfoError> {
        let parsed = url::Url::parse(uri).map_err(|_| MetainfoError::BadMagnet)?;
        if parsed.scheme() != "magnet" {
            return Err(MetainfoError::BadMagnet);
        }
        let mut info_hash = None;
        let mut name = None;
        let mut announce_list = Vec::new();
        for (key, val) in parsed.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let hex = val.strip_prefix("urn:btih:").ok_or(MetainfoError::BadMagnet)?;
                    if hex.len() != 40 {
                        return Err(MetainfoError::BadMagnet);
                    }
                    let mut h = [0u8; 20];
                    for i in 0..20 {
                        h[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                            .map_err(|_| MetainfoError::BadMagnet)?;
                    }
                    info_hash = Some(h);
                }
                "dn" => name = Some(val.into_owned()),
                "tr" => announce_list.push(vec![val.into_owned()]),
                _ => {}
            }
        }
        let info_hash = info_hash.ok_or(MetainfoError::BadMagnet)?;
        let name = name.unwrap_or_else(|| info_hash.iter().map(|b| format!("{:02x}", b)).collect());
        Ok(Metainfo {
            info_hash,
            name,
            piece_length: 0,
            piece_hashes: Vec::new(),
            files: Vec::new(),
            private: false,
            announce: announce_list.first().and_then(|t| t.first()).cloned(),
            announce_list,
            comment: None,
            created_by: None,
            creation_date: None,
        })
    }

    /// True once the actual piece layout has been learned (either parsed
    /// from a `.torrent` file, or fetched via `ut_metadata` for a magnet).
    pub fn has_piece_layout(&self) -> bool {
        !self.piece_hashes.is_empty()
    }

    /// Maps each file entry to its on-disk path. Multi-file torrents nest
    /// under a top-level directory named after the torrent (BEP 3); a
    /// single-file torrent's one entry is the download name itself.
    pub fn download_paths(&self, download_dir: &std::path::Path) -> Vec<PathBuf> {
        let multi_file = self.files.len() > 1;
        self.files
            .iter()
            .map(|f| {
                let mut p = download_dir.to_path_buf();
                if multi_file {
                    p.push(&self.name);
                }
                for part in &f.path {
                    p.push(part);
                }
                p
            })
            .collect()
    }
}

fn str_field(map: &value::ValueMap, key: &str) -> Result<String, MetainfoError> {
    map.get(crate::quark::intern_str(key))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or(MetainfoError::MissingField(leak_key(key)))
}

fn bytes_field<'a>(map: &'a value::ValueMap, key: &str) -> Result<&'a [u8], MetainfoError> {
    map.get(crate::quark::intern_str(key))
        .and_then(Value::as_bytes)
        .ok_or(MetainfoError::MissingField(leak_key(key)))
}

fn int_field(map: &value::ValueMap, key: &str) -> Result<i64, MetainfoError> {
    map.get(crate::quark::intern_str(key))
        .and_then(|v| v.as_i64())
        .ok_or(MetainfoError::MissingField(leak_key(key)))
}

// `MetainfoError::MissingField` wants a `&'static str` for a small fixed
// set of field names; this maps the handful of names we ever query to a
// static literal instead of leaking.
fn leak_key(key: &str) -> &'static str {
    match key {
        "name" => "name",
        "piece length" => "piece length",
        "pieces" => "pieces",
        "length" => "length",
        "path" => "path",
        "files" => "files",
        _ => "field",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quark;
    use crate::value::{Value, ValueMap};

    fn sample_bytes() -> Vec<u8> {
        let mut info = ValueMap::new();
        info.insert_str("name", Value::string("sample.iso"));
        info.insert_str("piece length", Value::Int(16384));
        info.insert_str("pieces", Value::Str(vec![7u8; 20]));
        info.insert_str("length", Value::Int(100));
        let mut root = ValueMap::new();
        root.insert_str("announce", Value::string("http://tracker.example/announce"));
        root.insert(quark::intern_str("info"), Value::Map(info));
        value::bencode_encode(&Value::Map(root))
    }

    #[test]
    fn parses_single_file_torrent() {
        let mi = Metainfo::from_bencode(&sample_bytes()).unwrap();
        assert_eq!(mi.name, "sample.iso");
        assert_eq!(mi.piece_length, 16384);
        assert_eq!(mi.piece_hashes.len(), 1);
        assert_eq!(mi.total_size(), 100);
        assert_eq!(mi.announce.as_deref(), Some("http://tracker.example/announce"));
    }

    #[test]
    fn magnet_uri_extracts_info_hash_and_name() {
        let hex = "a".repeat(40);
        let uri = format!("magnet:?xt=urn:btih:{hex}&dn=My+Torrent&tr=http://tracker.example/announce");
        let mi = Metainfo::from_magnet(&uri).unwrap();
        assert_eq!(mi.info_hash_hex(), hex);
        assert!(!mi.has_piece_layout());
    }

    #[test]
    fn rejects_non_magnet_uri() {
        assert!(Metainfo::from_magnet("http://example.com").is_err());
    }
}
