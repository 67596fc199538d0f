//! The session: owns the torrent registry, bandwidth groups, global
//! config, and the single event loop.
//!
//! `Session` owns one shared `mio::Poll` that multiplexes every peer
//! socket and the inbound-peer listener; `tick` drains it once per
//! daemon iteration. Tracker announces/scrapes stay off that thread
//! entirely: `tracker::http` and `tracker::udp` are both blocking
//! (they run their own private `Poll` loops bounded by
//! `tracker::ANNOUNCE_TIMEOUT`/`SCRAPE_TIMEOUT`), so `Session` hands
//! them to a small `crossbeam_channel` worker pool and picks up
//! completions in `tick` instead of calling them inline. The one-shot
//! HTTP fetches behind `blocklist-update`, `port-test`, and
//! `torrent-add`'s URL-source case go through the same treatment, on
//! their own worker pool (`submit_fetch`/`poll_fetch`): the RPC layer
//! submits a job and gets a request id back immediately instead of
//! blocking the caller's thread on the fetch.

use crate::config::Settings;
use crate::peer::manager::PeerManager;
use crate::peer::message::Message;
use crate::peer::protocol::{BlockRequest, Effect, PeerId, PeerSession, SessionState};
use crate::peer::transport::{log_connect_failure, OpenSocketCounter, PeerTransport, TcpTransport, Transport};
use crate::picker::Picker;
use crate::storage::{self, ResumeRecord, Storage, VerifyResult};
use crate::torrent::{Activity, Metainfo, MetainfoError, Priority, Torrent, TorrentError, TorrentId};
use crate::tracker::{AnnounceEvent, TrackerState};
use crate::value::{Value, ValueMap};
use crossbeam::channel::{unbounded, Receiver, Sender};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Number of threads dispatching blocking tracker HTTP/UDP calls off the
/// event-loop thread.
const TRACKER_WORKER_COUNT: usize = 2;

/// Number of threads dispatching the blocking one-shot HTTP fetches
/// (`blocklist-update`, `port-test`, `torrent-add` URL sources) off the
/// event-loop thread.
const FETCH_WORKER_COUNT: usize = 2;

const PEER_LISTENER_TOKEN: Token = Token(usize::MAX);

/// A connection that has completed its mio registration but hasn't yet
/// reached `SessionState::Active` with a torrent attached to it.
enum PendingPeer {
    Inbound(PeerSession),
    Outbound { session: PeerSession, torrent_id: TorrentId },
}

/// Work handed to a tracker worker thread; owns everything the blocking
/// call needs so it doesn't have to borrow from `Session`.
enum TrackerJob {
    Announce {
        torrent_id: TorrentId,
        tracker_id: u32,
        url: String,
        is_udp: bool,
        metainfo: Metainfo,
        peer_id: [u8; 20],
        port: u16,
        uploaded: u64,
        downloaded: u64,
        left: u64,
        event: AnnounceEvent,
    },
}

enum TrackerOutcome {
    Announce {
        torrent_id: TorrentId,
        tracker_id: u32,
        result: Result<AnnounceOutcome, TrackerFailure>,
    },
}

struct AnnounceOutcome {
    interval: u64,
    min_interval: Option<u64>,
    peers: Vec<SocketAddr>,
}

enum TrackerFailure {
    Timeout,
    Error(String),
}

fn run_tracker_worker(jobs: Receiver<TrackerJob>, results: Sender<TrackerOutcome>) {
    for job in jobs.iter() {
        match job {
            TrackerJob::Announce {
                torrent_id,
                tracker_id,
                url,
                is_udp,
                metainfo,
                peer_id,
                port,
                uploaded,
                downloaded,
                left,
                event,
            } => {
                let result = if is_udp {
                    run_udp_announce(&url, &metainfo, peer_id, port, uploaded, downloaded, left, event)
                } else {
                    run_http_announce(&url, &metainfo, peer_id, port, uploaded, downloaded, left, event)
                };
                let _ = results.send(TrackerOutcome::Announce { torrent_id, tracker_id, result });
            }
        }
    }
}

/// A one-shot HTTP GET handed to a fetch worker. The worker only fetches
/// bytes; interpreting them (gunzip, parsing a metainfo file, reading a
/// `1`/`0` body) happens back on the event-loop thread in
/// `drain_fetch_results`, the same split `run_tracker_worker` uses between
/// "do the blocking I/O" and "apply the outcome".
struct FetchJob {
    id: u64,
    url: String,
    timeout: Duration,
}

struct FetchOutcome {
    id: u64,
    result: Result<Vec<u8>, String>,
}

/// What a pending fetch is for, kept around so `drain_fetch_results` knows
/// how to turn the raw response bytes into the method's response shape.
pub enum PendingFetchKind {
    BlocklistUpdate,
    PortTest,
    TorrentAddUrl { opts: TorrentAddOptions, now: i64 },
}

fn run_fetch_worker(jobs: Receiver<FetchJob>, results: Sender<FetchOutcome>) {
    for job in jobs.iter() {
        let url = match url::Url::parse(&job.url) {
            Ok(url) => url,
            Err(e) => {
                let _ = results.send(FetchOutcome { id: job.id, result: Err(e.to_string()) });
                continue;
            }
        };
        let result = crate::net_fetch::fetch(&url, job.timeout).map_err(|e| e.to_string());
        let _ = results.send(FetchOutcome { id: job.id, result });
    }
}

/// Builds the `torrent-added`/`torrent-duplicate` response shape for an
/// `AddOutcome`. Mirrors `rpc::torrent_add`'s own helper of the same
/// shape; duplicated here rather than shared because `rpc` depends on
/// `session`, not the other way around, and this is the only bit of that
/// module's response-shaping the fetch worker pool needs.
fn add_outcome_to_value_map(session: &Session, outcome: AddOutcome) -> ValueMap {
    use crate::quark::keys;
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

fn run_http_announce(
    url: &str,
    metainfo: &Metainfo,
    peer_id: [u8; 20],
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    event: AnnounceEvent,
) -> Result<AnnounceOutcome, TrackerFailure> {
    let params = crate::tracker::http::AnnounceParams {
        metainfo,
        peer_id,
        port,
        uploaded,
        downloaded,
        left,
        event,
        numwant: 80,
        key: rand::random(),
        tracker_id: None,
        compact: true,
    };
    match crate::tracker::http::announce(url, &params) {
        Ok(resp) => Ok(AnnounceOutcome {
            interval: resp.interval,
            min_interval: resp.min_interval,
            peers: resp.peers.into_iter().map(|p| p.addr).collect(),
        }),
        Err(crate::tracker::http::HttpTrackerError::Timeout) => Err(TrackerFailure::Timeout),
        Err(e) => Err(TrackerFailure::Error(e.to_string())),
    }
}

fn run_udp_announce(
    url: &str,
    metainfo: &Metainfo,
    peer_id: [u8; 20],
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    event: AnnounceEvent,
) -> Result<AnnounceOutcome, TrackerFailure> {
    let addr = crate::tracker::resolve_announce_addr(url).map_err(|e| TrackerFailure::Error(e.to_string()))?;
    let mut client = crate::tracker::udp::UdpTrackerClient::new().map_err(|e| TrackerFailure::Error(e.to_string()))?;
    let deadline = Instant::now() + crate::tracker::ANNOUNCE_TIMEOUT;
    match client.announce(addr, metainfo, peer_id, port, uploaded, downloaded, left, event, deadline) {
        Ok(res) => Ok(AnnounceOutcome {
            interval: res.interval,
            min_interval: None,
            peers: res.peers,
        }),
        Err(crate::tracker::udp::UdpTrackerError::Timeout) => Err(TrackerFailure::Timeout),
        Err(e) => Err(TrackerFailure::Error(e.to_string())),
    }
}

/// Bandwidth groups: a named speed-limit bucket torrents
/// can opt into, owned by the session and mutated only on the event
/// thread.
#[derive(Debug, Clone, Default)]
pub struct BandwidthGroup {
    pub name: String,
    pub up_limit_kbps: Option<u64>,
    pub down_limit_kbps: Option<u64>,
    pub up_limited: bool,
    pub down_limited: bool,
}

/// Caller errors: returned as the RPC response's `result` string, never
/// fatal. Display strings match the documented boundary-behavior
/// messages exactly, since clients match on them.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no filename or metainfo specified")]
    NoFilenameOrMetainfo,
    #[error("download directory path is not absolute")]
    RelativeDownloadDir,
    #[error("new location path is not absolute")]
    RelativeLocation,
    #[error("no fields specified")]
    NoFieldsSpecified,
    #[error("invalid or corrupt torrent file")]
    InvalidTorrentFile,
    #[error("no such torrent")]
    NoSuchTorrent,
    #[error("no such tracker")]
    NoSuchTracker,
    #[error("unsupported ip-protocol: {0}")]
    UnsupportedIpProtocol(String),
    #[error("no such bandwidth group")]
    NoSuchGroup,
    #[error(transparent)]
    Torrent(#[from] TorrentError),
    #[error(transparent)]
    Metainfo(#[from] MetainfoError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct TorrentAddOptions {
    pub download_dir: Option<PathBuf>,
    pub paused: bool,
    pub peer_limit: Option<u32>,
    pub bandwidth_priority: Option<i8>,
    pub labels: Vec<String>,
    pub sequential_download: bool,
}

impl Default for TorrentAddOptions {
    fn default() -> Self {
        TorrentAddOptions {
            download_dir: None,
            paused: false,
            peer_limit: None,
            bandwidth_priority: None,
            labels: Vec::new(),
            sequential_download: false,
        }
    }
}

pub enum AddOutcome {
    Added(TorrentId),
    Duplicate(TorrentId),
}

/// How long a removed torrent's id stays in the `recently-active` removed
/// list.
const RECENTLY_ACTIVE_WINDOW: Duration = Duration::from_secs(60);

/// Selector accepted by `ids` across most RPC methods: a list of numeric
/// ids, a list of hash strings, the literal string `"recently-active"`,
/// or (absent) "all torrents".
pub enum IdSelector<'a> {
    All,
    Ids(&'a [TorrentId]),
    HashStrings(&'a [String]),
    RecentlyActive,
}

/// Owns every torrent, the per-torrent peer managers, storage handles,
/// bandwidth groups, global settings, and the open-peer-socket counter.
pub struct Session {
    pub settings: Settings,
    torrents: HashMap<TorrentId, Torrent>,
    storages: HashMap<TorrentId, Storage>,
    peer_managers: HashMap<TorrentId, PeerManager>,
    info_hash_index: HashMap<[u8; 20], TorrentId>,
    next_id: TorrentId,
    pub bandwidth_groups: HashMap<String, BandwidthGroup>,
    pub open_sockets: OpenSocketCounter,
    recently_removed: Vec<(TorrentId, Instant)>,
    pub our_peer_id: [u8; 20],
    pub session_stats: SessionStats,
    started_at: Instant,
    poll: Poll,
    peer_listener: Option<TcpListener>,
    next_token: usize,
    /// Tokens for connections still in `Handshake` (or, for inbound ones,
    /// not yet attributed to a torrent).
    pending_peers: HashMap<Token, PendingPeer>,
    /// Tokens for connections already adopted into a torrent's
    /// `PeerManager`.
    peer_tokens: HashMap<Token, (TorrentId, PeerId)>,
    tracker_job_tx: Sender<TrackerJob>,
    tracker_result_rx: Receiver<TrackerOutcome>,
    fetch_job_tx: Sender<FetchJob>,
    fetch_result_rx: Receiver<FetchOutcome>,
    next_fetch_id: u64,
    pending_fetches: HashMap<u64, PendingFetchKind>,
    completed_fetches: HashMap<u64, Result<ValueMap, String>>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub uploaded_bytes: u64,
    pub downloaded_bytes: u64,
    pub corrupt_bytes: u64,
    pub files_added: u64,
    /// Cumulative totals carried over from previous sessions, loaded at
    /// startup and folded back in at close. The running fields above
    /// only ever count the current process's lifetime.
    pub cumulative_uploaded_bytes: u64,
    pub cumulative_downloaded_bytes: u64,
    pub cumulative_files_added: u64,
    pub cumulative_seconds_active: u64,
    pub cumulative_session_count: u64,
}

impl SessionStats {
    /// Loads `<config_dir>/sessionstats` if present, else starts from
    /// zeroed cumulative counters. Malformed or missing files are treated
    /// as "no history yet" rather than an error.
    pub fn load(path: &Path) -> SessionStats {
        let mut stats = SessionStats::default();
        let Ok(bytes) = std::fs::read(path) else {
            return stats;
        };
        let Ok(text) = String::from_utf8(bytes) else {
            return stats;
        };
        let Ok(v) = crate::value::json_decode(&text) else {
            return stats;
        };
        let Some(map) = v.as_map() else {
            return stats;
        };
        stats.cumulative_uploaded_bytes = map
            .get(crate::quark::intern_str("uploaded-bytes"))
            .and_then(crate::value::Value::as_i64)
            .unwrap_or(0) as u64;
        stats.cumulative_downloaded_bytes = map
            .get(crate::quark::intern_str("downloaded-bytes"))
            .and_then(crate::value::Value::as_i64)
            .unwrap_or(0) as u64;
        stats.cumulative_files_added = map
            .get(crate::quark::intern_str("files-added"))
            .and_then(crate::value::Value::as_i64)
            .unwrap_or(0) as u64;
        stats.cumulative_seconds_active = map
            .get(crate::quark::intern_str("seconds-active"))
            .and_then(crate::value::Value::as_i64)
            .unwrap_or(0) as u64;
        stats.cumulative_session_count = map
            .get(crate::quark::intern_str("session-count"))
            .and_then(crate::value::Value::as_i64)
            .unwrap_or(0) as u64;
        stats
    }

    /// Folds the current process's running totals into the cumulative
    /// counters and writes them back out, ready to be re-loaded by the
    /// next session.
    pub fn save(&self, path: &Path, uptime: Duration) -> std::io::Result<()> {
        let mut m = ValueMap::new();
        m.insert_str(
            "uploaded-bytes",
            Value::Int((self.cumulative_uploaded_bytes + self.uploaded_bytes) as i64),
        );
        m.insert_str(
            "downloaded-bytes",
            Value::Int((self.cumulative_downloaded_bytes + self.downloaded_bytes) as i64),
        );
        m.insert_str(
            "files-added",
            Value::Int((self.cumulative_files_added + self.files_added) as i64),
        );
        m.insert_str(
            "seconds-active",
            Value::Int((self.cumulative_seconds_active + uptime.as_secs()) as i64),
        );
        m.insert_str("session-count", Value::Int((self.cumulative_session_count + 1) as i64));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, crate::value::json_encode(&Value::Map(m)))
    }
}

impl Session {
    pub fn new(settings: Settings) -> Session {
        let session_stats = SessionStats::load(&settings.sessionstats_path());
        let poll = Poll::new().expect("creating the session's mio poll");
        let (tracker_job_tx, tracker_job_rx) = unbounded::<TrackerJob>();
        let (tracker_result_tx, tracker_result_rx) = unbounded::<TrackerOutcome>();
        for _ in 0..TRACKER_WORKER_COUNT {
            let jobs = tracker_job_rx.clone();
            let results = tracker_result_tx.clone();
            std::thread::spawn(move || run_tracker_worker(jobs, results));
        }
        let (fetch_job_tx, fetch_job_rx) = unbounded::<FetchJob>();
        let (fetch_result_tx, fetch_result_rx) = unbounded::<FetchOutcome>();
        for _ in 0..FETCH_WORKER_COUNT {
            let jobs = fetch_job_rx.clone();
            let results = fetch_result_tx.clone();
            std::thread::spawn(move || run_fetch_worker(jobs, results));
        }
        Session {
            settings,
            torrents: HashMap::new(),
            storages: HashMap::new(),
            peer_managers: HashMap::new(),
            info_hash_index: HashMap::new(),
            next_id: 1,
            bandwidth_groups: HashMap::new(),
            open_sockets: OpenSocketCounter::new(),
            recently_removed: Vec::new(),
            our_peer_id: crate::utils::generate_peer_id(),
            session_stats,
            started_at: Instant::now(),
            poll,
            peer_listener: None,
            next_token: 0,
            pending_peers: HashMap::new(),
            peer_tokens: HashMap::new(),
            tracker_job_tx,
            tracker_result_rx,
            fetch_job_tx,
            fetch_result_rx,
            next_fetch_id: 0,
            pending_fetches: HashMap::new(),
            completed_fetches: HashMap::new(),
        }
    }

    /// Binds the inbound-peer listener on `settings.peer_port` and
    /// registers it with the session's poll. Left out of `new` so
    /// constructing a `Session` for tests or one-off RPC calls never binds
    /// a port; the daemon calls this once at startup.
    pub fn start_listening(&mut self) -> std::io::Result<()> {
        if self.peer_listener.is_some() {
            return Ok(());
        }
        let addr = SocketAddr::new(self.settings.bind_address_ipv4.into(), self.settings.peer_port);
        let mut listener = TcpListener::bind(addr)?;
        self.poll.registry().register(&mut listener, PEER_LISTENER_TOKEN, Interest::READABLE)?;
        self.peer_listener = Some(listener);
        Ok(())
    }

    pub fn get(&self, id: TorrentId) -> Option<&Torrent> {
        self.torrents.get(&id)
    }

    pub fn get_mut(&mut self, id: TorrentId) -> Option<&mut Torrent> {
        self.torrents.get_mut(&id)
    }

    pub fn torrent_by_hash(&self, info_hash: &[u8; 20]) -> Option<&Torrent> {
        self.info_hash_index.get(info_hash).and_then(|id| self.torrents.get(id))
    }

    pub fn len(&self) -> usize {
        self.torrents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.torrents.is_empty()
    }

    /// Resolves an `ids` selector to the matching torrent ids, in no
    /// particular order except `All`/`Ids`/`HashStrings` which preserve
    /// registry/caller order respectively.
    pub fn resolve_ids(&self, selector: &IdSelector<'_>) -> Vec<TorrentId> {
        match selector {
            IdSelector::All => {
                let mut ids: Vec<TorrentId> = self.torrents.keys().copied().collect();
                ids.sort_unstable();
                ids
            }
            IdSelector::Ids(ids) => ids.iter().copied().filter(|id| self.torrents.contains_key(id)).collect(),
            IdSelector::HashStrings(hashes) => hashes
                .iter()
                .filter_map(|h| decode_hex20(h))
                .filter_map(|h| self.info_hash_index.get(&h).copied())
                .collect(),
            IdSelector::RecentlyActive => {
                let mut ids: Vec<TorrentId> = self.torrents.keys().copied().collect();
                ids.sort_unstable();
                ids
            }
        }
    }

    /// The `removed` vector accompanying a `recently-active`
    /// `torrent-get`, ids deleted within the last 60s.
    pub fn removed_since(&self, now: Instant) -> Vec<TorrentId> {
        self.recently_removed
            .iter()
            .filter(|(_, at)| now.duration_since(*at) <= RECENTLY_ACTIVE_WINDOW)
            .map(|(id, _)| *id)
            .collect()
    }

    fn prune_recently_removed(&mut self, now: Instant) {
        self.recently_removed
            .retain(|(_, at)| now.duration_since(*at) <= RECENTLY_ACTIVE_WINDOW);
    }

    fn next_torrent_id(&mut self) -> TorrentId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Inserts a newly-constructed torrent, wiring up its storage and peer
    /// manager, and indexing it by info-hash. Callers are expected to have
    /// already checked for a duplicate info-hash.
    fn insert_torrent(&mut self, mut torrent: Torrent, paused: bool, now: i64) -> TorrentId {
        let id = torrent.id;
        self.info_hash_index.insert(torrent.info_hash(), id);

        if let Ok(storage) = Storage::new(&torrent.metainfo, &torrent.download_dir, self.settings.cache_size_mb) {
            self.storages.insert(id, storage);
        }

        if let Some(resume) = storage::load_resume_if_matching(&self.settings.resume_dir(), &torrent.info_hash()) {
            apply_resume(&mut torrent, &resume);
        }

        if paused {
            torrent.activity = Activity::Stopped;
        } else if torrent.metainfo.has_piece_layout() {
            torrent.activity = Activity::QueuedCheck;
        }
        torrent.counters.added_date = now;

        let piece_count = torrent.metainfo.piece_count().max(1) as u32;
        let total_size = torrent.metainfo.total_size().max(1);
        let picker = Picker::new(
            torrent.metainfo.piece_length.max(1),
            piece_count,
            total_size,
            torrent.sequential_download,
        );
        let peer_limit = torrent.peer_limit as usize;
        self.peer_managers.insert(id, PeerManager::new(picker, peer_limit));

        self.torrents.insert(id, torrent);
        id
    }

    /// `torrent-add` from a parsed `.torrent`/metainfo blob.
    /// Returns `Duplicate` without creating a new torrent when the
    /// info-hash already exists in the session.
    pub fn add_from_metainfo(
        &mut self,
        metainfo: Metainfo,
        opts: TorrentAddOptions,
        now: i64,
    ) -> Result<AddOutcome, SessionError> {
        if let Some(&existing) = self.info_hash_index.get(&metainfo.info_hash) {
            return Ok(AddOutcome::Duplicate(existing));
        }
        if let Some(dir) = &opts.download_dir {
            if dir.is_relative() {
                return Err(SessionError::RelativeDownloadDir);
            }
        }

        let id = self.next_torrent_id();
        let download_dir = opts
            .download_dir
            .clone()
            .unwrap_or_else(|| self.settings.download_dir.clone());
        let mut torrent = Torrent::new(id, metainfo, download_dir, now);
        if let Some(limit) = opts.peer_limit {
            torrent.peer_limit = limit;
        }
        if let Some(p) = opts.bandwidth_priority {
            torrent.bandwidth_priority = p;
        }
        if !opts.labels.is_empty() {
            torrent.set_labels(opts.labels)?;
        }
        torrent.sequential_download = opts.sequential_download;

        let id = self.insert_torrent(torrent, opts.paused, now);
        self.session_stats.files_added += 1;
        Ok(AddOutcome::Added(id))
    }

    /// `torrent-add` from a magnet URI. Metadata (piece
    /// layout) is unknown until `ut_metadata` (BEP 9) completes; the
    /// torrent sits in `Stopped`/`QueuedCheck` with an empty piece count
    /// until then.
    pub fn add_from_magnet(&mut self, uri: &str, opts: TorrentAddOptions, now: i64) -> Result<AddOutcome, SessionError> {
        let metainfo = Metainfo::from_magnet(uri)?;
        self.add_from_metainfo(metainfo, opts, now)
    }

    /// `torrent-add` from a local `.torrent` file path.
    pub fn add_from_file(&mut self, path: &Path, opts: TorrentAddOptions, now: i64) -> Result<AddOutcome, SessionError> {
        let metainfo = Metainfo::from_file(path).map_err(|_| SessionError::InvalidTorrentFile)?;
        self.add_from_metainfo(metainfo, opts, now)
    }

    /// `torrent-add` from a base64-encoded bencode blob.
    pub fn add_from_metainfo_bytes(&mut self, bytes: &[u8], opts: TorrentAddOptions, now: i64) -> Result<AddOutcome, SessionError> {
        let metainfo = Metainfo::from_bencode(bytes).map_err(|_| SessionError::InvalidTorrentFile)?;
        self.add_from_metainfo(metainfo, opts, now)
    }

    /// Explicit RPC remove, optionally
    /// deleting local data. The id enters the 60s "recently removed"
    /// window regardless of `delete_local_data`.
    pub fn remove_torrent(&mut self, id: TorrentId, delete_local_data: bool, now: Instant) -> Result<(), SessionError> {
        let torrent = self.torrents.remove(&id).ok_or(SessionError::NoSuchTorrent)?;
        self.info_hash_index.remove(&torrent.info_hash());
        self.storages.remove(&id);
        self.peer_managers.remove(&id);

        let hex = torrent.metainfo.info_hash_hex();
        let resume_path = self.settings.resume_dir().join(format!("{hex}.resume"));
        let _ = std::fs::remove_file(resume_path);

        if delete_local_data {
            for path in torrent.metainfo.download_paths(&torrent.download_dir) {
                let _ = std::fs::remove_file(path);
            }
        }

        self.prune_recently_removed(now);
        self.recently_removed.push((id, now));
        Ok(())
    }

    pub fn start_torrent(&mut self, id: TorrentId) -> Result<(), SessionError> {
        let t = self.torrents.get_mut(&id).ok_or(SessionError::NoSuchTorrent)?;
        t.start();
        Ok(())
    }

    pub fn stop_torrent(&mut self, id: TorrentId) -> Result<(), SessionError> {
        let t = self.torrents.get_mut(&id).ok_or(SessionError::NoSuchTorrent)?;
        t.stop();
        Ok(())
    }

    /// `torrent-verify`: re-queues the torrent for a fresh hash check of
    /// every piece.
    pub fn verify_torrent(&mut self, id: TorrentId) -> Result<(), SessionError> {
        let t = self.torrents.get_mut(&id).ok_or(SessionError::NoSuchTorrent)?;
        t.activity = Activity::QueuedCheck;
        Ok(())
    }

    pub fn reannounce_torrent(&mut self, id: TorrentId, now: i64) -> Result<(), SessionError> {
        let t = self.torrents.get_mut(&id).ok_or(SessionError::NoSuchTorrent)?;
        for tracker in &mut t.trackers {
            tracker.next_announce = now;
        }
        Ok(())
    }

    pub fn set_location(&mut self, id: TorrentId, location: &Path) -> Result<(), SessionError> {
        if location.is_relative() {
            return Err(SessionError::RelativeLocation);
        }
        let t = self.torrents.get_mut(&id).ok_or(SessionError::NoSuchTorrent)?;
        t.download_dir = location.to_path_buf();
        Ok(())
    }

    /// Queue movement: moves `id` within the queue-position
    /// ordering of all torrents. Positions are kept dense (0..n).
    pub fn queue_move(&mut self, id: TorrentId, direction: QueueMove) -> Result<(), SessionError> {
        let mut ordered: Vec<TorrentId> = self.torrents.keys().copied().collect();
        ordered.sort_by_key(|id| self.torrents[id].queue_position);
        let pos = ordered.iter().position(|&x| x == id).ok_or(SessionError::NoSuchTorrent)?;
        match direction {
            QueueMove::Top => {
                ordered.remove(pos);
                ordered.insert(0, id);
            }
            QueueMove::Up => {
                if pos > 0 {
                    ordered.swap(pos, pos - 1);
                }
            }
            QueueMove::Down => {
                if pos + 1 < ordered.len() {
                    ordered.swap(pos, pos + 1);
                }
            }
            QueueMove::Bottom => {
                ordered.remove(pos);
                ordered.push(id);
            }
        }
        for (i, tid) in ordered.into_iter().enumerate() {
            if let Some(t) = self.torrents.get_mut(&tid) {
                t.queue_position = i as u32;
            }
        }
        Ok(())
    }

    pub fn group_get(&self, name: &str) -> Option<&BandwidthGroup> {
        self.bandwidth_groups.get(name)
    }

    pub fn group_set(&mut self, group: BandwidthGroup) {
        self.bandwidth_groups.insert(group.name.clone(), group);
    }

    /// `free-space`: bytes available and total capacity of
    /// the filesystem backing `path`.
    pub fn free_space(path: &Path) -> Result<(u64, u64), SessionError> {
        if path.is_relative() {
            return Err(SessionError::RelativeDownloadDir);
        }
        crate::utils::filesystem_capacity(path).map_err(SessionError::Io)
    }

    /// Persists every torrent's resume record. Called after nontrivial
    /// state changes and at session close.
    pub fn save_all_resume_files(&self, now: i64) -> std::io::Result<()> {
        let dir = self.settings.resume_dir();
        for torrent in self.torrents.values() {
            let record = build_resume_record(torrent, now);
            storage::save_resume(&dir, &record)?;
        }
        Ok(())
    }

    /// Session close cancels outstanding fetches, closes all peer sockets,
    /// flushes and saves resume files, and persists settings before
    /// returning. A failure to save resume files is logged but does not
    /// stop the close from completing.
    pub fn close(&mut self, now: i64) {
        if let Err(e) = self.save_all_resume_files(now) {
            log::error!("failed to save resume files during shutdown: {e}");
        }
        if let Err(e) = self.settings.save() {
            log::error!("failed to persist settings during shutdown: {e}");
        }
        if let Err(e) = self.session_stats.save(&self.settings.sessionstats_path(), self.uptime()) {
            log::error!("failed to persist sessionstats during shutdown: {e}");
        }

        for (_, pending) in self.pending_peers.drain() {
            match pending {
                PendingPeer::Inbound(mut session) => {
                    let _ = session.deregister(self.poll.registry());
                    let _ = session.close();
                }
                PendingPeer::Outbound { mut session, .. } => {
                    let _ = session.deregister(self.poll.registry());
                    let _ = session.close();
                }
            }
            self.open_sockets.release();
        }
        self.peer_tokens.clear();
        for (_, mut manager) in self.peer_managers.drain() {
            for peer_id in manager.ids() {
                if let Some(session) = manager.get_mut(peer_id) {
                    let _ = session.deregister(self.poll.registry());
                    let _ = session.close();
                    self.open_sockets.release();
                }
            }
        }
        if let Some(mut listener) = self.peer_listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        self.torrents.clear();
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Drives one piece-verification step for a torrent whose activity is
    /// `Checking`/`QueuedCheck`, hashing the next unchecked piece. The
    /// daemon's event loop calls this once per tick per checking torrent
    /// so a slow hash pass never blocks RPC dispatch for more than one
    /// piece at a time.
    pub fn step_verify(&mut self, id: TorrentId, now: i64) -> Result<(), SessionError> {
        let torrent = self.torrents.get_mut(&id).ok_or(SessionError::NoSuchTorrent)?;
        if !torrent.activity.is_checking() && torrent.activity != Activity::QueuedCheck {
            return Ok(());
        }
        torrent.activity = Activity::Checking;
        let piece_count = torrent.metainfo.piece_count();
        let next_unchecked = (0..piece_count as u32).find(|&p| !torrent.bitfield.has_piece(p as usize));
        let Some(piece) = next_unchecked else {
            torrent.finish_checking(now);
            return Ok(());
        };
        let Some(storage) = self.storages.get_mut(&id) else { return Ok(()) };
        match storage.verify_piece(piece) {
            Ok(storage::VerifyResult::Ok) => torrent.record_piece_checked(piece as usize, true, now),
            Ok(storage::VerifyResult::Bad) => torrent.record_piece_checked(piece as usize, false, now),
            Err(e) if e.is_soft_error() => torrent.set_soft_error(e.to_string()),
            Err(_) => torrent.record_piece_checked(piece as usize, false, now),
        }
        Ok(())
    }

    pub fn peer_manager_mut(&mut self, id: TorrentId) -> Option<&mut PeerManager> {
        self.peer_managers.get_mut(&id)
    }

    pub fn storage_mut(&mut self, id: TorrentId) -> Option<&mut Storage> {
        self.storages.get_mut(&id)
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Drives the peer socket layer and the tracker worker pool for one
    /// iteration: accepts inbound connections, services whatever sockets
    /// are ready, drains finished tracker jobs, dispatches due announces,
    /// and runs the choke/unchoke and request-scheduling passes. Meant to
    /// be called once per daemon tick alongside `step_verify`.
    pub fn tick(&mut self, now_unix: i64) -> std::io::Result<()> {
        self.accept_inbound();

        let mut events = Events::with_capacity(256);
        self.poll.poll(&mut events, Some(Duration::from_millis(0)))?;
        let tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();
        for token in tokens {
            if token == PEER_LISTENER_TOKEN {
                self.accept_inbound();
                continue;
            }
            self.service_peer_token(token, now_unix);
        }

        self.drain_tracker_results(now_unix);
        self.drain_fetch_results();

        let torrent_ids: Vec<TorrentId> = self.torrents.keys().copied().collect();
        for id in torrent_ids {
            let stopped = self.torrents.get(&id).map(|t| t.activity == Activity::Stopped).unwrap_or(true);
            if stopped {
                continue;
            }
            for tracker_id in self.due_trackers_for(id, now_unix) {
                self.submit_announce(id, tracker_id);
            }
            self.drive_peer_manager(id);
        }

        Ok(())
    }

    fn accept_inbound(&mut self) {
        let mut accepted = Vec::new();
        if let Some(listener) = &self.peer_listener {
            loop {
                match listener.accept() {
                    Ok(pair) => accepted.push(pair),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("accepting inbound peer connection failed: {e}");
                        break;
                    }
                }
            }
        }
        for (stream, addr) in accepted {
            if !self.open_sockets.try_acquire(self.settings.peer_limit_global as usize) {
                continue;
            }
            let mut session =
                PeerSession::new_inbound(0, Transport::Tcp(TcpTransport::from_accepted(stream, addr)), self.our_peer_id);
            let token = self.alloc_token();
            if session.register(self.poll.registry(), token).is_err() {
                self.open_sockets.release();
                continue;
            }
            self.pending_peers.insert(token, PendingPeer::Inbound(session));
        }
    }

    /// Dials an outbound connection for `torrent_id`, respecting the
    /// per-torrent and global peer-socket limits.
    fn dial_peer(&mut self, torrent_id: TorrentId, addr: SocketAddr) {
        if self.peer_managers.get(&torrent_id).map(|m| m.at_limit()).unwrap_or(true) {
            return;
        }
        if !self.open_sockets.try_acquire(self.settings.peer_limit_global as usize) {
            return;
        }
        let Some(info_hash) = self.torrents.get(&torrent_id).map(|t| t.info_hash()) else {
            self.open_sockets.release();
            return;
        };
        let piece_count = self.torrents.get(&torrent_id).map(|t| t.metainfo.piece_count() as u32).unwrap_or(0);
        match TcpTransport::connect(addr) {
            Ok(tcp) => {
                let mut session =
                    PeerSession::new_outbound(0, Transport::Tcp(tcp), self.our_peer_id, info_hash, piece_count);
                let token = self.alloc_token();
                if session.register(self.poll.registry(), token).is_err() {
                    self.open_sockets.release();
                    return;
                }
                session.send_handshake(info_hash);
                let _ = session.flush_writes();
                self.pending_peers.insert(token, PendingPeer::Outbound { session, torrent_id });
            }
            Err(e) => {
                log_connect_failure(addr, &e);
                self.open_sockets.release();
            }
        }
    }

    fn service_peer_token(&mut self, token: Token, now_unix: i64) {
        if let Some(pending) = self.pending_peers.remove(&token) {
            self.service_pending(token, pending);
            return;
        }
        if let Some(&(torrent_id, peer_id)) = self.peer_tokens.get(&token) {
            self.service_active_peer(torrent_id, peer_id, token, now_unix);
        }
    }

    fn service_pending(&mut self, token: Token, pending: PendingPeer) {
        match pending {
            PendingPeer::Outbound { mut session, torrent_id } => match session.on_readable() {
                Ok(effects) => {
                    let _ = session.flush_writes();
                    match session.state() {
                        SessionState::Active => self.attach_peer(token, torrent_id, session, effects),
                        SessionState::Closed => {
                            let _ = session.deregister(self.poll.registry());
                            self.open_sockets.release();
                        }
                        SessionState::Handshake => {
                            self.pending_peers.insert(token, PendingPeer::Outbound { session, torrent_id });
                        }
                    }
                }
                Err(e) => {
                    log::debug!("outbound peer {} dropped during handshake: {e}", session.info.addr);
                    let _ = session.deregister(self.poll.registry());
                    self.open_sockets.release();
                }
            },
            PendingPeer::Inbound(mut session) => match session.on_readable() {
                Ok(effects) => match session.state() {
                    SessionState::Active => {
                        let info_hash = session.expected_info_hash();
                        let known = self.info_hash_index.get(&info_hash).copied();
                        match known {
                            Some(torrent_id) => {
                                let piece_count =
                                    self.torrents.get(&torrent_id).map(|t| t.metainfo.piece_count() as u32).unwrap_or(0);
                                session.send_handshake(info_hash);
                                let mut all_effects = effects;
                                if let Ok(more) = session.adopt_torrent(piece_count) {
                                    all_effects.extend(more);
                                }
                                let _ = session.flush_writes();
                                self.attach_peer(token, torrent_id, session, all_effects);
                            }
                            None => {
                                let _ = session.deregister(self.poll.registry());
                                self.open_sockets.release();
                            }
                        }
                    }
                    SessionState::Closed => {
                        let _ = session.deregister(self.poll.registry());
                        self.open_sockets.release();
                    }
                    SessionState::Handshake => {
                        self.pending_peers.insert(token, PendingPeer::Inbound(session));
                    }
                },
                Err(e) => {
                    log::debug!("inbound peer {} dropped during handshake: {e}", session.info.addr);
                    let _ = session.deregister(self.poll.registry());
                    self.open_sockets.release();
                }
            },
        }
    }

    /// Moves a handshake-complete session into its torrent's
    /// `PeerManager`, sends our bitfield, and applies any effects produced
    /// while reaching `Active` (e.g. a bitfield the peer sent immediately
    /// after its handshake).
    fn attach_peer(&mut self, token: Token, torrent_id: TorrentId, mut session: PeerSession, effects: Vec<Effect>) {
        let at_limit = self.peer_managers.get(&torrent_id).map(|m| m.at_limit()).unwrap_or(true);
        if at_limit {
            let _ = session.deregister(self.poll.registry());
            self.open_sockets.release();
            return;
        }
        if let Some(bitfield) = self.torrents.get(&torrent_id).map(|t| t.bitfield.clone()) {
            if bitfield.count_ones() > 0 {
                session.queue_message(&Message::Bitfield(bitfield.to_wire()));
            }
        }
        let _ = session.flush_writes();
        let peer_id = match self.peer_managers.get_mut(&torrent_id) {
            Some(manager) => manager.insert(move |id| {
                session.id = id;
                session
            }),
            None => {
                let _ = session.deregister(self.poll.registry());
                self.open_sockets.release();
                return;
            }
        };
        self.peer_tokens.insert(token, (torrent_id, peer_id));
        self.handle_effects(torrent_id, peer_id, effects, self.started_at_unix_hint());
    }

    /// `attach_peer` needs a `now_unix` for effects that can complete a
    /// piece during the handshake's trailing bytes; real wall-clock
    /// granularity doesn't matter there; any monotonically-reasonable
    /// value the caller last observed is fine since the bitfield/have
    /// bookkeeping it feeds doesn't key off of it.
    fn started_at_unix_hint(&self) -> i64 {
        self.started_at.elapsed().as_secs() as i64
    }

    fn service_active_peer(&mut self, torrent_id: TorrentId, peer_id: PeerId, token: Token, now_unix: i64) {
        let effects = {
            let Some(manager) = self.peer_managers.get_mut(&torrent_id) else { return };
            let Some(session) = manager.get_mut(peer_id) else { return };
            match session.on_readable() {
                Ok(effects) => {
                    let _ = session.flush_writes();
                    if session.state() == SessionState::Closed {
                        None
                    } else {
                        Some(effects)
                    }
                }
                Err(e) => {
                    log::debug!("peer {peer_id} on torrent {torrent_id} dropped: {e}");
                    None
                }
            }
        };
        match effects {
            Some(effects) => self.handle_effects(torrent_id, peer_id, effects, now_unix),
            None => self.drop_peer(torrent_id, peer_id, token),
        }
    }

    fn drop_peer(&mut self, torrent_id: TorrentId, peer_id: PeerId, token: Token) {
        self.peer_tokens.remove(&token);
        if let Some(manager) = self.peer_managers.get_mut(&torrent_id) {
            if let Some(session) = manager.get_mut(peer_id) {
                let _ = session.deregister(self.poll.registry());
            }
            manager.remove(peer_id);
        }
        self.open_sockets.release();
    }

    /// Applies the effects of a batch of wire messages: rarity/bitfield
    /// bookkeeping goes to the picker via the peer manager, `Piece`
    /// payloads get written to storage, and `Request`s get served back.
    fn handle_effects(&mut self, torrent_id: TorrentId, peer_id: PeerId, effects: Vec<Effect>, now_unix: i64) {
        if effects.is_empty() {
            return;
        }
        if let Some(manager) = self.peer_managers.get_mut(&torrent_id) {
            manager.record_bitfield_effects(&effects);
            if effects.iter().any(|e| matches!(e, Effect::BitfieldAdvertised)) {
                let bf = manager.get(peer_id).and_then(|p| p.info.bitfield.clone());
                if let Some(bf) = bf {
                    manager.note_bitfield_for(&bf);
                }
            }
        }
        for effect in effects {
            match effect {
                Effect::PieceReceived { piece, begin, data } => {
                    self.handle_piece_received(torrent_id, peer_id, piece, begin, data, now_unix);
                }
                Effect::RequestReceived(req) => {
                    self.handle_block_request(torrent_id, peer_id, req);
                }
                _ => {}
            }
        }
    }

    /// Writes a received block to storage; once its piece is fully
    /// buffered, verifies it and marks it in the torrent's bitfield (or
    /// discards it and re-opens it to the picker on a hash mismatch).
    /// Cancels the same block on any other peer it was also requested
    /// from (endgame mode can request one block from several peers).
    fn handle_piece_received(
        &mut self,
        torrent_id: TorrentId,
        peer_id: PeerId,
        piece: u32,
        begin: u32,
        data: Vec<u8>,
        now_unix: i64,
    ) {
        let length = data.len() as u32;
        let Some(storage) = self.storages.get_mut(&torrent_id) else { return };
        if storage.write_block(piece, begin, &data).is_err() {
            return;
        }
        let piece_complete = storage.piece_is_complete(piece);
        if let Some(torrent) = self.torrents.get_mut(&torrent_id) {
            torrent.have_unchecked_bytes = storage.unverified_bytes();
        }

        if let Some(manager) = self.peer_managers.get_mut(&torrent_id) {
            let req = BlockRequest { piece, begin, length };
            for holder in manager.picker.on_block_received(req) {
                if holder == peer_id {
                    continue;
                }
                if let Some(other) = manager.get_mut(holder) {
                    other.queue_message(&Message::Cancel(piece, begin, length));
                    let _ = other.flush_writes();
                }
            }
        }

        if !piece_complete {
            return;
        }

        let verify_result = self.storages.get_mut(&torrent_id).map(|s| s.verify_piece(piece));
        let unverified_after = self.storages.get(&torrent_id).map(|s| s.unverified_bytes()).unwrap_or(0);
        if let Some(torrent) = self.torrents.get_mut(&torrent_id) {
            torrent.have_unchecked_bytes = unverified_after;
        }
        match verify_result {
            Some(Ok(VerifyResult::Ok)) => {
                if let Some(torrent) = self.torrents.get_mut(&torrent_id) {
                    torrent.mark_piece_verified(piece as usize, now_unix);
                }
                self.broadcast_have(torrent_id, piece);
            }
            Some(Ok(VerifyResult::Bad)) => {
                let piece_size = self.torrents.get(&torrent_id).map(|t| t.metainfo.piece_size(piece) as u64).unwrap_or(0);
                if let Some(torrent) = self.torrents.get_mut(&torrent_id) {
                    torrent.record_piece_corrupt(piece as usize, piece_size);
                }
                if let Some(manager) = self.peer_managers.get_mut(&torrent_id) {
                    manager.picker.return_piece(piece);
                }
            }
            Some(Err(e)) => {
                log::warn!("verify_piece({piece}) failed for torrent {torrent_id}: {e}");
            }
            None => {}
        }
    }

    fn broadcast_have(&mut self, torrent_id: TorrentId, piece: u32) {
        let Some(manager) = self.peer_managers.get_mut(&torrent_id) else { return };
        for id in manager.ids() {
            if let Some(session) = manager.get_mut(id) {
                session.queue_message(&Message::Have(piece));
                let _ = session.flush_writes();
            }
        }
    }

    /// Serves a block request from storage, unless we currently choke
    /// that peer.
    fn handle_block_request(&mut self, torrent_id: TorrentId, peer_id: PeerId, req: BlockRequest) {
        if req.length > crate::peer::protocol::MAX_REQUEST_LEN {
            return;
        }
        let choking = self
            .peer_managers
            .get(&torrent_id)
            .and_then(|m| m.get(peer_id))
            .map(|p| p.info.client_choked)
            .unwrap_or(true);
        if choking {
            return;
        }
        let Some(storage) = self.storages.get_mut(&torrent_id) else { return };
        let Ok(data) = storage.read_block(req.piece, req.begin, req.length) else { return };
        let uploaded = data.len() as u64;
        if let Some(manager) = self.peer_managers.get_mut(&torrent_id) {
            if let Some(session) = manager.get_mut(peer_id) {
                session.queue_message(&Message::Piece(req.piece, req.begin, data));
                session.info.uploaded += uploaded;
                let _ = session.flush_writes();
            }
        }
        if let Some(torrent) = self.torrents.get_mut(&torrent_id) {
            torrent.counters.uploaded_ever += uploaded;
        }
    }

    /// Runs the choke/unchoke rotation and request scheduling for one
    /// torrent's peer set, flushing whatever messages either one queues.
    fn drive_peer_manager(&mut self, torrent_id: TorrentId) {
        let is_seeding = self.torrents.get(&torrent_id).map(|t| t.is_done()).unwrap_or(false);
        let ours = self.torrents.get(&torrent_id).map(|t| t.bitfield.clone());
        let Some(ours) = ours else { return };
        let Some(manager) = self.peer_managers.get_mut(&torrent_id) else { return };

        if let Some(unchoked) = manager.recompute_unchoke(Instant::now(), is_seeding) {
            for id in unchoked {
                if let Some(session) = manager.get_mut(id) {
                    session.queue_message(&Message::Unchoke);
                    let _ = session.flush_writes();
                }
            }
        }

        let outstanding_total = manager.picker.outstanding_count();
        let total_blocks = manager.picker.piece_count() as usize
            * ((manager.picker.piece_length() as usize).div_ceil(crate::picker::BLOCK_SIZE as usize));
        manager.picker.recompute_endgame(total_blocks.saturating_sub(outstanding_total));

        if !is_seeding {
            let issued = manager.schedule_requests(&ours);
            for (id, _req) in issued {
                if let Some(session) = manager.get_mut(id) {
                    let _ = session.flush_writes();
                }
            }
        }
    }

    /// Picks the live tier's due, non-in-flight trackers for `torrent_id`:
    /// the first tier (lowest number) that still has a non-backup member,
    /// filtered to entries whose `next_announce` has passed.
    fn due_trackers_for(&self, id: TorrentId, now_unix: i64) -> Vec<u32> {
        let Some(t) = self.torrents.get(&id) else { return Vec::new() };
        for group in crate::tracker::tiers(&t.trackers) {
            let any_non_backup = group
                .iter()
                .any(|tid| t.trackers.iter().any(|e| e.id == *tid && !e.is_backup()));
            if !any_non_backup {
                continue;
            }
            return group
                .into_iter()
                .filter(|tid| {
                    t.trackers.iter().any(|e| {
                        e.id == *tid && !matches!(e.state, TrackerState::InFlight) && e.next_announce <= now_unix
                    })
                })
                .collect();
        }
        Vec::new()
    }

    fn submit_announce(&mut self, torrent_id: TorrentId, tracker_id: u32) {
        let Some(torrent) = self.torrents.get_mut(&torrent_id) else { return };
        let Some(entry) = torrent.trackers.iter_mut().find(|e| e.id == tracker_id) else { return };
        entry.state = TrackerState::InFlight;
        let url = entry.announce_url.clone();
        let is_udp = entry.is_udp();
        let downloaded = torrent.counters.downloaded_ever;
        let job = TrackerJob::Announce {
            torrent_id,
            tracker_id,
            url,
            is_udp,
            metainfo: torrent.metainfo.clone(),
            peer_id: self.our_peer_id,
            port: self.settings.peer_port,
            uploaded: torrent.counters.uploaded_ever,
            downloaded,
            left: torrent.left_until_done(),
            event: if downloaded == 0 { AnnounceEvent::Started } else { AnnounceEvent::None },
        };
        let _ = self.tracker_job_tx.send(job);
    }

    fn drain_tracker_results(&mut self, now_unix: i64) {
        while let Ok(outcome) = self.tracker_result_rx.try_recv() {
            match outcome {
                TrackerOutcome::Announce { torrent_id, tracker_id, result } => {
                    let peers = self.apply_announce_outcome(torrent_id, tracker_id, result, now_unix);
                    for addr in peers {
                        self.dial_peer(torrent_id, addr);
                    }
                }
            }
        }
    }

    /// Queues a one-shot HTTP GET on the fetch worker pool and returns a
    /// request id the caller can later pass to `poll_fetch`. Never blocks:
    /// the actual request runs on a worker thread, picked up by
    /// `drain_fetch_results` on a later `tick`.
    pub fn submit_fetch(&mut self, url: String, timeout: Duration, kind: PendingFetchKind) -> u64 {
        let id = self.next_fetch_id;
        self.next_fetch_id += 1;
        self.pending_fetches.insert(id, kind);
        let _ = self.fetch_job_tx.send(FetchJob { id, url, timeout });
        id
    }

    /// Non-blocking poll for a fetch submitted with `submit_fetch`. Returns
    /// `None` while the fetch is still in flight; removes and returns the
    /// outcome once it's ready.
    pub fn poll_fetch(&mut self, id: u64) -> Option<Result<ValueMap, String>> {
        self.completed_fetches.remove(&id)
    }

    fn drain_fetch_results(&mut self) {
        while let Ok(outcome) = self.fetch_result_rx.try_recv() {
            let Some(kind) = self.pending_fetches.remove(&outcome.id) else { continue };
            let resolved = match kind {
                PendingFetchKind::BlocklistUpdate => outcome.result.and_then(|body| self.apply_blocklist_body(body)),
                PendingFetchKind::PortTest => outcome.result.map(|body| {
                    let text = String::from_utf8_lossy(&body);
                    let is_open = text.trim() == "1";
                    let mut m = ValueMap::new();
                    m.insert_str("port-is-open", Value::Bool(is_open));
                    m
                }),
                PendingFetchKind::TorrentAddUrl { opts, now } => outcome.result.and_then(|body| {
                    self.add_from_metainfo_bytes(&body, opts, now)
                        .map(|added| add_outcome_to_value_map(self, added))
                        .map_err(|e| e.to_string())
                }),
            };
            self.completed_fetches.insert(outcome.id, resolved);
        }
    }

    fn apply_blocklist_body(&self, body: Vec<u8>) -> Result<ValueMap, String> {
        let text = if body.starts_with(&[0x1f, 0x8b]) {
            crate::net_fetch::gunzip(&body).map_err(|e| e.to_string())?
        } else {
            body
        };
        let rule_count = crate::net_fetch::BlocklistUpdater::apply(&text);
        std::fs::write(self.settings.blocklist_path(), &text).map_err(|e| e.to_string())?;
        let mut m = ValueMap::new();
        m.insert_str("blocklist-size", Value::Int(rule_count as i64));
        Ok(m)
    }

    fn apply_announce_outcome(
        &mut self,
        torrent_id: TorrentId,
        tracker_id: u32,
        result: Result<AnnounceOutcome, TrackerFailure>,
        now_unix: i64,
    ) -> Vec<SocketAddr> {
        let Some(torrent) = self.torrents.get_mut(&torrent_id) else { return Vec::new() };
        match result {
            Ok(ok) => {
                if let Some(entry) = torrent.trackers.iter_mut().find(|e| e.id == tracker_id) {
                    entry.on_success(ok.interval, ok.min_interval, now_unix);
                }
                crate::tracker::apply_backup_policy(&mut torrent.trackers, tracker_id);
                ok.peers
            }
            Err(TrackerFailure::Timeout) => {
                if let Some(entry) = torrent.trackers.iter_mut().find(|e| e.id == tracker_id) {
                    entry.on_timeout(now_unix);
                }
                Vec::new()
            }
            Err(TrackerFailure::Error(message)) => {
                if let Some(entry) = torrent.trackers.iter_mut().find(|e| e.id == tracker_id) {
                    entry.on_error(message, now_unix);
                }
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMove {
    Top,
    Up,
    Down,
    Bottom,
}

fn decode_hex20(s: &str) -> Option<[u8; 20]> {
    if s.len() != 40 {
        return None;
    }
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

fn apply_resume(torrent: &mut Torrent, resume: &ResumeRecord) {
    for (i, &wanted) in resume.file_wanted.iter().enumerate() {
        if let Some(f) = torrent.files.get_mut(i) {
            f.wanted = wanted;
        }
    }
    for (i, &p) in resume.file_priority.iter().enumerate() {
        if let Some(f) = torrent.files.get_mut(i) {
            f.priority = match p {
                x if x < 0 => Priority::Low,
                x if x > 0 => Priority::High,
                _ => Priority::Normal,
            };
        }
    }
    torrent.counters.uploaded_ever = resume.uploaded_ever;
    torrent.counters.downloaded_ever = resume.downloaded_ever;
    torrent.counters.corrupt_ever = resume.corrupt_ever;
    torrent.labels = resume.labels.clone();
    torrent.bandwidth_group = resume.bandwidth_group.clone();
    torrent.queue_position = resume.queue_position;
    torrent.sequential_download = resume.sequential_download;
    if resume.bitfield_bytes.len() * 8 >= torrent.bitfield.len() {
        if let Ok(bf) = crate::bitfield::BitField::from_wire(&resume.bitfield_bytes, torrent.bitfield.len()) {
            torrent.bitfield = bf;
        }
    }
}

fn build_resume_record(torrent: &Torrent, now: i64) -> ResumeRecord {
    ResumeRecord {
        info_hash: torrent.info_hash(),
        bitfield_bytes: torrent.bitfield.to_wire(),
        file_wanted: torrent.files.iter().map(|f| f.wanted).collect(),
        file_priority: torrent
            .files
            .iter()
            .map(|f| match f.priority {
                Priority::Low => -1,
                Priority::Normal => 0,
                Priority::High => 1,
            })
            .collect(),
        uploaded_ever: torrent.counters.uploaded_ever,
        downloaded_ever: torrent.counters.downloaded_ever,
        corrupt_ever: torrent.counters.corrupt_ever,
        labels: torrent.labels.clone(),
        bandwidth_group: torrent.bandwidth_group.clone(),
        queue_position: torrent.queue_position,
        sequential_download: torrent.sequential_download,
        edit_date: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quark;
    use crate::value::{Value, ValueMap};
    use tempfile::tempdir;

    fn sample_metainfo(seed: u8) -> Metainfo {
        let mut info = ValueMap::new();
        info.insert_str("name", Value::string(format!("t{seed}")));
        info.insert_str("piece length", Value::Int(16384));
        info.insert_str("pieces", Value::Str(vec![seed; 20]));
        info.insert_str("length", Value::Int(16384));
        let mut root = ValueMap::new();
        root.insert(quark::intern_str("info"), Value::Map(info));
        let bytes = crate::value::bencode_encode(&Value::Map(root));
        Metainfo::from_bencode(&bytes).unwrap()
    }

    fn session_with_tmp_dirs() -> (Session, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.config_dir = dir.path().to_path_buf();
        settings.download_dir = dir.path().join("downloads");
        (Session::new(settings), dir)
    }

    #[test]
    fn add_and_duplicate_detection_round_trips() {
        let (mut session, _dir) = session_with_tmp_dirs();
        let mi = sample_metainfo(1);
        let outcome = session.add_from_metainfo(mi.clone(), TorrentAddOptions::default(), 1000).unwrap();
        let id = match outcome {
            AddOutcome::Added(id) => id,
            _ => panic!("expected Added"),
        };
        let outcome2 = session.add_from_metainfo(mi, TorrentAddOptions::default(), 1001).unwrap();
        match outcome2 {
            AddOutcome::Duplicate(dup_id) => assert_eq!(dup_id, id),
            _ => panic!("expected Duplicate"),
        }
        assert_eq!(session.len(), 1);
    }

    #[test]
    fn relative_download_dir_is_rejected() {
        let (mut session, _dir) = session_with_tmp_dirs();
        let mi = sample_metainfo(2);
        let opts = TorrentAddOptions {
            download_dir: Some(PathBuf::from("relative/path")),
            ..TorrentAddOptions::default()
        };
        let err = session.add_from_metainfo(mi, opts, 1000).unwrap_err();
        assert!(matches!(err, SessionError::RelativeDownloadDir));
    }

    #[test]
    fn remove_then_recently_active_lists_the_id() {
        let (mut session, _dir) = session_with_tmp_dirs();
        let mi = sample_metainfo(3);
        let id = match session.add_from_metainfo(mi, TorrentAddOptions::default(), 1000).unwrap() {
            AddOutcome::Added(id) => id,
            _ => unreachable!(),
        };
        let now = Instant::now();
        session.remove_torrent(id, false, now).unwrap();
        assert_eq!(session.removed_since(now), vec![id]);
    }

    #[test]
    fn queue_move_down_swaps_adjacent_positions() {
        let (mut session, _dir) = session_with_tmp_dirs();
        let first = match session.add_from_metainfo(sample_metainfo(4), TorrentAddOptions::default(), 1000).unwrap() {
            AddOutcome::Added(id) => id,
            _ => unreachable!(),
        };
        let second = match session.add_from_metainfo(sample_metainfo(5), TorrentAddOptions::default(), 1000).unwrap() {
            AddOutcome::Added(id) => id,
            _ => unreachable!(),
        };
        session.get_mut(first).unwrap().queue_position = 0;
        session.get_mut(second).unwrap().queue_position = 1;
        session.queue_move(first, QueueMove::Down).unwrap();
        assert_eq!(session.get(first).unwrap().queue_position, 1);
        assert_eq!(session.get(second).unwrap().queue_position, 0);
    }

    #[test]
    fn sessionstats_round_trips_and_accumulates_across_saves() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessionstats");

        assert_eq!(SessionStats::load(&path).cumulative_session_count, 0);

        let mut stats = SessionStats::default();
        stats.uploaded_bytes = 500;
        stats.downloaded_bytes = 1000;
        stats.save(&path, Duration::from_secs(60)).unwrap();

        let reloaded = SessionStats::load(&path);
        assert_eq!(reloaded.cumulative_uploaded_bytes, 500);
        assert_eq!(reloaded.cumulative_downloaded_bytes, 1000);
        assert_eq!(reloaded.cumulative_seconds_active, 60);
        assert_eq!(reloaded.cumulative_session_count, 1);

        let mut stats2 = reloaded;
        stats2.uploaded_bytes = 10;
        stats2.save(&path, Duration::from_secs(30)).unwrap();
        let final_stats = SessionStats::load(&path);
        assert_eq!(final_stats.cumulative_uploaded_bytes, 510);
        assert_eq!(final_stats.cumulative_seconds_active, 90);
        assert_eq!(final_stats.cumulative_session_count, 2);
    }
}
