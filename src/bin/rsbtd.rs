//! The daemon entry point: parses CLI flags, loads and merges settings,
//! builds a `Session`, and runs the event loop that serves the JSON-RPC
//! surface over HTTP.
//!
//! Watch-dir scanning, signal handling, and daemonization are left to the
//! operator or a wrapper script; this binary only exposes the callback
//! contract (`Session::add_from_file`) such a watcher would call into, and
//! logs that watch-dir is configured but not scanned by this process.

use anyhow::{Context, Result};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use rs_bt_engine::config::{Cli, Settings};
use rs_bt_engine::rpc::{self, DispatchOutcome, Request, Response};
use rs_bt_engine::session::Session;
use rs_bt_engine::value::{self, Value};
use clap::Parser;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const TICK: Duration = Duration::from_millis(500);
const RESUME_SAVE_INTERVAL: Duration = Duration::from_secs(120);
const MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = cli.config_dir.clone().unwrap_or_else(|| Settings::default().config_dir);
    let mut settings = Settings::load(&config_dir).context("loading settings")?;
    settings.apply_cli(&cli);

    if cli.dump_settings {
        println!("{}", value::json_encode(&Value::Map(settings.to_value_map())));
        return Ok(());
    }

    init_logging(&settings)?;
    std::fs::create_dir_all(&settings.download_dir).context("creating download directory")?;
    std::fs::create_dir_all(settings.resume_dir()).context("creating resume directory")?;

    if settings.watch_dir_enabled {
        if let Some(dir) = &settings.watch_dir {
            log::info!("watch-dir {} is configured; this binary does not scan it itself, only `Session::add_from_file` is wired up for a watcher to call", dir.display());
        }
    }

    let addr = std::net::SocketAddr::new(settings.rpc_bind_address, settings.rpc_port);
    let mut listener = TcpListener::bind(addr).with_context(|| format!("binding rpc listener on {addr}"))?;
    log::info!("rpc listening on {addr}");

    let mut poll = Poll::new().context("creating poll")?;
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
        .context("registering rpc listener")?;

    let mut session = Session::new(settings);
    if let Err(e) = session.start_listening() {
        log::warn!("failed to bind peer listener: {e}");
    }
    let mut connections: HashMap<Token, Connection> = HashMap::new();
    let mut next_token = 1usize;
    let mut events = Events::with_capacity(256);
    let mut last_resume_save = Instant::now();

    loop {
        poll.poll(&mut events, Some(TICK)).context("polling event loop")?;

        for ev in events.iter() {
            if ev.token() == LISTENER_TOKEN {
                loop {
                    match listener.accept() {
                        Ok((mut stream, peer)) => {
                            let token = Token(next_token);
                            next_token += 1;
                            if let Err(e) = poll.registry().register(
                                &mut stream,
                                token,
                                Interest::READABLE | Interest::WRITABLE,
                            ) {
                                log::warn!("failed to register rpc connection from {peer}: {e}");
                                continue;
                            }
                            connections.insert(token, Connection::new(stream));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                            break;
                        }
                    }
                }
                continue;
            }

            let done = match connections.get_mut(&ev.token()) {
                Some(conn) => conn.progress(&mut session, ev),
                None => true,
            };
            if done {
                if let Some(mut conn) = connections.remove(&ev.token()) {
                    let _ = poll.registry().deregister(&mut conn.stream);
                }
            }
        }

        run_housekeeping(&mut session);

        if let Err(e) = session.tick(now_unix()) {
            log::warn!("session tick failed: {e}");
        }

        let mut finished = Vec::new();
        for (&token, conn) in connections.iter_mut() {
            conn.poll_pending(&mut session);
            if conn.response.is_some() && conn.try_flush_response() {
                finished.push(token);
            }
        }
        for token in finished {
            if let Some(mut conn) = connections.remove(&token) {
                let _ = poll.registry().deregister(&mut conn.stream);
            }
        }

        if last_resume_save.elapsed() >= RESUME_SAVE_INTERVAL {
            if let Err(e) = session.save_all_resume_files(now_unix()) {
                log::warn!("periodic resume save failed: {e}");
            }
            last_resume_save = Instant::now();
        }
    }
}

/// Drives one verification step for every torrent still checking its
/// on-disk pieces. Called once per tick so a slow hash pass never blocks
/// RPC dispatch for more than a single piece at a time.
fn run_housekeeping(session: &mut Session) {
    let now = now_unix();
    let ids = session.resolve_ids(&rs_bt_engine::session::IdSelector::All);
    for id in ids {
        let checking = session
            .get(id)
            .map(|t| t.activity.is_checking() || t.activity == rs_bt_engine::torrent::Activity::QueuedCheck)
            .unwrap_or(false);
        if checking {
            let _ = session.step_verify(id, now);
        }
    }
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn init_logging(settings: &Settings) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(settings.log_level.to_level_filter());
    if let Some(path) = &settings.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

/// One accepted RPC connection: reads a single HTTP request, dispatches
/// it, writes back a single HTTP response, then closes. `Connection:
/// close` semantics throughout, since the control surface is low-volume
/// and local.
///
/// `blocklist-update`/`port-test`/`torrent-add`'s URL-source case resolve
/// through `Session`'s fetch worker pool rather than inline, so a
/// connection can sit in `pending_fetch` across several ticks with no
/// mio readiness event of its own to drive it; the main loop polls every
/// open connection after each `session.tick` to pick up the moment its
/// fetch completes, rather than relying on edge-triggered writable events
/// that already fired once right after accept.
struct Connection {
    stream: TcpStream,
    read_buf: Vec<u8>,
    response: Option<Vec<u8>>,
    written: usize,
    pending_fetch: Option<(u64, Option<i64>)>,
}

impl Connection {
    fn new(stream: TcpStream) -> Connection {
        Connection { stream, read_buf: Vec::new(), response: None, written: 0, pending_fetch: None }
    }

    /// Advances this connection's state machine for one readiness event.
    /// Returns `true` once the connection should be torn down.
    fn progress(&mut self, session: &mut Session, ev: &mio::event::Event) -> bool {
        if self.response.is_none() && self.pending_fetch.is_none() {
            if ev.is_readable() {
                if let Err(close_now) = self.read_request() {
                    if close_now {
                        return true;
                    }
                }
            }
            if let Some(request_body) = self.try_extract_request() {
                match build_response(session, &request_body) {
                    BuildResult::Done(bytes) => self.response = Some(bytes),
                    BuildResult::Pending { fetch_id, tag } => self.pending_fetch = Some((fetch_id, tag)),
                }
            }
        }

        if ev.is_writable() || self.written > 0 {
            if self.try_flush_response() {
                return true;
            }
        }
        false
    }

    /// If this connection is waiting on a fetch, checks whether it's
    /// resolved yet and, if so, builds the final response bytes.
    fn poll_pending(&mut self, session: &mut Session) {
        let Some((fetch_id, tag)) = self.pending_fetch else { return };
        if let Some(result) = session.poll_fetch(fetch_id) {
            let json = value::json_encode(&Response::from_fetch_result(result, tag).to_value());
            self.response = Some(http_response_bytes(&json));
            self.pending_fetch = None;
        }
    }

    /// Writes out whatever of `response` hasn't been sent yet. Returns
    /// `true` once the whole response has been written (or the write
    /// failed outright), meaning the connection is done.
    fn try_flush_response(&mut self) -> bool {
        let Some(resp) = &self.response else { return false };
        match self.stream.write(&resp[self.written..]) {
            Ok(0) => true,
            Ok(n) => {
                self.written += n;
                self.written >= resp.len()
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }

    /// Reads whatever is available right now. `Err(true)` means the
    /// connection should close outright (error, size cap exceeded, or EOF
    /// with nothing read yet); `Err(false)` means the peer closed its
    /// write side but left a request already in the buffer worth parsing.
    fn read_request(&mut self) -> Result<(), bool> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(self.read_buf.is_empty()),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    if self.read_buf.len() > MAX_REQUEST_BYTES {
                        return Err(true);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(_) => return Err(true),
            }
        }
    }

    /// Once headers and the full `Content-Length` body have arrived,
    /// returns the body bytes.
    fn try_extract_request(&self) -> Option<Vec<u8>> {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        let status = req.parse(&self.read_buf).ok()?;
        let header_len = match status {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => return None,
        };
        let content_length = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("content-length"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if self.read_buf.len() < header_len + content_length {
            return None;
        }
        Some(self.read_buf[header_len..header_len + content_length].to_vec())
    }
}

/// Outcome of dispatching one request: either the HTTP response bytes are
/// ready now, or the method is one of the fetch-backed ones and the
/// connection must wait for `Session::poll_fetch` to resolve.
enum BuildResult {
    Done(Vec<u8>),
    Pending { fetch_id: u64, tag: Option<i64> },
}

fn build_response(session: &mut Session, body: &[u8]) -> BuildResult {
    let now = now_unix();
    let now_instant = Instant::now();
    let text = String::from_utf8_lossy(body);
    let result = value::json_decode(&text)
        .map_err(|e| e.to_string())
        .and_then(|v| Request::from_value(&v));

    let request = match result {
        Ok(request) => request,
        Err(message) => {
            let mut m = value::ValueMap::new();
            m.insert_str("result", Value::string(message));
            m.insert_str("arguments", Value::Map(value::ValueMap::new()));
            let json = value::json_encode(&Value::Map(m));
            return BuildResult::Done(http_response_bytes(&json));
        }
    };

    match rpc::dispatch(session, request, now, now_instant) {
        DispatchOutcome::Done(resp) => {
            let json = value::json_encode(&resp.to_value());
            BuildResult::Done(http_response_bytes(&json))
        }
        DispatchOutcome::Pending { fetch_id, tag } => BuildResult::Pending { fetch_id, tag },
    }
}

fn http_response_bytes(json: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        json.len(),
        json
    )
    .into_bytes()
}
