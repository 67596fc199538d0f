//! RPC dispatcher: method resolution, field projection,
//! and the synchronous/asynchronous handler split.
//!
//! Method table, argument validation, and response shapes are
//! re-expressed over this crate's own `value`/`quark` modules rather
//! than a serde-backed request/response struct.

mod async_handlers;
mod session_methods;
mod torrent_add;
mod torrent_get;
mod torrent_set;

use crate::quark;
use crate::session::{IdSelector, Session};
use crate::value::{Value, ValueMap};
use std::time::Instant;

pub const RPC_VERSION: i64 = 18;
pub const RPC_VERSION_MINIMUM: i64 = 14;
pub const RPC_VERSION_SEMVER: &str = "6.0.0";

/// A parsed RPC request.
pub struct Request {
    pub method: String,
    pub arguments: ValueMap,
    pub tag: Option<i64>,
}

impl Request {
    pub fn from_value(v: &Value) -> Result<Request, String> {
        let map = v.as_map().ok_or_else(|| "request is not a json object".to_string())?;
        let method = map
            .get(quark::intern_str("method"))
            .and_then(Value::as_str)
            .ok_or_else(|| "no method specified".to_string())?
            .to_string();
        let arguments = map
            .get(quark::intern_str("arguments"))
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();
        let tag = map.get(quark::intern_str("tag")).and_then(Value::as_i64);
        Ok(Request { method, arguments, tag })
    }
}

/// Normalizes a method name for dispatch: RPC method names are
/// conventionally kebab-case, but `_`-spelled variants must resolve too,
/// so dashes and underscores are folded to one form before matching.
fn normalize_method(method: &str) -> String {
    method.replace('_', "-")
}

pub struct Response {
    pub result: String,
    pub arguments: ValueMap,
    pub tag: Option<i64>,
}

impl Response {
    fn ok(arguments: ValueMap, tag: Option<i64>) -> Response {
        Response { result: "success".to_string(), arguments, tag }
    }

    fn err(message: impl Into<String>, tag: Option<i64>) -> Response {
        Response { result: message.into(), arguments: ValueMap::new(), tag }
    }

    pub fn to_value(&self) -> Value {
        let mut m = ValueMap::new();
        m.insert_str("result", Value::string(self.result.clone()));
        m.insert_str("arguments", Value::Map(self.arguments.clone()));
        if let Some(tag) = self.tag {
            m.insert_str("tag", Value::Int(tag));
        }
        Value::Map(m)
    }
}

/// `dispatch`'s return value: most methods resolve immediately, but the
/// three that reach outside the process (`blocklist-update`, `port-test`,
/// `torrent-add`'s URL-source case) hand back a fetch id instead of
/// blocking the caller's thread on the network round trip. The caller
/// polls `Session::poll_fetch` on a later tick and builds the eventual
/// `Response` itself with `Response::from_fetch_result`.
pub enum DispatchOutcome {
    Done(Response),
    Pending { fetch_id: u64, tag: Option<i64> },
}

impl Response {
    /// Builds the eventual response for a method that resolved through
    /// `DispatchOutcome::Pending`, once `Session::poll_fetch` has an answer.
    pub fn from_fetch_result(result: Result<ValueMap, String>, tag: Option<i64>) -> Response {
        match result {
            Ok(arguments) => Response::ok(arguments, tag),
            Err(message) => Response::err(message, tag),
        }
    }
}

/// Reads the `ids` argument shared by most handlers:
/// absent means every torrent, the literal `recently-active` string means
/// the 60s window, a list of ints means numeric ids, a list of strings
/// means 40-hex info-hashes.
fn resolve_ids_from_args(session: &Session, args: &ValueMap) -> Vec<crate::torrent::TorrentId> {
    match args.get(quark::intern_str("ids")) {
        None => session.resolve_ids(&IdSelector::All),
        Some(Value::Str(bytes)) => {
            let s = String::from_utf8_lossy(bytes);
            if s == "recently-active" || s == "recently_active" {
                session.resolve_ids(&IdSelector::RecentlyActive)
            } else {
                session.resolve_ids(&IdSelector::All)
            }
        }
        Some(Value::List(items)) => {
            let mut numeric = Vec::new();
            let mut hashes = Vec::new();
            for item in items {
                match item {
                    Value::Int(n) => numeric.push(*n as u32),
                    Value::Str(bytes) => hashes.push(String::from_utf8_lossy(bytes).into_owned()),
                    _ => {}
                }
            }
            if !numeric.is_empty() {
                session.resolve_ids(&IdSelector::Ids(&numeric))
            } else {
                session.resolve_ids(&IdSelector::HashStrings(&hashes))
            }
        }
        Some(Value::Int(n)) => session.resolve_ids(&IdSelector::Ids(&[*n as u32])),
        _ => session.resolve_ids(&IdSelector::All),
    }
}

/// Dispatches one already-parsed request against `session`. `now`/`now_instant`
/// carry the wall-clock and monotonic clocks the caller already has, since
/// nothing in this crate is allowed to read the clock itself (workflow/test
/// determinism — see `session.rs`'s own tests for the same convention).
pub fn dispatch(session: &mut Session, request: Request, now: i64, now_instant: Instant) -> DispatchOutcome {
    let method = normalize_method(&request.method);
    let args = &request.arguments;
    let tag = request.tag;

    match method.as_str() {
        "blocklist-update" => {
            return match async_handlers::blocklist_update(session) {
                Ok(fetch_id) => DispatchOutcome::Pending { fetch_id, tag },
                Err(message) => DispatchOutcome::Done(Response::err(message, tag)),
            };
        }
        "port-test" => {
            return match async_handlers::port_test(session, args) {
                Ok(fetch_id) => DispatchOutcome::Pending { fetch_id, tag },
                Err(message) => DispatchOutcome::Done(Response::err(message, tag)),
            };
        }
        "torrent-add" => {
            return match torrent_add::handle(session, args, now) {
                Ok(torrent_add::TorrentAddResult::Done(arguments)) => DispatchOutcome::Done(Response::ok(arguments, tag)),
                Ok(torrent_add::TorrentAddResult::Pending(fetch_id)) => DispatchOutcome::Pending { fetch_id, tag },
                Err(message) => DispatchOutcome::Done(Response::err(message, tag)),
            };
        }
        _ => {}
    }

    let result = match method.as_str() {
        "session-get" => session_methods::session_get(session).map(Some),
        "session-set" => session_methods::session_set(session, args).map(|()| None),
        "session-stats" => session_methods::session_stats(session).map(Some),
        "session-close" => {
            session.close(now);
            Ok(None)
        }
        "free-space" => session_methods::free_space(args).map(Some),
        "group-get" => session_methods::group_get(session, args).map(Some),
        "group-set" => session_methods::group_set(session, args).map(|()| None),
        "queue-move-top" => session_methods::queue_move(session, args, crate::session::QueueMove::Top).map(|()| None),
        "queue-move-up" => session_methods::queue_move(session, args, crate::session::QueueMove::Up).map(|()| None),
        "queue-move-down" => session_methods::queue_move(session, args, crate::session::QueueMove::Down).map(|()| None),
        "queue-move-bottom" => {
            session_methods::queue_move(session, args, crate::session::QueueMove::Bottom).map(|()| None)
        }
        "torrent-get" => torrent_get::handle(session, args, now_instant).map(Some),
        "torrent-set" => torrent_set::handle(session, args).map(|()| None),
        "torrent-set-location" => torrent_set::set_location(session, args).map(|()| None),
        "torrent-remove" => session_methods::torrent_remove(session, args, now_instant).map(|()| None),
        "torrent-start" => session_methods::torrent_foreach(session, args, |t| {
            t.start();
            Ok(())
        })
        .map(|()| None),
        "torrent-start-now" => session_methods::torrent_foreach(session, args, |t| {
            t.start();
            Ok(())
        })
        .map(|()| None),
        "torrent-stop" => session_methods::torrent_foreach(session, args, |t| {
            t.stop();
            Ok(())
        })
        .map(|()| None),
        "torrent-verify" => {
            let ids = resolve_ids_from_args(session, args);
            for id in ids {
                let _ = session.verify_torrent(id);
            }
            Ok(None)
        }
        "torrent-reannounce" => {
            let ids = resolve_ids_from_args(session, args);
            for id in ids {
                let _ = session.reannounce_torrent(id, now);
            }
            Ok(None)
        }
        "torrent-rename-path" => async_handlers::torrent_rename_path(session, args, now).map(Some),
        _ => Err(format!("unsupported method: {}", request.method)),
    };

    DispatchOutcome::Done(match result {
        Ok(Some(arguments)) => Response::ok(arguments, tag),
        Ok(None) => Response::ok(ValueMap::new(), tag),
        Err(message) => Response::err(message, tag),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::json_decode;

    #[test]
    fn request_parses_method_arguments_and_tag() {
        let v = json_decode(r#"{"method":"torrent-get","arguments":{"fields":["id"]},"tag":7}"#).unwrap();
        let req = Request::from_value(&v).unwrap();
        assert_eq!(req.method, "torrent-get");
        assert_eq!(req.tag, Some(7));
        assert!(req.arguments.get(quark::intern_str("fields")).is_some());
    }

    #[test]
    fn request_without_method_is_rejected() {
        let v = json_decode(r#"{"arguments":{}}"#).unwrap();
        assert!(Request::from_value(&v).is_err());
    }

    #[test]
    fn unknown_method_yields_error_result() {
        let mut session = Session::new(crate::config::Settings::default());
        let req = Request { method: "not-a-real-method".into(), arguments: ValueMap::new(), tag: None };
        let resp = match dispatch(&mut session, req, 0, Instant::now()) {
            DispatchOutcome::Done(resp) => resp,
            DispatchOutcome::Pending { .. } => panic!("expected an immediate result"),
        };
        assert_ne!(resp.result, "success");
    }

    #[test]
    fn underscore_method_name_resolves_same_as_dash() {
        let mut session = Session::new(crate::config::Settings::default());
        let req = Request { method: "session_get".into(), arguments: ValueMap::new(), tag: None };
        let resp = match dispatch(&mut session, req, 0, Instant::now()) {
            DispatchOutcome::Done(resp) => resp,
            DispatchOutcome::Pending { .. } => panic!("expected an immediate result"),
        };
        assert_eq!(resp.result, "success");
    }

    #[test]
    fn blocklist_update_dispatch_returns_pending() {
        let mut session = Session::new(crate::config::Settings::default());
        let req = Request { method: "blocklist-update".into(), arguments: ValueMap::new(), tag: Some(3) };
        match dispatch(&mut session, req, 0, Instant::now()) {
            DispatchOutcome::Pending { tag, .. } => assert_eq!(tag, Some(3)),
            DispatchOutcome::Done(_) => panic!("expected a pending fetch"),
        }
    }
}
