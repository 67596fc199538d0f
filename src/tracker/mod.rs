//! Announce/scrape subsystem: per-tracker scheduling, tier/backup policy,
//! and the HTTP/UDP protocol dispatch.

pub mod http;
pub mod udp;

use std::net::SocketAddr;
use std::time::Duration;

pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(45);
pub const SCRAPE_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_SCRAPE_BATCH: usize = 60;
pub const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::None => "",
            AnnounceEvent::Started => "started",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    InFlight,
    /// This cycle's first success within the tier; peers in the same
    /// tier become `Backup` until the next cycle.
    Succeeded,
    Backup,
    TimedOut,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct TrackerEntry {
    pub id: u32,
    pub announce_url: String,
    pub scrape_url: Option<String>,
    pub tier: u32,
    pub state: TrackerState,
    pub next_announce: i64,
    pub min_interval: u64,
    pub interval: u64,
    pub seeders: Option<u64>,
    pub leechers: Option<u64>,
    pub tracker_id: Option<String>,
    backoff: Duration,
}

impl TrackerEntry {
    fn new(id: u32, tier: u32, announce_url: String) -> TrackerEntry {
        let scrape_url = derive_scrape_url(&announce_url);
        TrackerEntry {
            id,
            announce_url,
            scrape_url,
            tier,
            state: TrackerState::Idle,
            next_announce: 0,
            min_interval: 0,
            interval: 1800,
            seeders: None,
            leechers: None,
            tracker_id: None,
            backoff: Duration::from_secs(0),
        }
    }

    pub fn is_backup(&self) -> bool {
        matches!(self.state, TrackerState::Backup)
    }

    pub fn is_udp(&self) -> bool {
        self.announce_url.starts_with("udp://")
    }

    /// Builds the announce-list for a torrent: one tier per outer list
    /// entry, falling back to a single-tracker single tier if there is no
    /// `announce-list` (legacy single-`announce` torrents).
    pub fn from_announce_lists(announce: &Option<String>, announce_list: &[Vec<String>]) -> Vec<TrackerEntry> {
        let mut entries = Vec::new();
        let mut id = 0;
        if announce_list.is_empty() {
            if let Some(url) = announce {
                entries.push(TrackerEntry::new(id, 0, url.clone()));
            }
            return entries;
        }
        for (tier, urls) in announce_list.iter().enumerate() {
            for url in urls {
                entries.push(TrackerEntry::new(id, tier as u32, url.clone()));
                id += 1;
            }
        }
        entries
    }

    pub fn on_success(&mut self, interval: u64, min_interval: Option<u64>, now: i64) {
        self.state = TrackerState::Succeeded;
        self.interval = interval;
        if let Some(mi) = min_interval {
            self.min_interval = mi;
        }
        self.backoff = Duration::from_secs(0);
        self.next_announce = now + interval as i64;
    }

    pub fn on_timeout(&mut self, now: i64) {
        self.state = TrackerState::TimedOut;
        self.advance_backoff(now);
    }

    pub fn on_error(&mut self, message: String, now: i64) {
        self.state = TrackerState::Error(message);
        self.advance_backoff(now);
    }

    fn advance_backoff(&mut self, now: i64) {
        self.backoff = (self.backoff * 2).max(Duration::from_secs(30)).min(MAX_BACKOFF);
        self.next_announce = now + self.backoff.as_secs() as i64;
    }

    pub fn mark_backup(&mut self) {
        self.state = TrackerState::Backup;
    }
}

fn derive_scrape_url(announce_url: &str) -> Option<String> {
    // BEP 48: scrape URL is the announce URL with the final path segment
    // `announce` replaced by `scrape`, only when that segment exists.
    let idx = announce_url.rfind('/')?;
    let (head, tail) = announce_url.split_at(idx + 1);
    if tail == "announce" || tail.starts_with("announce?") {
        Some(format!("{head}scrape{}", &tail["announce".len()..]))
    } else {
        None
    }
}

/// Compares two outcomes of retrying the same request: did-connect >
/// non-timeout > has-error-message, so a real tracker error beats a bare
/// connection failure when surfacing the "best" outcome to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OutcomeRank {
    did_connect: bool,
    non_timeout: bool,
    has_error_message: bool,
}

impl OutcomeRank {
    pub fn new(did_connect: bool, non_timeout: bool, has_error_message: bool) -> Self {
        OutcomeRank {
            did_connect,
            non_timeout,
            has_error_message,
        }
    }

    pub fn better_than(&self, other: &OutcomeRank) -> bool {
        (self.did_connect, self.non_timeout, self.has_error_message)
            > (other.did_connect, other.non_timeout, other.has_error_message)
    }
}

/// Groups tracker entries into ordered tiers, tier order ascending, member
/// order shuffled fresh on every call so a cycle's attempts within a tier
/// don't always favor the same tracker.
pub fn tiers(entries: &[TrackerEntry]) -> Vec<Vec<u32>> {
    use rand::seq::SliceRandom;
    let mut tiers: Vec<(u32, Vec<u32>)> = Vec::new();
    for e in entries {
        if let Some((_, ids)) = tiers.iter_mut().find(|(t, _)| *t == e.tier) {
            ids.push(e.id);
        } else {
            tiers.push((e.tier, vec![e.id]));
        }
    }
    tiers.sort_by_key(|(t, _)| *t);
    let mut rng = rand::thread_rng();
    tiers
        .into_iter()
        .map(|(_, mut ids)| {
            ids.shuffle(&mut rng);
            ids
        })
        .collect()
}

/// After a tracker in a tier succeeds, every other tracker in that tier
/// becomes a backup until the next cycle.
pub fn apply_backup_policy(entries: &mut [TrackerEntry], succeeded_id: u32) {
    let tier = entries.iter().find(|e| e.id == succeeded_id).map(|e| e.tier);
    let Some(tier) = tier else { return };
    for e in entries.iter_mut() {
        if e.tier == tier && e.id != succeeded_id {
            e.mark_backup();
        }
    }
}

pub fn resolve_announce_addr(url_str: &str) -> anyhow::Result<SocketAddr> {
    let url = url::Url::parse(url_str)?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("tracker url has no host"))?;
    let port = url.port_or_known_default().unwrap_or(80);
    use std::net::ToSocketAddrs;
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("could not resolve tracker host"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_groups_by_tier_number_in_ascending_order() {
        let entries = vec![
            TrackerEntry::new(0, 1, "http://b/announce".into()),
            TrackerEntry::new(1, 0, "http://a/announce".into()),
            TrackerEntry::new(2, 1, "http://c/announce".into()),
        ];
        let t = tiers(&entries);
        assert_eq!(t.len(), 2);
        assert_eq!(t[0], vec![1]);
        let mut second = t[1].clone();
        second.sort_unstable();
        assert_eq!(second, vec![0, 2]);
    }

    #[test]
    fn tiers_shuffles_member_order_across_calls() {
        let entries: Vec<TrackerEntry> = (0..20).map(|i| TrackerEntry::new(i, 0, format!("http://{i}/announce"))).collect();
        let orders: std::collections::HashSet<Vec<u32>> = (0..20).map(|_| tiers(&entries)[0].clone()).collect();
        assert!(orders.len() > 1, "expected at least one differing shuffle across 20 calls");
    }

    #[test]
    fn backup_policy_marks_siblings_only() {
        let mut entries = vec![
            TrackerEntry::new(0, 0, "http://a/announce".into()),
            TrackerEntry::new(1, 0, "http://b/announce".into()),
            TrackerEntry::new(2, 1, "http://c/announce".into()),
        ];
        entries[0].state = TrackerState::Succeeded;
        apply_backup_policy(&mut entries, 0);
        assert!(entries[1].is_backup());
        assert!(!entries[2].is_backup());
    }

    #[test]
    fn outcome_rank_prefers_error_message_over_timeout() {
        let with_error = OutcomeRank::new(true, true, true);
        let timed_out = OutcomeRank::new(true, false, false);
        assert!(with_error.better_than(&timed_out));
    }

    #[test]
    fn outcome_rank_prefers_timeout_over_connection_failure() {
        let timed_out = OutcomeRank::new(true, false, false);
        let refused = OutcomeRank::new(false, false, false);
        assert!(timed_out.better_than(&refused));
    }

    #[test]
    fn scrape_url_is_derived_from_announce_path() {
        let e = TrackerEntry::new(0, 0, "http://tracker.example/announce?x=1".into());
        assert_eq!(e.scrape_url.as_deref(), Some("http://tracker.example/scrape?x=1"));
    }
}
