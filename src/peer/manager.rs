//! Peer manager: owns the live peer set for one torrent, runs the
//! choke/unchoke rotation, and asks the picker for block requests, over
//! arena-style dense peer ids.

use crate::bitfield::BitField;
use crate::peer::protocol::{BlockRequest, Effect, PeerId, PeerSession};
use crate::picker::Picker;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Regular unchoke slots are recomputed on this interval.
pub const REGULAR_UNCHOKE_INTERVAL: Duration = Duration::from_secs(10);
pub const OPTIMISTIC_UNCHOKE_INTERVAL: Duration = Duration::from_secs(30);

/// Number of peers unchoked in the regular rotation (Transmission's
/// default slot count).
pub const REGULAR_UNCHOKE_SLOTS: usize = 4;

pub struct PeerManager {
    peers: HashMap<PeerId, PeerSession>,
    next_id: PeerId,
    pub picker: Picker,
    last_regular_unchoke: Option<Instant>,
    last_optimistic_unchoke: Option<Instant>,
    optimistic_peer: Option<PeerId>,
    peer_limit: usize,
}

pub enum ManagerEvent {
    PeerClosed { id: PeerId, returned: Vec<BlockRequest> },
    PieceComplete { piece: u32, data_by_offset: Vec<(u32, Vec<u8>)> },
    RequestsToIssue(Vec<(PeerId, BlockRequest)>),
}

impl PeerManager {
    pub fn new(picker: Picker, peer_limit: usize) -> Self {
        PeerManager {
            peers: HashMap::new(),
            next_id: 0,
            picker,
            last_regular_unchoke: None,
            last_optimistic_unchoke: None,
            optimistic_peer: None,
            peer_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn at_limit(&self) -> bool {
        self.peers.len() >= self.peer_limit
    }

    pub fn insert(&mut self, build: impl FnOnce(PeerId) -> PeerSession) -> PeerId {
        let id = self.next_id;
        self.next_id += 1;
        let session = build(id);
        self.peers.insert(id, session);
        id
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerSession> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut PeerSession> {
        self.peers.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Removes a peer, closing its session and returning its outstanding
    /// requests so the caller can feed them back via `picker.release_peer`
    /// and reissue to other candidates.
    pub fn remove(&mut self, id: PeerId) -> Vec<BlockRequest> {
        if let Some(mut session) = self.peers.remove(&id) {
            let from_close = session.close();
            let mut released = self.picker.release_peer(id);
            released.extend(from_close);
            released
        } else {
            Vec::new()
        }
    }

    /// Applies the effects of one batch of incoming wire messages for
    /// `id` to the peer-level bitfield rarity tracking the picker needs.
    pub fn record_bitfield_effects(&mut self, effects: &[Effect]) {
        for effect in effects {
            if let Effect::HaveCompleted(piece) = effect {
                self.picker.note_peer_has(*piece);
            }
        }
    }

    pub fn note_bitfield_for(&mut self, bf: &BitField) {
        self.picker.note_bitfield(bf);
    }

    /// Choke/unchoke policy: regular slots recomputed every 10s (highest
    /// download rate from the peer while leeching, or best reciprocal
    /// upload while seeding), one optimistic slot rotated every 30s.
    /// Returns the set of peer ids that should be unchoked this tick, or
    /// `None` if neither timer has elapsed.
    pub fn recompute_unchoke(&mut self, now: Instant, is_seeding: bool) -> Option<Vec<PeerId>> {
        let due_regular = self
            .last_regular_unchoke
            .map_or(true, |t| now.duration_since(t) >= REGULAR_UNCHOKE_INTERVAL);
        let due_optimistic = self
            .last_optimistic_unchoke
            .map_or(true, |t| now.duration_since(t) >= OPTIMISTIC_UNCHOKE_INTERVAL);

        if !due_regular && !due_optimistic {
            return None;
        }

        if due_optimistic {
            self.last_optimistic_unchoke = Some(now);
            self.optimistic_peer = self.pick_optimistic_candidate();
        }

        if due_regular {
            self.last_regular_unchoke = Some(now);
        }

        let mut interested: Vec<(PeerId, u64)> = self
            .peers
            .iter()
            .filter(|(_, p)| p.info.peer_interested)
            .map(|(id, p)| {
                let rate = if is_seeding { p.info.uploaded } else { p.info.downloaded };
                (*id, rate)
            })
            .collect();
        interested.sort_by(|a, b| b.1.cmp(&a.1));

        let mut unchoked: Vec<PeerId> = interested
            .into_iter()
            .take(REGULAR_UNCHOKE_SLOTS)
            .map(|(id, _)| id)
            .collect();

        if let Some(opt) = self.optimistic_peer {
            if self.peers.contains_key(&opt) && !unchoked.contains(&opt) {
                unchoked.push(opt);
            }
        }

        for (id, session) in self.peers.iter_mut() {
            session.info.client_choked = !unchoked.contains(id);
        }

        Some(unchoked)
    }

    fn pick_optimistic_candidate(&self) -> Option<PeerId> {
        self.peers
            .iter()
            .filter(|(_, p)| p.info.peer_interested && p.info.client_choked)
            .map(|(id, _)| *id)
            .next()
            .or_else(|| self.peers.keys().next().copied())
    }

    /// Requests blocks on behalf of every unchoked, interesting peer up to
    /// `reqq`, capped by `picker::SESSION_REQQ_CAP`.
    pub fn schedule_requests(&mut self, ours: &BitField) -> Vec<(PeerId, BlockRequest)> {
        let mut out = Vec::new();
        let ids = self.ids();
        for id in ids {
            let (peer_has, reqq, outstanding, choked_by_peer) = {
                let Some(session) = self.peers.get(&id) else { continue };
                (
                    session.info.bitfield.clone(),
                    session.info.reqq.min(crate::picker::SESSION_REQQ_CAP),
                    session.info.outstanding_to_peer.len(),
                    session.info.peer_choked,
                )
            };
            if choked_by_peer {
                continue;
            }
            let Some(peer_has) = peer_has else { continue };
            let picked = self
                .picker
                .pick_for_peer(id, &peer_has, ours, outstanding, reqq as usize);
            if let Some(session) = self.peers.get_mut(&id) {
                for req in &picked {
                    session.info.outstanding_to_peer.insert(*req);
                    session.queue_message(&crate::peer::message::Message::Request(
                        req.piece, req.begin, req.length,
                    ));
                }
            }
            out.extend(picked.into_iter().map(|r| (id, r)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_limit_reflects_peer_count() {
        let picker = Picker::new(16384, 1, 16384, false);
        let manager = PeerManager::new(picker, 0);
        assert!(manager.at_limit());
    }
}
