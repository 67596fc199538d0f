//! Piece picker and block scheduler.
//!
//! Builds rarest-first selection, strict sequential order, and endgame
//! mode on top of `peer::protocol::BlockRequest`, tracking which peer(s)
//! currently hold each outstanding request so the session can enforce the
//! invariant that a block appears in at most one peer's outstanding set
//! outside endgame.

use crate::bitfield::BitField;
use crate::peer::protocol::{BlockRequest, PeerId};
use std::collections::{HashMap, HashSet};

pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Endgame activates once fewer than this many blocks remain missing.
pub const ENDGAME_THRESHOLD: usize = 20;

/// Upper bound on outstanding requests to a single peer regardless of
/// its advertised `reqq`.
pub const SESSION_REQQ_CAP: u32 = 250;

pub fn block_size(piece_length: u32, piece_index: u32, piece_count: u32, total_size: u64, begin: u32) -> u32 {
    let piece_len = if piece_index + 1 == piece_count {
        let full = piece_length as u64 * (piece_count as u64 - 1);
        (total_size - full) as u32
    } else {
        piece_length
    };
    (piece_len - begin).min(BLOCK_SIZE)
}

pub fn blocks_in_piece(piece_len: u32) -> u32 {
    piece_len.div_ceil(BLOCK_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    RarestFirst,
    Sequential,
}

/// Owns the request bookkeeping for one torrent: which blocks are
/// outstanding, and to which peer(s) (more than one only during endgame).
pub struct Picker {
    piece_length: u32,
    piece_count: u32,
    total_size: u64,
    mode: SelectionMode,
    /// Number of peers in the swarm known to have each piece, used for
    /// rarest-first ordering. Updated whenever a peer's bitfield/have
    /// arrives or the peer disconnects.
    rarity: HashMap<u32, u32>,
    outstanding: HashMap<BlockRequest, HashSet<PeerId>>,
    endgame: bool,
}

impl Picker {
    pub fn new(piece_length: u32, piece_count: u32, total_size: u64, sequential: bool) -> Self {
        Picker {
            piece_length,
            piece_count,
            total_size,
            mode: if sequential {
                SelectionMode::Sequential
            } else {
                SelectionMode::RarestFirst
            },
            rarity: HashMap::new(),
            outstanding: HashMap::new(),
            endgame: false,
        }
    }

    pub fn set_sequential(&mut self, sequential: bool) {
        self.mode = if sequential {
            SelectionMode::Sequential
        } else {
            SelectionMode::RarestFirst
        };
    }

    pub fn note_peer_has(&mut self, piece: u32) {
        *self.rarity.entry(piece).or_insert(0) += 1;
    }

    pub fn note_peer_lost(&mut self, piece: u32) {
        if let Some(c) = self.rarity.get_mut(&piece) {
            *c = c.saturating_sub(1);
        }
    }

    pub fn note_bitfield(&mut self, bf: &BitField) {
        for p in bf.pieces() {
            self.note_peer_has(p as u32);
        }
    }

    fn piece_len(&self, piece: u32) -> u32 {
        if piece + 1 == self.piece_count {
            let full = self.piece_length as u64 * (self.piece_count as u64 - 1);
            (self.total_size - full) as u32
        } else {
            self.piece_length
        }
    }

    /// Total outstanding count across all pieces, used to decide whether
    /// to enter endgame.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Recomputes endgame eligibility: fewer than `ENDGAME_THRESHOLD`
    /// blocks remain missing (outstanding + not-yet-requested).
    pub fn recompute_endgame(&mut self, missing_blocks: usize) {
        self.endgame = missing_blocks < ENDGAME_THRESHOLD;
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Picks the next blocks to request from a peer with bitfield
    /// `peer_has`, given what we already have (`ours`) and how many
    /// requests are already outstanding to this peer. Returns at most
    /// `want` requests.
    pub fn pick_for_peer(
        &mut self,
        peer_id: PeerId,
        peer_has: &BitField,
        ours: &BitField,
        already_outstanding_to_peer: usize,
        want: usize,
    ) -> Vec<BlockRequest> {
        let mut picked = Vec::new();
        let slots = want.saturating_sub(already_outstanding_to_peer);
        if slots == 0 {
            return picked;
        }

        let candidate_pieces = self.candidate_piece_order(peer_has, ours);
        'outer: for piece in candidate_pieces {
            let piece_len = self.piece_len(piece);
            let n_blocks = blocks_in_piece(piece_len);
            for block_idx in 0..n_blocks {
                let begin = block_idx * BLOCK_SIZE;
                let length = block_size(self.piece_length, piece, self.piece_count, self.total_size, begin);
                let req = BlockRequest { piece, begin, length };
                let holders = self.outstanding.entry(req).or_default();
                if !holders.is_empty() && !self.endgame {
                    continue; // one holder per block outside endgame
                }
                if holders.contains(&peer_id) {
                    continue;
                }
                holders.insert(peer_id);
                picked.push(req);
                if picked.len() >= slots {
                    break 'outer;
                }
            }
        }
        picked
    }

    fn candidate_piece_order(&self, peer_has: &BitField, ours: &BitField) -> Vec<u32> {
        let mut candidates: Vec<u32> = (0..self.piece_count)
            .filter(|&p| !ours.has_piece(p as usize) && peer_has.has_piece(p as usize))
            .collect();
        match self.mode {
            SelectionMode::Sequential => candidates.sort_unstable(),
            SelectionMode::RarestFirst => {
                candidates.sort_by_key(|p| *self.rarity.get(p).unwrap_or(&0));
            }
        }
        candidates
    }

    /// A block arrived: stop tracking it as outstanding (for every
    /// holder). During endgame, callers should broadcast `cancel` to the
    /// other holders.
    pub fn on_block_received(&mut self, req: BlockRequest) -> HashSet<PeerId> {
        self.outstanding.remove(&req).unwrap_or_default()
    }

    /// Returns the outstanding requests held by `peer_id` and removes
    /// `peer_id` from every holder set.
    pub fn release_peer(&mut self, peer_id: PeerId) -> Vec<BlockRequest> {
        let mut released = Vec::new();
        self.outstanding.retain(|req, holders| {
            if holders.remove(&peer_id) {
                released.push(*req);
            }
            !holders.is_empty()
        });
        released
    }

    /// Returns a piece's blocks to the request pool after a hash-check
    /// failure.
    pub fn return_piece(&mut self, piece: u32) {
        self.outstanding.retain(|req, _| req.piece != piece);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bf(piece_count: usize, set: &[usize]) -> BitField {
        let mut b = BitField::new(piece_count);
        for &i in set {
            b.set(i);
        }
        b
    }

    #[test]
    fn rarest_first_prefers_pieces_with_fewer_holders() {
        let mut picker = Picker::new(16384, 3, 16384 * 3, false);
        picker.note_peer_has(0);
        picker.note_peer_has(0);
        picker.note_peer_has(1);
        let ours = bf(3, &[]);
        let peer_has = bf(3, &[0, 1, 2]);
        let picked = picker.pick_for_peer(1, &peer_has, &ours, 0, 1);
        // Piece 2 has rarity 0 (rarest), should come first.
        assert_eq!(picked[0].piece, 2);
    }

    #[test]
    fn sequential_mode_picks_lowest_index_first() {
        let mut picker = Picker::new(16384, 3, 16384 * 3, true);
        let ours = bf(3, &[]);
        let peer_has = bf(3, &[0, 1, 2]);
        let picked = picker.pick_for_peer(1, &peer_has, &ours, 0, 1);
        assert_eq!(picked[0].piece, 0);
    }

    #[test]
    fn same_block_not_assigned_twice_outside_endgame() {
        let mut picker = Picker::new(16384, 1, 16384, false);
        let ours = bf(1, &[]);
        let peer_has = bf(1, &[0]);
        let first = picker.pick_for_peer(1, &peer_has, &ours, 0, 10);
        let second = picker.pick_for_peer(2, &peer_has, &ours, 0, 10);
        assert!(!first.is_empty());
        assert!(second.is_empty());
    }

    #[test]
    fn endgame_allows_multiple_holders() {
        let mut picker = Picker::new(16384, 1, 16384, false);
        picker.recompute_endgame(1);
        assert!(picker.is_endgame());
        let ours = bf(1, &[]);
        let peer_has = bf(1, &[0]);
        let first = picker.pick_for_peer(1, &peer_has, &ours, 0, 10);
        let second = picker.pick_for_peer(2, &peer_has, &ours, 0, 10);
        assert!(!first.is_empty());
        assert!(!second.is_empty());
    }

    #[test]
    fn release_peer_returns_its_outstanding_requests() {
        let mut picker = Picker::new(16384, 1, 16384, false);
        let ours = bf(1, &[]);
        let peer_has = bf(1, &[0]);
        let picked = picker.pick_for_peer(1, &peer_has, &ours, 0, 10);
        assert!(!picked.is_empty());
        let released = picker.release_peer(1);
        assert_eq!(released.len(), picked.len());
        assert_eq!(picker.outstanding_count(), 0);
    }
}
