use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::metainfo::SessionInfo;
use crate::peer::Bitfield;

/// A piece handed out for requesting, with the holders to request it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub piece: u32,
    pub length: u32,
    pub holders: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_in_flight: usize,
    pub endgame_threshold: f64,
    pub endgame_interval: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug)]
struct PieceSlot {
    length: u32,
    holders: Vec<SocketAddr>,
}

/// Rarest-first piece selection.
///
/// Every incomplete piece is either queued (`pending`) or `in_flight`.
/// Selection takes the queued piece with the fewest known holders, lowest
/// index first on ties, among pieces at least one ready peer can serve.
#[derive(Debug)]
pub struct Scheduler {
    slots: Vec<PieceSlot>,
    pending: BTreeSet<u32>,
    in_flight: HashMap<u32, Instant>,
    endgame_sent: HashMap<u32, Instant>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(session: &SessionInfo, config: SchedulerConfig) -> Self {
        let slots = (0..session.piece_count() as u32)
            .map(|i| PieceSlot {
                length: session.piece_len(i),
                holders: Vec::new(),
            })
            .collect();

        Self {
            slots,
            pending: BTreeSet::new(),
            in_flight: HashMap::new(),
            endgame_sent: HashMap::new(),
            config,
        }
    }

    /// Queues every piece missing from `have`, forgetting any in-flight state.
    pub fn enqueue_missing(&mut self, have: &Bitfield) {
        self.in_flight.clear();
        self.endgame_sent.clear();
        self.pending = have.missing().map(|i| i as u32).collect();
    }

    pub fn add_holder(&mut self, piece: u32, peer: SocketAddr) {
        if let Some(slot) = self.slots.get_mut(piece as usize) {
            if !slot.holders.contains(&peer) {
                slot.holders.push(peer);
            }
        }
    }

    pub fn add_holders(&mut self, bitfield: &Bitfield, peer: SocketAddr) {
        for piece in bitfield.ones() {
            self.add_holder(piece as u32, peer);
        }
    }

    pub fn remove_peer(&mut self, peer: SocketAddr) {
        for slot in &mut self.slots {
            slot.holders.retain(|&h| h != peer);
        }
    }

    pub fn holders(&self, piece: u32) -> &[SocketAddr] {
        self.slots
            .get(piece as usize)
            .map(|slot| slot.holders.as_slice())
            .unwrap_or(&[])
    }

    /// Picks the rarest selectable piece and marks it in flight.
    ///
    /// Returns `None` when the in-flight cap is reached or no queued piece
    /// has a holder for which `is_ready` is true.
    pub fn next_assignment(
        &mut self,
        now: Instant,
        is_ready: impl Fn(SocketAddr) -> bool,
    ) -> Option<Assignment> {
        if self.in_flight.len() >= self.config.max_in_flight {
            return None;
        }

        let (piece, holders) = self
            .pending
            .iter()
            .filter_map(|&piece| {
                let slot = &self.slots[piece as usize];
                let ready: Vec<SocketAddr> =
                    slot.holders.iter().copied().filter(|&h| is_ready(h)).collect();
                (!ready.is_empty()).then_some((piece, ready))
            })
            .min_by_key(|(piece, _)| (self.slots[*piece as usize].holders.len(), *piece))?;

        self.pending.remove(&piece);
        self.in_flight.insert(piece, now);

        Some(Assignment {
            piece,
            length: self.slots[piece as usize].length,
            holders,
        })
    }

    pub fn on_complete(&mut self, piece: u32) {
        self.pending.remove(&piece);
        self.in_flight.remove(&piece);
        self.endgame_sent.remove(&piece);
    }

    /// Returns a piece to the queue after a failed or abandoned download.
    pub fn requeue(&mut self, piece: u32) {
        if (piece as usize) < self.slots.len() {
            self.in_flight.remove(&piece);
            self.pending.insert(piece);
        }
    }

    /// Requeues in-flight pieces older than the request timeout.
    pub fn expire_stale(&mut self, now: Instant) -> Vec<u32> {
        let timeout = self.config.request_timeout;
        let stale: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|&(_, &since)| now.saturating_duration_since(since) >= timeout)
            .map(|(&piece, _)| piece)
            .collect();

        for &piece in &stale {
            self.requeue(piece);
        }
        stale
    }

    /// Incomplete pieces, queued or in flight.
    pub fn remaining(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, piece: u32) -> bool {
        self.in_flight.contains_key(&piece)
    }

    /// True once fewer than `endgame_threshold` of all pieces remain.
    pub fn is_endgame(&self) -> bool {
        let remaining = self.remaining();
        remaining > 0
            && (remaining as f64) < self.config.endgame_threshold * self.slots.len() as f64
    }

    /// In end-game, every incomplete piece is re-requested from every ready
    /// holder. Each piece is re-issued at most once per `endgame_interval`.
    /// These redundant requests are not counted against the in-flight cap.
    pub fn endgame_targets(
        &mut self,
        now: Instant,
        is_ready: impl Fn(SocketAddr) -> bool,
    ) -> Vec<Assignment> {
        if !self.is_endgame() {
            return Vec::new();
        }

        let interval = self.config.endgame_interval;
        let incomplete: Vec<u32> = self
            .pending
            .iter()
            .copied()
            .chain(self.in_flight.keys().copied())
            .collect();

        let mut targets = Vec::new();
        for piece in incomplete {
            let due = self
                .endgame_sent
                .get(&piece)
                .map_or(true, |&at| now.saturating_duration_since(at) >= interval);
            if !due {
                continue;
            }

            let slot = &self.slots[piece as usize];
            let holders: Vec<SocketAddr> =
                slot.holders.iter().copied().filter(|&h| is_ready(h)).collect();
            if holders.is_empty() {
                continue;
            }

            self.endgame_sent.insert(piece, now);
            targets.push(Assignment {
                piece,
                length: slot.length,
                holders,
            });
        }
        targets.sort_by_key(|a| a.piece);
        targets
    }
}
