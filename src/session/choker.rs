use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;

use crate::peer::RemotePeer;

/// Which list a peer currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerClass {
    /// Choked; we will not upload to it.
    Choked,
    /// Unchoked and interested, waiting for an active slot.
    WaitList,
    /// One of the reciprocating upload slots.
    Active,
    /// The randomly rotated upload slot.
    Optimistic,
}

#[derive(Debug, Clone, Copy)]
pub struct ChokeConfig {
    pub max_active: usize,
    pub max_optimistic: usize,
}

/// Moves made during one [`ChokeController::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Active-set minimum after all promotions.
    pub baseline: u64,
    pub pruned: Vec<SocketAddr>,
    pub choked: Vec<SocketAddr>,
    pub wait_listed: Vec<SocketAddr>,
    pub activated: Vec<SocketAddr>,
    /// Active peers displaced into the choked list.
    pub displaced: Vec<SocketAddr>,
    pub optimistic: Vec<SocketAddr>,
}

struct Lists<P> {
    choked: Vec<Arc<P>>,
    wait_list: Vec<Arc<P>>,
    active: Vec<Arc<P>>,
    optimistic: Vec<Arc<P>>,
}

impl<P: RemotePeer> Lists<P> {
    fn class_of(&self, addr: SocketAddr) -> Option<PeerClass> {
        let has = |list: &[Arc<P>]| list.iter().any(|p| p.addr() == addr);
        if has(&self.active) {
            Some(PeerClass::Active)
        } else if has(&self.optimistic) {
            Some(PeerClass::Optimistic)
        } else if has(&self.wait_list) {
            Some(PeerClass::WaitList)
        } else if has(&self.choked) {
            Some(PeerClass::Choked)
        } else {
            None
        }
    }

    fn all(&self) -> impl Iterator<Item = &Arc<P>> {
        self.choked
            .iter()
            .chain(&self.wait_list)
            .chain(&self.active)
            .chain(&self.optimistic)
    }
}

/// Periodic tit-for-tat classification of peers.
///
/// This is the only component that moves peers between lists, and it does
/// so under a single lock. The metric is the bytes a peer sent us since the
/// last tick while we are still downloading, and the bytes we sent it once
/// we are seeding.
pub struct ChokeController<P> {
    lists: Mutex<Lists<P>>,
    rng: Mutex<StdRng>,
    config: ChokeConfig,
}

impl<P: RemotePeer> ChokeController<P> {
    pub fn new(config: ChokeConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    pub fn with_rng(config: ChokeConfig, rng: StdRng) -> Self {
        Self {
            lists: Mutex::new(Lists {
                choked: Vec::new(),
                wait_list: Vec::new(),
                active: Vec::new(),
                optimistic: Vec::new(),
            }),
            rng: Mutex::new(rng),
            config,
        }
    }

    /// Places a newly connected peer: active if there is room, else
    /// optimistic if there is room (both unchoked), else choked.
    pub fn admit(&self, peer: Arc<P>) -> PeerClass {
        let mut lists = self.lists.lock();
        if let Some(class) = lists.class_of(peer.addr()) {
            return class;
        }

        if lists.active.len() < self.config.max_active {
            peer.unchoke();
            lists.active.push(peer);
            PeerClass::Active
        } else if lists.optimistic.len() < self.config.max_optimistic {
            peer.unchoke();
            lists.optimistic.push(peer);
            PeerClass::Optimistic
        } else {
            peer.choke();
            lists.choked.push(peer);
            PeerClass::Choked
        }
    }

    /// True if uploads to `addr` are allowed.
    pub fn is_authorized(&self, addr: SocketAddr) -> bool {
        matches!(
            self.lists.lock().class_of(addr),
            Some(PeerClass::Active | PeerClass::Optimistic)
        )
    }

    pub fn class_of(&self, addr: SocketAddr) -> Option<PeerClass> {
        self.lists.lock().class_of(addr)
    }

    /// Sizes of the choked, wait-list, active and optimistic lists.
    pub fn counts(&self) -> [usize; 4] {
        let lists = self.lists.lock();
        [
            lists.choked.len(),
            lists.wait_list.len(),
            lists.active.len(),
            lists.optimistic.len(),
        ]
    }

    /// Runs one classification round. `seeding` flips the metric from
    /// download rate to upload rate.
    pub fn tick(&self, seeding: bool) -> TickReport {
        let metric = |p: &Arc<P>| {
            if seeding {
                p.uploaded_since_reset()
            } else {
                p.downloaded_since_reset()
            }
        };
        let baseline_of =
            |active: &[Arc<P>]| active.iter().map(|p| metric(p)).min().unwrap_or(0);

        let mut report = TickReport::default();
        let mut guard = self.lists.lock();
        let lists = &mut *guard;

        // 1. prune disconnected peers
        for list in [
            &mut lists.choked,
            &mut lists.wait_list,
            &mut lists.active,
            &mut lists.optimistic,
        ] {
            list.retain(|p| {
                if p.is_connected() {
                    true
                } else {
                    p.close();
                    report.pruned.push(p.addr());
                    false
                }
            });
        }

        // 2. baseline
        let mut baseline = baseline_of(&lists.active);

        // 3. wait-list peers below baseline go back to choked
        let (keep, demote): (Vec<_>, Vec<_>) = std::mem::take(&mut lists.wait_list)
            .into_iter()
            .partition(|p| metric(p) >= baseline);
        lists.wait_list = keep;
        for peer in demote {
            peer.choke();
            report.choked.push(peer.addr());
            lists.choked.push(peer);
        }

        // 4. choked peers above baseline join the wait-list
        let (promote, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut lists.choked)
            .into_iter()
            .partition(|p| metric(p) > baseline);
        lists.choked = keep;
        for peer in promote {
            peer.unchoke();
            peer.interested();
            report.wait_listed.push(peer.addr());
            lists.wait_list.push(peer);
        }

        // 5. optimistic peers above baseline join the wait-list
        let (promote, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut lists.optimistic)
            .into_iter()
            .partition(|p| metric(p) > baseline);
        lists.optimistic = keep;
        for peer in promote {
            report.wait_listed.push(peer.addr());
            lists.wait_list.push(peer);
        }

        // 6. best wait-list peers take free active slots, then displace the
        //    worst active peer while they beat the baseline
        lists
            .wait_list
            .sort_by_key(|p| std::cmp::Reverse(metric(p)));
        while !lists.wait_list.is_empty() {
            let candidate = metric(&lists.wait_list[0]);
            if lists.active.len() < self.config.max_active {
                let peer = lists.wait_list.remove(0);
                report.activated.push(peer.addr());
                lists.active.push(peer);
            } else if candidate > baseline {
                let Some((worst, _)) = lists
                    .active
                    .iter()
                    .enumerate()
                    .min_by_key(|&(_, p)| metric(p))
                else {
                    break;
                };
                let displaced = lists.active.swap_remove(worst);
                displaced.choke();
                report.displaced.push(displaced.addr());
                lists.choked.push(displaced);

                let peer = lists.wait_list.remove(0);
                report.activated.push(peer.addr());
                lists.active.push(peer);
            } else {
                break;
            }
            baseline = baseline_of(&lists.active);
        }

        // 7. rotate the optimistic slot
        if !lists.choked.is_empty() {
            let previous = std::mem::take(&mut lists.optimistic);
            let mut pool = std::mem::take(&mut lists.choked);
            let prior_count = pool.len();
            pool.extend(previous.iter().cloned());

            let picks = self.config.max_optimistic.min(pool.len());
            let mut chosen = sample(&mut *self.rng.lock(), pool.len(), picks).into_vec();
            chosen.sort_unstable_by(|a, b| b.cmp(a));

            for index in chosen {
                let peer = pool.swap_remove(index);
                if index < prior_count {
                    peer.unchoke();
                    peer.interested();
                }
                report.optimistic.push(peer.addr());
                lists.optimistic.push(peer);
            }

            for peer in pool {
                if previous.iter().any(|p| p.addr() == peer.addr()) {
                    peer.choke();
                }
                lists.choked.push(peer);
            }
        }

        // 8. reset per-tick counters
        for peer in lists.all() {
            peer.reset_counters();
        }

        report.baseline = baseline;
        report
    }
}
