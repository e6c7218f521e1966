use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::peer::{Direction, PeerLink};

/// Live links keyed by remote address. A peer's identity is its address.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    links: DashMap<SocketAddr, Arc<PeerLink>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `link` unless a live link to the same address exists.
    /// A dead entry for the address is replaced.
    pub fn insert(&self, link: Arc<PeerLink>) -> bool {
        match self.links.entry(link.addr()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return false;
                }
                entry.insert(link);
            }
            Entry::Vacant(entry) => {
                entry.insert(link);
            }
        }
        true
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<PeerLink>> {
        self.links.get(addr).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.links.contains_key(addr)
    }

    /// Removes the entry for `addr` if it is still `link`.
    pub fn remove(&self, link: &Arc<PeerLink>) -> bool {
        self.links
            .remove_if(&link.addr(), |_, current| Arc::ptr_eq(current, link))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.links.iter().filter(|e| e.value().is_connected()).count()
    }

    /// A snapshot of every registered link.
    pub fn links(&self) -> Vec<Arc<PeerLink>> {
        self.links.iter().map(|e| e.value().clone()).collect()
    }

    pub fn connected(&self) -> Vec<Arc<PeerLink>> {
        self.links
            .iter()
            .filter(|e| e.value().is_connected())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Outbound links whose address is not in `keep`.
    pub fn outbound_not_in(&self, keep: &[SocketAddr]) -> Vec<Arc<PeerLink>> {
        self.links
            .iter()
            .filter(|e| e.value().direction() == Direction::Outbound && !keep.contains(e.key()))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn close_all(&self) {
        for link in self.links() {
            link.close();
        }
        self.links.clear();
    }
}
