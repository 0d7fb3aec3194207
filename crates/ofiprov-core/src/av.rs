//! Address vectors: fabric address to lower peer lookup.

use parking_lot::RwLock;

use crate::lower::PeerAddr;
use crate::vlane;

/// Fabric address as used by the application.
pub type FiAddr = u64;

/// Wildcard source address.
pub const FI_ADDR_UNSPEC: FiAddr = u64::MAX;

/// Black-box translation consumed by endpoints.
pub trait AddressVector: Send + Sync {
    /// Resolves a fabric address; `None` when unknown.
    fn lookup(&self, addr: FiAddr) -> Option<PeerAddr>;

    /// Fabric address of a known peer.
    fn reverse(&self, peer: PeerAddr) -> Option<FiAddr>;
}

/// Index-based table of peers.
#[derive(Debug, Default)]
pub struct TableAv {
    peers: RwLock<Vec<Option<PeerAddr>>>,
}

impl TableAv {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `peer` and returns its index as the address.
    pub fn insert(&self, peer: PeerAddr) -> FiAddr {
        let mut peers = self.peers.write();
        peers.push(Some(peer));
        (peers.len() - 1) as FiAddr
    }

    /// Clears an entry; false when it was already empty.
    pub fn remove(&self, addr: FiAddr) -> bool {
        let mut peers = self.peers.write();
        match peers.get_mut(addr as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

impl AddressVector for TableAv {
    fn lookup(&self, addr: FiAddr) -> Option<PeerAddr> {
        self.peers.read().get(addr as usize).copied().flatten()
    }

    fn reverse(&self, peer: PeerAddr) -> Option<FiAddr> {
        self.peers
            .read()
            .iter()
            .position(|p| *p == Some(peer))
            .map(|i| i as FiAddr)
    }
}

/// Map-style vector: the fabric address encodes context and lane directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct MapAv;

impl MapAv {
    /// Encodes `peer` without storing anything.
    pub fn insert(&self, peer: PeerAddr) -> FiAddr {
        vlane::peer_to_addr(peer)
    }
}

impl AddressVector for MapAv {
    fn lookup(&self, addr: FiAddr) -> Option<PeerAddr> {
        if addr == FI_ADDR_UNSPEC {
            return None;
        }
        Some(vlane::addr_to_peer(addr))
    }

    fn reverse(&self, peer: PeerAddr) -> Option<FiAddr> {
        Some(vlane::peer_to_addr(peer))
    }
}
