//! Virtual lanes multiplexed over one lower context.
//!
//! A fabric address packs the lane into the top byte and the context
//! address into the low 56 bits, sign-extended on decode.

use crate::lower::{LowerContextId, PeerAddr};

/// Lanes per context.
pub const MAX_VLANES: usize = 256;

const VL_SHIFT: u32 = 56;
const EP_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;
const EP_SIGN_BIT: u64 = 0x0080_0000_0000_0000;
const VL_MASK: u64 = 0xFF00_0000_0000_0000;

/// Packs a context address and lane.
pub fn ep_to_addr(epaddr: u64, vlane: u8) -> u64 {
    ((vlane as u64) << VL_SHIFT) | (epaddr & EP_MASK)
}

/// Lane in the top byte.
pub fn addr_to_vlane(addr: u64) -> u8 {
    ((addr & VL_MASK) >> VL_SHIFT) as u8
}

/// Context address, sign-extended from bit 55.
pub fn addr_to_ep(addr: u64) -> u64 {
    if addr & EP_SIGN_BIT != 0 {
        addr | VL_MASK
    } else {
        addr & EP_MASK
    }
}

/// Fabric address of a peer.
pub fn peer_to_addr(peer: PeerAddr) -> u64 {
    ep_to_addr(peer.context as u64, peer.vlane)
}

/// Peer named by a fabric address.
pub fn addr_to_peer(addr: u64) -> PeerAddr {
    PeerAddr {
        context: addr_to_ep(addr) as LowerContextId,
        vlane: addr_to_vlane(addr),
    }
}

/// Allocation bitmap of the 256 lanes of a context.
#[derive(Debug, Clone, Default)]
pub struct VlaneMap {
    used: [u64; 4],
    next: u8,
}

impl VlaneMap {
    /// All lanes free.
    pub fn new() -> Self {
        Self::default()
    }

    fn is_used(&self, lane: u8) -> bool {
        self.used[(lane / 64) as usize] & (1 << (lane % 64)) != 0
    }

    /// Round-robin allocation starting after the last lane handed out.
    pub fn alloc(&mut self) -> Option<u8> {
        for step in 0..MAX_VLANES {
            let lane = self.next.wrapping_add(step as u8);
            if !self.is_used(lane) {
                self.used[(lane / 64) as usize] |= 1 << (lane % 64);
                self.next = lane.wrapping_add(1);
                return Some(lane);
            }
        }
        None
    }

    /// Claims a specific lane.
    pub fn reserve(&mut self, lane: u8) -> bool {
        if self.is_used(lane) {
            return false;
        }
        self.used[(lane / 64) as usize] |= 1 << (lane % 64);
        true
    }

    /// Returns a lane to the pool.
    pub fn free(&mut self, lane: u8) {
        self.used[(lane / 64) as usize] &= !(1 << (lane % 64));
    }

    /// Lanes allocated.
    pub fn in_use(&self) -> usize {
        self.used.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_encoding() {
        let addr = ep_to_addr(0x1234, 7);
        assert_eq!(addr_to_vlane(addr), 7);
        assert_eq!(addr_to_ep(addr), 0x1234);
    }

    #[test]
    fn test_addr_sign_extension() {
        let epaddr = 0xFFFF_FFFF_FFFF_FFF0u64;
        let addr = ep_to_addr(epaddr, 3);
        assert_eq!(addr_to_vlane(addr), 3);
        assert_eq!(addr_to_ep(addr), epaddr);
    }

    #[test]
    fn test_peer_round_trip() {
        let peer = PeerAddr {
            context: 42,
            vlane: 200,
        };
        assert_eq!(addr_to_peer(peer_to_addr(peer)), peer);
    }

    #[test]
    fn test_vlane_alloc_exhaustion() {
        let mut map = VlaneMap::new();
        for _ in 0..MAX_VLANES {
            assert!(map.alloc().is_some());
        }
        assert!(map.alloc().is_none());
        map.free(17);
        assert_eq!(map.alloc(), Some(17));
    }

    #[test]
    fn test_vlane_round_robin() {
        let mut map = VlaneMap::new();
        assert_eq!(map.alloc(), Some(0));
        assert_eq!(map.alloc(), Some(1));
        map.free(0);
        assert_eq!(map.alloc(), Some(2));
        assert!(map.reserve(0));
        assert!(!map.reserve(0));
        assert_eq!(map.in_use(), 3);
    }
}
