//! Pooled transfer entries.
//!
//! Every issued operation owns one [`XferEntry`] until its completion has
//! been reported. Entries live in fixed slots of an [`XferPool`] and are
//! named by an [`XferId`] that travels through the lower transport as the
//! work request id.

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::flags::{OpClass, OpFlags, XferCtrl};
use crate::mr::MrKey;

/// Normalized wire operation recovered from a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireOp {
    /// Untagged message.
    #[default]
    Msg,
    /// Tagged message.
    Tagged,
    /// RMA write.
    Write,
    /// RMA read.
    Read,
    /// Atomic.
    Atomic,
}

/// Transport-neutral header recovered from a raw completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XferHeader {
    /// Recovered operation.
    pub op: WireOp,
    /// `REMOTE_CQ_DATA` and `TAGGED` bits.
    pub flags: u16,
    /// Total wire size, header included.
    pub size: u64,
    /// Header bytes preceding the payload.
    pub hdr_size: u64,
    /// Remote CQ data.
    pub cq_data: u64,
    /// Matched tag.
    pub tag: u64,
}

impl XferHeader {
    /// Header carries remote CQ data.
    pub const REMOTE_CQ_DATA: u16 = 1 << 0;
    /// Header carries a tag.
    pub const TAGGED: u16 = 1 << 7;

    /// True when `flag` is set.
    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    /// Wire size minus header.
    pub fn payload_len(&self) -> u64 {
        self.size.saturating_sub(self.hdr_size)
    }
}

/// Which CQ of an endpoint an entry was allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Transmit queue.
    Tx,
    /// Receive queue.
    Rx,
}

/// One in-flight or completed operation.
#[derive(Debug, Clone)]
pub struct XferEntry {
    /// Operation class.
    pub class: OpClass,
    /// Flags reported in the completion.
    pub cq_flags: OpFlags,
    /// Provider-private control bits.
    pub ctrl: XferCtrl,
    /// Application context echoed in the completion.
    pub context: u64,
    /// Recovered wire header.
    pub hdr: XferHeader,
    /// Bytes the application posted.
    pub posted_len: usize,
    /// Lane of the owning endpoint.
    pub lane: u8,
    /// Region a target-side entry landed in.
    pub mr_key: Option<MrKey>,
}

impl XferEntry {
    /// Entry with empty header and control bits.
    pub fn new(class: OpClass, cq_flags: OpFlags, context: u64) -> Self {
        Self {
            class,
            cq_flags,
            ctrl: XferCtrl::empty(),
            context,
            hdr: XferHeader::default(),
            posted_len: 0,
            lane: 0,
            mr_key: None,
        }
    }

    /// True for provider bookkeeping transfers.
    pub fn is_internal(&self) -> bool {
        self.ctrl.contains(XferCtrl::INTERNAL)
    }
}

/// Handle of a pooled entry: slot, generation and direction packed into
/// the work request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XferId {
    slot: u32,
    generation: u32,
    direction: Direction,
}

impl XferId {
    const RX_BIT: u64 = 1 << 63;
    const GEN_MASK: u64 = 0x7FFF_FFFF;

    /// Work request id that never names a pooled entry.
    pub const UNTRACKED: u64 = u64::MAX;

    /// Pool slot.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Queue the entry belongs to.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Packs the id into a work request id.
    pub fn to_wr_id(&self) -> u64 {
        let dir = match self.direction {
            Direction::Tx => 0,
            Direction::Rx => Self::RX_BIT,
        };
        dir | ((self.generation as u64 & Self::GEN_MASK) << 32) | self.slot as u64
    }

    /// Inverse of [`XferId::to_wr_id`]; `None` for untracked ids.
    pub fn from_wr_id(wr_id: u64) -> Option<Self> {
        if wr_id == Self::UNTRACKED {
            return None;
        }
        let direction = if wr_id & Self::RX_BIT != 0 {
            Direction::Rx
        } else {
            Direction::Tx
        };
        Some(Self {
            slot: wr_id as u32,
            generation: ((wr_id >> 32) & Self::GEN_MASK) as u32,
            direction,
        })
    }
}

struct Slot {
    generation: u32,
    entry: Option<XferEntry>,
}

struct PoolInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    in_use: usize,
    destroyed: bool,
}

/// Free-list pool of transfer entries.
///
/// Grows `chunk` slots at a time. With a hard cap (bounded resource
/// management) allocation fails with `Again` once `cap` entries are live.
pub struct XferPool {
    inner: Mutex<PoolInner>,
    chunk: usize,
    cap: Option<usize>,
}

impl XferPool {
    /// Pool with one chunk preallocated.
    pub fn new(chunk: usize, cap: Option<usize>) -> Self {
        let chunk = chunk.max(1);
        let pool = Self {
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                free: Vec::new(),
                in_use: 0,
                destroyed: false,
            }),
            chunk,
            cap,
        };
        {
            let mut inner = pool.inner.lock();
            pool.grow(&mut inner);
        }
        pool
    }

    fn grow(&self, inner: &mut PoolInner) -> bool {
        let current = inner.slots.len();
        let target = match self.cap {
            Some(cap) => (current + self.chunk).min(cap),
            None => current + self.chunk,
        };
        if target <= current {
            return false;
        }
        inner.slots.reserve(target - current);
        for index in current..target {
            inner.slots.push(Slot {
                generation: 0,
                entry: None,
            });
            inner.free.push(index as u32);
        }
        // lowest slots are handed out first
        inner.free.sort_unstable_by(|a, b| b.cmp(a));
        debug!(slots = target, "xfer pool grown");
        true
    }

    /// Stores `entry`, growing the pool if needed. `Again` once capped.
    pub fn alloc(&self, entry: XferEntry, direction: Direction) -> ProviderResult<XferId> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(ProviderError::bad_state("transfer pool destroyed"));
        }
        if inner.free.is_empty() && !self.grow(&mut inner) {
            return Err(ProviderError::Again);
        }
        let slot_index = match inner.free.pop() {
            Some(index) => index,
            None => return Err(ProviderError::Again),
        };
        inner.in_use += 1;
        let slot = &mut inner.slots[slot_index as usize];
        slot.entry = Some(entry);
        Ok(XferId {
            slot: slot_index,
            generation: (slot.generation as u64 & XferId::GEN_MASK) as u32,
            direction,
        })
    }

    /// Removes the entry named by `id`, returning its slot to the free list.
    /// Stale or unknown ids yield `None`.
    pub fn take(&self, id: XferId) -> Option<XferEntry> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(id.slot as usize)?;
        if (slot.generation as u64 & XferId::GEN_MASK) != id.generation as u64 {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(id.slot);
        inner.in_use -= 1;
        Some(entry)
    }

    /// Entries currently allocated.
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    /// Slots allocated so far.
    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Hard cap, if any.
    pub fn cap(&self) -> Option<usize> {
        self.cap
    }

    /// Drops every slot. Returns how many entries were still outstanding.
    pub fn destroy(&self) -> usize {
        let mut inner = self.inner.lock();
        let outstanding = inner.in_use;
        if outstanding > 0 {
            warn!(outstanding, "destroying xfer pool with live entries");
        }
        inner.slots.clear();
        inner.free.clear();
        inner.in_use = 0;
        inner.destroyed = true;
        outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(context: u64) -> XferEntry {
        XferEntry::new(OpClass::Send, OpClass::Send.cq_flags(), context)
    }

    #[test]
    fn test_alloc_take() {
        let pool = XferPool::new(4, None);
        let id = pool.alloc(entry(9), Direction::Tx).unwrap();
        assert_eq!(pool.in_use(), 1);
        let taken = pool.take(id).unwrap();
        assert_eq!(taken.context, 9);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.take(id).is_none());
    }

    #[test]
    fn test_grows_in_chunks() {
        let pool = XferPool::new(2, None);
        assert_eq!(pool.capacity(), 2);
        for i in 0..3 {
            pool.alloc(entry(i), Direction::Tx).unwrap();
        }
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn test_cap_returns_again() {
        let pool = XferPool::new(16, Some(3));
        for i in 0..3 {
            pool.alloc(entry(i), Direction::Rx).unwrap();
        }
        assert_eq!(
            pool.alloc(entry(4), Direction::Rx).unwrap_err(),
            ProviderError::Again
        );
    }

    #[test]
    fn test_stale_id_after_reuse() {
        let pool = XferPool::new(1, Some(1));
        let first = pool.alloc(entry(1), Direction::Tx).unwrap();
        pool.take(first).unwrap();
        let second = pool.alloc(entry(2), Direction::Tx).unwrap();
        assert_eq!(first.slot(), second.slot());
        assert!(pool.take(first).is_none());
        assert_eq!(pool.take(second).unwrap().context, 2);
    }

    #[test]
    fn test_wr_id_round_trip_keeps_direction() {
        let pool = XferPool::new(4, None);
        let id = pool.alloc(entry(1), Direction::Rx).unwrap();
        let back = XferId::from_wr_id(id.to_wr_id()).unwrap();
        assert_eq!(back, id);
        assert_eq!(back.direction(), Direction::Rx);
        assert!(XferId::from_wr_id(XferId::UNTRACKED).is_none());
    }

    #[test]
    fn test_destroy_rejects_alloc() {
        let pool = XferPool::new(4, None);
        pool.alloc(entry(1), Direction::Tx).unwrap();
        assert_eq!(pool.destroy(), 1);
        assert!(pool.alloc(entry(2), Direction::Tx).is_err());
    }

    #[test]
    fn test_header_payload_len() {
        let hdr = XferHeader {
            size: 40,
            hdr_size: 24,
            ..Default::default()
        };
        assert_eq!(hdr.payload_len(), 16);
    }
}
