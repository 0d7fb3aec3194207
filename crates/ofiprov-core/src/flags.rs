//! Operation, completion and access flag words.

use serde::{Deserialize, Serialize};

/// Operation and completion flags, bit-compatible with the host framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OpFlags(u64);

impl OpFlags {
    /// Message operation.
    pub const MSG: Self = Self(1 << 1);
    /// RMA operation.
    pub const RMA: Self = Self(1 << 2);
    /// Tagged message.
    pub const TAGGED: Self = Self(1 << 3);
    /// Atomic operation.
    pub const ATOMIC: Self = Self(1 << 4);
    /// Local read; also a read access bit.
    pub const READ: Self = Self(1 << 8);
    /// Local write; also a write access bit.
    pub const WRITE: Self = Self(1 << 9);
    /// Receive side.
    pub const RECV: Self = Self(1 << 10);
    /// Send side.
    pub const SEND: Self = Self(1 << 11);
    /// Peer may read the region.
    pub const REMOTE_READ: Self = Self(1 << 12);
    /// Peer may write the region.
    pub const REMOTE_WRITE: Self = Self(1 << 13);
    /// Receive buffer consumed by several messages.
    pub const MULTI_RECV: Self = Self(1 << 16);
    /// Completion carries remote CQ data.
    pub const REMOTE_CQ_DATA: Self = Self(1 << 17);
    /// More operations follow.
    pub const MORE: Self = Self(1 << 18);
    /// Deferred until a counter threshold.
    pub const TRIGGER: Self = Self(1 << 20);
    /// Ordered after earlier operations.
    pub const FENCE: Self = Self(1 << 21);
    /// Requests a completion entry.
    pub const COMPLETION: Self = Self(1 << 24);
    /// Buffer is reusable on return.
    pub const INJECT: Self = Self(1 << 25);
    /// Complete once the buffer is reusable.
    pub const INJECT_COMPLETE: Self = Self(1 << 26);
    /// Complete once sent.
    pub const TRANSMIT_COMPLETE: Self = Self(1 << 27);
    /// Complete once delivered to the target.
    pub const DELIVERY_COMPLETE: Self = Self(1 << 28);
    /// Remote accesses generate completions.
    pub const RMA_EVENT: Self = Self(1 << 56);
    /// Only `COMPLETION`-flagged operations generate entries.
    pub const SELECTIVE_COMPLETION: Self = Self(1 << 59);

    /// Bits meaningful in a memory registration access mask.
    pub const ACCESS_MASK: Self = Self(
        Self::READ.0
            | Self::WRITE.0
            | Self::RECV.0
            | Self::SEND.0
            | Self::REMOTE_READ.0
            | Self::REMOTE_WRITE.0,
    );

    /// No bits set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Wraps raw bits.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// True when no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// True when any bit of `other` is set.
    pub const fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// Copy with the bits of `other` cleared.
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for OpFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for OpFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for OpFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Provider-private control bits carried by a transfer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct XferCtrl(u8);

impl XferCtrl {
    /// Bookkeeping transfer issued by the provider itself.
    pub const INTERNAL: Self = Self(1 << 0);
    /// Zero-copy inject transfer.
    pub const INJECT_OP: Self = Self(1 << 1);

    /// No bits set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// True when every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// True when any bit of `other` is set.
    pub const fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }
}

impl std::ops::BitOr for XferCtrl {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Operation class of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpClass {
    /// Message send.
    Send,
    /// Message receive.
    Recv,
    /// RMA write.
    Write,
    /// RMA read.
    Read,
    /// Write landing in a local region.
    RemoteWrite,
    /// Read served from a local region.
    RemoteRead,
    /// Atomic.
    Atomic,
}

impl OpClass {
    /// Base CQ flags for a transfer of this class.
    pub fn cq_flags(self) -> OpFlags {
        match self {
            OpClass::Send => OpFlags::MSG | OpFlags::SEND,
            OpClass::Recv => OpFlags::MSG | OpFlags::RECV,
            OpClass::Write => OpFlags::RMA | OpFlags::WRITE,
            OpClass::Read => OpFlags::RMA | OpFlags::READ,
            OpClass::RemoteWrite => OpFlags::RMA | OpFlags::REMOTE_WRITE,
            OpClass::RemoteRead => OpFlags::RMA | OpFlags::REMOTE_READ,
            OpClass::Atomic => OpFlags::ATOMIC | OpFlags::WRITE,
        }
    }
}

/// Endpoint counter slot an entry is accounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CntrSlot {
    /// Receives.
    Recv = 0,
    /// Sends.
    Send = 1,
    /// RMA writes.
    Write = 2,
    /// RMA reads.
    Read = 3,
    /// Remote writes into local regions.
    RemoteWrite = 4,
    /// Remote reads from local regions.
    RemoteRead = 5,
}

impl CntrSlot {
    /// Number of slots.
    pub const COUNT: usize = 6;

    /// Picks the counter slot from CQ flags, checked in receive, send,
    /// write, read, remote-write, remote-read order.
    pub fn from_flags(flags: OpFlags) -> Option<CntrSlot> {
        if flags.contains(OpFlags::RECV) {
            Some(CntrSlot::Recv)
        } else if flags.contains(OpFlags::SEND) {
            Some(CntrSlot::Send)
        } else if flags.contains(OpFlags::WRITE) {
            Some(CntrSlot::Write)
        } else if flags.contains(OpFlags::READ) {
            Some(CntrSlot::Read)
        } else if flags.contains(OpFlags::REMOTE_WRITE) {
            Some(CntrSlot::RemoteWrite)
        } else if flags.contains(OpFlags::REMOTE_READ) {
            Some(CntrSlot::RemoteRead)
        } else {
            None
        }
    }

    /// Slots selected by endpoint counter binding flags.
    pub fn from_bind_flags(flags: OpFlags) -> Vec<CntrSlot> {
        let table = [
            (OpFlags::RECV, CntrSlot::Recv),
            (OpFlags::SEND, CntrSlot::Send),
            (OpFlags::WRITE, CntrSlot::Write),
            (OpFlags::READ, CntrSlot::Read),
            (OpFlags::REMOTE_WRITE, CntrSlot::RemoteWrite),
            (OpFlags::REMOTE_READ, CntrSlot::RemoteRead),
        ];
        table
            .iter()
            .filter(|(bit, _)| flags.contains(*bit))
            .map(|(_, slot)| *slot)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_flags_contains() {
        let flags = OpFlags::SEND | OpFlags::MSG;
        assert!(flags.contains(OpFlags::SEND));
        assert!(!flags.contains(OpFlags::SEND | OpFlags::TAGGED));
        assert!(flags.intersects(OpFlags::SEND | OpFlags::TAGGED));
        assert_eq!(flags.without(OpFlags::MSG), OpFlags::SEND);
    }

    #[test]
    fn test_op_flags_insert_remove() {
        let mut flags = OpFlags::empty();
        flags.insert(OpFlags::COMPLETION);
        assert!(flags.contains(OpFlags::COMPLETION));
        flags.remove(OpFlags::COMPLETION);
        assert!(flags.is_empty());
    }

    #[test]
    fn test_xfer_ctrl() {
        let ctrl = XferCtrl::INTERNAL | XferCtrl::INJECT_OP;
        assert!(ctrl.contains(XferCtrl::INTERNAL));
        assert!(XferCtrl::INJECT_OP.intersects(ctrl));
        assert!(!XferCtrl::empty().intersects(ctrl));
    }

    #[test]
    fn test_counter_slot_priority() {
        assert_eq!(
            CntrSlot::from_flags(OpFlags::RECV | OpFlags::REMOTE_WRITE),
            Some(CntrSlot::Recv)
        );
        assert_eq!(
            CntrSlot::from_flags(OpFlags::ATOMIC | OpFlags::WRITE),
            Some(CntrSlot::Write)
        );
        assert_eq!(
            CntrSlot::from_flags(OpFlags::REMOTE_READ | OpFlags::RMA),
            Some(CntrSlot::RemoteRead)
        );
        assert_eq!(CntrSlot::from_flags(OpFlags::MSG), None);
    }

    #[test]
    fn test_bind_flags_expand() {
        let slots = CntrSlot::from_bind_flags(OpFlags::SEND | OpFlags::REMOTE_WRITE);
        assert_eq!(slots, vec![CntrSlot::Send, CntrSlot::RemoteWrite]);
    }

    #[test]
    fn test_class_flags() {
        assert!(OpClass::Recv.cq_flags().contains(OpFlags::RECV));
        assert!(OpClass::RemoteWrite.cq_flags().contains(OpFlags::RMA));
    }
}
