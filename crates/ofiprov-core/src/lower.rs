//! Interface to the lower transport.
//!
//! The lower transport executes sends, receives, RMA and atomics on a
//! hardware (or simulated) context, owns raw registrations, and hands back
//! raw completions through a non-blocking poll. Target-side RMA requests
//! surface as [`RemoteAccess`] notifications that the provider verifies and
//! answers with [`PostedOp::Respond`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flags::OpFlags;

/// Identifier of a lower (hardware) context.
pub type LowerContextId = u32;

/// One contiguous buffer segment in lower-transport address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Iov {
    /// Start address.
    pub addr: u64,
    /// Length in bytes.
    pub len: usize,
}

impl Iov {
    /// Segment of `len` bytes at `addr`.
    pub fn new(addr: u64, len: usize) -> Self {
        Self { addr, len }
    }

    /// One past the last byte, or `None` if that overflows.
    pub fn end(&self) -> Option<u64> {
        self.addr.checked_add(self.len as u64)
    }
}

/// Total byte length of a segment list.
pub fn iov_len(iov: &[Iov]) -> usize {
    iov.iter().map(|seg| seg.len).sum()
}

/// Resolved peer: lower context plus virtual lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    /// Lower context of the peer.
    pub context: LowerContextId,
    /// Virtual lane within that context.
    pub vlane: u8,
}

/// Raw registration handed out by the lower transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LowerRegion {
    /// Handle used to deregister.
    pub handle: u64,
    /// Key the transport assigned.
    pub key: u64,
}

/// Error reported by the lower transport: host errno plus a
/// transport-specific diagnostic code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("errno {errno} (provider errno {prov_errno})")]
pub struct LowerError {
    /// Positive host errno.
    pub errno: i32,
    /// Transport diagnostic code.
    pub prov_errno: i32,
}

impl LowerError {
    /// Builds an error from its two codes.
    pub fn new(errno: i32, prov_errno: i32) -> Self {
        Self { errno, prov_errno }
    }
}

/// Remote memory target of an RMA or atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaTarget {
    /// Address or offset inside the remote region.
    pub addr: u64,
    /// Key of the remote region.
    pub key: u64,
}

/// 64-bit atomic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicOp {
    /// Adds the operand.
    Sum,
    /// Stores the operand.
    Write,
    /// Stores the operand if the target equals the compare value.
    CompareSwap,
}

/// Token correlating a remote access with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteToken(pub u64);

/// Operation handed to the lower transport.
#[derive(Debug, Clone)]
pub enum PostedOp {
    /// Message or tagged send.
    Send {
        /// Receiving peer.
        dest: PeerAddr,
        /// Payload.
        iov: Vec<Iov>,
        /// Tag for tagged sends.
        tag: Option<u64>,
        /// Remote CQ data.
        data: Option<u64>,
    },
    /// Posted receive buffer.
    Recv {
        /// Buffer to fill.
        iov: Vec<Iov>,
        /// Only accept messages from this peer.
        src: Option<PeerAddr>,
        /// Tag and ignore mask for tagged receives.
        tag: Option<(u64, u64)>,
    },
    /// RMA write.
    Write {
        /// Target peer.
        dest: PeerAddr,
        /// Local source.
        iov: Vec<Iov>,
        /// Remote destination.
        target: RmaTarget,
        /// Remote CQ data.
        data: Option<u64>,
    },
    /// RMA read.
    Read {
        /// Peer owning the region.
        src: PeerAddr,
        /// Local destination.
        iov: Vec<Iov>,
        /// Remote source.
        target: RmaTarget,
    },
    /// 64-bit atomic on remote memory.
    Atomic {
        /// Target peer.
        dest: PeerAddr,
        /// Operation applied at the target.
        op: AtomicOp,
        /// Local operand.
        operand: Iov,
        /// Compare value for compare-and-swap.
        compare: Option<Iov>,
        /// Receives the previous target value for fetching forms.
        result: Option<Iov>,
        /// Remote word.
        target: RmaTarget,
    },
    /// Answer to a [`RemoteAccess`]: the translated target segments, or
    /// the error the initiator should see.
    Respond {
        /// Access being answered.
        token: RemoteToken,
        /// Target segments, or the initiator's error.
        status: Result<Vec<Iov>, LowerError>,
    },
}

/// A posted operation with its completion identifier and source lane.
#[derive(Debug, Clone)]
pub struct PostedWork {
    /// Echoed back in the local completion.
    pub wr_id: u64,
    /// Lane of the posting endpoint.
    pub lane: u8,
    /// The operation.
    pub op: PostedOp,
}

/// Kind of an incoming remote access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    /// Peer writes into the region.
    Write,
    /// Peer reads from the region.
    Read,
    /// Peer runs an atomic; `fetch` when it also reads the old value.
    Atomic {
        /// Previous value returned to the initiator.
        fetch: bool,
    },
}

impl RemoteOp {
    /// Access bits a region must grant for this request.
    pub fn required_access(self) -> OpFlags {
        match self {
            RemoteOp::Write => OpFlags::REMOTE_WRITE,
            RemoteOp::Read => OpFlags::REMOTE_READ,
            RemoteOp::Atomic { fetch: false } => OpFlags::REMOTE_WRITE,
            RemoteOp::Atomic { fetch: true } => OpFlags::REMOTE_WRITE | OpFlags::REMOTE_READ,
        }
    }
}

/// Target-side notification of an incoming remote access.
#[derive(Debug, Clone)]
pub struct RemoteAccess {
    /// Passed back with the response.
    pub token: RemoteToken,
    /// Target lane.
    pub lane: u8,
    /// Requested operation.
    pub op: RemoteOp,
    /// Region key named by the initiator.
    pub key: u64,
    /// Address or offset inside the region.
    pub addr: u64,
    /// Bytes touched.
    pub len: usize,
    /// Remote CQ data carried by a write.
    pub data: Option<u64>,
    /// Initiating peer.
    pub source: PeerAddr,
}

/// Stream transport message header as received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamHeader {
    /// One of the `OP_*` codes.
    pub op: u8,
    /// `REMOTE_CQ_DATA`, completion and `TAGGED` bits.
    pub flags: u16,
    /// Bytes of header preceding the payload.
    pub hdr_size: u64,
    /// Total size on the wire, header included.
    pub size: u64,
    /// Remote CQ data, valid with `REMOTE_CQ_DATA`.
    pub cq_data: u64,
    /// Tag, valid with `TAGGED`.
    pub tag: u64,
}

#[allow(missing_docs)]
impl StreamHeader {
    pub const OP_MSG: u8 = 0;
    pub const OP_TAGGED: u8 = 1;
    pub const OP_WRITE: u8 = 4;
    pub const OP_READ_REQ: u8 = 2;
    pub const OP_READ_RSP: u8 = 3;

    pub const REMOTE_CQ_DATA: u16 = 1 << 0;
    pub const TRANSMIT_COMPLETE: u16 = 1 << 1;
    pub const DELIVERY_COMPLETE: u16 = 1 << 2;
    pub const TAGGED: u16 = 1 << 7;

    /// Fixed part of the header; cq data and tag each add a word.
    pub const BASE_SIZE: u64 = 16;
}

/// Tag-matching transport receive status with its 96-bit tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TagStatus {
    /// Words 0 and 1 are the application tag; word 2 carries flags.
    pub tag: [u32; 3],
    /// Length the sender posted.
    pub msg_length: u64,
    /// Bytes landed in the receive buffer.
    pub nbytes: u64,
}

/// Datagram lower-provider completion entry, passed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatagramEntry {
    /// Completion flags as reported below.
    pub flags: OpFlags,
    /// Payload length.
    pub len: usize,
    /// Remote CQ data.
    pub data: u64,
    /// Tag.
    pub tag: u64,
}

/// Transport-specific decoding material carried by a raw completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireInfo {
    /// Nothing beyond the status.
    #[default]
    None,
    /// Stream message header.
    Stream(StreamHeader),
    /// Tag-matching receive status.
    Tagged(TagStatus),
    /// Datagram completion entry.
    Datagram(DatagramEntry),
}

/// Raw completion drained from the lower transport.
#[derive(Debug, Clone)]
pub enum RawCompletion {
    /// Completion of work posted by this side.
    Local {
        /// Identifier given at post time.
        wr_id: u64,
        /// Lane of the posting endpoint.
        lane: u8,
        /// Bytes transferred, or the failure.
        status: Result<usize, LowerError>,
        /// Variant-specific decoding material.
        wire: WireInfo,
    },
    /// Incoming remote access awaiting verification.
    Remote(RemoteAccess),
}

/// Lower transport driven by the provider.
pub trait LowerTransport: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Opens a hardware context.
    fn open_context(&self) -> Result<LowerContextId, LowerError>;

    /// Closes a context; pending completions on it are dropped.
    fn close_context(&self, ctx: LowerContextId) -> Result<(), LowerError>;

    /// Issues work; completion arrives later through [`LowerTransport::poll`].
    fn post(&self, ctx: LowerContextId, work: PostedWork) -> Result<(), LowerError>;

    /// Drains at most `max` raw completions without blocking.
    fn poll(&self, ctx: LowerContextId, max: usize) -> Vec<RawCompletion>;

    /// Registers one buffer segment.
    fn register(&self, iov: Iov, access: OpFlags) -> Result<LowerRegion, LowerError>;

    /// Releases one raw registration.
    fn deregister(&self, region: LowerRegion) -> Result<(), LowerError>;

    /// Closes the lower domain.
    fn close(&self) -> Result<(), LowerError>;
}
