//! Triggered (counter-gated) operations.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::endpoint::{AtomicArgs, Endpoint, MsgArgs, RmaArgs, TaggedArgs};
use crate::error::ProviderResult;

/// A deferred operation with its captured arguments.
#[derive(Debug, Clone)]
pub enum TriggeredOp {
    /// Message send of one buffer.
    Send(MsgArgs),
    /// Message send of a segment list.
    SendV(MsgArgs),
    /// Message receive.
    Recv(MsgArgs),
    /// Tagged send of one buffer.
    TSend(TaggedArgs),
    /// Tagged send of a segment list.
    TSendV(TaggedArgs),
    /// Tagged receive.
    TRecv(TaggedArgs),
    /// RMA write of one buffer.
    Write(RmaArgs),
    /// RMA write of a segment list.
    WriteV(RmaArgs),
    /// RMA read into one buffer.
    Read(RmaArgs),
    /// RMA read into a segment list.
    ReadV(RmaArgs),
    /// Non-fetching atomic.
    AtomicWrite(AtomicArgs),
    /// Non-fetching atomic, vector form.
    AtomicWriteV(AtomicArgs),
    /// Fetching atomic.
    AtomicReadWrite(AtomicArgs),
    /// Fetching atomic, vector form.
    AtomicReadWriteV(AtomicArgs),
    /// Compare-and-swap.
    AtomicCompWrite(AtomicArgs),
    /// Compare-and-swap, vector form.
    AtomicCompWriteV(AtomicArgs),
}

impl TriggeredOp {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            TriggeredOp::Send(_) => "send",
            TriggeredOp::SendV(_) => "sendv",
            TriggeredOp::Recv(_) => "recv",
            TriggeredOp::TSend(_) => "tsend",
            TriggeredOp::TSendV(_) => "tsendv",
            TriggeredOp::TRecv(_) => "trecv",
            TriggeredOp::Write(_) => "write",
            TriggeredOp::WriteV(_) => "writev",
            TriggeredOp::Read(_) => "read",
            TriggeredOp::ReadV(_) => "readv",
            TriggeredOp::AtomicWrite(_) => "atomic_write",
            TriggeredOp::AtomicWriteV(_) => "atomic_writev",
            TriggeredOp::AtomicReadWrite(_) => "atomic_readwrite",
            TriggeredOp::AtomicReadWriteV(_) => "atomic_readwritev",
            TriggeredOp::AtomicCompWrite(_) => "atomic_compwrite",
            TriggeredOp::AtomicCompWriteV(_) => "atomic_compwritev",
        }
    }
}

/// Operation waiting for a counter to reach `threshold`.
pub struct Trigger {
    /// Operation to issue.
    pub op: TriggeredOp,
    /// Endpoint it is issued on.
    pub ep: Arc<Endpoint>,
    /// Success count that releases it.
    pub threshold: u64,
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("op", &self.op.name())
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl Trigger {
    /// Trigger for `op` on `ep`.
    pub fn new(ep: Arc<Endpoint>, op: TriggeredOp, threshold: u64) -> Self {
        Self { op, ep, threshold }
    }

    /// Issues the operation through the endpoint's normal entry points.
    pub fn fire(self) -> ProviderResult<()> {
        self.ep.submit(self.op)
    }
}

/// Satisfied triggers of one context, in the order they became ready.
#[derive(Debug, Default)]
pub struct TriggerQueue {
    ready: Mutex<VecDeque<Trigger>>,
}

impl TriggerQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a ready trigger.
    pub fn push(&self, trigger: Trigger) {
        self.ready.lock().push_back(trigger);
    }

    /// Oldest ready trigger.
    pub fn pop(&self) -> Option<Trigger> {
        self.ready.lock().pop_front()
    }

    /// Triggers waiting to fire.
    pub fn len(&self) -> usize {
        self.ready.lock().len()
    }

    /// True when nothing is ready.
    pub fn is_empty(&self) -> bool {
        self.ready.lock().is_empty()
    }
}
