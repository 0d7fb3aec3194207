//! Wait objects for blocking and async completion waits.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::error::{ProviderError, ProviderResult};

static WAIT_ID: AtomicU64 = AtomicU64::new(1);

/// Wait object kind requested for a CQ or counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitObj {
    /// Let the provider choose.
    #[default]
    Unspec,
    /// No wait object; blocking reads are unsupported.
    None,
    /// File descriptor.
    Fd,
    /// Pollable file descriptor.
    PollFd,
    /// Mutex and condition variable.
    MutexCond,
    /// Busy wait that yields the thread.
    Yield,
}

impl WaitObj {
    /// Substitutes `default` for an unspecified kind.
    pub fn resolve(self, default: WaitObj) -> WaitObj {
        match self {
            WaitObj::Unspec => default,
            other => other,
        }
    }
}

/// Descriptor returned by the get-wait control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitDescriptor {
    /// Wait object kind.
    pub kind: WaitObj,
    /// Process-unique identifier.
    pub id: u64,
}

/// Control commands accepted by CQs and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Fetch the wait descriptor.
    GetWait,
    /// Fetch the wait object kind.
    GetWaitObj,
    /// Turn on wait signalling.
    Enable,
}

/// Reply to a successful control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    /// Answer to `GetWait`.
    Wait(WaitDescriptor),
    /// Answer to `GetWaitObj`.
    WaitObj(WaitObj),
}

/// Signalable wait object.
///
/// Each signal bumps a sequence number; waiters sleep until the sequence
/// moves past the value they observed.
#[derive(Debug)]
pub struct WaitObject {
    kind: WaitObj,
    id: u64,
    seq: Mutex<u64>,
    cond: Condvar,
    notify: Notify,
}

impl WaitObject {
    /// New wait object with a fresh identifier.
    pub fn new(kind: WaitObj) -> Self {
        Self {
            kind,
            id: WAIT_ID.fetch_add(1, Ordering::Relaxed),
            seq: Mutex::new(0),
            cond: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Kind given at creation.
    pub fn kind(&self) -> WaitObj {
        self.kind
    }

    /// Kind and identifier.
    pub fn descriptor(&self) -> WaitDescriptor {
        WaitDescriptor {
            kind: self.kind,
            id: self.id,
        }
    }

    /// Current signal sequence.
    pub fn sequence(&self) -> u64 {
        *self.seq.lock()
    }

    /// Wakes every blocked and async waiter.
    pub fn signal(&self) {
        {
            let mut seq = self.seq.lock();
            *seq = seq.wrapping_add(1);
        }
        self.cond.notify_all();
        self.notify.notify_waiters();
    }

    /// Blocks until the sequence differs from `seen` or `timeout` passes.
    /// Returns true if signalled.
    pub fn wait_since(&self, seen: u64, timeout: Duration) -> bool {
        let mut seq = self.seq.lock();
        if *seq != seen {
            return true;
        }
        let _ = self.cond.wait_for(&mut seq, timeout);
        *seq != seen
    }

    /// Async counterpart of [`WaitObject::wait_since`].
    pub async fn wait_since_async(&self, seen: u64, timeout: Duration) -> bool {
        let notified = self.notify.notified();
        if self.sequence() != seen {
            return true;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.sequence() != seen
    }
}

/// End of a blocking wait. A timeout too large to represent never expires.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// Next sleep, at most `max`, or `None` once expired.
    pub(crate) fn slice(&self, max: Duration) -> Option<Duration> {
        match self.0 {
            None => Some(max),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    None
                } else {
                    Some((deadline - now).min(max))
                }
            }
        }
    }
}

/// Handles the control commands common to CQs and counters.
pub(crate) fn control(wait: Option<&WaitObject>, cmd: ControlCommand) -> ProviderResult<ControlReply> {
    match cmd {
        ControlCommand::GetWait => wait
            .map(|w| ControlReply::Wait(w.descriptor()))
            .ok_or(ProviderError::NoData),
        ControlCommand::GetWaitObj => wait
            .map(|w| ControlReply::WaitObj(w.kind()))
            .ok_or(ProviderError::NoData),
        ControlCommand::Enable => Err(ProviderError::unsupported(format!("{:?}", cmd))),
    }
}
