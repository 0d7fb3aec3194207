//! Progress engine.
//!
//! One pass drains each transport context of its raw completions, turns
//! them into CQ entries and counter updates, answers incoming remote
//! accesses, then fires the triggers that became ready. In manual mode a
//! pass runs inside CQ and counter reads; in auto mode a named background
//! thread runs passes until the domain stops it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::config::ProgressMode;
use crate::context::TransportContext;
use crate::cq::CompletionQueue;
use crate::domain::DomainShared;
use crate::endpoint::Endpoint;
use crate::error::{errno, ProviderError, ProviderResult};
use crate::flags::{CntrSlot, OpClass, OpFlags};
use crate::lower::{
    LowerError, PostedOp, PostedWork, RawCompletion, RemoteAccess, RemoteOp, WireInfo,
};
use crate::xfer::{Direction, XferEntry, XferId};

/// Driver invoked by CQs and counters before they report state.
pub trait ProgressHook: Send + Sync {
    /// Runs one pass and returns the raw events handled.
    fn progress(&self) -> usize;
}

/// Drives completions from the lower transport into CQs and counters.
pub struct ProgressEngine {
    shared: Arc<DomainShared>,
    mode: ProgressMode,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProgressEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressEngine")
            .field("mode", &self.mode)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ProgressEngine {
    pub(crate) fn new(shared: Arc<DomainShared>) -> Self {
        Self {
            mode: shared.config.progress,
            shared,
            stop: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Manual or auto.
    pub fn mode(&self) -> ProgressMode {
        self.mode
    }

    /// True while the background thread runs.
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Runs one pass over every context of the domain.
    pub fn progress_all(&self) -> usize {
        progress_domain(&self.shared)
    }

    /// Spawns the background thread in auto mode; a no-op otherwise.
    pub(crate) fn start(&self) -> ProviderResult<()> {
        if self.mode != ProgressMode::Auto {
            return Ok(());
        }
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Ok(());
        }
        self.stop.store(false, Ordering::Release);
        let shared = self.shared.clone();
        let stop = self.stop.clone();
        let interval = shared.config.progress_interval();
        let handle = thread::Builder::new()
            .name("ofiprov-progress".to_string())
            .spawn(move || {
                info!(?interval, "progress thread started");
                while !stop.load(Ordering::Acquire) {
                    if progress_domain(&shared) == 0 {
                        thread::park_timeout(interval);
                    }
                }
                info!("progress thread stopped");
            })
            .map_err(|e| ProviderError::NoMemory {
                reason: format!("progress thread: {}", e),
            })?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stops and joins the background thread.
    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("progress thread panicked");
            }
        }
    }
}

impl ProgressHook for ProgressEngine {
    fn progress(&self) -> usize {
        match self.mode {
            ProgressMode::Manual => self.progress_all(),
            ProgressMode::Auto => 0,
        }
    }
}

pub(crate) fn progress_domain(shared: &DomainShared) -> usize {
    let contexts: Vec<Arc<TransportContext>> = shared.contexts.read().clone();
    contexts
        .iter()
        .map(|ctx| progress_context(shared, ctx))
        .sum()
}

/// Work held back because its completion queue had no free slot.
/// Retried in arrival order on the context's next pass.
#[derive(Debug)]
pub(crate) enum Deferred {
    Local {
        wr_id: u64,
        lane: u8,
        status: Result<usize, LowerError>,
        wire: WireInfo,
    },
    /// Target-side report of a remote access that was already answered.
    RemoteReport(RemoteAccess),
}

/// Queues found full during the current pass. Later work for them is
/// deferred as well so each queue keeps its completion order.
#[derive(Default)]
struct Stalled(Vec<Arc<CompletionQueue>>);

impl Stalled {
    fn blocks(&mut self, cq: &Arc<CompletionQueue>) -> bool {
        if self.0.iter().any(|s| Arc::ptr_eq(s, cq)) {
            return true;
        }
        if cq.free_slots() == 0 {
            self.0.push(cq.clone());
            return true;
        }
        false
    }
}

/// Drains one context. A context already being polled by another thread
/// is skipped rather than waited on.
///
/// A full CQ only holds back the completions headed for it; the other
/// endpoints on the context keep progressing.
pub(crate) fn progress_context(shared: &DomainShared, ctx: &TransportContext) -> usize {
    let mut handled = 0;
    if let Some(_poll) = ctx.poll_lock().try_lock() {
        shared.metrics.inc_progress_calls();
        let mut stalled = Stalled::default();
        for work in ctx.take_backlog() {
            if deliver(shared, ctx, work, &mut stalled) {
                handled += 1;
            }
        }
        for raw in shared.lower.poll(ctx.lower_id(), shared.config.progress_batch) {
            match raw {
                RawCompletion::Local {
                    wr_id,
                    lane,
                    status,
                    wire,
                } => {
                    let work = Deferred::Local {
                        wr_id,
                        lane,
                        status,
                        wire,
                    };
                    deliver(shared, ctx, work, &mut stalled);
                }
                RawCompletion::Remote(access) => dispatch_remote(shared, ctx, access, &mut stalled),
            }
            handled += 1;
        }
        if !stalled.0.is_empty() {
            trace!(backlog = ctx.backlog_len(), "completions deferred on full queues");
        }
    }
    handled + fire_ready(shared, ctx)
}

/// Queue a piece of work will write into, if it can write at all.
fn target_cq(ctx: &TransportContext, work: &Deferred) -> Option<Arc<CompletionQueue>> {
    match work {
        Deferred::Local { wr_id, lane, .. } => {
            let id = XferId::from_wr_id(*wr_id)?;
            ctx.endpoint(*lane)?.cq(id.direction())
        }
        Deferred::RemoteReport(access) => {
            let ep = ctx.endpoint(access.lane)?;
            if access.data.is_none() && !ep.caps().contains(OpFlags::RMA_EVENT) {
                return None;
            }
            ep.cq(Direction::Rx)
        }
    }
}

/// Dispatches `work`, or parks it on the backlog when its queue is full.
fn deliver(shared: &DomainShared, ctx: &TransportContext, work: Deferred, stalled: &mut Stalled) -> bool {
    if let Some(cq) = target_cq(ctx, &work) {
        if stalled.blocks(&cq) {
            ctx.defer(work);
            return false;
        }
    }
    match work {
        Deferred::Local {
            wr_id,
            lane,
            status,
            wire,
        } => dispatch_local(shared, ctx, wr_id, lane, status, wire),
        Deferred::RemoteReport(access) => match ctx.endpoint(access.lane) {
            Some(ep) => report_remote(shared, &ep, &access),
            None => warn!(lane = access.lane, key = access.key, "remote access report for closed endpoint"),
        },
    }
    true
}

fn dispatch_local(
    shared: &DomainShared,
    ctx: &TransportContext,
    wr_id: u64,
    lane: u8,
    status: Result<usize, LowerError>,
    wire: WireInfo,
) {
    let Some(id) = XferId::from_wr_id(wr_id) else {
        trace!(lane, "untracked completion");
        return;
    };
    let Some(ep) = ctx.endpoint(lane) else {
        warn!(lane, wr_id, "completion for closed endpoint dropped");
        return;
    };
    let Some(cq) = ep.cq(id.direction()) else {
        warn!(lane, wr_id, "completion without a bound queue dropped");
        return;
    };
    let Some(mut entry) = cq.pool().take(id) else {
        warn!(lane, wr_id, "stale transfer id");
        return;
    };
    shared.variant.decode(&wire, &mut entry.hdr);
    if entry.cq_flags.contains(OpFlags::RECV) && wire == WireInfo::None {
        if let Ok(len) = status {
            entry.hdr.size = len as u64;
            entry.hdr.hdr_size = 0;
        }
    }
    let counter = if entry.is_internal() {
        None
    } else {
        CntrSlot::from_flags(entry.cq_flags).and_then(|slot| ep.counter(slot))
    };
    match status {
        Ok(_) => {
            if let Some(cntr) = counter {
                cntr.increment_success();
            }
            cq.report_success(&entry);
        }
        Err(e) => {
            debug!(lane, errno = e.errno, prov_errno = e.prov_errno, "transfer failed");
            cq.report_error(&entry, e.errno, e.prov_errno);
            if let Some(cntr) = counter {
                cntr.increment_error();
            }
        }
    }
}

fn dispatch_remote(
    shared: &DomainShared,
    ctx: &TransportContext,
    access: RemoteAccess,
    stalled: &mut Stalled,
) {
    let Some(ep) = ctx.endpoint(access.lane) else {
        warn!(lane = access.lane, key = access.key, "remote access for closed endpoint");
        respond_untracked(shared, ctx, &access, LowerError::new(errno::EINVAL, 0));
        return;
    };
    let verdict = shared
        .registry
        .verify(access.key, access.addr, access.len, access.op.required_access());
    match verdict {
        Ok(segs) => {
            ep.respond(access.token, Ok(segs));
            deliver(shared, ctx, Deferred::RemoteReport(access), stalled);
        }
        Err(e) => {
            warn!(
                key = access.key,
                addr = access.addr,
                len = access.len,
                source = access.source.context,
                "remote access rejected"
            );
            ep.respond(access.token, Err(LowerError::new(e.errno(), 0)));
        }
    }
}

fn respond_untracked(shared: &DomainShared, ctx: &TransportContext, access: &RemoteAccess, err: LowerError) {
    let work = PostedWork {
        wr_id: XferId::UNTRACKED,
        lane: access.lane,
        op: PostedOp::Respond {
            token: access.token,
            status: Err(err),
        },
    };
    if let Err(e) = shared.lower.post(ctx.lower_id(), work) {
        warn!(error = %e, "unable to reject remote access");
    }
}

/// Target-side accounting of a completed remote access.
fn report_remote(shared: &DomainShared, ep: &Endpoint, access: &RemoteAccess) {
    let (class, mut flags) = match access.op {
        RemoteOp::Write => (OpClass::RemoteWrite, OpClass::RemoteWrite.cq_flags()),
        RemoteOp::Read => (OpClass::RemoteRead, OpClass::RemoteRead.cq_flags()),
        RemoteOp::Atomic { fetch } => {
            let mut flags = OpFlags::ATOMIC | OpFlags::REMOTE_WRITE;
            if fetch {
                flags.insert(OpFlags::REMOTE_READ);
            }
            (OpClass::RemoteWrite, flags)
        }
    };
    if access.data.is_some() || ep.caps().contains(OpFlags::RMA_EVENT) {
        flags.insert(OpFlags::COMPLETION);
    }
    let mut entry = XferEntry::new(class, flags, 0);
    entry.lane = access.lane;
    entry.mr_key = Some(access.key);
    entry.posted_len = access.len;
    if let Some(data) = access.data {
        entry.cq_flags.insert(OpFlags::REMOTE_CQ_DATA);
        entry.hdr.cq_data = data;
    }

    if let Some(cntr) = CntrSlot::from_flags(flags).and_then(|slot| ep.counter(slot)) {
        cntr.increment_success();
    }
    if let Some(cntr) = shared.registry.get(access.key).and_then(|mr| mr.counter()) {
        cntr.increment_success();
    }
    if let Some(cq) = ep.cq(Direction::Rx) {
        cq.report_success(&entry);
    }
}

/// Issues the triggers of `ctx` that became ready, in order.
fn fire_ready(shared: &DomainShared, ctx: &TransportContext) -> usize {
    let queue = ctx.trigger_queue();
    if queue.is_empty() {
        return 0;
    }
    let _fire = ctx.fire_lock().lock();
    let mut fired = 0;
    while let Some(trigger) = queue.pop() {
        let op = trigger.op.name();
        match trigger.fire() {
            Ok(()) => trace!(op, "triggered operation issued"),
            Err(e) => warn!(op, error = %e, "triggered operation failed"),
        }
        shared.metrics.inc_triggers_fired();
        fired += 1;
    }
    fired
}
