//! Completion queues.
//!
//! A CQ holds an ordered event list plus a pending-error slot. An error
//! event reaching the head of a read is moved into the slot, and reads
//! return `ErrorAvailable` until the application collects it with
//! [`CompletionQueue::readerr`]. Successes generated after an error stay
//! queued behind it, so the error is always delivered first.
//!
//! The queue size bounds what progress writes: completions for a full
//! queue wait in their context's backlog until the application reads, so
//! unread entries are never overwritten.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::{ProviderError, ProviderResult};
use crate::flags::{OpFlags, XferCtrl};
use crate::metrics::ProviderMetrics;
use crate::progress::ProgressHook;
use crate::wait::{self, ControlCommand, ControlReply, Deadline, WaitObj, WaitObject};
use crate::xfer::{WireOp, XferEntry, XferHeader, XferPool};

/// Fields an application sees in a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CqFormat {
    /// Operation context only.
    Context,
    /// Adds flags and length.
    Msg,
    /// Adds buffer and remote data.
    Data,
    /// Every field, tag included.
    #[default]
    Tagged,
}

/// CQ open attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CqAttr {
    /// Zero selects the configured default size.
    pub size: usize,
    /// Fields reported by reads.
    pub format: CqFormat,
    /// Unspecified takes the configured default.
    pub wait_obj: WaitObj,
}

/// Success completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CqEntry {
    /// Context given when the operation was posted.
    pub op_context: u64,
    /// Completion flags.
    pub flags: OpFlags,
    /// Bytes received; zero for transmit completions.
    pub len: usize,
    /// Receive buffer, when known.
    pub buf: Option<u64>,
    /// Remote CQ data.
    pub data: u64,
    /// Matched tag.
    pub tag: u64,
}

impl CqEntry {
    fn formatted(mut self, format: CqFormat) -> Self {
        match format {
            CqFormat::Context => {
                self.flags = OpFlags::empty();
                self.len = 0;
                self.buf = None;
                self.data = 0;
                self.tag = 0;
            }
            CqFormat::Msg => {
                self.buf = None;
                self.data = 0;
                self.tag = 0;
            }
            CqFormat::Data => self.tag = 0,
            CqFormat::Tagged => {}
        }
        self
    }
}

/// Error completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CqErrEntry {
    /// Context given when the operation was posted.
    pub op_context: u64,
    /// Completion flags.
    pub flags: OpFlags,
    /// Always zero.
    pub len: usize,
    /// Always `None`.
    pub buf: Option<u64>,
    /// Remote CQ data.
    pub data: u64,
    /// Tag of a failed tagged receive.
    pub tag: u64,
    /// Bytes that did not fit the receive buffer.
    pub olen: usize,
    /// Positive host errno.
    pub err: i32,
    /// Lower transport diagnostic code.
    pub prov_errno: i32,
}

#[derive(Debug, Clone, Copy)]
enum CqEvent {
    Completion(CqEntry),
    Error(CqErrEntry),
}

#[derive(Default)]
struct CqState {
    events: VecDeque<CqEvent>,
    pending_error: Option<CqErrEntry>,
}

impl CqState {
    fn occupied(&self) -> usize {
        self.events.len() + usize::from(self.pending_error.is_some())
    }
}

/// Recovers data and tag for a receive, adding the matching CQ flags.
fn recv_cq_info(hdr: &XferHeader, flags: &mut OpFlags) -> (u64, u64) {
    let tagged = hdr.op == WireOp::Tagged || hdr.has(XferHeader::TAGGED);
    if hdr.has(XferHeader::REMOTE_CQ_DATA) {
        flags.insert(OpFlags::REMOTE_CQ_DATA);
        if tagged {
            flags.insert(OpFlags::TAGGED);
            (hdr.cq_data, hdr.tag)
        } else {
            (hdr.cq_data, 0)
        }
    } else if tagged {
        flags.insert(OpFlags::TAGGED);
        (0, hdr.tag)
    } else {
        (0, 0)
    }
}

/// Classifies an entry into (flags, len, data, tag) for reporting.
fn classify(entry: &XferEntry) -> (OpFlags, usize, u64, u64) {
    let mut flags = entry.cq_flags.without(OpFlags::COMPLETION);
    if flags.contains(OpFlags::RECV) {
        let len = entry.hdr.payload_len() as usize;
        let (data, tag) = recv_cq_info(&entry.hdr, &mut flags);
        (flags, len, data, tag)
    } else if flags.contains(OpFlags::REMOTE_CQ_DATA) {
        debug_assert!(flags.contains(OpFlags::REMOTE_WRITE));
        (flags, 0, entry.hdr.cq_data, 0)
    } else {
        (flags, 0, 0, 0)
    }
}

/// Application-facing completion queue.
pub struct CompletionQueue {
    attr: CqAttr,
    state: Mutex<CqState>,
    pool: XferPool,
    wait: Option<Arc<WaitObject>>,
    progress: OnceLock<Weak<dyn ProgressHook>>,
    metrics: Arc<ProviderMetrics>,
    bindings: AtomicUsize,
    closed: AtomicBool,
    progress_interval: Duration,
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("attr", &self.attr)
            .field("len", &self.len())
            .field("bindings", &self.bindings())
            .finish()
    }
}

impl CompletionQueue {
    /// Opens a queue. A zero size takes the configured default and an
    /// unspecified wait object becomes the configured concrete kind.
    pub fn open(
        attr: CqAttr,
        config: &ProviderConfig,
        resource_mgmt: bool,
        metrics: Arc<ProviderMetrics>,
    ) -> ProviderResult<Self> {
        let size = if attr.size == 0 {
            config.cq_default_size
        } else {
            attr.size
        };
        let wait_obj = attr.wait_obj.resolve(config.default_wait);
        let wait = match wait_obj {
            WaitObj::None => None,
            WaitObj::Unspec => {
                return Err(ProviderError::invalid("wait object left unspecified"));
            }
            kind => Some(Arc::new(WaitObject::new(kind))),
        };
        let cap = resource_mgmt.then_some(size);
        debug!(size, ?wait_obj, resource_mgmt, "completion queue opened");
        Ok(Self {
            attr: CqAttr {
                size,
                format: attr.format,
                wait_obj,
            },
            state: Mutex::new(CqState::default()),
            pool: XferPool::new(config.xfer_pool_chunk, cap),
            wait,
            progress: OnceLock::new(),
            metrics,
            bindings: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            progress_interval: config.progress_interval(),
        })
    }

    /// Attributes in effect after defaults were applied.
    pub fn attr(&self) -> CqAttr {
        self.attr
    }

    /// Capacity.
    pub fn size(&self) -> usize {
        self.attr.size
    }

    /// Wait object kind in effect.
    pub fn wait_obj(&self) -> WaitObj {
        self.attr.wait_obj
    }

    /// Transfer entries owned by operations bound to this queue.
    pub fn pool(&self) -> &XferPool {
        &self.pool
    }

    /// Installs the progress driver run before every read.
    pub fn set_progress(&self, hook: Weak<dyn ProgressHook>) {
        if self.progress.set(hook).is_err() {
            debug!("completion queue progress hook already set");
        }
    }

    fn run_progress(&self) {
        if let Some(engine) = self.progress.get().and_then(Weak::upgrade) {
            engine.progress();
        }
    }

    /// Unread entries, pending error included.
    pub fn len(&self) -> usize {
        self.state.lock().occupied()
    }

    /// True when nothing is unread.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries that fit before the queue is full.
    pub fn free_slots(&self) -> usize {
        self.attr.size.saturating_sub(self.state.lock().occupied())
    }

    fn push_event(&self, event: CqEvent) {
        self.state.lock().events.push_back(event);
        if let Some(wait) = &self.wait {
            wait.signal();
        }
    }

    /// Writes one success entry unless the entry did not ask for a
    /// completion or is provider-internal.
    pub fn report_success(&self, entry: &XferEntry) {
        if !entry.cq_flags.contains(OpFlags::COMPLETION) || entry.is_internal() {
            return;
        }
        let (flags, len, data, tag) = classify(entry);
        self.push_event(CqEvent::Completion(CqEntry {
            op_context: entry.context,
            flags,
            len,
            buf: None,
            data,
            tag,
        }));
        self.metrics.inc_completions_reported();
    }

    /// Writes one error entry. Internal and inject transfers have no
    /// application context to correlate, so their failures are only logged.
    pub fn report_error(&self, entry: &XferEntry, err: i32, prov_errno: i32) {
        if entry.ctrl.intersects(XferCtrl::INTERNAL | XferCtrl::INJECT_OP) {
            warn!(
                err,
                prov_errno,
                flags = entry.cq_flags.bits(),
                internal = entry.is_internal(),
                "suppressed error completion for internal or inject transfer"
            );
            self.metrics.inc_errors_suppressed();
            return;
        }
        let (flags, _len, data, tag) = classify(entry);
        self.push_event(CqEvent::Error(CqErrEntry {
            op_context: entry.context,
            flags,
            len: 0,
            buf: None,
            data,
            tag,
            olen: 0,
            err,
            prov_errno,
        }));
        self.metrics.inc_errors_reported();
    }

    /// Wakes blocked readers without an event.
    pub fn signal(&self) {
        if let Some(wait) = &self.wait {
            wait.signal();
        }
    }

    /// Reads up to `count` success entries after driving progress.
    ///
    /// Returns `ErrorAvailable` while an error is pending and `Again` when
    /// nothing is queued.
    pub fn read(&self, count: usize) -> ProviderResult<Vec<CqEntry>> {
        self.run_progress();
        let mut state = self.state.lock();
        if state.pending_error.is_some() {
            return Err(ProviderError::ErrorAvailable);
        }
        let mut out = Vec::new();
        while out.len() < count {
            match state.events.front() {
                Some(CqEvent::Completion(entry)) => {
                    out.push(entry.formatted(self.attr.format));
                    state.events.pop_front();
                }
                Some(CqEvent::Error(err)) => {
                    if out.is_empty() {
                        let err = *err;
                        state.events.pop_front();
                        state.pending_error = Some(err);
                        return Err(ProviderError::ErrorAvailable);
                    }
                    break;
                }
                None => break,
            }
        }
        if out.is_empty() {
            Err(ProviderError::Again)
        } else {
            Ok(out)
        }
    }

    /// Takes the pending error, or an error at the head of the queue.
    pub fn readerr(&self) -> ProviderResult<CqErrEntry> {
        self.run_progress();
        let mut state = self.state.lock();
        if let Some(err) = state.pending_error.take() {
            return Ok(err);
        }
        if let Some(CqEvent::Error(err)) = state.events.front() {
            let err = *err;
            state.events.pop_front();
            return Ok(err);
        }
        Err(ProviderError::Again)
    }

    fn require_wait(&self) -> ProviderResult<&Arc<WaitObject>> {
        self.wait
            .as_ref()
            .ok_or_else(|| ProviderError::unsupported("blocking read without a wait object"))
    }

    /// Blocking read; returns `Again` if nothing arrives within `timeout`.
    pub fn sread(&self, count: usize, timeout: Duration) -> ProviderResult<Vec<CqEntry>> {
        let wait = self.require_wait()?;
        let deadline = Deadline::after(timeout);
        loop {
            let seen = wait.sequence();
            match self.read(count) {
                Err(ProviderError::Again) => {}
                other => return other,
            }
            let Some(slice) = deadline.slice(self.progress_interval) else {
                return Err(ProviderError::Again);
            };
            wait.wait_since(seen, slice);
        }
    }

    /// Async counterpart of [`CompletionQueue::sread`].
    pub async fn read_async(&self, count: usize, timeout: Duration) -> ProviderResult<Vec<CqEntry>> {
        let wait = self.require_wait()?.clone();
        let deadline = Deadline::after(timeout);
        loop {
            let seen = wait.sequence();
            match self.read(count) {
                Err(ProviderError::Again) => {}
                other => return other,
            }
            let Some(slice) = deadline.slice(self.progress_interval) else {
                return Err(ProviderError::Again);
            };
            wait.wait_since_async(seen, slice).await;
        }
    }

    /// Wait-object query or retrieval.
    pub fn control(&self, cmd: ControlCommand) -> ProviderResult<ControlReply> {
        wait::control(self.wait.as_deref(), cmd)
    }

    pub(crate) fn acquire_binding(&self) {
        self.bindings.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_binding(&self) {
        self.bindings.fetch_sub(1, Ordering::AcqRel);
    }

    /// Endpoints currently bound to this queue.
    pub fn bindings(&self) -> usize {
        self.bindings.load(Ordering::Acquire)
    }

    /// True once [`CompletionQueue::close`] ran.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Destroys the transfer pool and drops unread events. Callers close
    /// bound endpoints first.
    pub fn close(&self) -> ProviderResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ProviderError::bad_state("completion queue already closed"));
        }
        let outstanding = self.pool.destroy();
        let dropped = {
            let mut state = self.state.lock();
            let dropped = state.occupied();
            state.events.clear();
            state.pending_error = None;
            dropped
        };
        debug!(outstanding, dropped, "completion queue closed");
        self.signal();
        Ok(())
    }
}
