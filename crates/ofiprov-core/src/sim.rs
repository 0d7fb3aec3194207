//! Software fabric for exercising the provider without hardware.
//!
//! [`SimFabric`] implements [`LowerTransport`] over an in-process byte
//! arena. Sends are matched against posted receives (or parked as
//! unexpected messages), RMA and atomics are surfaced to the target context
//! as remote-access notifications and only move data once the target
//! responds. Faults can be injected into registration, deregistration,
//! posting and completion delivery.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::errno;
use crate::flags::OpFlags;
use crate::lower::{
    iov_len, AtomicOp, Iov, LowerContextId, LowerError, LowerRegion, LowerTransport, PeerAddr,
    PostedOp, PostedWork, RawCompletion, RemoteAccess, RemoteOp, RemoteToken, RmaTarget, WireInfo,
};
use crate::variant::{variant_for, TransportVariant, VariantKind, WireSummary};

const PAGE: u64 = 4096;
const ARENA_BASE: u64 = 0x10_0000;

/// Simulated fabric configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimFabricConfig {
    /// Wire conventions used for receive completions.
    pub variant: VariantKind,
    /// Queued completions plus posted receives allowed per context.
    pub max_queue_depth: usize,
    /// Contexts that may be open at once.
    pub max_contexts: usize,
}

impl Default for SimFabricConfig {
    fn default() -> Self {
        Self {
            variant: VariantKind::Stream,
            max_queue_depth: 4096,
            max_contexts: 64,
        }
    }
}

/// Fabric-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricStats {
    /// Local completions delivered with success.
    pub operations_completed: u64,
    /// Local completions delivered with an error.
    pub operations_failed: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// Payload bytes landed in receive buffers.
    pub bytes_received: u64,
    /// Lower registrations not yet released.
    pub live_registrations: usize,
    /// Open contexts.
    pub live_contexts: usize,
}

/// Byte arena backing simulated buffers.
#[derive(Debug, Default)]
pub struct SimMemory {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next: u64,
    buffers: BTreeMap<u64, Vec<u8>>,
}

impl MemoryInner {
    fn locate(&mut self, addr: u64, len: usize) -> Option<(&mut Vec<u8>, usize)> {
        let (base, buf) = self.buffers.range_mut(..=addr).next_back()?;
        let offset = (addr - base) as usize;
        if offset.checked_add(len)? > buf.len() {
            return None;
        }
        Some((buf, offset))
    }
}

impl SimMemory {
    /// Allocates a zeroed buffer and returns its address. Buffers are page
    /// aligned and separated by an unmapped guard page.
    pub fn alloc(&self, len: usize) -> u64 {
        let mut inner = self.inner.lock();
        if inner.next == 0 {
            inner.next = ARENA_BASE;
        }
        let base = inner.next;
        let span = (len as u64).div_ceil(PAGE).max(1) * PAGE;
        inner.next = base + span + PAGE;
        inner.buffers.insert(base, vec![0; len]);
        base
    }

    /// True when `[addr, addr+len)` lies inside one buffer.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        self.inner.lock().locate(addr, len).is_some()
    }

    /// Copies `data` in; false when the range is unmapped.
    pub fn write(&self, addr: u64, data: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        match inner.locate(addr, data.len()) {
            Some((buf, offset)) => {
                buf[offset..offset + data.len()].copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Copies `len` bytes out.
    pub fn read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let (buf, offset) = inner.locate(addr, len)?;
        Some(buf[offset..offset + len].to_vec())
    }

    /// Reads a little-endian word.
    pub fn read_u64(&self, addr: u64) -> Option<u64> {
        let bytes = self.read(addr, 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    fn gather(&self, iov: &[Iov]) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(iov_len(iov));
        for seg in iov {
            out.extend(self.read(seg.addr, seg.len)?);
        }
        Some(out)
    }

    /// Copies `data` across `iov`, returning the bytes placed.
    fn scatter(&self, iov: &[Iov], data: &[u8]) -> Option<usize> {
        let mut placed = 0;
        for seg in iov {
            if placed == data.len() {
                break;
            }
            let take = seg.len.min(data.len() - placed);
            if !self.write(seg.addr, &data[placed..placed + take]) {
                return None;
            }
            placed += take;
        }
        Some(placed)
    }
}

#[derive(Debug)]
struct PostedRecv {
    wr_id: u64,
    lane: u8,
    iov: Vec<Iov>,
    src: Option<PeerAddr>,
    tag: Option<(u64, u64)>,
}

#[derive(Debug)]
struct InboundMsg {
    src: PeerAddr,
    dst_lane: u8,
    payload: Vec<u8>,
    tag: Option<u64>,
    data: Option<u64>,
}

impl PostedRecv {
    fn matches(&self, msg: &InboundMsg) -> bool {
        if self.lane != msg.dst_lane {
            return false;
        }
        if self.src.is_some_and(|src| src != msg.src) {
            return false;
        }
        match (self.tag, msg.tag) {
            (None, None) => true,
            (Some((tag, ignore)), Some(got)) => (tag & !ignore) == (got & !ignore),
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct SimContext {
    completions: VecDeque<RawCompletion>,
    posted: Vec<PostedRecv>,
    unexpected: VecDeque<InboundMsg>,
}

impl SimContext {
    fn depth(&self) -> usize {
        self.completions.len() + self.posted.len()
    }
}

#[derive(Debug)]
enum PendingKind {
    Write { payload: Vec<u8> },
    Read { local: Vec<Iov> },
    Atomic {
        op: AtomicOp,
        operand: u64,
        compare: Option<u64>,
        result: Option<Iov>,
    },
}

#[derive(Debug)]
struct PendingRemote {
    ctx: LowerContextId,
    lane: u8,
    wr_id: u64,
    kind: PendingKind,
}

#[derive(Debug, Default)]
struct Faults {
    registration: Option<(usize, i32)>,
    deregistration: Option<i32>,
    post: Option<i32>,
    completions: Option<(usize, LowerError)>,
}

#[derive(Debug, Default)]
struct SimState {
    contexts: HashMap<LowerContextId, SimContext>,
    next_ctx: LowerContextId,
    registrations: HashMap<u64, (Iov, OpFlags)>,
    next_handle: u64,
    pending: HashMap<u64, PendingRemote>,
    next_token: u64,
    faults: Faults,
    stats: FabricStats,
    closed: bool,
}

impl SimState {
    fn push_local(
        &mut self,
        ctx: LowerContextId,
        wr_id: u64,
        lane: u8,
        status: Result<usize, LowerError>,
        wire: WireInfo,
    ) {
        let status = match (&mut self.faults.completions, status) {
            (Some((left, err)), Ok(_)) if *left > 0 => {
                *left -= 1;
                Err(*err)
            }
            (_, status) => status,
        };
        if matches!(self.faults.completions, Some((0, _))) {
            self.faults.completions = None;
        }
        match &status {
            Ok(_) => self.stats.operations_completed += 1,
            Err(_) => self.stats.operations_failed += 1,
        }
        match self.contexts.get_mut(&ctx) {
            Some(sim_ctx) => sim_ctx.completions.push_back(RawCompletion::Local {
                wr_id,
                lane,
                status,
                wire,
            }),
            None => debug!(ctx, wr_id, "completion for closed context dropped"),
        }
    }
}

fn lower_err(code: i32) -> LowerError {
    LowerError::new(code, -code)
}

/// In-process lower transport.
pub struct SimFabric {
    config: SimFabricConfig,
    variant: Arc<dyn TransportVariant>,
    memory: SimMemory,
    state: Mutex<SimState>,
}

impl std::fmt::Debug for SimFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimFabric")
            .field("config", &self.config)
            .finish()
    }
}

impl SimFabric {
    /// Fabric with no contexts open.
    pub fn new(config: SimFabricConfig) -> Self {
        Self {
            variant: variant_for(config.variant),
            config,
            memory: SimMemory::default(),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &SimFabricConfig {
        &self.config
    }

    /// Simulated memory.
    pub fn memory(&self) -> &SimMemory {
        &self.memory
    }

    /// Current counters.
    pub fn stats(&self) -> FabricStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.live_registrations = state.registrations.len();
        stats.live_contexts = state.contexts.len();
        stats
    }

    /// Access the lower registration was made with.
    pub fn registration_access(&self, region: LowerRegion) -> Option<OpFlags> {
        self.state
            .lock()
            .registrations
            .get(&region.handle)
            .map(|(_, access)| *access)
    }

    /// Lets `successes` registrations through, then fails the next one.
    pub fn fail_registration_after(&self, successes: usize, code: i32) {
        self.state.lock().faults.registration = Some((successes, code));
    }

    /// Fails the next deregistration; the region stays registered.
    pub fn fail_next_deregistration(&self, code: i32) {
        self.state.lock().faults.deregistration = Some(code);
    }

    /// Fails the next post with `code`.
    pub fn fail_next_post(&self, code: i32) {
        self.state.lock().faults.post = Some(code);
    }

    /// Turns the next `count` successful local completions into `err`.
    pub fn fail_next_completions(&self, count: usize, err: LowerError) {
        self.state.lock().faults.completions = Some((count, err));
    }

    /// Messages parked on `ctx` with no matching receive.
    pub fn unexpected_messages(&self, ctx: LowerContextId) -> usize {
        self.state
            .lock()
            .contexts
            .get(&ctx)
            .map_or(0, |c| c.unexpected.len())
    }

    fn complete_recv(&self, state: &mut SimState, ctx: LowerContextId, recv: PostedRecv, msg: InboundMsg) {
        let capacity = iov_len(&recv.iov);
        let delivered = msg.payload.len().min(capacity);
        let placed = self
            .memory
            .scatter(&recv.iov, &msg.payload[..delivered])
            .unwrap_or(0);
        state.stats.bytes_received += placed as u64;
        let wire = self.variant.encode(&WireSummary {
            len: placed,
            tag: msg.tag,
            data: msg.data,
            src_lane: msg.src.vlane,
            dst_lane: msg.dst_lane,
        });
        let status = if msg.payload.len() > capacity {
            Err(LowerError::new(errno::FI_ETRUNC, (msg.payload.len() - capacity) as i32))
        } else {
            Ok(placed)
        };
        trace!(ctx, wr_id = recv.wr_id, placed, "receive matched");
        state.push_local(ctx, recv.wr_id, recv.lane, status, wire);
    }

    fn deliver(&self, state: &mut SimState, dest: LowerContextId, msg: InboundMsg) {
        let Some(target) = state.contexts.get_mut(&dest) else {
            return;
        };
        match target.posted.iter().position(|r| r.matches(&msg)) {
            Some(index) => {
                let recv = target.posted.remove(index);
                self.complete_recv(state, dest, recv, msg);
            }
            None => target.unexpected.push_back(msg),
        }
    }

    fn post_recv(&self, state: &mut SimState, ctx: LowerContextId, recv: PostedRecv) {
        let Some(sim_ctx) = state.contexts.get_mut(&ctx) else {
            return;
        };
        match sim_ctx.unexpected.iter().position(|m| recv.matches(m)) {
            Some(index) => {
                if let Some(msg) = sim_ctx.unexpected.remove(index) {
                    self.complete_recv(state, ctx, recv, msg);
                }
            }
            None => sim_ctx.posted.push(recv),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn request_remote(
        &self,
        state: &mut SimState,
        ctx: LowerContextId,
        work: &PostedWork,
        dest: PeerAddr,
        target: RmaTarget,
        op: RemoteOp,
        len: usize,
        data: Option<u64>,
        kind: PendingKind,
    ) -> Result<(), LowerError> {
        if !state.contexts.contains_key(&dest.context) {
            state.push_local(ctx, work.wr_id, work.lane, Err(lower_err(errno::EREMOTEIO)), WireInfo::None);
            return Ok(());
        }
        state.next_token += 1;
        let token = state.next_token;
        state.pending.insert(
            token,
            PendingRemote {
                ctx,
                lane: work.lane,
                wr_id: work.wr_id,
                kind,
            },
        );
        let access = RemoteAccess {
            token: RemoteToken(token),
            lane: dest.vlane,
            op,
            key: target.key,
            addr: target.addr,
            len,
            data,
            source: PeerAddr {
                context: ctx,
                vlane: work.lane,
            },
        };
        if let Some(target_ctx) = state.contexts.get_mut(&dest.context) {
            target_ctx.completions.push_back(RawCompletion::Remote(access));
        }
        Ok(())
    }

    /// Applies a verified remote access and returns the bytes moved.
    fn execute_remote(&self, state: &mut SimState, kind: PendingKind, segs: &[Iov]) -> Result<usize, LowerError> {
        let fault = || lower_err(errno::EFAULT);
        match kind {
            PendingKind::Write { payload } => {
                let placed = self.memory.scatter(segs, &payload).ok_or_else(fault)?;
                state.stats.bytes_received += placed as u64;
                Ok(placed)
            }
            PendingKind::Read { local } => {
                let bytes = self.memory.gather(segs).ok_or_else(fault)?;
                let placed = self.memory.scatter(&local, &bytes).ok_or_else(fault)?;
                state.stats.bytes_sent += placed as u64;
                Ok(placed)
            }
            PendingKind::Atomic {
                op,
                operand,
                compare,
                result,
            } => {
                let bytes = self.memory.gather(segs).ok_or_else(fault)?;
                let old = u64::from_le_bytes(bytes.try_into().map_err(|_| lower_err(errno::EINVAL))?);
                let new = match op {
                    AtomicOp::Sum => old.wrapping_add(operand),
                    AtomicOp::Write => operand,
                    AtomicOp::CompareSwap if compare == Some(old) => operand,
                    AtomicOp::CompareSwap => old,
                };
                self.memory.scatter(segs, &new.to_le_bytes()).ok_or_else(fault)?;
                if let Some(result) = result {
                    if !self.memory.write(result.addr, &old.to_le_bytes()) {
                        return Err(fault());
                    }
                }
                Ok(8)
            }
        }
    }
}

impl LowerTransport for SimFabric {
    fn name(&self) -> &str {
        "sim"
    }

    fn open_context(&self) -> Result<LowerContextId, LowerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(lower_err(errno::FI_EOPBADSTATE));
        }
        if state.contexts.len() >= self.config.max_contexts {
            return Err(lower_err(errno::ENOMEM));
        }
        state.next_ctx += 1;
        let id = state.next_ctx;
        state.contexts.insert(id, SimContext::default());
        debug!(ctx = id, "sim context opened");
        Ok(id)
    }

    fn close_context(&self, ctx: LowerContextId) -> Result<(), LowerError> {
        let mut state = self.state.lock();
        state
            .contexts
            .remove(&ctx)
            .map(|_| ())
            .ok_or_else(|| lower_err(errno::ENOENT))
    }

    fn post(&self, ctx: LowerContextId, work: PostedWork) -> Result<(), LowerError> {
        let mut state = self.state.lock();
        if let Some(code) = state.faults.post.take() {
            return Err(lower_err(code));
        }
        let depth = state
            .contexts
            .get(&ctx)
            .map(SimContext::depth)
            .ok_or_else(|| lower_err(errno::ENOENT))?;
        if depth >= self.config.max_queue_depth {
            return Err(lower_err(errno::EAGAIN));
        }
        let source = PeerAddr {
            context: ctx,
            vlane: work.lane,
        };
        match &work.op {
            PostedOp::Send { dest, iov, tag, data } => {
                if self.config.variant == VariantKind::TagMatch && tag.is_some() && data.is_some() {
                    return Err(lower_err(errno::ENOSYS));
                }
                let payload = self.memory.gather(iov).ok_or_else(|| lower_err(errno::EFAULT))?;
                let len = payload.len();
                if !state.contexts.contains_key(&dest.context) {
                    state.push_local(ctx, work.wr_id, work.lane, Err(lower_err(errno::EREMOTEIO)), WireInfo::None);
                    return Ok(());
                }
                state.stats.bytes_sent += len as u64;
                self.deliver(
                    &mut state,
                    dest.context,
                    InboundMsg {
                        src: source,
                        dst_lane: dest.vlane,
                        payload,
                        tag: *tag,
                        data: *data,
                    },
                );
                state.push_local(ctx, work.wr_id, work.lane, Ok(len), WireInfo::None);
            }
            PostedOp::Recv { iov, src, tag } => {
                self.post_recv(
                    &mut state,
                    ctx,
                    PostedRecv {
                        wr_id: work.wr_id,
                        lane: work.lane,
                        iov: iov.clone(),
                        src: *src,
                        tag: *tag,
                    },
                );
            }
            PostedOp::Write {
                dest,
                iov,
                target,
                data,
            } => {
                let payload = self.memory.gather(iov).ok_or_else(|| lower_err(errno::EFAULT))?;
                state.stats.bytes_sent += payload.len() as u64;
                self.request_remote(
                    &mut state,
                    ctx,
                    &work,
                    *dest,
                    *target,
                    RemoteOp::Write,
                    payload.len(),
                    *data,
                    PendingKind::Write { payload },
                )?;
            }
            PostedOp::Read { src, iov, target } => {
                if iov.iter().any(|seg| !self.memory.contains(seg.addr, seg.len)) {
                    return Err(lower_err(errno::EFAULT));
                }
                self.request_remote(
                    &mut state,
                    ctx,
                    &work,
                    *src,
                    *target,
                    RemoteOp::Read,
                    iov_len(iov),
                    None,
                    PendingKind::Read { local: iov.clone() },
                )?;
            }
            PostedOp::Atomic {
                dest,
                op,
                operand,
                compare,
                result,
                target,
            } => {
                let read = |seg: &Iov| {
                    if seg.len != 8 {
                        return Err(lower_err(errno::EINVAL));
                    }
                    self.memory.read_u64(seg.addr).ok_or_else(|| lower_err(errno::EFAULT))
                };
                let operand = read(operand)?;
                let compare = compare.as_ref().map(read).transpose()?;
                self.request_remote(
                    &mut state,
                    ctx,
                    &work,
                    *dest,
                    *target,
                    RemoteOp::Atomic {
                        fetch: result.is_some(),
                    },
                    8,
                    None,
                    PendingKind::Atomic {
                        op: *op,
                        operand,
                        compare,
                        result: *result,
                    },
                )?;
            }
            PostedOp::Respond { token, status } => {
                let pending = state
                    .pending
                    .remove(&token.0)
                    .ok_or_else(|| lower_err(errno::EINVAL))?;
                let outcome = match status {
                    Ok(segs) => self.execute_remote(&mut state, pending.kind, segs),
                    Err(e) => Err(*e),
                };
                state.push_local(ctx, work.wr_id, work.lane, Ok(0), WireInfo::None);
                state.push_local(pending.ctx, pending.wr_id, pending.lane, outcome, WireInfo::None);
            }
        }
        Ok(())
    }

    fn poll(&self, ctx: LowerContextId, max: usize) -> Vec<RawCompletion> {
        let mut state = self.state.lock();
        let Some(sim_ctx) = state.contexts.get_mut(&ctx) else {
            return Vec::new();
        };
        let take = max.min(sim_ctx.completions.len());
        sim_ctx.completions.drain(..take).collect()
    }

    fn register(&self, iov: Iov, access: OpFlags) -> Result<LowerRegion, LowerError> {
        let mut state = self.state.lock();
        if let Some((left, code)) = state.faults.registration {
            if left == 0 {
                state.faults.registration = None;
                return Err(lower_err(code));
            }
            state.faults.registration = Some((left - 1, code));
        }
        if !self.memory.contains(iov.addr, iov.len) {
            return Err(lower_err(errno::EFAULT));
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.registrations.insert(handle, (iov, access));
        Ok(LowerRegion {
            handle,
            key: handle | 0x8000_0000,
        })
    }

    fn deregister(&self, region: LowerRegion) -> Result<(), LowerError> {
        let mut state = self.state.lock();
        if let Some(code) = state.faults.deregistration.take() {
            return Err(lower_err(code));
        }
        state
            .registrations
            .remove(&region.handle)
            .map(|_| ())
            .ok_or_else(|| lower_err(errno::ENOENT))
    }

    fn close(&self) -> Result<(), LowerError> {
        let mut state = self.state.lock();
        state.closed = true;
        if !state.contexts.is_empty() {
            return Err(lower_err(errno::EBUSY));
        }
        Ok(())
    }
}
