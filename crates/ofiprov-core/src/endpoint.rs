//! Endpoints.
//!
//! An endpoint owns one virtual lane of a transport context. Every data
//! operation allocates a transfer entry from the pool of the CQ bound for
//! its direction, encodes the work for the lower transport and posts it.
//! The entry is returned to the pool when the progress engine reports its
//! completion, or immediately if the post fails.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::av::{AddressVector, FiAddr, FI_ADDR_UNSPEC};
use crate::cntr::Counter;
use crate::context::TransportContext;
use crate::cq::CompletionQueue;
use crate::domain::DomainShared;
use crate::error::{ProviderError, ProviderResult};
use crate::flags::{CntrSlot, OpClass, OpFlags, XferCtrl};
use crate::lower::{
    iov_len, AtomicOp, Iov, LowerError, PeerAddr, PostedOp, PostedWork, RemoteToken, RmaTarget,
};
use crate::mr::MrKey;
use crate::trigger::{Trigger, TriggeredOp};
use crate::vlane;
use crate::xfer::{Direction, XferEntry, XferId};

/// Arguments of a message send or receive.
#[derive(Debug, Clone, Default)]
pub struct MsgArgs {
    /// Payload segments.
    pub iov: Vec<Iov>,
    /// Registration of the payload, required in `mr_local` domains.
    pub desc: Option<MrKey>,
    /// Destination, or source filter for receives.
    pub addr: FiAddr,
    /// Operation context returned in the completion.
    pub context: u64,
    /// Remote CQ data.
    pub data: Option<u64>,
    /// Per-operation flags.
    pub flags: OpFlags,
}

/// Arguments of a tagged send or receive.
#[derive(Debug, Clone, Default)]
pub struct TaggedArgs {
    /// Payload segments.
    pub iov: Vec<Iov>,
    /// Registration of the payload.
    pub desc: Option<MrKey>,
    /// Destination, or source filter for receives.
    pub addr: FiAddr,
    /// Tag to send or match.
    pub tag: u64,
    /// Tag bits ignored when matching a receive.
    pub ignore: u64,
    /// Operation context.
    pub context: u64,
    /// Remote CQ data.
    pub data: Option<u64>,
    /// Per-operation flags.
    pub flags: OpFlags,
}

/// Arguments of an RMA read or write.
#[derive(Debug, Clone, Default)]
pub struct RmaArgs {
    /// Local segments.
    pub iov: Vec<Iov>,
    /// Registration of the local segments.
    pub desc: Option<MrKey>,
    /// Peer owning the remote region.
    pub addr: FiAddr,
    /// Address or offset inside the remote region.
    pub remote_addr: u64,
    /// Remote region key.
    pub key: u64,
    /// Operation context.
    pub context: u64,
    /// Remote CQ data for writes.
    pub data: Option<u64>,
    /// Per-operation flags.
    pub flags: OpFlags,
}

/// Arguments of a 64-bit atomic.
#[derive(Debug, Clone)]
pub struct AtomicArgs {
    /// Operation applied at the target.
    pub op: AtomicOp,
    /// Local operand word.
    pub operand: Iov,
    /// Registration of the operand.
    pub desc: Option<MrKey>,
    /// Compare word for compare-and-swap.
    pub compare: Option<Iov>,
    /// Receives the previous target value for fetching atomics.
    pub result: Option<Iov>,
    /// Target peer.
    pub addr: FiAddr,
    /// Address or offset of the remote word.
    pub remote_addr: u64,
    /// Remote region key.
    pub key: u64,
    /// Operation context.
    pub context: u64,
    /// Per-operation flags.
    pub flags: OpFlags,
}

/// Endpoint open attributes.
#[derive(Debug, Clone, Default)]
pub struct EpAttr {
    /// Flags applied by the short-form transmit calls.
    pub tx_op_flags: OpFlags,
    /// Flags applied by the short-form receive calls.
    pub rx_op_flags: OpFlags,
    /// `RMA_EVENT` makes every remote access produce a completion.
    pub caps: OpFlags,
    /// Opens a lower context for this endpoint alone.
    pub dedicated_context: bool,
    /// Requests a specific virtual lane.
    pub vlane: Option<u8>,
}

#[derive(Clone)]
struct CqBinding {
    cq: Arc<CompletionQueue>,
    selective: bool,
}

#[derive(Default)]
struct Bindings {
    tx: Option<CqBinding>,
    rx: Option<CqBinding>,
    cntrs: [Option<Arc<Counter>>; CntrSlot::COUNT],
    av: Option<Arc<dyn AddressVector>>,
}

/// Everything `issue` needs besides the encoded lower operation.
struct Request<'a> {
    dir: Direction,
    class: OpClass,
    cq_flags: OpFlags,
    iov: &'a [Iov],
    desc: Option<MrKey>,
    local_access: OpFlags,
    context: u64,
    flags: OpFlags,
    /// Never generates a completion, whatever the binding says.
    silent: bool,
}

/// Transmit and receive side of one virtual lane on a transport context.
///
/// Endpoints are opened through [`crate::domain::Domain::endpoint`], bound
/// to an address vector and at least one CQ, then enabled. Every data call
/// allocates a transfer entry from the bound CQ's pool and posts it to the
/// lower transport; progress turns the raw completion back into CQ entries
/// and counter updates.
pub struct Endpoint {
    shared: Arc<DomainShared>,
    ctx: Arc<TransportContext>,
    lane: u8,
    attr: EpAttr,
    bindings: RwLock<Bindings>,
    enabled: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("context", &self.ctx.lower_id())
            .field("lane", &self.lane)
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .finish()
    }
}

impl Endpoint {
    pub(crate) fn new(shared: Arc<DomainShared>, ctx: Arc<TransportContext>, lane: u8, attr: EpAttr) -> Self {
        Self {
            shared,
            ctx,
            lane,
            attr,
            bindings: RwLock::new(Bindings::default()),
            enabled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Virtual lane inside the transport context.
    pub fn lane(&self) -> u8 {
        self.lane
    }

    /// Attributes given at open.
    pub fn attr(&self) -> &EpAttr {
        &self.attr
    }

    /// Capabilities requested at open.
    pub fn caps(&self) -> OpFlags {
        self.attr.caps
    }

    pub(crate) fn context(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    /// Lower address of this endpoint.
    pub fn name(&self) -> PeerAddr {
        PeerAddr {
            context: self.ctx.lower_id(),
            vlane: self.lane,
        }
    }

    /// Fabric address with the lane in the top byte.
    pub fn fi_addr(&self) -> FiAddr {
        vlane::peer_to_addr(self.name())
    }

    /// True once [`Endpoint::enable`] succeeded.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn check_open(&self) -> ProviderResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProviderError::bad_state("endpoint closed"));
        }
        Ok(())
    }

    fn check_ready(&self) -> ProviderResult<()> {
        self.check_open()?;
        if !self.is_enabled() {
            return Err(ProviderError::bad_state("endpoint not enabled"));
        }
        Ok(())
    }

    fn check_unbound_phase(&self) -> ProviderResult<()> {
        self.check_open()?;
        if self.is_enabled() {
            return Err(ProviderError::bad_state("endpoint already enabled"));
        }
        Ok(())
    }

    /// Binds a CQ for transmit (`SEND`) and/or receive (`RECV`)
    /// completions. With `SELECTIVE_COMPLETION` only operations flagged
    /// `COMPLETION` generate entries.
    pub fn bind_cq(&self, cq: Arc<CompletionQueue>, flags: OpFlags) -> ProviderResult<()> {
        self.check_unbound_phase()?;
        if !flags.intersects(OpFlags::SEND | OpFlags::RECV) {
            return Err(ProviderError::invalid("CQ binding needs SEND or RECV"));
        }
        if cq.is_closed() {
            return Err(ProviderError::bad_state("completion queue closed"));
        }
        let binding = CqBinding {
            cq,
            selective: flags.contains(OpFlags::SELECTIVE_COMPLETION),
        };
        let mut guard = self.bindings.write();
        let bindings = &mut *guard;
        for (bit, slot) in [
            (OpFlags::SEND, &mut bindings.tx),
            (OpFlags::RECV, &mut bindings.rx),
        ] {
            if flags.contains(bit) {
                binding.cq.acquire_binding();
                if let Some(old) = slot.replace(binding.clone()) {
                    old.cq.release_binding();
                }
            }
        }
        Ok(())
    }

    /// Binds a counter to every event class named in `flags`.
    pub fn bind_cntr(&self, cntr: Arc<Counter>, flags: OpFlags) -> ProviderResult<()> {
        self.check_unbound_phase()?;
        let slots = CntrSlot::from_bind_flags(flags);
        if slots.is_empty() {
            return Err(ProviderError::invalid("counter binding names no event class"));
        }
        let mut bindings = self.bindings.write();
        for slot in slots {
            cntr.acquire_binding();
            if let Some(old) = bindings.cntrs[slot as usize].replace(cntr.clone()) {
                old.release_binding();
            }
        }
        Ok(())
    }

    /// Binds the address vector used to resolve destinations.
    pub fn bind_av(&self, av: Arc<dyn AddressVector>) -> ProviderResult<()> {
        self.check_unbound_phase()?;
        self.bindings.write().av = Some(av);
        Ok(())
    }

    /// Makes the endpoint usable; needs an address vector and a CQ.
    pub fn enable(&self) -> ProviderResult<()> {
        self.check_open()?;
        {
            let bindings = self.bindings.read();
            if bindings.av.is_none() {
                return Err(ProviderError::bad_state("no address vector bound"));
            }
            if bindings.tx.is_none() && bindings.rx.is_none() {
                return Err(ProviderError::bad_state("no completion queue bound"));
            }
        }
        self.enabled.store(true, Ordering::Release);
        debug!(context = self.ctx.lower_id(), lane = self.lane, "endpoint enabled");
        Ok(())
    }

    /// CQ bound for `dir`.
    pub fn cq(&self, dir: Direction) -> Option<Arc<CompletionQueue>> {
        let bindings = self.bindings.read();
        let binding = match dir {
            Direction::Tx => &bindings.tx,
            Direction::Rx => &bindings.rx,
        };
        binding.as_ref().map(|b| b.cq.clone())
    }

    /// Counter bound to an event class.
    pub fn counter(&self, slot: CntrSlot) -> Option<Arc<Counter>> {
        self.bindings.read().cntrs[slot as usize].clone()
    }

    fn cq_binding(&self, dir: Direction) -> ProviderResult<CqBinding> {
        let bindings = self.bindings.read();
        let binding = match dir {
            Direction::Tx => &bindings.tx,
            Direction::Rx => &bindings.rx,
        };
        binding
            .clone()
            .ok_or_else(|| ProviderError::bad_state(format!("no {:?} completion queue bound", dir)))
    }

    fn peer(&self, addr: FiAddr) -> ProviderResult<PeerAddr> {
        let av = self
            .bindings
            .read()
            .av
            .clone()
            .ok_or_else(|| ProviderError::bad_state("no address vector bound"))?;
        av.lookup(addr)
            .ok_or_else(|| ProviderError::invalid(format!("address 0x{:X} not in address vector", addr)))
    }

    fn source_filter(&self, addr: FiAddr) -> ProviderResult<Option<PeerAddr>> {
        if addr == FI_ADDR_UNSPEC {
            Ok(None)
        } else {
            self.peer(addr).map(Some)
        }
    }

    fn reject_trigger(flags: OpFlags) -> ProviderResult<()> {
        if flags.contains(OpFlags::TRIGGER) {
            return Err(ProviderError::invalid(
                "triggered operations are registered with Endpoint::trigger",
            ));
        }
        Ok(())
    }

    /// Allocates the transfer entry and posts `op`.
    fn issue(&self, req: Request<'_>, op: PostedOp) -> ProviderResult<()> {
        self.check_ready()?;
        let binding = self.cq_binding(req.dir)?;
        let len = iov_len(req.iov);
        let inject = req.flags.contains(OpFlags::INJECT);
        if inject && len > self.shared.config.inject_size {
            return Err(ProviderError::MessageTooLong {
                len,
                max: self.shared.config.inject_size,
            });
        }
        match req.desc {
            Some(key) => self.shared.registry.verify_local(key, req.iov, req.local_access)?,
            None if self.shared.mr_local && !inject && len > 0 => {
                return Err(ProviderError::invalid("local memory descriptor required"));
            }
            None => {}
        }

        let mut cq_flags = req.cq_flags;
        if !req.silent && (!binding.selective || req.flags.contains(OpFlags::COMPLETION)) {
            cq_flags.insert(OpFlags::COMPLETION);
        }
        let mut entry = XferEntry::new(req.class, cq_flags, req.context);
        entry.lane = self.lane;
        entry.posted_len = len;
        if inject {
            entry.ctrl = XferCtrl::INJECT_OP;
        }

        let pool = binding.cq.pool();
        let id = pool.alloc(entry, req.dir)?;
        let work = PostedWork {
            wr_id: id.to_wr_id(),
            lane: self.lane,
            op,
        };
        if let Err(e) = self.shared.lower.post(self.ctx.lower_id(), work) {
            pool.take(id);
            debug!(lane = self.lane, error = %e, "lower post failed");
            return Err(e.into());
        }
        self.shared.metrics.inc_ops_posted();
        Ok(())
    }

    /// Sends one buffer.
    pub fn send(&self, buf: Iov, desc: Option<MrKey>, dest: FiAddr, context: u64) -> ProviderResult<()> {
        self.sendmsg(MsgArgs {
            iov: vec![buf],
            desc,
            addr: dest,
            context,
            data: None,
            flags: self.attr.tx_op_flags,
        })
    }

    /// Sends a segment list.
    pub fn sendv(&self, iov: &[Iov], desc: Option<MrKey>, dest: FiAddr, context: u64) -> ProviderResult<()> {
        self.sendmsg(MsgArgs {
            iov: iov.to_vec(),
            desc,
            addr: dest,
            context,
            data: None,
            flags: self.attr.tx_op_flags,
        })
    }

    /// Send carrying remote CQ data.
    pub fn senddata(
        &self,
        buf: Iov,
        desc: Option<MrKey>,
        data: u64,
        dest: FiAddr,
        context: u64,
    ) -> ProviderResult<()> {
        self.sendmsg(MsgArgs {
            iov: vec![buf],
            desc,
            addr: dest,
            context,
            data: Some(data),
            flags: self.attr.tx_op_flags | OpFlags::REMOTE_CQ_DATA,
        })
    }

    /// Sends with explicit flags.
    pub fn sendmsg(&self, msg: MsgArgs) -> ProviderResult<()> {
        Self::reject_trigger(msg.flags)?;
        self.post_send(msg, None, false)
    }

    /// Buffered send that never generates a completion.
    pub fn inject(&self, buf: Iov, dest: FiAddr) -> ProviderResult<()> {
        self.post_send(
            MsgArgs {
                iov: vec![buf],
                addr: dest,
                flags: OpFlags::INJECT,
                ..Default::default()
            },
            None,
            true,
        )
    }

    /// Injects a buffer with remote CQ data.
    pub fn injectdata(&self, buf: Iov, data: u64, dest: FiAddr) -> ProviderResult<()> {
        self.post_send(
            MsgArgs {
                iov: vec![buf],
                addr: dest,
                data: Some(data),
                flags: OpFlags::INJECT | OpFlags::REMOTE_CQ_DATA,
                ..Default::default()
            },
            None,
            true,
        )
    }

    fn post_send(&self, msg: MsgArgs, tag: Option<u64>, silent: bool) -> ProviderResult<()> {
        let dest = self.peer(msg.addr)?;
        let cq_flags = match tag {
            Some(_) => OpFlags::TAGGED | OpFlags::SEND,
            None => OpClass::Send.cq_flags(),
        };
        let data = if msg.flags.contains(OpFlags::REMOTE_CQ_DATA) {
            msg.data
        } else {
            None
        };
        let op = PostedOp::Send {
            dest,
            iov: msg.iov.clone(),
            tag,
            data,
        };
        self.issue(
            Request {
                dir: Direction::Tx,
                class: OpClass::Send,
                cq_flags,
                iov: &msg.iov,
                desc: msg.desc,
                local_access: OpFlags::SEND,
                context: msg.context,
                flags: msg.flags,
                silent,
            },
            op,
        )
    }

    /// Posts one receive buffer.
    pub fn recv(&self, buf: Iov, desc: Option<MrKey>, src: FiAddr, context: u64) -> ProviderResult<()> {
        self.recvmsg(MsgArgs {
            iov: vec![buf],
            desc,
            addr: src,
            context,
            data: None,
            flags: self.attr.rx_op_flags,
        })
    }

    /// Posts a receive segment list.
    pub fn recvv(&self, iov: &[Iov], desc: Option<MrKey>, src: FiAddr, context: u64) -> ProviderResult<()> {
        self.recvmsg(MsgArgs {
            iov: iov.to_vec(),
            desc,
            addr: src,
            context,
            data: None,
            flags: self.attr.rx_op_flags,
        })
    }

    /// Posts a receive with explicit flags.
    pub fn recvmsg(&self, msg: MsgArgs) -> ProviderResult<()> {
        Self::reject_trigger(msg.flags)?;
        self.post_recv(msg.iov, msg.desc, msg.addr, None, msg.context, msg.flags)
    }

    fn post_recv(
        &self,
        iov: Vec<Iov>,
        desc: Option<MrKey>,
        src: FiAddr,
        tag: Option<(u64, u64)>,
        context: u64,
        flags: OpFlags,
    ) -> ProviderResult<()> {
        let src = self.source_filter(src)?;
        let cq_flags = match tag {
            Some(_) => OpFlags::TAGGED | OpFlags::RECV,
            None => OpClass::Recv.cq_flags(),
        };
        let op = PostedOp::Recv {
            iov: iov.clone(),
            src,
            tag,
        };
        self.issue(
            Request {
                dir: Direction::Rx,
                class: OpClass::Recv,
                cq_flags,
                iov: &iov,
                desc,
                local_access: OpFlags::RECV,
                context,
                flags: flags.without(OpFlags::INJECT),
                silent: false,
            },
            op,
        )
    }

    /// Tagged send of one buffer.
    pub fn tsend(
        &self,
        buf: Iov,
        desc: Option<MrKey>,
        dest: FiAddr,
        tag: u64,
        context: u64,
    ) -> ProviderResult<()> {
        self.tsendmsg(TaggedArgs {
            iov: vec![buf],
            desc,
            addr: dest,
            tag,
            context,
            flags: self.attr.tx_op_flags,
            ..Default::default()
        })
    }

    /// Tagged send of a segment list.
    pub fn tsendv(
        &self,
        iov: &[Iov],
        desc: Option<MrKey>,
        dest: FiAddr,
        tag: u64,
        context: u64,
    ) -> ProviderResult<()> {
        self.tsendmsg(TaggedArgs {
            iov: iov.to_vec(),
            desc,
            addr: dest,
            tag,
            context,
            flags: self.attr.tx_op_flags,
            ..Default::default()
        })
    }

    /// Tagged send with remote CQ data.
    pub fn tsenddata(
        &self,
        buf: Iov,
        desc: Option<MrKey>,
        data: u64,
        dest: FiAddr,
        tag: u64,
        context: u64,
    ) -> ProviderResult<()> {
        self.tsendmsg(TaggedArgs {
            iov: vec![buf],
            desc,
            addr: dest,
            tag,
            context,
            data: Some(data),
            flags: self.attr.tx_op_flags | OpFlags::REMOTE_CQ_DATA,
            ..Default::default()
        })
    }

    /// Tagged send with explicit flags.
    pub fn tsendmsg(&self, msg: TaggedArgs) -> ProviderResult<()> {
        Self::reject_trigger(msg.flags)?;
        let tag = msg.tag;
        self.post_send(tagged_as_msg(msg), Some(tag), false)
    }

    /// Tagged inject; never completes.
    pub fn tinject(&self, buf: Iov, dest: FiAddr, tag: u64) -> ProviderResult<()> {
        self.post_send(
            MsgArgs {
                iov: vec![buf],
                addr: dest,
                flags: OpFlags::INJECT,
                ..Default::default()
            },
            Some(tag),
            true,
        )
    }

    /// Posts a tagged receive; bits set in `ignore` are not compared.
    pub fn trecv(
        &self,
        buf: Iov,
        desc: Option<MrKey>,
        src: FiAddr,
        tag: u64,
        ignore: u64,
        context: u64,
    ) -> ProviderResult<()> {
        self.trecvmsg(TaggedArgs {
            iov: vec![buf],
            desc,
            addr: src,
            tag,
            ignore,
            context,
            flags: self.attr.rx_op_flags,
            ..Default::default()
        })
    }

    /// Tagged receive with explicit flags.
    pub fn trecvmsg(&self, msg: TaggedArgs) -> ProviderResult<()> {
        Self::reject_trigger(msg.flags)?;
        self.post_recv(
            msg.iov,
            msg.desc,
            msg.addr,
            Some((msg.tag, msg.ignore)),
            msg.context,
            msg.flags,
        )
    }

    /// RMA write of one buffer.
    pub fn write(
        &self,
        buf: Iov,
        desc: Option<MrKey>,
        dest: FiAddr,
        remote_addr: u64,
        key: u64,
        context: u64,
    ) -> ProviderResult<()> {
        self.writemsg(RmaArgs {
            iov: vec![buf],
            desc,
            addr: dest,
            remote_addr,
            key,
            context,
            data: None,
            flags: self.attr.tx_op_flags,
        })
    }

    /// RMA write of a segment list.
    pub fn writev(
        &self,
        iov: &[Iov],
        desc: Option<MrKey>,
        dest: FiAddr,
        remote_addr: u64,
        key: u64,
        context: u64,
    ) -> ProviderResult<()> {
        self.writemsg(RmaArgs {
            iov: iov.to_vec(),
            desc,
            addr: dest,
            remote_addr,
            key,
            context,
            data: None,
            flags: self.attr.tx_op_flags,
        })
    }

    /// Write that also delivers `data` to the target's CQ.
    #[allow(clippy::too_many_arguments)]
    pub fn writedata(
        &self,
        buf: Iov,
        desc: Option<MrKey>,
        data: u64,
        dest: FiAddr,
        remote_addr: u64,
        key: u64,
        context: u64,
    ) -> ProviderResult<()> {
        self.writemsg(RmaArgs {
            iov: vec![buf],
            desc,
            addr: dest,
            remote_addr,
            key,
            context,
            data: Some(data),
            flags: self.attr.tx_op_flags | OpFlags::REMOTE_CQ_DATA,
        })
    }

    /// RMA write of a small buffer that never completes.
    pub fn inject_write(&self, buf: Iov, dest: FiAddr, remote_addr: u64, key: u64) -> ProviderResult<()> {
        self.post_write(
            RmaArgs {
                iov: vec![buf],
                addr: dest,
                remote_addr,
                key,
                flags: OpFlags::INJECT,
                ..Default::default()
            },
            true,
        )
    }

    /// RMA write with explicit flags.
    pub fn writemsg(&self, msg: RmaArgs) -> ProviderResult<()> {
        Self::reject_trigger(msg.flags)?;
        self.post_write(msg, false)
    }

    fn post_write(&self, msg: RmaArgs, silent: bool) -> ProviderResult<()> {
        let dest = self.peer(msg.addr)?;
        let data = if msg.flags.contains(OpFlags::REMOTE_CQ_DATA) {
            msg.data
        } else {
            None
        };
        let op = PostedOp::Write {
            dest,
            iov: msg.iov.clone(),
            target: RmaTarget {
                addr: msg.remote_addr,
                key: msg.key,
            },
            data,
        };
        self.issue(
            Request {
                dir: Direction::Tx,
                class: OpClass::Write,
                cq_flags: OpClass::Write.cq_flags(),
                iov: &msg.iov,
                desc: msg.desc,
                local_access: OpFlags::WRITE,
                context: msg.context,
                flags: msg.flags,
                silent,
            },
            op,
        )
    }

    /// RMA read into one buffer.
    pub fn read(
        &self,
        buf: Iov,
        desc: Option<MrKey>,
        src: FiAddr,
        remote_addr: u64,
        key: u64,
        context: u64,
    ) -> ProviderResult<()> {
        self.readmsg(RmaArgs {
            iov: vec![buf],
            desc,
            addr: src,
            remote_addr,
            key,
            context,
            data: None,
            flags: self.attr.tx_op_flags,
        })
    }

    /// RMA read into a segment list.
    pub fn readv(
        &self,
        iov: &[Iov],
        desc: Option<MrKey>,
        src: FiAddr,
        remote_addr: u64,
        key: u64,
        context: u64,
    ) -> ProviderResult<()> {
        self.readmsg(RmaArgs {
            iov: iov.to_vec(),
            desc,
            addr: src,
            remote_addr,
            key,
            context,
            data: None,
            flags: self.attr.tx_op_flags,
        })
    }

    /// RMA read with explicit flags.
    pub fn readmsg(&self, msg: RmaArgs) -> ProviderResult<()> {
        Self::reject_trigger(msg.flags)?;
        if msg.flags.contains(OpFlags::INJECT) {
            return Err(ProviderError::invalid("reads cannot be injected"));
        }
        let src = self.peer(msg.addr)?;
        let op = PostedOp::Read {
            src,
            iov: msg.iov.clone(),
            target: RmaTarget {
                addr: msg.remote_addr,
                key: msg.key,
            },
        };
        self.issue(
            Request {
                dir: Direction::Tx,
                class: OpClass::Read,
                cq_flags: OpClass::Read.cq_flags(),
                iov: &msg.iov,
                desc: msg.desc,
                local_access: OpFlags::READ,
                context: msg.context,
                flags: msg.flags,
                silent: false,
            },
            op,
        )
    }

    /// Non-fetching atomic update of the target word.
    pub fn atomic(&self, args: AtomicArgs) -> ProviderResult<()> {
        Self::reject_trigger(args.flags)?;
        if args.result.is_some() || args.op == AtomicOp::CompareSwap {
            return Err(ProviderError::invalid("use fetch_atomic or compare_atomic"));
        }
        self.post_atomic(args)
    }

    /// Atomic update returning the previous value in `result`.
    pub fn fetch_atomic(&self, args: AtomicArgs) -> ProviderResult<()> {
        Self::reject_trigger(args.flags)?;
        if args.result.is_none() {
            return Err(ProviderError::invalid("fetching atomic needs a result buffer"));
        }
        if args.op == AtomicOp::CompareSwap {
            return Err(ProviderError::invalid("use compare_atomic for compare-swap"));
        }
        self.post_atomic(args)
    }

    /// Compare-and-swap returning the previous value in `result`.
    pub fn compare_atomic(&self, args: AtomicArgs) -> ProviderResult<()> {
        Self::reject_trigger(args.flags)?;
        if args.op != AtomicOp::CompareSwap || args.compare.is_none() || args.result.is_none() {
            return Err(ProviderError::invalid(
                "compare atomic needs CompareSwap with compare and result buffers",
            ));
        }
        self.post_atomic(args)
    }

    fn post_atomic(&self, args: AtomicArgs) -> ProviderResult<()> {
        let words = [Some(args.operand), args.compare, args.result];
        if words.iter().flatten().any(|seg| seg.len != 8) {
            return Err(ProviderError::invalid("atomics operate on 8-byte words"));
        }
        if args.flags.contains(OpFlags::INJECT) && args.result.is_some() {
            return Err(ProviderError::invalid("fetching atomics cannot be injected"));
        }
        let dest = self.peer(args.addr)?;
        let cq_flags = if args.result.is_some() {
            OpFlags::ATOMIC | OpFlags::READ
        } else {
            OpFlags::ATOMIC | OpFlags::WRITE
        };
        let op = PostedOp::Atomic {
            dest,
            op: args.op,
            operand: args.operand,
            compare: args.compare,
            result: args.result,
            target: RmaTarget {
                addr: args.remote_addr,
                key: args.key,
            },
        };
        self.issue(
            Request {
                dir: Direction::Tx,
                class: OpClass::Atomic,
                cq_flags,
                iov: std::slice::from_ref(&args.operand),
                desc: args.desc,
                local_access: OpFlags::WRITE,
                context: args.context,
                flags: args.flags,
                silent: false,
            },
            op,
        )
    }

    /// Defers `op` until `cntr` reaches `threshold`.
    pub fn trigger(self: &Arc<Self>, cntr: &Counter, threshold: u64, op: TriggeredOp) -> ProviderResult<()> {
        self.check_ready()?;
        cntr.add_trigger(Trigger::new(self.clone(), op, threshold))
    }

    /// Issues a triggered operation through the regular entry points.
    pub(crate) fn submit(&self, op: TriggeredOp) -> ProviderResult<()> {
        match op {
            TriggeredOp::Send(mut a) | TriggeredOp::SendV(mut a) => {
                a.flags.remove(OpFlags::TRIGGER);
                self.sendmsg(a)
            }
            TriggeredOp::Recv(mut a) => {
                a.flags.remove(OpFlags::TRIGGER);
                self.recvmsg(a)
            }
            TriggeredOp::TSend(mut a) | TriggeredOp::TSendV(mut a) => {
                a.flags.remove(OpFlags::TRIGGER);
                self.tsendmsg(a)
            }
            TriggeredOp::TRecv(mut a) => {
                a.flags.remove(OpFlags::TRIGGER);
                self.trecvmsg(a)
            }
            TriggeredOp::Write(mut a) | TriggeredOp::WriteV(mut a) => {
                a.flags.remove(OpFlags::TRIGGER);
                self.writemsg(a)
            }
            TriggeredOp::Read(mut a) | TriggeredOp::ReadV(mut a) => {
                a.flags.remove(OpFlags::TRIGGER);
                self.readmsg(a)
            }
            TriggeredOp::AtomicWrite(mut a) | TriggeredOp::AtomicWriteV(mut a) => {
                a.flags.remove(OpFlags::TRIGGER);
                self.atomic(a)
            }
            TriggeredOp::AtomicReadWrite(mut a) | TriggeredOp::AtomicReadWriteV(mut a) => {
                a.flags.remove(OpFlags::TRIGGER);
                self.fetch_atomic(a)
            }
            TriggeredOp::AtomicCompWrite(mut a) | TriggeredOp::AtomicCompWriteV(mut a) => {
                a.flags.remove(OpFlags::TRIGGER);
                self.compare_atomic(a)
            }
        }
    }

    /// Answers a verified (or rejected) remote access. The response is an
    /// internal transfer: it never reaches a CQ or counter.
    pub(crate) fn respond(&self, token: RemoteToken, status: Result<Vec<Iov>, LowerError>) {
        let mut entry = XferEntry::new(OpClass::RemoteWrite, OpClass::RemoteWrite.cq_flags(), 0);
        entry.ctrl = XferCtrl::INTERNAL;
        entry.lane = self.lane;
        let tracked = self.cq(Direction::Rx).and_then(|cq| {
            let id = cq.pool().alloc(entry, Direction::Rx).ok()?;
            Some((cq, id))
        });
        let wr_id = tracked
            .as_ref()
            .map_or(XferId::UNTRACKED, |(_, id)| id.to_wr_id());
        let work = PostedWork {
            wr_id,
            lane: self.lane,
            op: PostedOp::Respond { token, status },
        };
        if let Err(e) = self.shared.lower.post(self.ctx.lower_id(), work) {
            warn!(lane = self.lane, error = %e, "unable to answer remote access");
            if let Some((cq, id)) = tracked {
                cq.pool().take(id);
            }
        }
    }

    /// Releases every binding. In-flight completions for this lane are
    /// dropped by the progress engine afterwards.
    pub(crate) fn close(&self) -> ProviderResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ProviderError::bad_state("endpoint already closed"));
        }
        self.enabled.store(false, Ordering::Release);
        let mut bindings = self.bindings.write();
        for binding in [bindings.tx.take(), bindings.rx.take()].into_iter().flatten() {
            binding.cq.release_binding();
        }
        for cntr in bindings.cntrs.iter_mut().filter_map(Option::take) {
            cntr.release_binding();
        }
        bindings.av = None;
        debug!(context = self.ctx.lower_id(), lane = self.lane, "endpoint closed");
        Ok(())
    }
}

fn tagged_as_msg(msg: TaggedArgs) -> MsgArgs {
    MsgArgs {
        iov: msg.iov,
        desc: msg.desc,
        addr: msg.addr,
        context: msg.context,
        data: msg.data,
        flags: msg.flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::MapAv;
    use crate::config::ProviderConfig;
    use crate::cq::CqAttr;
    use crate::domain::{Domain, DomainAttr};
    use crate::sim::{SimFabric, SimFabricConfig};

    fn open(attr: DomainAttr) -> (Arc<SimFabric>, Domain) {
        let sim = Arc::new(SimFabric::new(SimFabricConfig::default()));
        let domain = Domain::open(ProviderConfig::default(), attr, sim.clone()).unwrap();
        (sim, domain)
    }

    #[test]
    fn test_enable_requires_av_and_cq() {
        let (_sim, domain) = open(DomainAttr::default());
        let ep = domain.ep(domain.endpoint(EpAttr::default()).unwrap()).unwrap();
        assert!(matches!(ep.enable(), Err(ProviderError::BadState { .. })));
        ep.bind_av(Arc::new(MapAv)).unwrap();
        assert!(matches!(ep.enable(), Err(ProviderError::BadState { .. })));

        let cq = domain.cq(domain.cq_open(CqAttr::default()).unwrap()).unwrap();
        assert!(matches!(
            ep.bind_cq(cq.clone(), OpFlags::empty()),
            Err(ProviderError::InvalidArgument { .. })
        ));
        ep.bind_cq(cq.clone(), OpFlags::SEND).unwrap();
        ep.enable().unwrap();
        assert!(ep.cq(Direction::Tx).is_some());
        assert!(ep.cq(Direction::Rx).is_none());
        assert!(matches!(
            ep.bind_cq(cq, OpFlags::RECV),
            Err(ProviderError::BadState { .. })
        ));
    }

    #[test]
    fn test_operations_need_enabled_endpoint_and_bound_queue() {
        let (sim, domain) = open(DomainAttr::default());
        let ep = domain.ep(domain.endpoint(EpAttr::default()).unwrap()).unwrap();
        let buf = sim.memory().alloc(8);
        assert!(matches!(
            ep.send(Iov::new(buf, 8), None, 0, 0),
            Err(ProviderError::BadState { .. })
        ));

        let cq = domain.cq(domain.cq_open(CqAttr::default()).unwrap()).unwrap();
        ep.bind_cq(cq, OpFlags::SEND).unwrap();
        ep.bind_av(Arc::new(MapAv)).unwrap();
        ep.enable().unwrap();
        assert!(matches!(
            ep.recv(Iov::new(buf, 8), None, FI_ADDR_UNSPEC, 0),
            Err(ProviderError::BadState { .. })
        ));
        ep.send(Iov::new(buf, 8), None, ep.fi_addr(), 0).unwrap();
    }

    #[test]
    fn test_local_descriptor_checks() {
        let (sim, domain) = open(DomainAttr {
            mr_local: true,
            ..Default::default()
        });
        let ep = domain.ep(domain.endpoint(EpAttr::default()).unwrap()).unwrap();
        let cq = domain.cq(domain.cq_open(CqAttr::default()).unwrap()).unwrap();
        ep.bind_cq(cq.clone(), OpFlags::SEND | OpFlags::RECV).unwrap();
        ep.bind_av(Arc::new(MapAv)).unwrap();
        ep.enable().unwrap();

        let buf = sim.memory().alloc(16);
        let dest = ep.fi_addr();
        assert!(matches!(
            ep.send(Iov::new(buf, 8), None, dest, 0),
            Err(ProviderError::InvalidArgument { .. })
        ));
        let recv_only = domain.mr_reg(Iov::new(buf, 16), OpFlags::RECV, 0, 0).unwrap();
        assert!(matches!(
            ep.send(Iov::new(buf, 8), Some(recv_only.key()), dest, 0),
            Err(ProviderError::AccessDenied { .. })
        ));
        let region = domain
            .mr_reg(Iov::new(buf, 16), OpFlags::SEND | OpFlags::RECV, 0, 0)
            .unwrap();
        assert!(matches!(
            ep.send(Iov::new(buf + 8, 16), Some(region.key()), dest, 0),
            Err(ProviderError::AccessDenied { .. })
        ));
        ep.send(Iov::new(buf, 8), Some(region.key()), dest, 0).unwrap();
        ep.inject(Iov::new(buf, 8), dest).unwrap();
        assert_eq!(cq.pool().in_use(), 2);
    }

    #[test]
    fn test_close_releases_bindings() {
        let (_sim, domain) = open(DomainAttr::default());
        let handle = domain.endpoint(EpAttr::default()).unwrap();
        let ep = domain.ep(handle).unwrap();
        let cq = domain.cq(domain.cq_open(CqAttr::default()).unwrap()).unwrap();
        let cntr = domain
            .cntr(domain.cntr_open(crate::cntr::CntrAttr::default()).unwrap())
            .unwrap();
        ep.bind_cq(cq.clone(), OpFlags::SEND | OpFlags::RECV).unwrap();
        ep.bind_cntr(cntr.clone(), OpFlags::SEND | OpFlags::WRITE).unwrap();
        assert_eq!(cq.bindings(), 2);
        assert_eq!(cntr.bindings(), 2);

        domain.ep_close(handle).unwrap();
        assert_eq!(cq.bindings(), 0);
        assert_eq!(cntr.bindings(), 0);
        assert!(matches!(ep.close(), Err(ProviderError::BadState { .. })));
    }
}
