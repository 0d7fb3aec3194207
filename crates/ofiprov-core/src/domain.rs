//! Domains: the root object owning contexts, queues, counters, endpoints
//! and memory regions.
//!
//! Objects are kept in generation-checked arenas and named by handles.
//! Every open object holds a domain reference; closing the domain while
//! any remain fails with `Busy`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::arena::{Arena, Handle};
use crate::av::{AddressVector, FiAddr};
use crate::cntr::{CntrAttr, Counter};
use crate::config::ProviderConfig;
use crate::context::TransportContext;
use crate::cq::{CompletionQueue, CqAttr};
use crate::endpoint::{EpAttr, Endpoint};
use crate::error::{ProviderError, ProviderResult};
use crate::flags::OpFlags;
use crate::lock::LockPolicy;
use crate::lower::{Iov, LowerTransport};
use crate::metrics::{MetricsSnapshot, ProviderMetrics};
use crate::mr::{MemoryRegion, MrAddressing, MrAttr, MrKey, MrRegistry};
use crate::progress::{ProgressEngine, ProgressHook};
use crate::variant::{variant_for, TransportVariant};

/// Handle of an open completion queue.
pub type CqHandle = Handle<CompletionQueue>;
/// Handle of an open counter.
pub type CntrHandle = Handle<Counter>;
/// Handle of an open endpoint.
pub type EpHandle = Handle<Endpoint>;

/// Domain open attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainAttr {
    /// Name used in logs.
    pub name: String,
    /// Bounds each CQ's transfer pool by the CQ size so that posting
    /// fails with `Again` instead of overrunning the queue.
    pub resource_mgmt: bool,
    /// How remote addresses name bytes of a region.
    pub mr_addressing: MrAddressing,
    /// Data operations must carry a local memory descriptor.
    pub mr_local: bool,
}

impl Default for DomainAttr {
    fn default() -> Self {
        Self {
            name: "ofiprov".to_string(),
            resource_mgmt: true,
            mr_addressing: MrAddressing::Offset,
            mr_local: false,
        }
    }
}

/// State shared by the domain, its endpoints and the progress engine.
pub(crate) struct DomainShared {
    pub(crate) config: ProviderConfig,
    pub(crate) policy: LockPolicy,
    pub(crate) variant: Arc<dyn TransportVariant>,
    pub(crate) lower: Arc<dyn LowerTransport>,
    pub(crate) registry: MrRegistry,
    pub(crate) contexts: RwLock<Vec<Arc<TransportContext>>>,
    pub(crate) metrics: Arc<ProviderMetrics>,
    pub(crate) resource_mgmt: bool,
    pub(crate) mr_local: bool,
}

impl DomainShared {
    fn base_context(&self) -> ProviderResult<Arc<TransportContext>> {
        self.contexts
            .read()
            .first()
            .cloned()
            .ok_or_else(|| ProviderError::bad_state("domain has no transport context"))
    }
}

/// Resource domain over one lower transport.
///
/// Owns the CQs, counters and endpoints opened from it, the memory
/// region registry and the progress engine. Objects are closed
/// individually; the domain itself closes only once none remain.
pub struct Domain {
    attr: DomainAttr,
    shared: Arc<DomainShared>,
    engine: Arc<ProgressEngine>,
    cqs: RwLock<Arena<CompletionQueue>>,
    cntrs: RwLock<Arena<Counter>>,
    eps: RwLock<Arena<Endpoint>>,
    refs: AtomicUsize,
    closed: AtomicBool,
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("attr", &self.attr)
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish()
    }
}

impl Domain {
    /// Opens a domain over `lower` and, in auto mode, starts its progress
    /// thread.
    pub fn open(config: ProviderConfig, attr: DomainAttr, lower: Arc<dyn LowerTransport>) -> ProviderResult<Self> {
        config.validate()?;
        let config = config.effective();
        let ctx_id = lower.open_context().map_err(|e| {
            warn!(lower = lower.name(), error = %e, "unable to open lower context");
            ProviderError::from(e)
        })?;
        let policy = LockPolicy::new(config.lock_level);
        let metrics = Arc::new(ProviderMetrics::new());
        let variant = variant_for(config.variant);
        let registry = MrRegistry::new(
            lower.clone(),
            variant.clone(),
            attr.mr_addressing,
            config.max_mr_size,
            metrics.clone(),
        );
        let shared = Arc::new(DomainShared {
            policy,
            variant,
            lower: lower.clone(),
            registry,
            contexts: RwLock::new(vec![Arc::new(TransportContext::new(ctx_id, policy, false))]),
            metrics,
            resource_mgmt: attr.resource_mgmt,
            mr_local: attr.mr_local,
            config,
        });
        let engine = Arc::new(ProgressEngine::new(shared.clone()));
        if let Err(e) = engine.start() {
            if let Err(close_err) = lower.close_context(ctx_id) {
                warn!(error = %close_err, "unable to close lower context");
            }
            return Err(e);
        }
        info!(
            name = %attr.name,
            lower = lower.name(),
            variant = ?shared.config.variant,
            lock_level = shared.config.lock_level,
            progress = ?shared.config.progress,
            "domain opened"
        );
        Ok(Self {
            attr,
            shared,
            engine,
            cqs: RwLock::new(Arena::new()),
            cntrs: RwLock::new(Arena::new()),
            eps: RwLock::new(Arena::new()),
            refs: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Attributes given at open.
    pub fn attr(&self) -> &DomainAttr {
        &self.attr
    }

    /// Configuration in effect after adjustments made at open.
    pub fn config(&self) -> &ProviderConfig {
        &self.shared.config
    }

    /// Snapshot of provider activity.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Read-only view of registered regions; registration goes through
    /// the `mr_*` calls so the domain keeps count of open regions.
    pub fn registry(&self) -> &MrRegistry {
        &self.shared.registry
    }

    /// Objects (CQs, counters, endpoints, regions) still open.
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Progress engine driving this domain.
    pub fn engine(&self) -> &Arc<ProgressEngine> {
        &self.engine
    }

    /// Runs one progress pass over every context.
    pub fn progress(&self) -> usize {
        self.engine.progress_all()
    }

    fn check_open(&self) -> ProviderResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProviderError::bad_state("domain closed"));
        }
        Ok(())
    }

    fn hook(&self) -> Weak<dyn ProgressHook> {
        let engine: Arc<dyn ProgressHook> = self.engine.clone();
        Arc::downgrade(&engine)
    }

    fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }

    /// Opens a CQ.
    pub fn cq_open(&self, attr: CqAttr) -> ProviderResult<CqHandle> {
        self.check_open()?;
        let cq = CompletionQueue::open(
            attr,
            &self.shared.config,
            self.shared.resource_mgmt,
            self.shared.metrics.clone(),
        )?;
        cq.set_progress(self.hook());
        let handle = self.cqs.write().insert(Arc::new(cq));
        self.acquire();
        Ok(handle)
    }

    /// CQ behind `handle`.
    pub fn cq(&self, handle: CqHandle) -> ProviderResult<Arc<CompletionQueue>> {
        self.cqs
            .read()
            .get(handle)
            .ok_or_else(|| ProviderError::not_found(format!("completion queue {:?}", handle)))
    }

    /// Closes a CQ; fails with `Busy` while endpoints are bound to it.
    pub fn cq_close(&self, handle: CqHandle) -> ProviderResult<()> {
        let cq = {
            let mut cqs = self.cqs.write();
            let cq = cqs
                .get(handle)
                .ok_or_else(|| ProviderError::not_found(format!("completion queue {:?}", handle)))?;
            if cq.bindings() > 0 {
                return Err(ProviderError::busy(format!(
                    "completion queue bound to {} endpoint(s)",
                    cq.bindings()
                )));
            }
            cqs.remove(handle);
            cq
        };
        self.release();
        cq.close()
    }

    /// Opens a counter; its triggers fire on the shared context.
    pub fn cntr_open(&self, attr: CntrAttr) -> ProviderResult<CntrHandle> {
        self.check_open()?;
        let ready = self.shared.base_context()?.trigger_queue();
        let cntr = Counter::open(attr, &self.shared.config, ready, self.shared.metrics.clone())?;
        cntr.set_progress(self.hook());
        let handle = self.cntrs.write().insert(Arc::new(cntr));
        self.acquire();
        Ok(handle)
    }

    /// Counter behind `handle`.
    pub fn cntr(&self, handle: CntrHandle) -> ProviderResult<Arc<Counter>> {
        self.cntrs
            .read()
            .get(handle)
            .ok_or_else(|| ProviderError::not_found(format!("counter {:?}", handle)))
    }

    /// Closes a counter, discarding its pending triggers. Fails with
    /// `Busy` while endpoints or regions are bound to it.
    pub fn cntr_close(&self, handle: CntrHandle) -> ProviderResult<usize> {
        let cntr = {
            let mut cntrs = self.cntrs.write();
            let cntr = cntrs
                .get(handle)
                .ok_or_else(|| ProviderError::not_found(format!("counter {:?}", handle)))?;
            if cntr.bindings() > 0 {
                return Err(ProviderError::busy(format!(
                    "counter bound to {} object(s)",
                    cntr.bindings()
                )));
            }
            cntrs.remove(handle);
            cntr
        };
        self.release();
        cntr.close()
    }

    /// Opens an endpoint on the shared context, or on a context of its own
    /// when `attr.dedicated_context` is set.
    pub fn endpoint(&self, attr: EpAttr) -> ProviderResult<EpHandle> {
        self.check_open()?;
        let ctx = if attr.dedicated_context {
            let id = self.shared.lower.open_context()?;
            let ctx = Arc::new(TransportContext::new(id, self.shared.policy, true));
            self.shared.contexts.write().push(ctx.clone());
            ctx
        } else {
            self.shared.base_context()?
        };
        let lane = match ctx.alloc_lane(attr.vlane) {
            Ok(lane) => lane,
            Err(e) => {
                if ctx.is_dedicated() {
                    self.drop_context(&ctx);
                }
                return Err(e);
            }
        };
        let ep = Arc::new(Endpoint::new(self.shared.clone(), ctx.clone(), lane, attr));
        ctx.attach(ep.clone());
        let handle = self.eps.write().insert(ep);
        self.acquire();
        debug!(context = ctx.lower_id(), lane, "endpoint opened");
        Ok(handle)
    }

    /// Endpoint behind `handle`.
    pub fn ep(&self, handle: EpHandle) -> ProviderResult<Arc<Endpoint>> {
        self.eps
            .read()
            .get(handle)
            .ok_or_else(|| ProviderError::not_found(format!("endpoint {:?}", handle)))
    }

    /// Binds a CQ for the directions named in `flags`.
    pub fn ep_bind_cq(&self, ep: EpHandle, cq: CqHandle, flags: OpFlags) -> ProviderResult<()> {
        self.ep(ep)?.bind_cq(self.cq(cq)?, flags)
    }

    /// Binds a counter for the event classes named in `flags`.
    pub fn ep_bind_cntr(&self, ep: EpHandle, cntr: CntrHandle, flags: OpFlags) -> ProviderResult<()> {
        self.ep(ep)?.bind_cntr(self.cntr(cntr)?, flags)
    }

    /// Binds an address vector.
    pub fn ep_bind_av(&self, ep: EpHandle, av: Arc<dyn AddressVector>) -> ProviderResult<()> {
        self.ep(ep)?.bind_av(av)
    }

    /// Enables an endpoint.
    pub fn ep_enable(&self, ep: EpHandle) -> ProviderResult<()> {
        self.ep(ep)?.enable()
    }

    /// Fabric address of an endpoint.
    pub fn ep_addr(&self, ep: EpHandle) -> ProviderResult<FiAddr> {
        Ok(self.ep(ep)?.fi_addr())
    }

    /// Closes an endpoint and frees its lane.
    pub fn ep_close(&self, handle: EpHandle) -> ProviderResult<()> {
        let ep = self
            .eps
            .write()
            .remove(handle)
            .ok_or_else(|| ProviderError::not_found(format!("endpoint {:?}", handle)))?;
        self.release();
        let ctx = ep.context().clone();
        ctx.detach(ep.lane());
        ctx.free_lane(ep.lane());
        let result = ep.close();
        if ctx.is_dedicated() && ctx.lane_count() == 0 {
            self.drop_context(&ctx);
        }
        result
    }

    fn drop_context(&self, ctx: &Arc<TransportContext>) {
        self.shared
            .contexts
            .write()
            .retain(|c| !Arc::ptr_eq(c, ctx));
        if let Err(e) = self.shared.lower.close_context(ctx.lower_id()) {
            warn!(context = ctx.lower_id(), error = %e, "unable to close lower context");
        }
    }

    /// Registers a single buffer.
    pub fn mr_reg(&self, buf: Iov, access: OpFlags, requested_key: u64, context: u64) -> ProviderResult<Arc<MemoryRegion>> {
        self.mr_regattr(
            &MrAttr {
                iov: vec![buf],
                access,
                offset: 0,
                requested_key,
                context,
            },
            OpFlags::empty(),
        )
    }

    /// Registers a segment list.
    pub fn mr_regv(&self, iov: &[Iov], access: OpFlags, requested_key: u64, context: u64) -> ProviderResult<Arc<MemoryRegion>> {
        self.mr_regattr(
            &MrAttr {
                iov: iov.to_vec(),
                access,
                offset: 0,
                requested_key,
                context,
            },
            OpFlags::empty(),
        )
    }

    /// Registers from full attributes.
    pub fn mr_regattr(&self, attr: &MrAttr, flags: OpFlags) -> ProviderResult<Arc<MemoryRegion>> {
        self.check_open()?;
        let region = self.shared.registry.register(attr, flags)?;
        self.acquire();
        Ok(region)
    }

    /// Region registered under `key`.
    pub fn mr(&self, key: MrKey) -> ProviderResult<Arc<MemoryRegion>> {
        self.shared
            .registry
            .get(key)
            .ok_or_else(|| ProviderError::not_found(format!("memory region 0x{:X}", key)))
    }

    /// Binds a counter that counts remote accesses landing in the region.
    pub fn mr_bind_cntr(&self, key: MrKey, cntr: CntrHandle) -> ProviderResult<()> {
        self.mr(key)?.bind_counter(self.cntr(cntr)?);
        Ok(())
    }

    /// Deregisters a region. The region is gone even when a lower
    /// deregistration fails; that failure is still returned.
    pub fn mr_close(&self, key: MrKey) -> ProviderResult<()> {
        let result = self
            .shared
            .registry
            .deregister(key)
            .ok_or_else(|| ProviderError::not_found(format!("memory region 0x{:X}", key)))?;
        self.release();
        result
    }

    /// Closes the domain once every object opened from it is closed.
    pub fn close(&self) -> ProviderResult<()> {
        let refs = self.refs();
        if refs > 0 {
            return Err(ProviderError::busy(format!("{} object(s) still open", refs)));
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ProviderError::bad_state("domain already closed"));
        }
        self.engine.stop();
        let contexts: Vec<Arc<TransportContext>> = self.shared.contexts.write().drain(..).collect();
        for ctx in contexts {
            if let Err(e) = self.shared.lower.close_context(ctx.lower_id()) {
                warn!(context = ctx.lower_id(), error = %e, "unable to close lower context");
            }
        }
        if let Err(e) = self.shared.lower.close() {
            warn!(lower = self.shared.lower.name(), error = %e, "unable to close lower domain");
        }
        info!(name = %self.attr.name, "domain closed");
        Ok(())
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.engine.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errno;
    use crate::sim::{SimFabric, SimFabricConfig};

    fn open() -> (Arc<SimFabric>, Domain) {
        let sim = Arc::new(SimFabric::new(SimFabricConfig::default()));
        let domain = Domain::open(ProviderConfig::default(), DomainAttr::default(), sim.clone()).unwrap();
        (sim, domain)
    }

    #[test]
    fn test_close_busy_until_objects_closed() {
        let (sim, domain) = open();
        let cq = domain.cq_open(CqAttr::default()).unwrap();
        let ep = domain.endpoint(EpAttr::default()).unwrap();
        domain.ep_bind_cq(ep, cq, OpFlags::SEND | OpFlags::RECV).unwrap();

        assert_eq!(domain.close().unwrap_err().errno(), errno::EBUSY);
        assert_eq!(domain.cq_close(cq).unwrap_err().errno(), errno::EBUSY);
        domain.ep_close(ep).unwrap();
        domain.cq_close(cq).unwrap();
        assert_eq!(domain.refs(), 0);
        domain.close().unwrap();
        assert_eq!(sim.stats().live_contexts, 0);
        assert_eq!(domain.close().unwrap_err().errno(), errno::FI_EOPBADSTATE);
    }

    #[test]
    fn test_stale_handles() {
        let (_sim, domain) = open();
        let cq = domain.cq_open(CqAttr::default()).unwrap();
        domain.cq_close(cq).unwrap();
        assert_eq!(domain.cq(cq).unwrap_err().errno(), errno::ENOENT);
        let again = domain.cq_open(CqAttr::default()).unwrap();
        assert_ne!(again, cq);
        assert!(domain.cq(cq).is_err());
    }

    #[test]
    fn test_dedicated_context_lifecycle() {
        let (sim, domain) = open();
        let ep = domain
            .endpoint(EpAttr {
                dedicated_context: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(sim.stats().live_contexts, 2);
        domain.ep_close(ep).unwrap();
        assert_eq!(sim.stats().live_contexts, 1);
    }

    #[test]
    fn test_requested_lane_conflict() {
        let (_sim, domain) = open();
        let attr = EpAttr {
            vlane: Some(4),
            ..Default::default()
        };
        let ep = domain.endpoint(attr.clone()).unwrap();
        assert_eq!(domain.endpoint(attr).unwrap_err().errno(), errno::EBUSY);
        assert_eq!(crate::vlane::addr_to_vlane(domain.ep_addr(ep).unwrap()), 4);
    }

    #[test]
    fn test_mr_close_releases_reference() {
        let (sim, domain) = open();
        let buf = Iov::new(sim.memory().alloc(64), 64);
        let mr = domain.mr_reg(buf, OpFlags::REMOTE_WRITE, 0, 0).unwrap();
        assert_eq!(domain.refs(), 1);
        let cntr = domain.cntr_open(CntrAttr::default()).unwrap();
        domain.mr_bind_cntr(mr.key(), cntr).unwrap();
        assert_eq!(domain.cntr_close(cntr).unwrap_err().errno(), errno::EBUSY);
        domain.mr_close(mr.key()).unwrap();
        assert_eq!(domain.cntr_close(cntr).unwrap(), 0);
        assert_eq!(domain.refs(), 0);
        assert_eq!(domain.mr_close(mr.key()).unwrap_err().errno(), errno::ENOENT);
    }

    #[test]
    fn test_concurrent_closes_release_once() {
        let (sim, domain) = open();
        let buf = Iov::new(sim.memory().alloc(32), 32);
        let key = domain.mr_reg(buf, OpFlags::REMOTE_READ, 0, 0).unwrap().key();
        let cq = domain.cq_open(CqAttr::default()).unwrap();
        let cntr = domain.cntr_open(CntrAttr::default()).unwrap();
        assert_eq!(domain.refs(), 3);

        let closed: Vec<bool> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        [
                            domain.mr_close(key).is_ok(),
                            domain.cq_close(cq).is_ok(),
                            domain.cntr_close(cntr).is_ok(),
                        ]
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });
        assert_eq!(closed.iter().filter(|ok| **ok).count(), 3);
        assert_eq!(domain.refs(), 0);
        assert_eq!(domain.metrics().regions_deregistered, 1);
        domain.close().unwrap();
    }

    #[test]
    fn test_second_close_leaves_count_alone() {
        let (sim, domain) = open();
        let first = domain
            .mr_reg(Iov::new(sim.memory().alloc(16), 16), OpFlags::REMOTE_READ, 0, 0)
            .unwrap();
        let second = domain
            .mr_reg(Iov::new(sim.memory().alloc(16), 16), OpFlags::REMOTE_READ, 0, 0)
            .unwrap();
        domain.mr_close(first.key()).unwrap();
        assert_eq!(domain.mr_close(first.key()).unwrap_err().errno(), errno::ENOENT);
        let cq = domain.cq_open(CqAttr::default()).unwrap();
        domain.cq_close(cq).unwrap();
        assert_eq!(domain.cq_close(cq).unwrap_err().errno(), errno::ENOENT);
        assert_eq!(domain.refs(), 1);
        assert_eq!(domain.close().unwrap_err().errno(), errno::EBUSY);
        domain.mr_close(second.key()).unwrap();
        domain.close().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let sim = Arc::new(SimFabric::new(SimFabricConfig::default()));
        let config = ProviderConfig {
            lock_level: 3,
            ..Default::default()
        };
        let err = Domain::open(config, DomainAttr::default(), sim.clone()).unwrap_err();
        assert_eq!(err.errno(), errno::EINVAL);
        assert_eq!(sim.stats().live_contexts, 0);
    }
}
