//! Memory region registry.
//!
//! Regions are registered segment by segment with the lower transport and
//! indexed by key in an ordered map. Incoming remote accesses are checked
//! against the map by [`MrRegistry::verify`]; any mismatch is reported as
//! one access-denied error.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cntr::Counter;
use crate::error::{ProviderError, ProviderResult};
use crate::flags::OpFlags;
use crate::lower::{Iov, LowerRegion, LowerTransport};
use crate::metrics::ProviderMetrics;
use crate::variant::{KeyMode, TransportVariant};

/// Registration key.
pub type MrKey = u64;

/// How remote addresses name bytes of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MrAddressing {
    /// Offsets from the registered `offset` base.
    #[default]
    Offset,
    /// Virtual addresses of the registered segments.
    Virtual,
}

/// Registration request.
#[derive(Debug, Clone, Default)]
pub struct MrAttr {
    /// Buffer segments, in region order.
    pub iov: Vec<Iov>,
    /// Access granted to peers and local operations.
    pub access: OpFlags,
    /// Base of the region in offset addressing.
    pub offset: u64,
    /// Used only when the domain accepts application keys.
    pub requested_key: u64,
    /// Returned with the region.
    pub context: u64,
}

impl MrAttr {
    /// Request for `iov` with `access` and defaults elsewhere.
    pub fn new(iov: Vec<Iov>, access: OpFlags) -> Self {
        Self {
            iov,
            access,
            ..Default::default()
        }
    }
}

/// A registered buffer range.
#[derive(Debug)]
pub struct MemoryRegion {
    key: MrKey,
    iov: Vec<Iov>,
    len: usize,
    access: OpFlags,
    offset: u64,
    context: u64,
    flags: OpFlags,
    lower: Vec<LowerRegion>,
    cntr: Mutex<Option<Arc<Counter>>>,
}

impl MemoryRegion {
    /// Key peers name the region by.
    pub fn key(&self) -> MrKey {
        self.key
    }

    /// Total length across segments.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length region.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Access granted to the caller, independent of the lower registration.
    pub fn access(&self) -> OpFlags {
        self.access
    }

    /// Registered segments.
    pub fn iov(&self) -> &[Iov] {
        &self.iov
    }

    /// Base address in offset addressing.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Application context given at registration.
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Registration flags.
    pub fn flags(&self) -> OpFlags {
        self.flags
    }

    /// Per-segment lower registrations.
    pub fn lower_regions(&self) -> &[LowerRegion] {
        &self.lower
    }

    /// Binds a counter bumped by remote writes into this region.
    pub fn bind_counter(&self, cntr: Arc<Counter>) {
        cntr.acquire_binding();
        if let Some(old) = self.cntr.lock().replace(cntr) {
            old.release_binding();
        }
    }

    /// Counter bound to the region, if any.
    pub fn counter(&self) -> Option<Arc<Counter>> {
        self.cntr.lock().clone()
    }

    pub(crate) fn unbind_counter(&self) {
        if let Some(old) = self.cntr.lock().take() {
            old.release_binding();
        }
    }

    /// Maps `[addr, addr+len)` onto registered segments.
    fn translate(&self, addressing: MrAddressing, addr: u64, len: usize) -> Option<Vec<Iov>> {
        match addressing {
            MrAddressing::Offset => {
                let rel = addr.checked_sub(self.offset)?;
                let end = rel.checked_add(len as u64)?;
                if end > self.len as u64 {
                    return None;
                }
                let mut skip = rel;
                let mut left = len;
                let mut out = Vec::new();
                for seg in &self.iov {
                    if left == 0 {
                        break;
                    }
                    if skip >= seg.len as u64 {
                        skip -= seg.len as u64;
                        continue;
                    }
                    let take = (seg.len - skip as usize).min(left);
                    out.push(Iov::new(seg.addr + skip, take));
                    left -= take;
                    skip = 0;
                }
                Some(out)
            }
            MrAddressing::Virtual => {
                let end = addr.checked_add(len as u64)?;
                self.iov
                    .iter()
                    .find(|seg| addr >= seg.addr && seg.end().is_some_and(|e| end <= e))
                    .map(|_| if len == 0 { Vec::new() } else { vec![Iov::new(addr, len)] })
            }
        }
    }
}

/// Key to region map owned by a domain.
pub struct MrRegistry {
    map: RwLock<BTreeMap<MrKey, Arc<MemoryRegion>>>,
    next_key: AtomicU64,
    lower: Arc<dyn LowerTransport>,
    variant: Arc<dyn TransportVariant>,
    addressing: MrAddressing,
    max_size: u64,
    metrics: Arc<ProviderMetrics>,
}

impl MrRegistry {
    pub(crate) fn new(
        lower: Arc<dyn LowerTransport>,
        variant: Arc<dyn TransportVariant>,
        addressing: MrAddressing,
        max_size: u64,
        metrics: Arc<ProviderMetrics>,
    ) -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
            next_key: AtomicU64::new(1),
            lower,
            variant,
            addressing,
            max_size,
            metrics,
        }
    }

    /// Addressing mode used by [`MrRegistry::verify`].
    pub fn addressing(&self) -> MrAddressing {
        self.addressing
    }

    /// Registers every segment with the lower transport and inserts the
    /// region under a fresh key. A failed segment rolls back the segments
    /// already registered and surfaces the lower error unchanged.
    pub(crate) fn register(&self, attr: &MrAttr, flags: OpFlags) -> ProviderResult<Arc<MemoryRegion>> {
        if attr.iov.is_empty() {
            return Err(ProviderError::invalid("registration without segments"));
        }
        for seg in &attr.iov {
            if seg.len as u64 > self.max_size {
                return Err(ProviderError::invalid(format!(
                    "segment of {} bytes exceeds max_mr_size {}",
                    seg.len, self.max_size
                )));
            }
            if seg.end().is_none() {
                return Err(ProviderError::invalid("segment wraps the address space"));
            }
        }

        let key_mode = self.variant.key_mode();
        if key_mode == KeyMode::Application && self.map.read().contains_key(&attr.requested_key) {
            return Err(ProviderError::KeyInUse {
                key: attr.requested_key,
            });
        }

        let granted = attr.access & OpFlags::ACCESS_MASK;
        let lower_access = self.variant.lower_access(granted);
        let mut lower = Vec::with_capacity(attr.iov.len());
        for seg in &attr.iov {
            match self.lower.register(*seg, lower_access) {
                Ok(region) => lower.push(region),
                Err(e) => {
                    warn!(addr = seg.addr, len = seg.len, error = %e, "lower registration failed");
                    self.release_lower(&lower);
                    return Err(e.into());
                }
            }
        }

        let key = match key_mode {
            KeyMode::Provider => self.next_key.fetch_add(1, Ordering::Relaxed),
            KeyMode::Application => attr.requested_key,
            KeyMode::Lower => lower[0].key,
        };

        let region = Arc::new(MemoryRegion {
            key,
            len: crate::lower::iov_len(&attr.iov),
            iov: attr.iov.clone(),
            access: granted,
            offset: attr.offset,
            context: attr.context,
            flags,
            lower,
            cntr: Mutex::new(None),
        });

        {
            let mut map = self.map.write();
            if map.contains_key(&key) {
                drop(map);
                self.release_lower(&region.lower);
                return Err(ProviderError::KeyInUse { key });
            }
            map.insert(key, region.clone());
        }
        self.metrics.inc_regions_registered();
        debug!(key, len = region.len, access = granted.bits(), "memory region registered");
        Ok(region)
    }

    fn release_lower(&self, regions: &[LowerRegion]) {
        for region in regions {
            if let Err(e) = self.lower.deregister(*region) {
                warn!(handle = region.handle, error = %e, "lower deregistration failed");
            }
        }
    }

    /// Checks an incoming remote access and returns the target segments.
    pub fn verify(&self, key: MrKey, addr: u64, len: usize, access: OpFlags) -> ProviderResult<Vec<Iov>> {
        let denied = || {
            self.metrics.inc_verify_failures();
            debug!(key, addr, len, access = access.bits(), "memory region verification failed");
            ProviderError::AccessDenied { key }
        };
        let region = match self.map.read().get(&key) {
            Some(region) => region.clone(),
            None => return Err(denied()),
        };
        if !region.access.contains(access) {
            return Err(denied());
        }
        region
            .translate(self.addressing, addr, len)
            .ok_or_else(denied)
    }

    /// Checks a local descriptor against the buffers an operation names.
    pub fn verify_local(&self, key: MrKey, iov: &[Iov], access: OpFlags) -> ProviderResult<()> {
        let region = self
            .get(key)
            .ok_or(ProviderError::AccessDenied { key })?;
        if !region.access.contains(access) {
            return Err(ProviderError::AccessDenied { key });
        }
        for seg in iov {
            if region.translate(MrAddressing::Virtual, seg.addr, seg.len).is_none() {
                return Err(ProviderError::AccessDenied { key });
            }
        }
        Ok(())
    }

    /// Region registered under `key`.
    pub fn get(&self, key: MrKey) -> Option<Arc<MemoryRegion>> {
        self.map.read().get(&key).cloned()
    }

    /// Unlinks `key` and releases its lower registrations.
    ///
    /// `None` when `key` is not registered, so concurrent callers see the
    /// removal exactly once. Otherwise this is best-effort teardown: each
    /// lower deregistration is attempted even if an earlier one failed, and
    /// the first failure is returned after cleanup has run to completion.
    pub(crate) fn deregister(&self, key: MrKey) -> Option<ProviderResult<()>> {
        let region = self.map.write().remove(&key)?;
        Some(self.teardown(&region))
    }

    /// Releases the lower registrations of a region already unlinked.
    fn teardown(&self, region: &MemoryRegion) -> ProviderResult<()> {
        let mut first_err = None;
        for lower in &region.lower {
            if let Err(e) = self.lower.deregister(*lower) {
                warn!(key = region.key, handle = lower.handle, error = %e, "unable to deregister region");
                first_err.get_or_insert(e);
            }
        }
        region.unbind_counter();
        self.metrics.inc_regions_deregistered();
        debug!(key = region.key, "memory region deregistered");
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Registered regions.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Registered keys in ascending order.
    pub fn keys(&self) -> Vec<MrKey> {
        self.map.read().keys().copied().collect()
    }
}
