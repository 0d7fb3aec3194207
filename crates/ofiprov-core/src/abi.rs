//! Host ABI adapter.
//!
//! Hosts driving the provider through the C fabric interface see objects as
//! numeric fids and operations as tables returning `0` (or a count) on
//! success and a negative errno on failure. [`AbiDomain`] maps fids to
//! domain handles and provider errors to those return codes.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::av::AddressVector;
use crate::cntr::{CntrAttr, Counter};
use crate::config::ProviderConfig;
use crate::cq::{CompletionQueue, CqAttr, CqEntry, CqErrEntry};
use crate::domain::{CntrHandle, CqHandle, Domain, DomainAttr, EpHandle};
use crate::endpoint::{EpAttr, Endpoint};
use crate::error::{errno, strerror, ProviderError, ProviderResult};
use crate::flags::OpFlags;
use crate::lower::{Iov, LowerTransport};
use crate::mr::{MrAttr, MrKey};
use crate::wait::{ControlCommand, ControlReply};

/// Numeric object identifier handed to the host.
pub type Fid = u64;

/// Key reported for an unknown region.
pub const FI_KEY_NOTAVAIL: u64 = u64::MAX;

/// Kind of object a fid names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FidClass {
    /// Completion queue.
    Cq,
    /// Counter.
    Cntr,
    /// Endpoint.
    Ep,
    /// Memory region.
    Mr,
}

#[derive(Debug, Clone, Copy)]
enum FidObject {
    Cq(CqHandle),
    Cntr(CntrHandle),
    Ep(EpHandle),
    Mr(MrKey),
}

impl FidObject {
    fn class(&self) -> FidClass {
        match self {
            FidObject::Cq(_) => FidClass::Cq,
            FidObject::Cntr(_) => FidClass::Cntr,
            FidObject::Ep(_) => FidClass::Ep,
            FidObject::Mr(_) => FidClass::Mr,
        }
    }
}

fn retcode<T>(result: ProviderResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.retcode(),
    }
}

/// Negative timeouts wait forever.
fn timeout_from_ms(timeout_ms: i32) -> Duration {
    if timeout_ms < 0 {
        Duration::MAX
    } else {
        Duration::from_millis(timeout_ms as u64)
    }
}

/// Domain-level operations.
pub trait FiDomainOps {
    /// Opens a CQ and stores its fid.
    fn cq_open(&self, attr: &CqAttr, fid: &mut Fid) -> i32;
    /// Opens a counter and stores its fid.
    fn cntr_open(&self, attr: &CntrAttr, fid: &mut Fid) -> i32;
    /// Opens an endpoint and stores its fid.
    fn endpoint(&self, attr: &EpAttr, fid: &mut Fid) -> i32;
    /// Binds a CQ or counter fid to an endpoint.
    fn ep_bind(&self, ep: Fid, bfid: Fid, flags: u64) -> i32;
    /// Binds an address vector to an endpoint.
    fn ep_bind_av(&self, ep: Fid, av: Arc<dyn AddressVector>) -> i32;
    /// Enables an endpoint.
    fn ep_enable(&self, ep: Fid) -> i32;
    /// Closes any object fid.
    fn close(&self, fid: Fid) -> i32;
    /// Closes the domain; `-EBUSY` while fids remain open.
    fn domain_close(&self) -> i32;
}

/// Memory registration operations.
pub trait FiMrOps {
    /// Registers one buffer.
    #[allow(clippy::too_many_arguments)]
    fn mr_reg(
        &self,
        buf: Iov,
        access: u64,
        offset: u64,
        requested_key: u64,
        flags: u64,
        context: u64,
        fid: &mut Fid,
    ) -> i32;
    /// Registers a segment list.
    #[allow(clippy::too_many_arguments)]
    fn mr_regv(
        &self,
        iov: &[Iov],
        access: u64,
        offset: u64,
        requested_key: u64,
        flags: u64,
        context: u64,
        fid: &mut Fid,
    ) -> i32;
    /// Key of a region, or [`FI_KEY_NOTAVAIL`].
    fn mr_key(&self, mr: Fid) -> u64;
    /// Binds a counter fid to a region.
    fn mr_bind(&self, mr: Fid, bfid: Fid, flags: u64) -> i32;
}

/// Completion queue operations.
pub trait FiCqOps {
    /// Returns the entries copied, or a negative errno.
    fn cq_read(&self, cq: Fid, buf: &mut [CqEntry]) -> isize;
    /// Copies the pending error; returns 1 on success.
    fn cq_readerr(&self, cq: Fid, buf: &mut CqErrEntry, flags: u64) -> isize;
    /// Blocking read; a negative timeout waits forever.
    fn cq_sread(&self, cq: Fid, buf: &mut [CqEntry], timeout_ms: i32) -> isize;
    /// Wakes blocked readers.
    fn cq_signal(&self, cq: Fid) -> i32;
    /// Wait-object query.
    fn cq_control(&self, cq: Fid, cmd: ControlCommand, reply: &mut Option<ControlReply>) -> i32;
    /// Describes a provider errno.
    fn cq_strerror(&self, cq: Fid, prov_errno: i32) -> &'static str;
}

/// Counter operations.
pub trait FiCntrOps {
    /// Success count, 0 for an unknown fid.
    fn cntr_read(&self, cntr: Fid) -> u64;
    /// Error count, 0 for an unknown fid.
    fn cntr_readerr(&self, cntr: Fid) -> u64;
    /// Adds to the success count.
    fn cntr_add(&self, cntr: Fid, value: u64) -> i32;
    /// Adds to the error count.
    fn cntr_adderr(&self, cntr: Fid, value: u64) -> i32;
    /// Sets the success count.
    fn cntr_set(&self, cntr: Fid, value: u64) -> i32;
    /// Sets the error count.
    fn cntr_seterr(&self, cntr: Fid, value: u64) -> i32;
    /// Waits for the success count to reach `threshold`.
    fn cntr_wait(&self, cntr: Fid, threshold: u64, timeout_ms: i32) -> i32;
    /// Wait-object query.
    fn cntr_control(&self, cntr: Fid, cmd: ControlCommand, reply: &mut Option<ControlReply>) -> i32;
}

/// A domain exposed through fid-based operation tables.
pub struct AbiDomain {
    domain: Domain,
    fids: DashMap<Fid, FidObject>,
    next_fid: AtomicU64,
}

impl std::fmt::Debug for AbiDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbiDomain")
            .field("domain", &self.domain)
            .field("fids", &self.fids.len())
            .finish()
    }
}

impl AbiDomain {
    /// Opens the domain; failures come back as a negative errno.
    pub fn open(config: ProviderConfig, attr: DomainAttr, lower: Arc<dyn LowerTransport>) -> Result<Self, i32> {
        let domain = Domain::open(config, attr, lower).map_err(|e| e.retcode())?;
        Ok(Self {
            domain,
            fids: DashMap::new(),
            next_fid: AtomicU64::new(1),
        })
    }

    /// Wrapped domain.
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Class of an open fid.
    pub fn fid_class(&self, fid: Fid) -> Option<FidClass> {
        self.fids.get(&fid).map(|obj| obj.class())
    }

    /// Endpoint behind `fid`, for the data-transfer entry points.
    pub fn endpoint_object(&self, fid: Fid) -> Option<Arc<Endpoint>> {
        match self.lookup(fid).ok()? {
            FidObject::Ep(handle) => self.domain.ep(handle).ok(),
            _ => None,
        }
    }

    fn publish(&self, obj: FidObject) -> Fid {
        let fid = self.next_fid.fetch_add(1, Ordering::Relaxed);
        self.fids.insert(fid, obj);
        fid
    }

    fn lookup(&self, fid: Fid) -> ProviderResult<FidObject> {
        self.fids
            .get(&fid)
            .map(|obj| *obj)
            .ok_or_else(|| ProviderError::not_found(format!("fid {}", fid)))
    }

    fn cq_object(&self, fid: Fid) -> ProviderResult<Arc<CompletionQueue>> {
        match self.lookup(fid)? {
            FidObject::Cq(handle) => self.domain.cq(handle),
            other => Err(ProviderError::invalid(format!("fid {} is a {:?}", fid, other.class()))),
        }
    }

    fn cntr_object(&self, fid: Fid) -> ProviderResult<Arc<Counter>> {
        match self.lookup(fid)? {
            FidObject::Cntr(handle) => self.domain.cntr(handle),
            other => Err(ProviderError::invalid(format!("fid {} is a {:?}", fid, other.class()))),
        }
    }

    fn ep_handle(&self, fid: Fid) -> ProviderResult<EpHandle> {
        match self.lookup(fid)? {
            FidObject::Ep(handle) => Ok(handle),
            other => Err(ProviderError::invalid(format!("fid {} is a {:?}", fid, other.class()))),
        }
    }

    fn mr_key_of(&self, fid: Fid) -> ProviderResult<MrKey> {
        match self.lookup(fid)? {
            FidObject::Mr(key) => Ok(key),
            other => Err(ProviderError::invalid(format!("fid {} is a {:?}", fid, other.class()))),
        }
    }

    fn close_object(&self, fid: Fid) -> ProviderResult<()> {
        let obj = self.lookup(fid)?;
        match obj {
            FidObject::Cq(handle) => self.domain.cq_close(handle)?,
            FidObject::Cntr(handle) => {
                self.domain.cntr_close(handle)?;
            }
            FidObject::Ep(handle) => self.domain.ep_close(handle)?,
            FidObject::Mr(key) => {
                // the region is gone even if the lower transport complained
                let result = self.domain.mr_close(key);
                self.fids.remove(&fid);
                return result;
            }
        }
        self.fids.remove(&fid);
        debug!(fid, class = ?obj.class(), "fid closed");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &self,
        iov: Vec<Iov>,
        access: u64,
        offset: u64,
        requested_key: u64,
        flags: u64,
        context: u64,
        fid: &mut Fid,
    ) -> i32 {
        let attr = MrAttr {
            iov,
            access: OpFlags::from_bits(access),
            offset,
            requested_key,
            context,
        };
        match self.domain.mr_regattr(&attr, OpFlags::from_bits(flags)) {
            Ok(region) => {
                *fid = self.publish(FidObject::Mr(region.key()));
                0
            }
            Err(e) => e.retcode(),
        }
    }
}

impl FiDomainOps for AbiDomain {
    fn cq_open(&self, attr: &CqAttr, fid: &mut Fid) -> i32 {
        match self.domain.cq_open(*attr) {
            Ok(handle) => {
                *fid = self.publish(FidObject::Cq(handle));
                0
            }
            Err(e) => e.retcode(),
        }
    }

    fn cntr_open(&self, attr: &CntrAttr, fid: &mut Fid) -> i32 {
        match self.domain.cntr_open(*attr) {
            Ok(handle) => {
                *fid = self.publish(FidObject::Cntr(handle));
                0
            }
            Err(e) => e.retcode(),
        }
    }

    fn endpoint(&self, attr: &EpAttr, fid: &mut Fid) -> i32 {
        match self.domain.endpoint(attr.clone()) {
            Ok(handle) => {
                *fid = self.publish(FidObject::Ep(handle));
                0
            }
            Err(e) => e.retcode(),
        }
    }

    fn ep_bind(&self, ep: Fid, bfid: Fid, flags: u64) -> i32 {
        let bind = || -> ProviderResult<()> {
            let ep = self.ep_handle(ep)?;
            let flags = OpFlags::from_bits(flags);
            match self.lookup(bfid)? {
                FidObject::Cq(cq) => self.domain.ep_bind_cq(ep, cq, flags),
                FidObject::Cntr(cntr) => self.domain.ep_bind_cntr(ep, cntr, flags),
                other => Err(ProviderError::unsupported(format!(
                    "binding a {:?} to an endpoint",
                    other.class()
                ))),
            }
        };
        retcode(bind())
    }

    fn ep_bind_av(&self, ep: Fid, av: Arc<dyn AddressVector>) -> i32 {
        retcode(self.ep_handle(ep).and_then(|ep| self.domain.ep_bind_av(ep, av)))
    }

    fn ep_enable(&self, ep: Fid) -> i32 {
        retcode(self.ep_handle(ep).and_then(|ep| self.domain.ep_enable(ep)))
    }

    fn close(&self, fid: Fid) -> i32 {
        retcode(self.close_object(fid))
    }

    fn domain_close(&self) -> i32 {
        retcode(self.domain.close())
    }
}

impl FiMrOps for AbiDomain {
    fn mr_reg(
        &self,
        buf: Iov,
        access: u64,
        offset: u64,
        requested_key: u64,
        flags: u64,
        context: u64,
        fid: &mut Fid,
    ) -> i32 {
        self.register(vec![buf], access, offset, requested_key, flags, context, fid)
    }

    fn mr_regv(
        &self,
        iov: &[Iov],
        access: u64,
        offset: u64,
        requested_key: u64,
        flags: u64,
        context: u64,
        fid: &mut Fid,
    ) -> i32 {
        self.register(iov.to_vec(), access, offset, requested_key, flags, context, fid)
    }

    fn mr_key(&self, mr: Fid) -> u64 {
        self.mr_key_of(mr).unwrap_or(FI_KEY_NOTAVAIL)
    }

    fn mr_bind(&self, mr: Fid, bfid: Fid, _flags: u64) -> i32 {
        let bind = || -> ProviderResult<()> {
            let key = self.mr_key_of(mr)?;
            match self.lookup(bfid)? {
                FidObject::Cntr(cntr) => self.domain.mr_bind_cntr(key, cntr),
                other => Err(ProviderError::unsupported(format!(
                    "binding a {:?} to a memory region",
                    other.class()
                ))),
            }
        };
        retcode(bind())
    }
}

fn copy_entries(result: ProviderResult<Vec<CqEntry>>, buf: &mut [CqEntry]) -> isize {
    match result {
        Ok(entries) => {
            for (slot, entry) in buf.iter_mut().zip(entries.iter()) {
                *slot = *entry;
            }
            entries.len() as isize
        }
        Err(e) => e.retcode() as isize,
    }
}

impl FiCqOps for AbiDomain {
    fn cq_read(&self, cq: Fid, buf: &mut [CqEntry]) -> isize {
        if buf.is_empty() {
            return -(errno::EINVAL as isize);
        }
        copy_entries(self.cq_object(cq).and_then(|cq| cq.read(buf.len())), buf)
    }

    fn cq_readerr(&self, cq: Fid, buf: &mut CqErrEntry, _flags: u64) -> isize {
        match self.cq_object(cq).and_then(|cq| cq.readerr()) {
            Ok(entry) => {
                *buf = entry;
                1
            }
            Err(e) => e.retcode() as isize,
        }
    }

    fn cq_sread(&self, cq: Fid, buf: &mut [CqEntry], timeout_ms: i32) -> isize {
        if buf.is_empty() {
            return -(errno::EINVAL as isize);
        }
        let timeout = timeout_from_ms(timeout_ms);
        copy_entries(
            self.cq_object(cq).and_then(|cq| cq.sread(buf.len(), timeout)),
            buf,
        )
    }

    fn cq_signal(&self, cq: Fid) -> i32 {
        retcode(self.cq_object(cq).map(|cq| cq.signal()))
    }

    fn cq_control(&self, cq: Fid, cmd: ControlCommand, reply: &mut Option<ControlReply>) -> i32 {
        match self.cq_object(cq).and_then(|cq| cq.control(cmd)) {
            Ok(r) => {
                *reply = Some(r);
                0
            }
            Err(e) => e.retcode(),
        }
    }

    fn cq_strerror(&self, _cq: Fid, prov_errno: i32) -> &'static str {
        strerror(prov_errno)
    }
}

impl FiCntrOps for AbiDomain {
    fn cntr_read(&self, cntr: Fid) -> u64 {
        self.cntr_object(cntr).map_or(0, |c| c.read())
    }

    fn cntr_readerr(&self, cntr: Fid) -> u64 {
        self.cntr_object(cntr).map_or(0, |c| c.read_err())
    }

    fn cntr_add(&self, cntr: Fid, value: u64) -> i32 {
        retcode(self.cntr_object(cntr).map(|c| c.add(value)))
    }

    fn cntr_adderr(&self, cntr: Fid, value: u64) -> i32 {
        retcode(self.cntr_object(cntr).map(|c| c.add_err(value)))
    }

    fn cntr_set(&self, cntr: Fid, value: u64) -> i32 {
        retcode(self.cntr_object(cntr).map(|c| c.set(value)))
    }

    fn cntr_seterr(&self, cntr: Fid, value: u64) -> i32 {
        retcode(self.cntr_object(cntr).map(|c| c.set_err(value)))
    }

    fn cntr_wait(&self, cntr: Fid, threshold: u64, timeout_ms: i32) -> i32 {
        let timeout = timeout_from_ms(timeout_ms);
        retcode(self.cntr_object(cntr).and_then(|c| c.wait(threshold, timeout)))
    }

    fn cntr_control(&self, cntr: Fid, cmd: ControlCommand, reply: &mut Option<ControlReply>) -> i32 {
        match self.cntr_object(cntr).and_then(|c| c.control(cmd)) {
            Ok(r) => {
                *reply = Some(r);
                0
            }
            Err(e) => e.retcode(),
        }
    }
}
