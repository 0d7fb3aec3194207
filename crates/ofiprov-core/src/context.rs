//! Transport contexts: one lower context multiplexed across virtual lanes.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::error::{ProviderError, ProviderResult};
use crate::lock::{LevelLock, LockPolicy, LockTier};
use crate::lower::LowerContextId;
use crate::progress::Deferred;
use crate::trigger::TriggerQueue;
use crate::vlane::VlaneMap;

/// One lower context shared by the endpoints whose lanes it carries.
pub struct TransportContext {
    lower_id: LowerContextId,
    dedicated: bool,
    poll_lock: LevelLock,
    fire_lock: LevelLock,
    triggers: Arc<TriggerQueue>,
    lanes: DashMap<u8, Arc<Endpoint>>,
    vlanes: Mutex<VlaneMap>,
    backlog: Mutex<VecDeque<Deferred>>,
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("lower_id", &self.lower_id)
            .field("dedicated", &self.dedicated)
            .field("lanes", &self.lanes.len())
            .field("backlog", &self.backlog_len())
            .finish()
    }
}

impl TransportContext {
    /// Wraps lower context `lower_id`; lock tiers follow `policy`.
    pub fn new(lower_id: LowerContextId, policy: LockPolicy, dedicated: bool) -> Self {
        Self {
            lower_id,
            dedicated,
            poll_lock: LevelLock::new(policy, LockTier::SharedContext),
            fire_lock: LevelLock::new(policy, LockTier::MultiThread),
            triggers: Arc::new(TriggerQueue::new()),
            lanes: DashMap::new(),
            vlanes: Mutex::new(VlaneMap::new()),
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    /// Identifier of the wrapped lower context.
    pub fn lower_id(&self) -> LowerContextId {
        self.lower_id
    }

    /// True when the context was opened for a single endpoint.
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    /// Serializes polling of the lower context.
    pub fn poll_lock(&self) -> &LevelLock {
        &self.poll_lock
    }

    /// Serializes firing of ready triggers.
    pub fn fire_lock(&self) -> &LevelLock {
        &self.fire_lock
    }

    /// Triggers waiting to be fired by this context's next pass.
    pub fn trigger_queue(&self) -> Arc<TriggerQueue> {
        self.triggers.clone()
    }

    /// Claims `requested`, or the lowest free lane when `None`.
    pub fn alloc_lane(&self, requested: Option<u8>) -> ProviderResult<u8> {
        let mut vlanes = self.vlanes.lock();
        match requested {
            Some(lane) if vlanes.reserve(lane) => Ok(lane),
            Some(lane) => Err(ProviderError::busy(format!("virtual lane {} in use", lane))),
            None => vlanes.alloc().ok_or_else(|| ProviderError::NoMemory {
                reason: "all virtual lanes in use".to_string(),
            }),
        }
    }

    /// Returns a lane to the allocator.
    pub fn free_lane(&self, lane: u8) {
        self.vlanes.lock().free(lane);
    }

    /// Routes completions for the endpoint's lane to it.
    pub fn attach(&self, ep: Arc<Endpoint>) {
        self.lanes.insert(ep.lane(), ep);
    }

    /// Stops routing `lane`.
    pub fn detach(&self, lane: u8) -> Option<Arc<Endpoint>> {
        self.lanes.remove(&lane).map(|(_, ep)| ep)
    }

    /// Endpoint attached on `lane`.
    pub fn endpoint(&self, lane: u8) -> Option<Arc<Endpoint>> {
        self.lanes.get(&lane).map(|ep| ep.value().clone())
    }

    /// Attached endpoints.
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Completions held back because their queue was full.
    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }

    pub(crate) fn defer(&self, work: Deferred) {
        self.backlog.lock().push_back(work);
    }

    pub(crate) fn take_backlog(&self) -> VecDeque<Deferred> {
        std::mem::take(&mut *self.backlog.lock())
    }
}
