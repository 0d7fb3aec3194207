//! Tiered optional locking.
//!
//! Every lock site names a tier. The configured lock level decides, once
//! at open time, which tiers take a real mutex and which become no-ops:
//! a site of tier `t` locks when `lock_level >= t`.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// Tier of a lock site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockTier {
    /// Always taken.
    Always = 0,
    /// Needed once several threads, including internal ones, run.
    MultiThread = 1,
    /// Needed only when threads share one lower context.
    SharedContext = 2,
}

/// Lock level chosen for a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    level: u8,
}

impl LockPolicy {
    /// Clamps `level` to the highest tier.
    pub fn new(level: u8) -> Self {
        Self {
            level: level.min(LockTier::SharedContext as u8),
        }
    }

    /// Effective level.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// True when locks of `tier` are taken at this level.
    pub fn requires(&self, tier: LockTier) -> bool {
        self.level >= tier as u8
    }
}

/// A mutex that is either real or a no-op, fixed at construction.
#[derive(Debug)]
pub struct LevelLock {
    inner: Mutex<()>,
    tier: LockTier,
    enabled: bool,
}

/// Guard returned by [`LevelLock::lock`]; holds nothing when disabled.
pub struct LevelGuard<'a> {
    _guard: Option<MutexGuard<'a, ()>>,
}

impl LevelLock {
    /// Lock of `tier`, real only if `policy` requires that tier.
    pub fn new(policy: LockPolicy, tier: LockTier) -> Self {
        Self {
            inner: Mutex::new(()),
            tier,
            enabled: policy.requires(tier),
        }
    }

    /// Blocking acquire; a disabled lock returns at once.
    pub fn lock(&self) -> LevelGuard<'_> {
        LevelGuard {
            _guard: self.enabled.then(|| self.inner.lock()),
        }
    }

    /// Non-blocking acquire; a disabled lock always succeeds.
    pub fn try_lock(&self) -> Option<LevelGuard<'_>> {
        if !self.enabled {
            return Some(LevelGuard { _guard: None });
        }
        self.inner.try_lock().map(|g| LevelGuard { _guard: Some(g) })
    }

    /// False when the lock is a no-op.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Tier the lock serves.
    pub fn tier(&self) -> LockTier {
        self.tier
    }
}
