//! Provider activity counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Point-in-time copy of provider metrics.
pub struct MetricsSnapshot {
    /// Operations handed to the lower transport.
    pub ops_posted: u64,
    /// Success entries written to CQs.
    pub completions_reported: u64,
    /// Error entries written to CQs.
    pub errors_reported: u64,
    /// Internal or inject failures logged but not surfaced.
    pub errors_suppressed: u64,
    /// Triggered operations fired.
    pub triggers_fired: u64,
    /// Pending triggers dropped when their counter closed.
    pub triggers_discarded: u64,
    /// Regions successfully registered.
    pub regions_registered: u64,
    /// Regions deregistered.
    pub regions_deregistered: u64,
    /// Failed memory region verifications.
    pub verify_failures: u64,
    /// Progress passes over a lower context.
    pub progress_calls: u64,
}

/// Lock-free metrics shared across a domain.
#[derive(Default)]
pub struct ProviderMetrics {
    ops_posted: AtomicU64,
    completions_reported: AtomicU64,
    errors_reported: AtomicU64,
    errors_suppressed: AtomicU64,
    triggers_fired: AtomicU64,
    triggers_discarded: AtomicU64,
    regions_registered: AtomicU64,
    regions_deregistered: AtomicU64,
    verify_failures: AtomicU64,
    progress_calls: AtomicU64,
}

impl std::fmt::Debug for ProviderMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ProviderMetrics {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One more operation posted.
    pub fn inc_ops_posted(&self) {
        self.ops_posted.fetch_add(1, Ordering::Relaxed);
    }

    /// One more success entry.
    pub fn inc_completions_reported(&self) {
        self.completions_reported.fetch_add(1, Ordering::Relaxed);
    }

    /// One more error entry.
    pub fn inc_errors_reported(&self) {
        self.errors_reported.fetch_add(1, Ordering::Relaxed);
    }

    /// One more suppressed error.
    pub fn inc_errors_suppressed(&self) {
        self.errors_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// One more trigger fired.
    pub fn inc_triggers_fired(&self) {
        self.triggers_fired.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `n` discarded triggers.
    pub fn add_triggers_discarded(&self, n: u64) {
        self.triggers_discarded.fetch_add(n, Ordering::Relaxed);
    }

    /// One more region registered.
    pub fn inc_regions_registered(&self) {
        self.regions_registered.fetch_add(1, Ordering::Relaxed);
    }

    /// One more region deregistered.
    pub fn inc_regions_deregistered(&self) {
        self.regions_deregistered.fetch_add(1, Ordering::Relaxed);
    }

    /// One more rejected verification.
    pub fn inc_verify_failures(&self) {
        self.verify_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// One more progress pass.
    pub fn inc_progress_calls(&self) {
        self.progress_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ops_posted: self.ops_posted.load(Ordering::Relaxed),
            completions_reported: self.completions_reported.load(Ordering::Relaxed),
            errors_reported: self.errors_reported.load(Ordering::Relaxed),
            errors_suppressed: self.errors_suppressed.load(Ordering::Relaxed),
            triggers_fired: self.triggers_fired.load(Ordering::Relaxed),
            triggers_discarded: self.triggers_discarded.load(Ordering::Relaxed),
            regions_registered: self.regions_registered.load(Ordering::Relaxed),
            regions_deregistered: self.regions_deregistered.load(Ordering::Relaxed),
            verify_failures: self.verify_failures.load(Ordering::Relaxed),
            progress_calls: self.progress_calls.load(Ordering::Relaxed),
        }
    }
}
