//! Completion counters and their trigger lists.
//!
//! A counter keeps a success and an error value. Every success increment
//! (or `set`) re-evaluates the pending triggers under the counter's own
//! lock and moves the satisfied ones, in registration order, to the ready
//! queue of the owning context. Error increments never satisfy triggers.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{ProviderError, ProviderResult};
use crate::metrics::ProviderMetrics;
use crate::progress::ProgressHook;
use crate::trigger::{Trigger, TriggerQueue};
use crate::wait::{self, ControlCommand, ControlReply, Deadline, WaitObj, WaitObject};

/// Counter open attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CntrAttr {
    /// Unspecified takes the configured default.
    pub wait_obj: WaitObj,
}

/// Success/error counter pair.
pub struct Counter {
    success: AtomicU64,
    error: AtomicU64,
    wait: Option<Arc<WaitObject>>,
    wait_obj: WaitObj,
    pending: Mutex<Vec<Trigger>>,
    ready: Arc<TriggerQueue>,
    progress: OnceLock<Weak<dyn ProgressHook>>,
    bindings: AtomicUsize,
    closed: AtomicBool,
    progress_interval: Duration,
    metrics: Arc<ProviderMetrics>,
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("success", &self.success.load(Ordering::Relaxed))
            .field("error", &self.error.load(Ordering::Relaxed))
            .field("wait_obj", &self.wait_obj)
            .finish()
    }
}

impl Counter {
    /// Opens a counter whose satisfied triggers go to `ready`.
    pub fn open(
        attr: CntrAttr,
        config: &ProviderConfig,
        ready: Arc<TriggerQueue>,
        metrics: Arc<ProviderMetrics>,
    ) -> ProviderResult<Self> {
        let wait_obj = attr.wait_obj.resolve(config.default_wait);
        let wait = match wait_obj {
            WaitObj::None => None,
            WaitObj::Unspec => return Err(ProviderError::invalid("wait object left unspecified")),
            kind => Some(Arc::new(WaitObject::new(kind))),
        };
        Ok(Self {
            success: AtomicU64::new(0),
            error: AtomicU64::new(0),
            wait,
            wait_obj,
            pending: Mutex::new(Vec::new()),
            ready,
            progress: OnceLock::new(),
            bindings: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            progress_interval: config.progress_interval(),
            metrics,
        })
    }

    /// Wait object kind in effect.
    pub fn wait_obj(&self) -> WaitObj {
        self.wait_obj
    }

    /// Installs the progress driver run before reads and waits.
    pub fn set_progress(&self, hook: Weak<dyn ProgressHook>) {
        if self.progress.set(hook).is_err() {
            debug!("counter progress hook already set");
        }
    }

    fn run_progress(&self) {
        if let Some(engine) = self.progress.get().and_then(Weak::upgrade) {
            engine.progress();
        }
    }

    fn signal(&self) {
        if let Some(wait) = &self.wait {
            wait.signal();
        }
    }

    /// Moves satisfied triggers to the ready queue, oldest first.
    fn check_triggers(&self) {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return;
        }
        let value = self.success.load(Ordering::Acquire);
        let (fire, keep): (Vec<Trigger>, Vec<Trigger>) =
            pending.drain(..).partition(|t| t.threshold <= value);
        *pending = keep;
        for trigger in fire {
            debug!(value, threshold = trigger.threshold, op = trigger.op.name(), "trigger ready");
            self.ready.push(trigger);
        }
    }

    /// One more completed operation.
    pub fn increment_success(&self) {
        self.add(1);
    }

    /// One more failed operation.
    pub fn increment_error(&self) {
        self.add_err(1);
    }

    /// Adds to the success value and readies satisfied triggers.
    pub fn add(&self, value: u64) {
        self.success.fetch_add(value, Ordering::AcqRel);
        self.check_triggers();
        self.signal();
    }

    /// Adds to the error value.
    pub fn add_err(&self, value: u64) {
        self.error.fetch_add(value, Ordering::AcqRel);
        self.signal();
    }

    /// Overwrites the success value and readies satisfied triggers.
    pub fn set(&self, value: u64) {
        self.success.store(value, Ordering::Release);
        self.check_triggers();
        self.signal();
    }

    /// Overwrites the error value.
    pub fn set_err(&self, value: u64) {
        self.error.store(value, Ordering::Release);
        self.signal();
    }

    /// Current success value after driving progress.
    pub fn read(&self) -> u64 {
        self.run_progress();
        self.success.load(Ordering::Acquire)
    }

    /// Current error value after driving progress.
    pub fn read_err(&self) -> u64 {
        self.run_progress();
        self.error.load(Ordering::Acquire)
    }

    /// Success value without driving progress.
    pub fn value(&self) -> u64 {
        self.success.load(Ordering::Acquire)
    }

    /// Error value without driving progress.
    pub fn error_value(&self) -> u64 {
        self.error.load(Ordering::Acquire)
    }

    /// Registers a trigger; it becomes ready at once if already satisfied.
    pub fn add_trigger(&self, trigger: Trigger) -> ProviderResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProviderError::bad_state("counter closed"));
        }
        self.pending.lock().push(trigger);
        self.check_triggers();
        Ok(())
    }

    /// Triggers still waiting for their threshold.
    pub fn pending_triggers(&self) -> usize {
        self.pending.lock().len()
    }

    fn require_wait(&self) -> ProviderResult<&Arc<WaitObject>> {
        self.wait
            .as_ref()
            .ok_or_else(|| ProviderError::unsupported("counter wait without a wait object"))
    }

    /// Blocks until the success value reaches `threshold`.
    ///
    /// Fails with `ErrorAvailable` if the error value moves while waiting
    /// and with `TimedOut` when `timeout` passes.
    pub fn wait(&self, threshold: u64, timeout: Duration) -> ProviderResult<()> {
        let wait = self.require_wait()?;
        let errors = self.error_value();
        let deadline = Deadline::after(timeout);
        loop {
            let seen = wait.sequence();
            self.run_progress();
            if self.value() >= threshold {
                return Ok(());
            }
            if self.error_value() != errors {
                return Err(ProviderError::ErrorAvailable);
            }
            let Some(slice) = deadline.slice(self.progress_interval) else {
                return Err(ProviderError::TimedOut);
            };
            wait.wait_since(seen, slice);
        }
    }

    /// Async counterpart of [`Counter::wait`].
    pub async fn wait_async(&self, threshold: u64, timeout: Duration) -> ProviderResult<()> {
        let wait = self.require_wait()?.clone();
        let errors = self.error_value();
        let deadline = Deadline::after(timeout);
        loop {
            let seen = wait.sequence();
            self.run_progress();
            if self.value() >= threshold {
                return Ok(());
            }
            if self.error_value() != errors {
                return Err(ProviderError::ErrorAvailable);
            }
            let Some(slice) = deadline.slice(self.progress_interval) else {
                return Err(ProviderError::TimedOut);
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

    /// Endpoints and regions currently bound to this counter.
    pub fn bindings(&self) -> usize {
        self.bindings.load(Ordering::Acquire)
    }

    /// Closes the counter, discarding pending triggers without firing them.
    /// Returns how many were discarded.
    pub fn close(&self) -> ProviderResult<usize> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ProviderError::bad_state("counter already closed"));
        }
        let discarded = self.pending.lock().drain(..).count();
        if discarded > 0 {
            debug!(discarded, "discarding pending triggers");
            self.metrics.add_triggers_discarded(discarded as u64);
        }
        self.signal();
        Ok(discarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errno;

    fn open(wait_obj: WaitObj) -> Counter {
        Counter::open(
            CntrAttr { wait_obj },
            &ProviderConfig::default(),
            Arc::new(TriggerQueue::new()),
            Arc::new(ProviderMetrics::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_add_and_set() {
        let cntr = open(WaitObj::None);
        cntr.increment_success();
        cntr.add(4);
        assert_eq!(cntr.read(), 5);
        cntr.set(2);
        assert_eq!(cntr.read(), 2);
        cntr.increment_error();
        cntr.add_err(2);
        assert_eq!(cntr.read_err(), 3);
        cntr.set_err(0);
        assert_eq!(cntr.read_err(), 0);
    }

    #[test]
    fn test_wait_reaches_threshold() {
        let cntr = Arc::new(open(WaitObj::MutexCond));
        let bumper = cntr.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..3 {
                std::thread::sleep(Duration::from_millis(2));
                bumper.increment_success();
            }
        });
        cntr.wait(3, Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let cntr = open(WaitObj::PollFd);
        assert_eq!(
            cntr.wait(1, Duration::from_millis(5)).unwrap_err(),
            ProviderError::TimedOut
        );
    }

    #[test]
    fn test_wait_reports_errors() {
        let cntr = Arc::new(open(WaitObj::PollFd));
        let bumper = cntr.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            bumper.increment_error();
        });
        assert_eq!(
            cntr.wait(1, Duration::from_secs(5)).unwrap_err(),
            ProviderError::ErrorAvailable
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_without_wait_object() {
        let cntr = open(WaitObj::None);
        assert_eq!(
            cntr.wait(0, Duration::from_millis(1)).unwrap_err().errno(),
            errno::ENOSYS
        );
        assert_eq!(
            cntr.control(ControlCommand::GetWait).unwrap_err().errno(),
            errno::ENODATA
        );
    }

    #[tokio::test]
    async fn test_wait_async() {
        let cntr = Arc::new(open(WaitObj::PollFd));
        let bumper = cntr.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            bumper.add(2);
        });
        cntr.wait_async(2, Duration::from_secs(5)).await.unwrap();
    }

    #[test]
    fn test_close_twice() {
        let cntr = open(WaitObj::None);
        assert_eq!(cntr.close().unwrap(), 0);
        assert!(cntr.close().is_err());
    }
}
