//! Cross-process conditions placed at fixed segment offsets.
//!
//! A [`Condition`] wraps one native wait cell. Waits are split into short native calls
//! (a spin poll or a capped OS wait) so that cancellation, segment destruction and the
//! optional tick callback are observed between slices, never mid-call.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::backoff::{remaining, Backoff, CancelToken, WaitPolicy};
use crate::segment::{ByteView, Dependent, DependentId, Segment, TeardownError};
use crate::wait::{LockStrategy, NativeWait, OsCell, SpinCell};
use crate::{Resource, ShmemError, ShmemResult};

/// Callback run periodically while a wait is blocked; an error aborts the wait.
pub type WaitTick<'a> = &'a mut dyn FnMut(Duration) -> ShmemResult<()>;

/// Signal/wait flag shared between processes.
#[derive(Clone)]
pub struct Condition {
    inner: Arc<ConditionInner>,
}

struct ConditionInner {
    view: ByteView,
    strategy: LockStrategy,
    auto_reset: bool,
    policy: WaitPolicy,
    closed: AtomicBool,
    registration: Mutex<Option<DependentId>>,
}

impl Dependent for ConditionInner {
    fn teardown(&self) -> Result<(), TeardownError> {
        self.closed.store(true, Ordering::Release);
        self.registration.lock().take();
        Ok(())
    }
}

impl Drop for ConditionInner {
    fn drop(&mut self) {
        if let Some(id) = self.registration.get_mut().take() {
            self.view.segment().unregister_dependent(id);
        }
    }
}

impl Segment {
    /// Initializes a fresh condition at `offset` using the default [`WaitPolicy`].
    pub fn new_condition(
        &self,
        offset: usize,
        strategy: LockStrategy,
        auto_reset: bool,
    ) -> ShmemResult<Condition> {
        Condition::create(self, offset, strategy, auto_reset, WaitPolicy::default())
    }

    /// Attaches to a condition another party initialized at `offset`.
    pub fn existing_condition(
        &self,
        offset: usize,
        strategy: LockStrategy,
    ) -> ShmemResult<Condition> {
        Condition::attach(self, offset, strategy, WaitPolicy::default())
    }
}

impl Condition {
    pub fn create(
        segment: &Segment,
        offset: usize,
        strategy: LockStrategy,
        auto_reset: bool,
        policy: WaitPolicy,
    ) -> ShmemResult<Self> {
        let view = segment.view(offset, strategy.backing_size())?;
        with_cell(&view, strategy, |cell| cell.init(auto_reset))?;
        trace!(offset, ?strategy, auto_reset, "initialized condition");
        Self::register(view, strategy, auto_reset, policy)
    }

    pub fn attach(
        segment: &Segment,
        offset: usize,
        strategy: LockStrategy,
        policy: WaitPolicy,
    ) -> ShmemResult<Self> {
        let view = segment.view(offset, strategy.backing_size())?;
        let auto_reset = with_cell(&view, strategy, |cell| {
            if !cell.is_initialized() {
                return Err(ShmemError::Uninitialized { offset });
            }
            Ok(cell.auto_reset())
        })?;
        Self::register(view, strategy, auto_reset, policy)
    }

    fn register(
        view: ByteView,
        strategy: LockStrategy,
        auto_reset: bool,
        policy: WaitPolicy,
    ) -> ShmemResult<Self> {
        let inner = Arc::new(ConditionInner {
            view,
            strategy,
            auto_reset,
            policy,
            closed: AtomicBool::new(false),
            registration: Mutex::new(None),
        });
        let weak = Arc::downgrade(&inner);
        let weak: Weak<dyn Dependent> = weak;
        let id = inner.view.segment().register_dependent(weak)?;
        *inner.registration.lock() = Some(id);
        Ok(Self { inner })
    }

    pub fn offset(&self) -> usize {
        self.inner.view.offset()
    }

    pub fn strategy(&self) -> LockStrategy {
        self.inner.strategy
    }

    pub fn auto_reset(&self) -> bool {
        self.inner.auto_reset
    }

    pub fn backing_size(&self) -> usize {
        self.inner.strategy.backing_size()
    }

    pub fn policy(&self) -> &WaitPolicy {
        &self.inner.policy
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn signal(&self) -> ShmemResult<()> {
        self.ensure_live()?;
        self.with_cell(|cell| cell.signal())
    }

    pub fn clear(&self) -> ShmemResult<()> {
        self.ensure_live()?;
        self.with_cell(|cell| cell.clear())
    }

    pub fn is_signaled(&self) -> ShmemResult<bool> {
        self.ensure_live()?;
        self.with_cell(|cell| Ok(cell.is_signaled()))
    }

    /// Waits until signalled (`true`) or `timeout` elapses (`false`).
    ///
    /// A zero timeout checks the flag exactly once.
    pub fn wait(&self, timeout: Duration) -> ShmemResult<bool> {
        self.wait_with(timeout, None, None)
    }

    /// [`Condition::wait`] with cancellation and a tick callback.
    ///
    /// `on_tick` receives the elapsed wait time roughly once per
    /// [`WaitPolicy::tick_interval`]; its error ends the wait.
    pub fn wait_with(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
        mut on_tick: Option<WaitTick<'_>>,
    ) -> ShmemResult<bool> {
        let policy = &self.inner.policy;
        let started = Instant::now();
        let deadline = started.checked_add(timeout);
        let mut backoff = Backoff::new(policy);
        let mut next_tick = policy.tick_interval;

        loop {
            self.ensure_live()?;
            if let Some(cancel) = cancel {
                cancel.check()?;
            }

            let slice = match self.inner.strategy {
                LockStrategy::Spin => policy.spin_poll,
                LockStrategy::Os => policy.os_slice,
            }
            .min(remaining(deadline));
            if self.with_cell(|cell| cell.try_wait(slice))? {
                return Ok(true);
            }

            let elapsed = started.elapsed();
            if let Some(tick) = on_tick.as_deref_mut() {
                if elapsed >= next_tick {
                    tick(elapsed)?;
                    next_tick = elapsed + policy.tick_interval;
                }
            }

            let left = remaining(deadline);
            if left.is_zero() {
                return Ok(false);
            }
            if self.inner.strategy == LockStrategy::Spin {
                backoff.snooze(left);
            }
        }
    }

    /// Marks the condition closed; later operations fail with `Destroyed(Condition)`.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = self.inner.registration.lock().take() {
            self.inner.view.segment().unregister_dependent(id);
        }
    }

    fn ensure_live(&self) -> ShmemResult<()> {
        if self.inner.view.segment().is_destroyed() {
            return Err(ShmemError::Destroyed(Resource::Segment));
        }
        if self.is_closed() {
            return Err(ShmemError::Destroyed(Resource::Condition));
        }
        Ok(())
    }

    fn with_cell<R>(&self, f: impl FnOnce(&dyn NativeWait) -> ShmemResult<R>) -> ShmemResult<R> {
        with_cell(&self.inner.view, self.inner.strategy, f)
    }
}

fn with_cell<R>(
    view: &ByteView,
    strategy: LockStrategy,
    f: impl FnOnce(&dyn NativeWait) -> ShmemResult<R>,
) -> ShmemResult<R> {
    match strategy {
        LockStrategy::Spin => view.with::<SpinCell, _>(|cell| f(cell))?,
        LockStrategy::Os => view.with::<OsCell, _>(|cell| f(cell))?,
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("offset", &self.offset())
            .field("strategy", &self.inner.strategy)
            .field("auto_reset", &self.inner.auto_reset)
            .field("closed", &self.is_closed())
            .finish()
    }
}
