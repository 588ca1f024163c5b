//! Bound the number of in-flight operations and the rate at which they start.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use snafu::{Snafu, ensure};
use tokio::{
    sync::{Mutex, OwnedSemaphorePermit, Semaphore},
    time::{Instant, sleep_until},
};

use super::{
    ConcurrencyTooLargeSnafu, ConfigError, InvalidRateSnafu, ZeroConcurrencySnafu,
    internal_event::{InternalEvent, RateGateInFlight, RateGateSlotGranted},
};

/// How many slots may be granted per second.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RateLimit {
    Unlimited,
    PerSecond(f64),
}

impl RateLimit {
    /// Minimum spacing between two consecutive grants.
    ///
    /// Saturates at `Duration::MAX`; a rate is never mistaken for "unlimited".
    fn spacing(&self) -> Option<Duration> {
        match self {
            RateLimit::Unlimited => None,
            RateLimit::PerSecond(rate) => {
                Some(Duration::try_from_secs_f64(1.0 / rate).unwrap_or(Duration::MAX))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateGateConfig {
    max_concurrent: usize,
    rate_limit: RateLimit,
}

impl RateGateConfig {
    pub fn new(max_concurrent: usize, rate_limit: RateLimit) -> Result<Self, ConfigError> {
        ensure!(max_concurrent >= 1, ZeroConcurrencySnafu);
        ensure!(
            max_concurrent <= Semaphore::MAX_PERMITS,
            ConcurrencyTooLargeSnafu {
                value: max_concurrent,
                max: Semaphore::MAX_PERMITS,
            }
        );
        if let RateLimit::PerSecond(value) = rate_limit {
            ensure!(value.is_finite() && value > 0.0, InvalidRateSnafu { value });
        }

        Ok(Self {
            max_concurrent,
            rate_limit,
        })
    }

    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub const fn rate_limit(&self) -> RateLimit {
        self.rate_limit
    }
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum AcquireError {
    #[snafu(display("rate gate is closed"))]
    Closed,
}

/// A point-in-time view of a gate, for diagnostics only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateGateStats {
    pub max_concurrent: usize,
    /// Slots currently granted and not yet released.
    pub held: usize,
    /// Permits not held by anyone, including callers still waiting out the pacing delay.
    pub free: usize,
    /// Callers inside `acquire` that have not been granted a slot yet.
    pub waiting: usize,
}

struct Inner {
    config: RateGateConfig,
    spacing: Option<Duration>,
    permits: Arc<Semaphore>,
    // Grant-to-grant pacing; held across the pacing sleep so grants are serialized.
    last_grant: Mutex<Option<Instant>>,
    held: AtomicUsize,
    waiting: AtomicUsize,
}

/// A counting gate combined with grant-to-grant pacing.
///
/// [`RateGate::acquire`] resolves once fewer than `max_concurrent` slots are held *and*
/// at least `1 / max_per_second` has elapsed since the previous slot was granted.
/// Releasing a slot returns its permit but leaves the pacing clock alone, so the grant
/// rate never exceeds `max_per_second` regardless of `max_concurrent`.
///
/// The gate is a cheap handle: clones share the same permits and pacing clock, which is
/// how several engines are made to share one budget.
#[derive(Clone)]
pub struct RateGate {
    inner: Arc<Inner>,
}

impl RateGate {
    pub fn new(config: RateGateConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                spacing: config.rate_limit.spacing(),
                permits: Arc::new(Semaphore::new(config.max_concurrent)),
                last_grant: Mutex::new(None),
                held: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> RateGateConfig {
        self.inner.config
    }

    /// Waits for a slot.
    ///
    /// Cancel-safe: dropping the returned future while it waits for a permit or for the
    /// pacing delay grants nothing, returns any permit already taken, and leaves the
    /// pacing clock untouched.
    pub async fn acquire(&self) -> Result<RateGateSlot, AcquireError> {
        let started = Instant::now();
        let _waiting = WaitingGuard::enter(&self.inner.waiting);

        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| AcquireError::Closed)?;

        let granted_at = {
            let mut last_grant = self.inner.last_grant.lock().await;
            if let (Some(spacing), Some(previous)) = (self.inner.spacing, *last_grant) {
                match previous.checked_add(spacing) {
                    Some(deadline) => sleep_until(deadline).await,
                    // The next grant lies beyond the clock's range.
                    None => std::future::pending::<()>().await,
                }
            }
            let now = Instant::now();
            *last_grant = Some(now);
            now
        };

        let held = self.inner.held.fetch_add(1, Ordering::AcqRel) + 1;
        RateGateSlotGranted {
            waited: granted_at.saturating_duration_since(started),
        }
        .emit();
        RateGateInFlight { held }.emit();

        Ok(RateGateSlot {
            inner: Arc::clone(&self.inner),
            granted_at,
            _permit: permit,
        })
    }

    /// Refuses all future grants and wakes every waiter with [`AcquireError::Closed`].
    /// Slots already granted stay valid until dropped.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    pub fn stats(&self) -> RateGateStats {
        RateGateStats {
            max_concurrent: self.inner.config.max_concurrent,
            held: self.inner.held.load(Ordering::Acquire),
            free: self.inner.permits.available_permits(),
            waiting: self.inner.waiting.load(Ordering::Acquire),
        }
    }
}

impl std::fmt::Debug for RateGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGate")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A lease on one concurrent operation. The permit goes back to the gate on drop.
#[must_use = "the slot is released as soon as it is dropped"]
pub struct RateGateSlot {
    inner: Arc<Inner>,
    granted_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl RateGateSlot {
    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }
}

impl Drop for RateGateSlot {
    fn drop(&mut self) {
        let held = self.inner.held.fetch_sub(1, Ordering::AcqRel) - 1;
        RateGateInFlight { held }.emit();
    }
}

impl std::fmt::Debug for RateGateSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGateSlot")
            .field("granted_at", &self.granted_at)
            .finish()
    }
}
