//! Poll a single resource with rate gating, adaptive backoff and event fan-out.

pub mod backoff;
pub mod dispatcher;
pub mod engine;
pub mod http;
pub mod internal_event;
pub mod rate_gate;
pub mod reqwest_integration;
pub mod validation;

use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

use self::{
    backoff::BackoffPolicy,
    rate_gate::{RateGateConfig, RateLimit},
};

/// Errors raised while turning [`PollerSettings`] into the typed policies.
///
/// These are the only errors allowed to abort startup; they are reported before a poll
/// loop is ever spawned.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("base interval must be a positive number of seconds, got {value}"))]
    InvalidBaseInterval { value: f64 },

    #[snafu(display("max interval ({max}s) must be a finite number >= base interval ({base}s)"))]
    MaxBelowBase { base: f64, max: f64 },

    #[snafu(display("{name} multiplier must be a finite number > 1, got {value}"))]
    InvalidMultiplier { name: &'static str, value: f64 },

    #[snafu(display("max concurrent operations must be at least 1"))]
    ZeroConcurrency,

    #[snafu(display("max concurrent operations must be at most {max}, got {value}"))]
    ConcurrencyTooLarge { value: usize, max: usize },

    #[snafu(display("max operations per second must be a positive number, got {value}"))]
    InvalidRate { value: f64 },

    #[snafu(display("request timeout must be a positive number of seconds, got {value}"))]
    InvalidTimeout { value: f64 },
}

/// Configuration of a poller.
///
/// Intervals and timeouts are expressed in seconds. All values are checked by
/// [`PollerSettings::validate`], which every constructor in this crate calls, so an
/// inconsistent configuration is rejected before a poll loop is ever started.
///
/// | Parameter | Default | Constraint |
/// |-----------|---------|------------|
/// | `base_interval_secs` | 5 | `> 0` |
/// | `max_interval_secs` | 60 | `>= base_interval_secs` |
/// | `no_change_multiplier` | 1.5 | `> 1` |
/// | `overload_multiplier` | 2.0 | `> 1` |
/// | `max_concurrent` | 1 | `>= 1` |
/// | `max_per_second` | unlimited | `> 0` when set |
/// | `request_timeout_secs` | 10 | `> 0` |
///
/// # Example
///
/// ```rust
/// use adaptive_poller::adaptive_polling::PollerSettings;
///
/// let settings = PollerSettings::builder()
///     .base_interval_secs(2.0)
///     .max_interval_secs(30.0)
///     .max_per_second(5.0)
///     .build();
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollerSettings {
    /// Interval used after fresh data, and the floor of the adaptive interval.
    #[builder(default = default_base_interval_secs())]
    pub(super) base_interval_secs: f64,

    /// Ceiling of the adaptive interval.
    ///
    /// A quiescent or struggling resource ends up polled once per this many seconds, so
    /// this is also the worst-case staleness of the data seen by subscribers.
    #[builder(default = default_max_interval_secs())]
    pub(super) max_interval_secs: f64,

    /// Growth factor applied when the server reports "not modified".
    #[builder(default = default_no_change_multiplier())]
    pub(super) no_change_multiplier: f64,

    /// Growth factor applied on overload (5xx / 429), timeouts and other failures.
    #[builder(default = default_overload_multiplier())]
    pub(super) overload_multiplier: f64,

    /// Maximum number of requests holding a rate gate slot at the same time.
    #[builder(default = default_max_concurrent())]
    pub(super) max_concurrent: usize,

    /// Maximum number of slots granted per second. `None` means unlimited.
    pub(super) max_per_second: Option<f64>,

    /// Upper bound on a single network request.
    ///
    /// An in-flight request is not interrupted by `stop()`, so this is also the
    /// worst-case shutdown latency of a poller.
    #[builder(default = default_request_timeout_secs())]
    pub(super) request_timeout_secs: f64,
}

const fn default_base_interval_secs() -> f64 {
    5.0
}

const fn default_max_interval_secs() -> f64 {
    60.0
}

const fn default_no_change_multiplier() -> f64 {
    1.5
}

const fn default_overload_multiplier() -> f64 {
    2.0
}

const fn default_max_concurrent() -> usize {
    1
}

const fn default_request_timeout_secs() -> f64 {
    10.0
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            base_interval_secs: default_base_interval_secs(),
            max_interval_secs: default_max_interval_secs(),
            no_change_multiplier: default_no_change_multiplier(),
            overload_multiplier: default_overload_multiplier(),
            max_concurrent: default_max_concurrent(),
            max_per_second: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// The typed, checked form of [`PollerSettings`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ValidatedSettings {
    pub backoff: BackoffPolicy,
    pub rate_gate: RateGateConfig,
    pub request_timeout: Duration,
}

impl PollerSettings {
    pub fn base_interval_secs(&self) -> f64 {
        self.base_interval_secs
    }

    pub fn max_interval_secs(&self) -> f64 {
        self.max_interval_secs
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_per_second(&self) -> Option<f64> {
        self.max_per_second
    }

    pub fn request_timeout_secs(&self) -> f64 {
        self.request_timeout_secs
    }

    /// Checks every invariant and builds the backoff policy, rate gate configuration
    /// and request timeout.
    pub fn validate(&self) -> Result<ValidatedSettings, ConfigError> {
        let backoff = BackoffPolicy::new(
            secs(self.base_interval_secs)
                .ok_or(ConfigError::InvalidBaseInterval { value: self.base_interval_secs })?,
            secs(self.max_interval_secs).ok_or(ConfigError::MaxBelowBase {
                base: self.base_interval_secs,
                max: self.max_interval_secs,
            })?,
            self.no_change_multiplier,
            self.overload_multiplier,
        )?;

        let rate_limit = match self.max_per_second {
            None => RateLimit::Unlimited,
            Some(value) => {
                ensure!(value.is_finite() && value > 0.0, InvalidRateSnafu { value });
                RateLimit::PerSecond(value)
            }
        };
        let rate_gate = RateGateConfig::new(self.max_concurrent, rate_limit)?;

        let request_timeout = secs(self.request_timeout_secs).ok_or(ConfigError::InvalidTimeout {
            value: self.request_timeout_secs,
        })?;

        Ok(ValidatedSettings {
            backoff,
            rate_gate,
            request_timeout,
        })
    }
}

/// A strictly positive, representable number of seconds.
fn secs(value: f64) -> Option<Duration> {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).ok()
    } else {
        None
    }
}
