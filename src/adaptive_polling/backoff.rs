use std::{fmt, time::Duration};

use snafu::ensure;

use super::{ConfigError, InvalidMultiplierSnafu, MaxBelowBaseSnafu};

/// The result of one poll cycle, as far as pacing is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The server returned a new representation.
    Fresh,
    /// The cached representation is still valid (`304 Not Modified`).
    NotModified,
    /// The server signaled overload (5xx or `429 Too Many Requests`).
    Overloaded,
    /// The request did not complete within the request timeout.
    TimedOut,
    /// Any other failure: connection errors, rejected requests, undecodable bodies.
    Failed,
}

impl Outcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Outcome::Fresh => "fresh",
            Outcome::NotModified => "not_modified",
            Outcome::Overloaded => "overloaded",
            Outcome::TimedOut => "timed_out",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable backoff configuration.
///
/// Invariant: `0 < base <= max` and both multipliers are finite and `> 1`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    no_change_multiplier: f64,
    overload_multiplier: f64,
}

impl BackoffPolicy {
    pub fn new(
        base: Duration,
        max: Duration,
        no_change_multiplier: f64,
        overload_multiplier: f64,
    ) -> Result<Self, ConfigError> {
        ensure!(
            !base.is_zero(),
            super::InvalidBaseIntervalSnafu {
                value: base.as_secs_f64()
            }
        );
        ensure!(
            base <= max,
            MaxBelowBaseSnafu {
                base: base.as_secs_f64(),
                max: max.as_secs_f64(),
            }
        );
        ensure!(
            no_change_multiplier.is_finite() && no_change_multiplier > 1.0,
            InvalidMultiplierSnafu {
                name: "no-change",
                value: no_change_multiplier,
            }
        );
        ensure!(
            overload_multiplier.is_finite() && overload_multiplier > 1.0,
            InvalidMultiplierSnafu {
                name: "overload",
                value: overload_multiplier,
            }
        );

        Ok(Self {
            base,
            max,
            no_change_multiplier,
            overload_multiplier,
        })
    }

    pub const fn base(&self) -> Duration {
        self.base
    }

    pub const fn max(&self) -> Duration {
        self.max
    }

    pub const fn no_change_multiplier(&self) -> f64 {
        self.no_change_multiplier
    }

    pub const fn overload_multiplier(&self) -> f64 {
        self.overload_multiplier
    }

    /// The transition function: the interval to wait after a cycle that ended with
    /// `outcome`, given the interval in effect before it.
    ///
    /// Fresh data resets to `base`. Every other outcome grows the interval by the
    /// matching multiplier, capped at `max`. The result always lies in `[base, max]`.
    pub fn next_interval(&self, current: Duration, outcome: Outcome) -> Duration {
        let multiplier = match outcome {
            Outcome::Fresh => return self.base,
            Outcome::NotModified => self.no_change_multiplier,
            Outcome::Overloaded | Outcome::TimedOut | Outcome::Failed => self.overload_multiplier,
        };

        // Saturate at `max` instead of panicking when the product is not a valid Duration.
        Duration::try_from_secs_f64(current.as_secs_f64() * multiplier)
            .unwrap_or(self.max)
            .clamp(self.base, self.max)
    }
}

/// The current polling interval of one running engine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffState {
    current: Duration,
}

impl BackoffState {
    pub const fn new(policy: &BackoffPolicy) -> Self {
        Self {
            current: policy.base,
        }
    }

    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Applies one completed cycle and returns the new interval.
    pub fn advance(&mut self, policy: &BackoffPolicy, outcome: Outcome) -> Duration {
        let previous = self.current;
        self.current = policy.next_interval(previous, outcome);
        trace!(
            message = "Backoff advanced.",
            %outcome,
            previous_secs = previous.as_secs_f64(),
            current_secs = self.current.as_secs_f64()
        );
        self.current
    }
}
