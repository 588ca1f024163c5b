//! Adaptive polling of a remote resource over an unreliable network.
//!
//! This crate drives a long-running poll loop against a single HTTP resource using
//! conditional requests (`If-None-Match` / `ETag`), and keeps the pressure it puts on
//! that resource bounded and self-adjusting:
//!
//! 1. **Rate gate**: every request holds a slot from a [`RateGate`], which caps both
//!    the number of requests in flight and the number of grants per second.
//! 2. **Adaptive backoff**: the interval between polls is reset to its base after fresh
//!    data and grows multiplicatively after "no change", overload, timeouts and other
//!    failures, capped at a configured maximum.
//! 3. **Fault-isolated dispatch**: every cycle publishes an [`Event`] to the subscribers
//!    registered on an [`EventDispatcher`]. A handler that errors or panics is logged and
//!    skipped; it never reaches the other handlers or the poll loop.
//!
//! # Basic Usage
//! ```no_run
//! use adaptive_poller::adaptive_polling::{PollerSettings, dispatcher::{Event, EventKind}, engine::PollEngine};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let settings = PollerSettings::builder()
//!     .base_interval_secs(5.0)
//!     .max_interval_secs(60.0)
//!     .build();
//! let engine = PollEngine::reqwest("https://example.com/products", settings)?;
//! engine.subscribe(EventKind::DataUpdated, |event: &Event| {
//!     println!("{event:?}");
//!     Ok(())
//! });
//! engine.start();
//! // ...
//! engine.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Metrics
//! Emits metrics through the `metrics` facade; no recorder is installed by this crate.
//!
//! [`RateGate`]: adaptive_polling::rate_gate::RateGate
//! [`Event`]: adaptive_polling::dispatcher::Event
//! [`EventDispatcher`]: adaptive_polling::dispatcher::EventDispatcher
pub mod adaptive_polling;
#[cfg(test)]
pub(crate) mod test_utils;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
