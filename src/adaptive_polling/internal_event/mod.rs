//! Metrics and structured log records emitted by the poller.
//!
//! Every observable point is a small struct implementing [`InternalEvent`], so the metric
//! names and log fields for one occurrence live in one place.

mod adaptive_polling;

pub use self::adaptive_polling::*;

pub trait InternalEvent: Sized {
    fn emit(self);
}
