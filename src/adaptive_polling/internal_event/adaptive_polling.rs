use std::time::Duration;

use metrics::{counter, gauge, histogram};

use super::InternalEvent;
use crate::adaptive_polling::{backoff::Outcome, dispatcher::EventKind};

#[derive(Clone, Copy, Debug)]
pub struct RateGateSlotGranted {
    pub waited: Duration,
}

impl InternalEvent for RateGateSlotGranted {
    fn emit(self) {
        histogram!("rate_gate_wait_seconds").record(self.waited);
        trace!(
            target: "adaptive_polling::rate_gate",
            waited_ms = self.waited.as_millis(),
            "Slot granted."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RateGateInFlight {
    pub held: usize,
}

impl InternalEvent for RateGateInFlight {
    fn emit(self) {
        gauge!("rate_gate_in_flight").set(self.held as f64);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PollCycleCompleted {
    pub outcome: Outcome,
    pub latency: Duration,
    pub next_interval: Duration,
}

impl InternalEvent for PollCycleCompleted {
    fn emit(self) {
        counter!("poll_cycles_total", "outcome" => self.outcome.as_str()).increment(1);
        histogram!("poll_request_duration_seconds").record(self.latency);
        histogram!("poll_interval_seconds").record(self.next_interval);
        debug!(
            target: "adaptive_polling::engine",
            outcome = %self.outcome,
            latency_ms = self.latency.as_millis(),
            next_interval_secs = self.next_interval.as_secs_f64(),
            "Poll cycle completed."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EventPublished {
    pub kind: EventKind,
    pub delivered: usize,
    pub failed: usize,
}

impl InternalEvent for EventPublished {
    fn emit(self) {
        counter!("events_published_total", "event" => self.kind.as_str()).increment(1);
        trace!(
            target: "adaptive_polling::dispatcher",
            event = %self.kind,
            delivered = self.delivered,
            failed = self.failed,
            "Event published."
        );
    }
}

#[derive(Debug)]
pub struct EventHandlerFailed<'a> {
    pub kind: EventKind,
    pub subscription: u64,
    pub position: usize,
    pub error: &'a str,
    pub panicked: bool,
}

impl InternalEvent for EventHandlerFailed<'_> {
    fn emit(self) {
        counter!("event_handler_failures_total", "event" => self.kind.as_str()).increment(1);
        error!(
            target: "adaptive_polling::dispatcher",
            message = "Event handler failed; continuing with remaining handlers.",
            event = %self.kind,
            subscription = self.subscription,
            position = self.position,
            error = %self.error,
            panicked = self.panicked
        );
    }
}
