//! Fan out poll events to independent subscribers.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use http::StatusCode;
use serde_json::Value;

use super::internal_event::{EventHandlerFailed, EventPublished, InternalEvent};
use crate::Error;

/// The closed set of event kinds a poller publishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    DataUpdated,
    ServerError,
    RequestRejected,
    Timeout,
    NetworkError,
    DecodeError,
    ValidationFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::DataUpdated,
        EventKind::ServerError,
        EventKind::RequestRejected,
        EventKind::Timeout,
        EventKind::NetworkError,
        EventKind::DecodeError,
        EventKind::ValidationFailed,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            EventKind::DataUpdated => "data-updated",
            EventKind::ServerError => "server-error",
            EventKind::RequestRejected => "request-rejected",
            EventKind::Timeout => "timeout",
            EventKind::NetworkError => "network-error",
            EventKind::DecodeError => "decode-error",
            EventKind::ValidationFailed => "validation-failed",
        }
    }

    pub const fn is_error(&self) -> bool {
        !matches!(self, EventKind::DataUpdated)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable snapshot of what one poll cycle observed.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The resource changed; carries the decoded body.
    DataUpdated(Value),
    /// The server answered 5xx or 429.
    ServerError { status: StatusCode, message: String },
    /// The server refused the request with any other non-success status.
    RequestRejected { status: StatusCode, message: String },
    /// The request exceeded the per-request timeout.
    Timeout { message: String },
    /// The request failed before a response was received.
    NetworkError { message: String },
    /// A fresh body arrived but could not be decoded.
    DecodeError { message: String },
    /// A fresh body decoded but was rejected by the configured validator.
    ValidationFailed { errors: Vec<String>, payload: Value },
}

impl Event {
    pub const fn kind(&self) -> EventKind {
        match self {
            Event::DataUpdated(_) => EventKind::DataUpdated,
            Event::ServerError { .. } => EventKind::ServerError,
            Event::RequestRejected { .. } => EventKind::RequestRejected,
            Event::Timeout { .. } => EventKind::Timeout,
            Event::NetworkError { .. } => EventKind::NetworkError,
            Event::DecodeError { .. } => EventKind::DecodeError,
            Event::ValidationFailed { .. } => EventKind::ValidationFailed,
        }
    }

    /// The decoded body, for the kinds that carry one.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Event::DataUpdated(payload) | Event::ValidationFailed { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::DataUpdated(_) => write!(f, "data updated"),
            Event::ServerError { status, message } | Event::RequestRejected { status, message } => {
                write!(f, "{} (status {}): {}", self.kind(), status, message)
            }
            Event::Timeout { message }
            | Event::NetworkError { message }
            | Event::DecodeError { message } => write!(f, "{}: {}", self.kind(), message),
            Event::ValidationFailed { errors, .. } => {
                write!(f, "{}: {}", self.kind(), errors.join(" | "))
            }
        }
    }
}

/// Identifies one registration; registering the same handler twice yields two ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Handler = Arc<dyn Fn(&Event) -> Result<(), Error> + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    handler: Handler,
}

/// How one `publish` call went.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// A table from [`EventKind`] to an ordered list of handlers.
///
/// Handlers run synchronously on the publishing task, in registration order. A handler
/// that returns an error or panics is logged and counted, and the remaining handlers
/// still run. Nothing a handler does can fail `publish`.
///
/// `publish` works on a snapshot of the handler list taken under a read lock and
/// released before any handler runs, so handlers may subscribe or unsubscribe
/// re-entrantly; such changes take effect from the next `publish`.
#[derive(Default)]
pub struct EventDispatcher {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` to the list for `kind`. Duplicates are not collapsed.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), Error> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Subscriber {
                id,
                handler: Arc::new(handler),
            });
        debug!(message = "Handler subscribed.", event = %kind, subscription = %id);
        id
    }

    /// Removes one registration. Returns `false` if `id` is not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for list in subscribers.values_mut() {
            if let Some(position) = list.iter().position(|subscriber| subscriber.id == id) {
                list.remove(position);
                debug!(message = "Handler unsubscribed.", subscription = %id);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Invokes every handler currently registered for the event's kind.
    pub fn publish(&self, event: &Event) -> DispatchReport {
        let kind = event.kind();
        let snapshot = match self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
        {
            Some(list) if !list.is_empty() => list.clone(),
            _ => return DispatchReport::default(),
        };

        let mut report = DispatchReport::default();
        for (position, subscriber) in snapshot.iter().enumerate() {
            let failure = match catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(event))) {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some((error.to_string(), false)),
                Err(panic) => Some((panic_message(panic.as_ref()), true)),
            };

            match failure {
                None => report.delivered += 1,
                Some((error, panicked)) => {
                    report.failed += 1;
                    EventHandlerFailed {
                        kind,
                        subscription: subscriber.id.get(),
                        position,
                        error: &error,
                        panicked,
                    }
                    .emit();
                }
            }
        }

        EventPublished {
            kind,
            delivered: report.delivered,
            failed: report.failed,
        }
        .emit();
        report
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<_, _> = subscribers
            .iter()
            .map(|(kind, list)| (kind.as_str(), list.len()))
            .collect();
        f.debug_struct("EventDispatcher")
            .field("subscribers", &counts)
            .finish()
    }
}

pub(super) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic payload is not a string".to_string()
    }
}
