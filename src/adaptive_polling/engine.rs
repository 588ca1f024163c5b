use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use http::StatusCode;
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
    time::{Instant, sleep, timeout},
};
use tower::{Service, ServiceExt, timeout::error::Elapsed};

use super::{
    ConfigError, PollerSettings, ValidatedSettings,
    backoff::{BackoffPolicy, BackoffState, Outcome},
    dispatcher::{Event, EventDispatcher, EventKind, SubscriptionId, panic_message},
    http::{ConditionalRequest, FetchResponse, HttpError},
    internal_event::{InternalEvent, PollCycleCompleted},
    rate_gate::RateGate,
    reqwest_integration::ReqwestTransport,
    validation::PayloadValidator,
};
use crate::Error;

/// Longest server-provided body excerpt kept in an error event message.
const MAX_MESSAGE_BODY_CHARS: usize = 200;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PollerError {
    #[snafu(display("Invalid poller configuration: {}", source))]
    Config { source: ConfigError },

    #[snafu(display("Could not build the HTTP transport: {}", source))]
    BuildTransport { source: HttpError },

    #[snafu(display("Poll loop panicked: {}", source))]
    LoopPanicked { source: JoinError },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Running,
    /// `stop()` was requested; the in-flight cycle is finishing.
    Stopping,
}

/// Observable state of an engine, published through a `watch` channel.
#[derive(Clone, Debug, PartialEq)]
pub struct PollerStatus {
    pub state: PollerState,
    /// The wait before the next cycle, as decided by the last one.
    pub current_interval: Duration,
    /// The cached validator sent as `If-None-Match`.
    pub etag: Option<String>,
    /// Cycles completed since the last `start()`.
    pub cycles: u64,
}

/// The polled resource together with its cached validator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollTarget {
    url: String,
    etag: Option<String>,
}

impl PollTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            etag: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    fn request(&self) -> ConditionalRequest {
        ConditionalRequest {
            url: self.url.clone(),
            if_none_match: self.etag.clone(),
        }
    }
}

struct Run {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Polls one URL on an adaptive schedule and publishes what it observes.
///
/// The engine owns its collaborators: a transport (any `tower::Service` speaking
/// [`ConditionalRequest`]), a [`RateGate`] that may be shared with other engines, an
/// [`EventDispatcher`] and an optional [`PayloadValidator`]. `start()` spawns a loop
/// task onto the current Tokio runtime; `stop()` lets the in-flight cycle finish and
/// waits for the loop to exit.
///
/// Dispatch is synchronous within a cycle: a slow handler delays the next sleep.
/// Dropping a running engine ends its loop at the next sleep.
pub struct PollEngine<S> {
    url: String,
    settings: ValidatedSettings,
    transport: S,
    gate: RateGate,
    dispatcher: Arc<EventDispatcher>,
    validator: Option<Arc<dyn PayloadValidator>>,
    status: Arc<watch::Sender<PollerStatus>>,
    run: Mutex<Option<Run>>,
}

impl PollEngine<ReqwestTransport> {
    /// An engine fetching over HTTP with a `reqwest` client.
    pub fn reqwest(url: impl Into<String>, settings: PollerSettings) -> Result<Self, PollerError> {
        let validated = settings.validate().context(ConfigSnafu)?;
        let transport =
            ReqwestTransport::new(validated.request_timeout).context(BuildTransportSnafu)?;
        Self::new(url, settings, transport).context(ConfigSnafu)
    }
}

impl<S> PollEngine<S> {
    pub fn new(
        url: impl Into<String>,
        settings: PollerSettings,
        transport: S,
    ) -> Result<Self, ConfigError> {
        let settings = settings.validate()?;
        let status = PollerStatus {
            state: PollerState::Idle,
            current_interval: settings.backoff.base(),
            etag: None,
            cycles: 0,
        };

        Ok(Self {
            url: url.into(),
            gate: RateGate::new(settings.rate_gate),
            settings,
            transport,
            dispatcher: Arc::new(EventDispatcher::new()),
            validator: None,
            status: Arc::new(watch::Sender::new(status)),
            run: Mutex::new(None),
        })
    }

    /// Replaces the private gate, typically with a clone of a gate shared by several
    /// engines.
    pub fn with_rate_gate(mut self, gate: RateGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<EventDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_validator(mut self, validator: impl PayloadValidator) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn settings(&self) -> &ValidatedSettings {
        &self.settings
    }

    pub fn rate_gate(&self) -> &RateGate {
        &self.gate
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn status(&self) -> PollerStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<PollerStatus> {
        self.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.status.borrow().state == PollerState::Running
    }
}

impl<S> PollEngine<S>
where
    S: Service<ConditionalRequest, Response = FetchResponse> + Clone + Send + 'static,
    S::Error: Into<Error>,
    S::Future: Send,
{
    /// Spawns the poll loop. Returns `false`, changing nothing, if the engine is
    /// already running or still stopping.
    ///
    /// Every run starts from the base interval with no cached validator.
    pub fn start(&self) -> bool {
        let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self.status.borrow().state;
        if state != PollerState::Idle {
            debug!(message = "Poller already active; start ignored.", url = %self.url, ?state);
            return false;
        }

        let policy = self.settings.backoff;
        self.status.send_modify(|status| {
            *status = PollerStatus {
                state: PollerState::Running,
                current_interval: policy.base(),
                etag: None,
                cycles: 0,
            }
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let poll_loop = PollLoop {
            target: PollTarget::new(self.url.clone()),
            backoff: BackoffState::new(&policy),
            policy,
            transport: self.transport.clone(),
            request_timeout: self.settings.request_timeout,
            gate: self.gate.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            validator: self.validator.clone(),
            status: Arc::clone(&self.status),
        };

        info!(
            message = "Poller started.",
            url = %self.url,
            base_interval_secs = policy.base().as_secs_f64(),
            max_interval_secs = policy.max().as_secs_f64()
        );
        *run = Some(Run {
            stop: stop_tx,
            task: tokio::spawn(poll_loop.run(stop_rx)),
        });
        true
    }

    /// Requests termination and waits until the loop has exited.
    ///
    /// An in-flight request and its dispatch are allowed to complete. Calling `stop`
    /// on an idle engine returns immediately.
    pub async fn stop(&self) -> Result<(), PollerError> {
        let run = self
            .run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(run) = run else {
            // Another caller owns the shutdown; wait for it to finish.
            let _ = self
                .watch_status()
                .wait_for(|status| status.state == PollerState::Idle)
                .await;
            return Ok(());
        };

        self.status.send_modify(|status| status.state = PollerState::Stopping);
        info!(message = "Stopping poller.", url = %self.url);
        run.stop.send_replace(true);

        let result = run.task.await;
        if let Err(error) = &result {
            // The loop never reached its own transition back to idle.
            error!(message = "Poll loop panicked.", url = %self.url, %error);
            self.status.send_modify(|status| status.state = PollerState::Idle);
        }
        result.context(LoopPanickedSnafu)
    }
}

impl<S> fmt::Debug for PollEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollEngine")
            .field("url", &self.url)
            .field("settings", &self.settings)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

/// State owned by one run of the loop task.
struct PollLoop<S> {
    target: PollTarget,
    backoff: BackoffState,
    policy: BackoffPolicy,
    transport: S,
    /// Bounds readiness and the call together.
    request_timeout: Duration,
    gate: RateGate,
    dispatcher: Arc<EventDispatcher>,
    validator: Option<Arc<dyn PayloadValidator>>,
    status: Arc<watch::Sender<PollerStatus>>,
}

impl<S> PollLoop<S>
where
    S: Service<ConditionalRequest, Response = FetchResponse>,
    S::Error: Into<Error>,
{
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        loop {
            let stopping = *stop.borrow_and_update();
            if stopping {
                break;
            }

            let interval = self.cycle().await;

            tokio::select! {
                // Also fires when the engine is dropped.
                _ = stop.changed() => break,
                _ = sleep(interval) => {}
            }
        }

        self.status.send_modify(|status| status.state = PollerState::Idle);
        info!(message = "Poller stopped.", url = %self.target.url());
    }

    async fn cycle(&mut self) -> Duration {
        let started = Instant::now();
        let result = self.fetch().await;
        let latency = started.elapsed();

        let Classification {
            outcome,
            event,
            etag,
        } = classify(result, self.validator.as_deref());
        if outcome == Outcome::Fresh {
            self.target.etag = etag;
        }
        let next_interval = self.backoff.advance(&self.policy, outcome);
        PollCycleCompleted {
            outcome,
            latency,
            next_interval,
        }
        .emit();

        if let Some(event) = event {
            log_event(self.target.url(), &event);
            self.dispatcher.publish(&event);
        }

        let etag = self.target.etag.clone();
        self.status.send_modify(|status| {
            status.cycles += 1;
            status.current_interval = next_interval;
            status.etag = etag;
        });
        next_interval
    }

    /// Holds a gate slot for the network operation only.
    async fn fetch(&mut self) -> Result<FetchResponse, Error> {
        let request = self.target.request();
        let _slot = self.gate.acquire().await?;
        let transport = &mut self.transport;
        let exchange = async move {
            let service = ServiceExt::<ConditionalRequest>::ready(transport)
                .await
                .map_err(Into::<Error>::into)?;
            service.call(request).await.map_err(Into::<Error>::into)
        };
        match timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Elapsed::new().into()),
        }
    }
}

fn log_event(url: &str, event: &Event) {
    match event {
        Event::DataUpdated(_) => info!(message = "Fresh data received.", url),
        Event::ValidationFailed { .. } => warn!(message = "Fresh data rejected.", url, %event),
        _ => warn!(message = "Poll cycle failed.", url, %event),
    }
}

struct Classification {
    outcome: Outcome,
    event: Option<Event>,
    /// The validator to cache; applied only for a fresh outcome.
    etag: Option<String>,
}

impl Classification {
    fn new(outcome: Outcome, event: Option<Event>) -> Self {
        Self {
            outcome,
            event,
            etag: None,
        }
    }
}

fn classify(
    result: Result<FetchResponse, Error>,
    validator: Option<&dyn PayloadValidator>,
) -> Classification {
    match result {
        Ok(FetchResponse::Modified { body, etag }) => {
            match serde_json::from_slice::<Value>(&body) {
                Ok(payload) => {
                    let event = match validator.map(|validator| run_validator(validator, &payload)) {
                        Some(Err(errors)) => Event::ValidationFailed { errors, payload },
                        _ => Event::DataUpdated(payload),
                    };
                    Classification {
                        outcome: Outcome::Fresh,
                        event: Some(event),
                        etag,
                    }
                }
                Err(error) => Classification::new(
                    Outcome::Failed,
                    Some(Event::DecodeError {
                        message: format!("Response body is not valid JSON: {error}"),
                    }),
                ),
            }
        }
        Ok(FetchResponse::NotModified) => Classification::new(Outcome::NotModified, None),
        Ok(FetchResponse::ErrorStatus { status, body }) => {
            let message = status_message(status, &body);
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                Classification::new(
                    Outcome::Overloaded,
                    Some(Event::ServerError { status, message }),
                )
            } else {
                Classification::new(
                    Outcome::Failed,
                    Some(Event::RequestRejected { status, message }),
                )
            }
        }
        Err(error) if is_timeout(&error) => Classification::new(
            Outcome::TimedOut,
            Some(Event::Timeout {
                message: error.to_string(),
            }),
        ),
        Err(error) => Classification::new(
            Outcome::Failed,
            Some(Event::NetworkError {
                message: error.to_string(),
            }),
        ),
    }
}

/// A panicking validator counts as a rejection of the payload.
fn run_validator(validator: &dyn PayloadValidator, payload: &Value) -> Result<(), Vec<String>> {
    catch_unwind(AssertUnwindSafe(|| validator.validate(payload))).map_err(|panic| {
        let message = panic_message(panic.as_ref());
        warn!(message = "Payload validator panicked.", panic = %message);
        vec![format!("Validator panicked: {message}")]
    })?
}

fn is_timeout(error: &Error) -> bool {
    error.is::<Elapsed>()
        || error
            .downcast_ref::<HttpError>()
            .is_some_and(HttpError::is_timeout)
}

fn status_message(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        format!("Error {status}")
    } else {
        let excerpt: String = body.chars().take(MAX_MESSAGE_BODY_CHARS).collect();
        format!("Error {status}: {excerpt}")
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::{
        adaptive_polling::rate_gate::{RateGateConfig, RateLimit},
        test_utils::{
            Scripted, ScriptedTransport, assert_close, fresh, not_modified, status, trace_init,
        },
    };

    const URL: &str = "http://inventory.test/products";

    fn engine(transport: &ScriptedTransport) -> PollEngine<ScriptedTransport> {
        PollEngine::new(URL, PollerSettings::default(), transport.clone()).unwrap()
    }

    fn record<S>(engine: &PollEngine<S>, kind: EventKind) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.subscribe(kind, move |event: &Event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        seen
    }

    async fn wait_cycles<S>(engine: &PollEngine<S>, cycles: u64) {
        engine
            .watch_status()
            .wait_for(|status| status.cycles >= cycles)
            .await
            .unwrap();
    }

    fn secs(value: f64) -> Duration {
        Duration::from_secs_f64(value)
    }

    #[tokio::test(start_paused = true)]
    async fn intervals_adapt_to_outcomes() {
        trace_init();
        let transport = ScriptedTransport::new([
            not_modified(),
            not_modified(),
            fresh("[]", Some("\"v1\"")),
            status(StatusCode::SERVICE_UNAVAILABLE),
        ]);
        let engine = engine(&transport);

        assert!(engine.start());
        wait_cycles(&engine, 5).await;
        engine.stop().await.unwrap();

        let gaps = transport.gaps();
        assert_eq!(gaps.len(), 4);
        for (gap, expected) in gaps.into_iter().zip([7.5, 11.25, 5.0, 10.0]) {
            assert_close(gap, secs(expected));
        }

        let sent: Vec<_> = transport
            .requests()
            .into_iter()
            .map(|request| request.if_none_match)
            .collect();
        let v1 = Some("\"v1\"".to_string());
        assert_eq!(sent, vec![None, None, None, v1.clone(), v1.clone()]);

        let status = engine.status();
        assert_eq!(status.state, PollerState::Idle);
        assert_eq!(status.cycles, 5);
        assert_eq!(status.etag, v1);
        assert_close(status.current_interval, secs(15.0));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_the_sleep() {
        let transport = ScriptedTransport::default();
        let engine = engine(&transport);

        assert!(engine.start());
        wait_cycles(&engine, 1).await;

        let before = Instant::now();
        engine.stop().await.unwrap();
        assert!(before.elapsed() < Duration::from_secs(1));
        assert_eq!(engine.status().state, PollerState::Idle);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_restart_resets_state() {
        let transport = ScriptedTransport::new([fresh("{}", Some("\"a\""))]);
        let engine = engine(&transport);

        assert!(engine.start());
        assert!(!engine.start());
        assert!(engine.is_running());
        wait_cycles(&engine, 1).await;
        assert_eq!(engine.status().etag.as_deref(), Some("\"a\""));

        engine.stop().await.unwrap();
        engine.stop().await.unwrap();
        assert_eq!(engine.status().state, PollerState::Idle);

        assert!(engine.start());
        let status = engine.status();
        assert_eq!(status.cycles, 0);
        assert_eq!(status.etag, None);
        assert_eq!(status.current_interval, Duration::from_secs(5));

        wait_cycles(&engine, 1).await;
        engine.stop().await.unwrap();
        assert_eq!(transport.requests()[1].if_none_match, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_handlers_do_not_stop_the_loop() {
        let transport = ScriptedTransport::new([fresh("[1]", None), fresh("[2]", None)]);
        let engine = engine(&transport);
        engine.subscribe(EventKind::DataUpdated, |_: &Event| Err("boom".into()));
        engine.subscribe(EventKind::DataUpdated, |_: &Event| panic!("handler panicked"));
        let updates = record(&engine, EventKind::DataUpdated);

        assert!(engine.start());
        wait_cycles(&engine, 3).await;
        assert!(engine.is_running());
        engine.stop().await.unwrap();

        let payloads: Vec<_> = updates
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.payload().cloned())
            .collect();
        assert_eq!(payloads, vec![Some(json!([1])), Some(json!([2]))]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_back_off_and_keep_polling() {
        let transport = ScriptedTransport::new([
            Scripted::Hang,
            Scripted::Fail(HttpError::Timeout),
            Scripted::Fail(HttpError::Transport {
                source: "connection reset by peer".into(),
            }),
        ]);
        let settings = PollerSettings::builder().request_timeout_secs(1.0).build();
        let engine = PollEngine::new(URL, settings, transport.clone()).unwrap();
        let timeouts = record(&engine, EventKind::Timeout);
        let network = record(&engine, EventKind::NetworkError);

        assert!(engine.start());
        wait_cycles(&engine, 3).await;
        engine.stop().await.unwrap();

        assert_eq!(timeouts.lock().unwrap().len(), 2);
        let network = network.lock().unwrap();
        assert_eq!(network.len(), 1);
        assert!(
            matches!(&network[0], Event::NetworkError { message } if message.contains("connection reset"))
        );

        // The hanging request costs the 1s timeout on top of the doubled interval.
        let gaps = transport.gaps();
        assert_close(gaps[0], secs(11.0));
        assert_close(gaps[1], secs(20.0));
        assert_eq!(engine.rate_gate().stats().held, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_body_keeps_the_cached_validator() {
        let transport = ScriptedTransport::new([
            fresh("[1]", Some("\"v1\"")),
            fresh("<html>", Some("\"v2\"")),
        ]);
        let engine = engine(&transport);
        let decode_errors = record(&engine, EventKind::DecodeError);

        assert!(engine.start());
        wait_cycles(&engine, 3).await;
        engine.stop().await.unwrap();

        assert_eq!(decode_errors.lock().unwrap().len(), 1);
        let sent: Vec<_> = transport
            .requests()
            .into_iter()
            .map(|request| request.if_none_match)
            .collect();
        let v1 = Some("\"v1\"".to_string());
        assert_eq!(sent, vec![None, v1.clone(), v1]);

        let gaps = transport.gaps();
        assert_close(gaps[0], secs(5.0));
        assert_close(gaps[1], secs(10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn validator_rejection_is_published_instead_of_the_data() {
        let transport = ScriptedTransport::new([fresh(r#"{"id":1}"#, Some("\"v1\""))]);
        let engine = engine(&transport).with_validator(|payload: &Value| {
            if payload.is_array() {
                Ok(())
            } else {
                Err(vec!["expected a list of products".to_string()])
            }
        });
        let updates = record(&engine, EventKind::DataUpdated);
        let rejected = record(&engine, EventKind::ValidationFailed);

        assert!(engine.start());
        wait_cycles(&engine, 1).await;
        engine.stop().await.unwrap();

        assert!(updates.lock().unwrap().is_empty());
        assert_eq!(
            *rejected.lock().unwrap(),
            vec![Event::ValidationFailed {
                errors: vec!["expected a list of products".to_string()],
                payload: json!({"id": 1}),
            }]
        );
        let status = engine.status();
        assert_eq!(status.etag.as_deref(), Some("\"v1\""));
        assert_eq!(status.current_interval, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_validator_rejects_the_payload() {
        let transport = ScriptedTransport::new([fresh("[]", None), fresh("[1]", None)]);
        let engine = engine(&transport).with_validator(
            |_: &Value| -> Result<(), Vec<String>> { panic!("schema unavailable") },
        );
        let updates = record(&engine, EventKind::DataUpdated);
        let rejected = record(&engine, EventKind::ValidationFailed);

        assert!(engine.start());
        wait_cycles(&engine, 3).await;
        assert!(engine.is_running());
        engine.stop().await.unwrap();

        assert!(updates.lock().unwrap().is_empty());
        let rejected = rejected.lock().unwrap();
        assert_eq!(rejected.len(), 2);
        assert_eq!(
            rejected[1],
            Event::ValidationFailed {
                errors: vec!["Validator panicked: schema unavailable".to_string()],
                payload: json!([1]),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn error_statuses_are_split_by_class() {
        let transport = ScriptedTransport::new([
            status(StatusCode::NOT_FOUND),
            status(StatusCode::TOO_MANY_REQUESTS),
        ]);
        let engine = engine(&transport);
        let rejected = record(&engine, EventKind::RequestRejected);
        let overloaded = record(&engine, EventKind::ServerError);

        assert!(engine.start());
        wait_cycles(&engine, 3).await;
        engine.stop().await.unwrap();

        assert_eq!(
            *rejected.lock().unwrap(),
            vec![Event::RequestRejected {
                status: StatusCode::NOT_FOUND,
                message: "Error 404 Not Found".to_string(),
            }]
        );
        assert_eq!(overloaded.lock().unwrap().len(), 1);

        let gaps = transport.gaps();
        assert_close(gaps[0], secs(10.0));
        assert_close(gaps[1], secs(20.0));
    }

    #[tokio::test(start_paused = true)]
    async fn engines_sharing_a_gate_share_its_pace() {
        let settings = PollerSettings::builder()
            .base_interval_secs(0.1)
            .max_interval_secs(0.2)
            .build();
        let gate = RateGate::new(RateGateConfig::new(1, RateLimit::PerSecond(1.0)).unwrap());
        let (a, b) = (ScriptedTransport::default(), ScriptedTransport::default());
        let first = PollEngine::new("http://a.test/", settings.clone(), a.clone())
            .unwrap()
            .with_rate_gate(gate.clone());
        let second = PollEngine::new("http://b.test/", settings, b.clone())
            .unwrap()
            .with_rate_gate(gate.clone());

        assert!(first.start());
        assert!(second.start());
        tokio::time::sleep(Duration::from_secs(6)).await;
        first.stop().await.unwrap();
        second.stop().await.unwrap();

        assert!(!a.requests().is_empty());
        assert!(!b.requests().is_empty());
        let mut grants: Vec<_> = a
            .requests()
            .into_iter()
            .chain(b.requests())
            .map(|request| request.at)
            .collect();
        grants.sort();
        assert!(grants.len() >= 6, "{} grants", grants.len());
        for pair in grants.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(999));
        }
        assert_eq!(gate.stats().held, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drives_any_tower_service() {
        let (service, mut handle) = tower_test::mock::pair::<ConditionalRequest, FetchResponse>();
        let engine = PollEngine::new(URL, PollerSettings::default(), service).unwrap();
        let network = record(&engine, EventKind::NetworkError);

        assert!(engine.start());

        let (request, respond) = handle.next_request().await.unwrap();
        assert_eq!(
            request,
            ConditionalRequest {
                url: URL.to_string(),
                if_none_match: None,
            }
        );
        respond.send_response(FetchResponse::Modified {
            body: Bytes::from_static(b"[]"),
            etag: Some("\"abc\"".to_string()),
        });

        let (request, respond) = handle.next_request().await.unwrap();
        assert_eq!(request.if_none_match.as_deref(), Some("\"abc\""));
        respond.send_error("connection reset by peer");

        wait_cycles(&engine, 2).await;
        engine.stop().await.unwrap();
        assert_eq!(
            *network.lock().unwrap(),
            vec![Event::NetworkError {
                message: "connection reset by peer".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_that_never_becomes_ready_times_out() {
        let (service, mut handle) = tower_test::mock::pair::<ConditionalRequest, FetchResponse>();
        handle.allow(0);
        let settings = PollerSettings::builder().request_timeout_secs(1.0).build();
        let engine = PollEngine::new(URL, settings, service).unwrap();
        let timeouts = record(&engine, EventKind::Timeout);

        assert!(engine.start());
        wait_cycles(&engine, 2).await;
        assert_eq!(engine.rate_gate().stats().held, 0);
        engine.stop().await.unwrap();

        assert_eq!(timeouts.lock().unwrap().len(), 2);
        assert_eq!(engine.status().state, PollerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_the_in_flight_cycle_finish() {
        let (service, mut handle) = tower_test::mock::pair::<ConditionalRequest, FetchResponse>();
        let engine = PollEngine::new(URL, PollerSettings::default(), service).unwrap();
        let updates = record(&engine, EventKind::DataUpdated);

        assert!(engine.start());
        let (_, respond) = handle.next_request().await.unwrap();

        let mut stopping = tokio_test::task::spawn(engine.stop());
        tokio_test::assert_pending!(stopping.poll());
        assert_eq!(engine.status().state, PollerState::Stopping);
        assert!(!engine.start());

        respond.send_response(FetchResponse::Modified {
            body: Bytes::from_static(b"[]"),
            etag: None,
        });
        stopping.await.unwrap();

        assert_eq!(*updates.lock().unwrap(), vec![Event::DataUpdated(json!([]))]);
        let status = engine.status();
        assert_eq!(status.state, PollerState::Idle);
        assert_eq!(status.cycles, 1);
    }

    #[test]
    fn invalid_settings_are_rejected_up_front() {
        let settings = PollerSettings::builder().base_interval_secs(0.0).build();
        let result = PollEngine::new(URL, settings, ScriptedTransport::default());
        assert!(matches!(
            result,
            Err(ConfigError::InvalidBaseInterval { value }) if value == 0.0
        ));
    }

    #[test]
    fn classification_covers_every_transport_result() {
        let cases: Vec<(Result<FetchResponse, Error>, Outcome, Option<EventKind>)> = vec![
            (Ok(FetchResponse::NotModified), Outcome::NotModified, None),
            (
                Ok(FetchResponse::Modified {
                    body: Bytes::from_static(b"[]"),
                    etag: None,
                }),
                Outcome::Fresh,
                Some(EventKind::DataUpdated),
            ),
            (
                Ok(FetchResponse::ErrorStatus {
                    status: StatusCode::BAD_GATEWAY,
                    body: String::new(),
                }),
                Outcome::Overloaded,
                Some(EventKind::ServerError),
            ),
            (
                Err(Elapsed::new().into()),
                Outcome::TimedOut,
                Some(EventKind::Timeout),
            ),
            (
                Err(HttpError::InvalidRequest {
                    details: "bad header".to_string(),
                }
                .into()),
                Outcome::Failed,
                Some(EventKind::NetworkError),
            ),
        ];

        for (result, outcome, kind) in cases {
            let classified = classify(result, None);
            assert_eq!(classified.outcome, outcome);
            assert_eq!(classified.event.as_ref().map(Event::kind), kind);
        }
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(1_000);
        let message = status_message(StatusCode::INTERNAL_SERVER_ERROR, &body);
        assert_eq!(
            message.len(),
            "Error 500 Internal Server Error: ".len() + MAX_MESSAGE_BODY_CHARS
        );
    }
}
