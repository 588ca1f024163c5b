use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::StatusCode;
use tokio::time::Instant;
use tower::Service;

use crate::adaptive_polling::http::{ConditionalRequest, FetchResponse, HttpError};

pub(crate) fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One scripted reaction of [`ScriptedTransport`].
pub(crate) enum Scripted {
    Respond(FetchResponse),
    Fail(HttpError),
    /// Never answers; only a surrounding timeout ends the request.
    Hang,
}

pub(crate) fn fresh(body: &'static str, etag: Option<&str>) -> Scripted {
    Scripted::Respond(FetchResponse::Modified {
        body: Bytes::from_static(body.as_bytes()),
        etag: etag.map(str::to_owned),
    })
}

pub(crate) fn not_modified() -> Scripted {
    Scripted::Respond(FetchResponse::NotModified)
}

pub(crate) fn status(status: StatusCode) -> Scripted {
    Scripted::Respond(FetchResponse::ErrorStatus {
        status,
        body: String::new(),
    })
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RecordedRequest {
    pub at: Instant,
    pub if_none_match: Option<String>,
}

/// Replays a queue of reactions, then answers `304 Not Modified` forever, recording
/// every request with its (virtual) arrival time.
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ScriptedTransport {
    pub(crate) fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            requests: Arc::default(),
        }
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Gaps between consecutive requests.
    pub(crate) fn gaps(&self) -> Vec<Duration> {
        self.requests()
            .windows(2)
            .map(|pair| pair[1].at - pair[0].at)
            .collect()
    }
}

impl Service<ConditionalRequest> for ScriptedTransport {
    type Response = FetchResponse;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ConditionalRequest) -> Self::Future {
        self.requests.lock().unwrap().push(RecordedRequest {
            at: Instant::now(),
            if_none_match: request.if_none_match,
        });
        let next = self.script.lock().unwrap().pop_front();

        Box::pin(async move {
            match next {
                None => Ok(FetchResponse::NotModified),
                Some(Scripted::Respond(response)) => Ok(response),
                Some(Scripted::Fail(error)) => Err(error),
                Some(Scripted::Hang) => futures::future::pending().await,
            }
        })
    }
}

#[track_caller]
pub(crate) fn assert_close(actual: Duration, expected: Duration) {
    let tolerance = Duration::from_millis(1);
    let diff = actual.abs_diff(expected);
    assert!(
        diff <= tolerance,
        "expected {expected:?}, got {actual:?}"
    );
}
