use std::{
    task::{Context, Poll},
    time::Duration,
};

use futures::future::BoxFuture;
use http::{
    StatusCode,
    header::{ETAG, IF_NONE_MATCH},
};
use tower::Service;

use super::http::{ConditionalRequest, FetchResponse, HttpError};

/// A `tower::Service` issuing conditional GETs with a `reqwest::Client`.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a client whose requests give up after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| HttpError::ClientError {
                source: Box::new(e),
            })?;
        Ok(Self { client })
    }

    pub fn new_with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Service<ConditionalRequest> for ReqwestTransport {
    type Response = FetchResponse;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ConditionalRequest) -> Self::Future {
        let url = match reqwest::Url::parse(&request.url) {
            Ok(url) => url,
            Err(parse_err) => {
                let error = HttpError::InvalidRequest {
                    details: format!("Invalid URL '{}': {}", request.url, parse_err),
                };
                return Box::pin(async move { Err(error) });
            }
        };

        let mut request_builder = self.client.get(url);
        if let Some(etag) = &request.if_none_match {
            request_builder = request_builder.header(IF_NONE_MATCH, etag.as_str());
        }

        let request_future = request_builder.send();
        Box::pin(async move {
            let response = request_future.await.map_err(classify_reqwest_error)?;
            let status = response.status();

            if status == StatusCode::NOT_MODIFIED {
                return Ok(FetchResponse::NotModified);
            }

            if status.is_success() {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned);
                let body = response.bytes().await.map_err(classify_reqwest_error)?;
                return Ok(FetchResponse::Modified { body, etag });
            }

            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Could not read error body".to_string());

            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                warn!(status = %status, error_body = %body, "Server error or rate limited");
            } else {
                debug!(status = %status, error_body = %body, "Request rejected");
            }

            Ok(FetchResponse::ErrorStatus { status, body })
        })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> HttpError {
    if e.is_timeout() {
        warn!(error = %e, "Request timed out");
        HttpError::Timeout
    } else if e.is_connect() {
        warn!(error = %e, "Connection error");
        HttpError::Transport {
            source: Box::new(e),
        }
    } else if e.is_builder() {
        HttpError::InvalidRequest {
            details: e.to_string(),
        }
    } else {
        warn!(error = %e, "Other reqwest error");
        HttpError::ClientError {
            source: Box::new(e),
        }
    }
}
