//! The contract between the poll engine and whatever performs the HTTP request.
//!
//! A transport is any `tower::Service<ConditionalRequest, Response = FetchResponse>`
//! whose error converts into [`crate::Error`]. Timeouts and connection failures come
//! back as errors; everything the server actually answered is a [`FetchResponse`].
use bytes::Bytes;
use http::StatusCode;
use snafu::Snafu;

use crate::Error as CrateError;

/// One conditional GET.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionalRequest {
    pub url: String,
    /// The validator (entity tag) cached from the last fresh response, sent as
    /// `If-None-Match`.
    pub if_none_match: Option<String>,
}

/// What the server answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchResponse {
    /// A new representation, with the validator to send next time, if the server gave one.
    Modified { body: Bytes, etag: Option<String> },
    /// `304 Not Modified`: the cached representation is still current.
    NotModified,
    /// Any other status that is not a success.
    ErrorStatus { status: StatusCode, body: String },
}

/// Failures that prevented a transport from producing a [`FetchResponse`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    /// An error occurred while moving bytes (DNS, connect, reset).
    #[snafu(display("HTTP transport error: {}", source))]
    Transport { source: CrateError },

    /// The request could not be built (bad URL, invalid validator header).
    #[snafu(display("Invalid HTTP request: {}", details))]
    InvalidRequest { details: String },

    /// The request did not complete in time.
    #[snafu(display("HTTP request timed out"))]
    Timeout,

    /// Any other client-side failure, such as reading the response body.
    #[snafu(display("Generic HTTP client error: {}", source))]
    ClientError { source: CrateError },
}

impl HttpError {
    pub const fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Timeout)
    }
}
