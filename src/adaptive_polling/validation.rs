//! Optional schema check applied to fresh payloads before they are published.

use serde_json::Value;

/// Checks a decoded payload. `Err` carries one message per violated rule.
///
/// Implemented for any `Fn(&Value) -> Result<(), Vec<String>>`, so a closure can be
/// passed directly to [`PollEngine::with_validator`].
///
/// [`PollEngine::with_validator`]: super::engine::PollEngine::with_validator
pub trait PayloadValidator: Send + Sync + 'static {
    fn validate(&self, payload: &Value) -> Result<(), Vec<String>>;
}

impl<F> PayloadValidator for F
where
    F: Fn(&Value) -> Result<(), Vec<String>> + Send + Sync + 'static,
{
    fn validate(&self, payload: &Value) -> Result<(), Vec<String>> {
        self(payload)
    }
}
