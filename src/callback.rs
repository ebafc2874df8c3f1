//! Outbound callback POST client with Fibonacci-backoff retry.
//!
//! Ground truth: `examples/original_source/src/CallbackAPI.{h,cpp}` and the
//! `_postEvent` retry loop in `PersistAndCallbackManager.cpp`. `reqwest`'s blocking
//! client replaces Poco's `HTTPClientSession`, grounded on
//! `examples/wandb-wandb/parquet-rust-wrapper/Cargo.toml`, which reaches for the
//! same `reqwest` blocking feature for a narrow outbound-POST collaborator.

use std::time::Duration;

use base64::Engine;
use log::{error, info};
use serde_json::Value;

use crate::error::{AppResult, SupervisorError};

const DEFAULT_MAX_RETRY: u32 = 3;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

fn encode_token(token: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(token.as_bytes())
}

fn max_retry_from_env() -> u32 {
    std::env::var("ML_GRIDENGINE_CALLBACK_MAX_RETRY")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(DEFAULT_MAX_RETRY)
}

/// A single HTTP callback endpoint.
pub struct CallbackClient {
    uri: String,
    token: String,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl CallbackClient {
    pub fn new(uri: impl Into<String>, token: impl Into<String>) -> Self {
        CallbackClient::with_timeout(uri, token, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(uri: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Self {
        CallbackClient {
            uri: uri.into(),
            token: token.into(),
            timeout,
            client: reqwest::blocking::Client::new(),
        }
    }

    /// Posts a pre-serialized JSON document once. Does not retry.
    pub fn post(&self, doc: &str) -> AppResult<()> {
        if self.uri.is_empty() {
            return Err(SupervisorError::Config("callback uri is not configured".into()));
        }

        let mut request = self
            .client
            .post(&self.uri)
            .timeout(self.timeout)
            .header("Content-Type", "application/json");
        if !self.token.is_empty() {
            request = request.header("Authentication", format!("TOKEN {}", encode_token(&self.token)));
        }

        let response = request
            .body(doc.to_string())
            .send()
            .map_err(|e| SupervisorError::Callback(e.to_string()))?;

        let status = response.status();
        let body = response.text().unwrap_or_default();
        if status.as_u16() != 200 {
            return Err(SupervisorError::Http {
                status: status.as_u16(),
                message: body,
            });
        }
        info!("Callback API response: {}", body.trim());
        Ok(())
    }

    /// Posts with Fibonacci backoff retry, up to `max_retry` extra attempts
    /// beyond the first. Never returns an error: failures are logged and
    /// swallowed, matching the original's best-effort contract.
    pub fn post_with_retry(&self, event_type: &str, data: Value) {
        if self.uri.is_empty() {
            return;
        }

        let payload = serde_json::json!({ "eventType": event_type, "data": data });
        let serialized = payload.to_string();

        let max_retry = max_retry_from_env();
        let mut sleep_time = 5u64;
        let mut next_sleep_time = 8u64;

        for attempt in 0..=max_retry {
            match self.post(&serialized) {
                Ok(()) => return,
                Err(e) => error!("Error posting to callback API: {e}"),
            }

            if attempt < max_retry {
                info!("Will retry posting to callback API after {sleep_time} seconds.");
                std::thread::sleep(Duration::from_secs(sleep_time));
                let next_next = sleep_time + next_sleep_time;
                sleep_time = next_sleep_time;
                next_sleep_time = next_next;
            } else {
                info!("Too many retrials, give up posting to the callback API.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_base64_encoded() {
        assert_eq!(encode_token("hello"), "aGVsbG8=");
    }

    #[test]
    fn empty_uri_post_is_rejected() {
        let client = CallbackClient::new("", "");
        assert!(client.post("{}").is_err());
    }

    #[test]
    fn max_retry_defaults_when_env_unset() {
        std::env::remove_var("ML_GRIDENGINE_CALLBACK_MAX_RETRY");
        assert_eq!(max_retry_from_env(), DEFAULT_MAX_RETRY);
    }
}
