//! Provider gateway boundary.
//!
//! This module defines only the gateway contract and its HTTP implementation.
//! No polling cadence, no event shaping, no storage logic belongs here.
//!
//! The gateway (a Nango-style sync service) owns provider credentials: the
//! engine addresses it with `(provider, connection_id)` pairs and never sees
//! an OAuth token.

use std::fmt;

use async_trait::async_trait;
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors a [`ProviderGateway`] implementation may return.
#[derive(Debug)]
pub enum GatewayError {
    /// Network or transport failure.
    Transport(String),
    /// The gateway returned an application-level error.
    Api { status: Option<u16>, message: String },
    /// A response payload could not be decoded.
    Decode(String),
    /// A required configuration value (base URL, secret) is missing or invalid.
    Config(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Transport(msg) => write!(f, "transport error: {msg}"),
            GatewayError::Api {
                status: Some(code),
                message,
            } => write!(f, "gateway api error status={code}: {message}"),
            GatewayError::Api {
                status: None,
                message,
            } => write!(f, "gateway api error: {message}"),
            GatewayError::Decode(msg) => write!(f, "decode error: {msg}"),
            GatewayError::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

/// Upstream provider gateway contract.
///
/// Implementations must be object-safe (`Arc<dyn ProviderGateway>`) and
/// `Send + Sync` so the poller and tool executor can share one instance
/// across tasks.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Fetch the current records of `resource` for a connection. Returns
    /// records in gateway order; callers filter and classify.
    async fn fetch_records(
        &self,
        provider: &str,
        connection_id: &str,
        resource: &str,
    ) -> Result<Vec<Value>, GatewayError>;

    /// Execute one provider action on behalf of `user_id`. The gateway
    /// resolves credentials, retries transient upstream failures, and rate
    /// limits; the returned value is whatever the action produced.
    async fn invoke(
        &self,
        provider: &str,
        action: &str,
        user_id: &str,
        args: &Value,
    ) -> Result<Value, GatewayError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct NangoGateway {
    base_url: String,
    secret: String,
    client: reqwest::Client,
}

impl NangoGateway {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            secret: secret.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProviderGateway for NangoGateway {
    async fn fetch_records(
        &self,
        provider: &str,
        connection_id: &str,
        resource: &str,
    ) -> Result<Vec<Value>, GatewayError> {
        let url = format!("{}/records/{}", self.base_url, resource);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.secret)
            .header("Connection-Id", connection_id)
            .header("Provider-Config-Key", provider)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: Some(status.as_u16()),
                message,
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        match body.get("records") {
            Some(Value::Array(records)) => Ok(records.clone()),
            _ => Err(GatewayError::Decode(
                "response missing records array".to_string(),
            )),
        }
    }

    async fn invoke(
        &self,
        provider: &str,
        action: &str,
        user_id: &str,
        args: &Value,
    ) -> Result<Value, GatewayError> {
        let url = format!("{}/action/{}/{}", self.base_url, provider, action);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.secret)
            .json(&json!({ "user_id": user_id, "args": args }))
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: Some(status.as_u16()),
                message,
            });
        }

        resp.json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn fetch_records_unwraps_the_records_array() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/records/emails")
                .header("Connection-Id", "conn-1")
                .header("Provider-Config-Key", "gmail");
            then.status(200)
                .json_body(serde_json::json!({"records": [{"id": "m1"}, {"id": "m2"}]}));
        });

        let gw = NangoGateway::new(server.base_url(), "secret");
        let records = gw.fetch_records("gmail", "conn-1", "emails").await.unwrap();
        mock.assert();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["id"], "m1");
    }

    #[tokio::test]
    async fn non_2xx_surfaces_as_api_error_with_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/records/emails");
            then.status(429).body("rate limited");
        });

        let gw = NangoGateway::new(server.base_url(), "secret");
        let err = gw
            .fetch_records("gmail", "conn-1", "emails")
            .await
            .unwrap_err();
        match err {
            GatewayError::Api { status, message } => {
                assert_eq!(status, Some(429));
                assert_eq!(message, "rate limited");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invoke_posts_user_and_args_and_returns_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/action/gmail/reply")
                .json_body_partial(r#"{"user_id": "u1", "args": {"to": "a@b.c"}}"#);
            then.status(200)
                .json_body(serde_json::json!({"message_id": "m99"}));
        });

        let gw = NangoGateway::new(server.base_url(), "secret");
        let out = gw
            .invoke("gmail", "reply", "u1", &serde_json::json!({"to": "a@b.c"}))
            .await
            .unwrap();
        mock.assert();
        assert_eq!(out["message_id"], "m99");
    }

    #[test]
    fn gateway_error_display_shapes() {
        assert_eq!(
            GatewayError::Transport("connection refused".into()).to_string(),
            "transport error: connection refused"
        );
        assert_eq!(
            GatewayError::Api {
                status: Some(500),
                message: "boom".into()
            }
            .to_string(),
            "gateway api error status=500: boom"
        );
    }
}
