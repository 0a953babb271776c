//! Tool dispatch over the provider gateway.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use cortex_engine::ToolExecutor;

use crate::gateway::ProviderGateway;

/// The fixed `provider.action` tool table. Tool keys are API surface: adding
/// one here is a deploy, not a config change.
pub const TOOL_TABLE: &[(&str, (&str, &str))] = &[
    ("gmail.send", ("gmail", "send")),
    ("gmail.reply", ("gmail", "reply")),
    ("gmail.archive", ("gmail", "archive")),
    ("calendar.create", ("google-calendar", "create_event")),
    ("calendar.update", ("google-calendar", "update_event")),
    ("salesforce.update_lead", ("salesforce", "update_lead")),
    ("salesforce.update_opportunity", ("salesforce", "update_opportunity")),
    ("salesforce.create_task", ("salesforce", "create_task")),
];

pub fn tool_target(tool: &str) -> Option<(&'static str, &'static str)> {
    TOOL_TABLE
        .iter()
        .find(|(key, _)| *key == tool)
        .map(|(_, target)| *target)
}

/// [`ToolExecutor`] implementation that routes every known tool key through
/// the gateway.
pub struct GatewayToolExecutor {
    gateway: Arc<dyn ProviderGateway>,
}

impl GatewayToolExecutor {
    pub fn new(gateway: Arc<dyn ProviderGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl ToolExecutor for GatewayToolExecutor {
    async fn execute(&self, tool: &str, args: &Value, user_id: &str) -> Result<Value> {
        let (provider, action) =
            tool_target(tool).ok_or_else(|| anyhow!("Unknown tool: {tool}"))?;
        self.gateway
            .invoke(provider, action, user_id, args)
            .await
            .map_err(|e| anyhow!("{tool} failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;
    use serde_json::json;
    use std::sync::Mutex;

    struct SpyGateway {
        calls: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl ProviderGateway for SpyGateway {
        async fn fetch_records(
            &self,
            _provider: &str,
            _connection_id: &str,
            _resource: &str,
        ) -> Result<Vec<Value>, GatewayError> {
            Ok(vec![])
        }

        async fn invoke(
            &self,
            provider: &str,
            action: &str,
            user_id: &str,
            _args: &Value,
        ) -> Result<Value, GatewayError> {
            self.calls.lock().unwrap().push((
                provider.to_string(),
                action.to_string(),
                user_id.to_string(),
            ));
            Ok(json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn known_tools_route_to_their_provider_action() {
        let spy = Arc::new(SpyGateway {
            calls: Mutex::new(vec![]),
        });
        let exec = GatewayToolExecutor::new(spy.clone());

        exec.execute("calendar.create", &json!({"title": "Follow up"}), "u1")
            .await
            .unwrap();

        let calls = spy.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            (
                "google-calendar".to_string(),
                "create_event".to_string(),
                "u1".to_string()
            )
        );
    }

    #[tokio::test]
    async fn unknown_tool_errors_with_the_contract_message() {
        let spy = Arc::new(SpyGateway {
            calls: Mutex::new(vec![]),
        });
        let exec = GatewayToolExecutor::new(spy);

        let err = exec
            .execute("slack.post", &json!({}), "u1")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown tool: slack.post");
    }
}
