//! Tool executor boundary.
//!
//! The engine hands a resolved `(tool, args, user_id)` triple across this
//! seam and stores whatever JSON comes back. Credential resolution, upstream
//! retries, and rate limiting all live on the other side.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute one tool call. `tool` is a stable dotted `provider.action`
    /// key (e.g. `gmail.send`); unknown keys fail with
    /// `Unknown tool: {tool}`. The returned value is stored verbatim in the
    /// run context when the action carries `store_as`.
    async fn execute(&self, tool: &str, args: &Value, user_id: &str) -> Result<Value>;
}
