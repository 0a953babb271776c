//! HTTP client for the LLM collaborator.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use cortex_engine::{instruction_for, LlmClient};

pub struct HttpLlm {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl HttpLlm {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlm {
    async fn generate(&self, prompt_key: &str, input: &Value) -> Result<String> {
        let url = format!("{}/v1/generate", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({
                "model": self.model,
                "instruction": instruction_for(prompt_key),
                "input": input,
            }))
            .send()
            .await
            .context("llm request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("llm returned {status}: {body}"));
        }

        let body: Value = resp.json().await.context("llm response not JSON")?;
        Ok(body["text"].as_str().unwrap_or_default().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn generate_expands_library_keys_and_returns_text() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/generate")
                .json_body_partial(r#"{"model": "test-model"}"#);
            then.status(200)
                .json_body(serde_json::json!({"text": "Here is the update."}));
        });

        let llm = HttpLlm::new(server.base_url(), "test-model");
        let text = llm
            .generate("draft_reply", &Value::String("status?".into()))
            .await
            .unwrap();
        mock.assert();
        assert_eq!(text, "Here is the update.");
    }

    #[tokio::test]
    async fn empty_text_is_acceptable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/generate");
            then.status(200).json_body(serde_json::json!({}));
        });

        let llm = HttpLlm::new(server.base_url(), "test-model");
        let text = llm.generate("summarize", &Value::Null).await.unwrap();
        assert_eq!(text, "");
    }
}
