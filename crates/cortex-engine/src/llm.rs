//! LLM collaborator boundary.
//!
//! The engine only depends on the contract: `generate(prompt_key, input)`
//! returns the assistant's text. A `prompt_key` found in the library expands
//! to a fixed instruction; anything else is treated as a raw instruction
//! string, so units can carry bespoke prompts without a deploy.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns the assistant's text; the empty string is acceptable.
    async fn generate(&self, prompt_key: &str, input: &Value) -> Result<String>;
}

pub const PROMPT_LIBRARY: &[(&str, &str)] = &[
    (
        "summarize",
        "Summarize the following content in 2-3 sentences. Keep names, dates, \
         and amounts. Reply with the summary only.",
    ),
    (
        "draft_reply",
        "Draft a short, professional reply to the following message. Match the \
         sender's tone. Reply with the draft body only, no subject line.",
    ),
    (
        "extract_action_items",
        "Extract the action items from the following content as a short bullet \
         list. One line per item, starting with a verb. Reply with the list only.",
    ),
    (
        "analyze_sentiment",
        "Classify the sentiment of the following content as positive, neutral, \
         or negative, and give a one-sentence justification.",
    ),
];

/// The library instruction for a key, or `None` for raw-instruction keys.
pub fn library_prompt(key: &str) -> Option<&'static str> {
    PROMPT_LIBRARY
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, p)| *p)
}

/// The full instruction an [`LlmClient`] implementation should send: library
/// expansion when the key is known, the key itself otherwise.
pub fn instruction_for(prompt_key: &str) -> &str {
    library_prompt(prompt_key).unwrap_or(prompt_key)
}
