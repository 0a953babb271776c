//! Provider-facing plumbing: the gateway boundary, the pull poller, tool
//! dispatch, and the HTTP LLM client.

pub mod executor;
pub mod gateway;
pub mod llm_http;
pub mod poller;

pub use executor::{tool_target, GatewayToolExecutor, TOOL_TABLE};
pub use gateway::{GatewayError, NangoGateway, ProviderGateway};
pub use llm_http::HttpLlm;
pub use poller::{detect_event_type, PollReport, Poller};
