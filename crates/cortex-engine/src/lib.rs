//! Cortex execution core: trigger matching, the run runtime, the wait/resume
//! scheduler, and the contracts for the external collaborators (rule
//! compiler, tool executor, LLM).

pub mod compiler;
pub mod llm;
pub mod matcher;
pub mod runtime;
pub mod scheduler;
pub mod template;
pub mod tools;

pub use compiler::{build_unit, parse_raw_rule, validate_unit, Compiler, LlmCompiler};
pub use llm::{instruction_for, library_prompt, LlmClient, PROMPT_LIBRARY};
pub use matcher::{condition_holds, conditions_hold, match_event};
pub use runtime::Runtime;
pub use scheduler::Scheduler;
pub use template::{lookup_path, parse_duration, resolve_args, resolve_template_string};
pub use tools::ToolExecutor;
