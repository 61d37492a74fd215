//! BYO-key LLM clients for Benjamin.
//!
//! Pure HTTP clients plus ordered fallback chains. Nothing in here knows about plans,
//! approvals or users.

mod anthropic;
mod chain;
mod client;
mod error;
mod gemini;
mod openai;
mod types;

pub use chain::{ModelChain, extract_json_object};
pub use client::{LlmClient, Provider};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatOptions, ChatResponse, Role, Usage};
