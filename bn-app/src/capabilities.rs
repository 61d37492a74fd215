//! Model-backed capabilities.
//!
//! The orchestrator and agent loop only see these traits; production wires them to
//! [`ModelChain`]s, tests wire them to scripted fakes.

use crate::memory::MemoryContext;
use async_trait::async_trait;
use bn_llm::{ChatOptions, ModelChain, extract_json_object};
use bn_tools::CommandRunner;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> bn_llm::Result<String>;

    /// Generation with provider-side web search.
    async fn generate_grounded(&self, prompt: &str) -> bn_llm::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CritiqueKind {
    Verification,
    CodeReview,
}

impl CritiqueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verification => "verification",
            Self::CodeReview => "code_review",
        }
    }
}

#[async_trait]
pub trait Critic: Send + Sync {
    /// Returns `text` unchanged when it holds up, otherwise feedback or a corrected version.
    async fn critique(&self, kind: CritiqueKind, text: &str, task: &str) -> bn_llm::Result<String>;
}

#[async_trait]
pub trait PlanRouter: Send + Sync {
    /// Raw plan JSON. Shape is not trusted; callers normalize it.
    async fn decide(&self, message: &str, memory: &MemoryContext) -> bn_llm::Result<Value>;
}

/// The model-backed pieces an orchestrator is built from.
#[derive(Clone)]
pub struct Capabilities {
    pub router: Arc<dyn PlanRouter>,
    pub generator: Arc<dyn TextGenerator>,
    pub critic: Arc<dyn Critic>,
    pub runner: Arc<dyn CommandRunner>,
}

pub struct LlmGenerator {
    worker: ModelChain,
    grounded: ModelChain,
}

impl LlmGenerator {
    pub fn new(worker: ModelChain, grounded: ModelChain) -> Self {
        Self { worker, grounded }
    }
}

#[async_trait]
impl TextGenerator for LlmGenerator {
    async fn generate(&self, prompt: &str) -> bn_llm::Result<String> {
        let options = ChatOptions {
            temperature: Some(0.5),
            ..ChatOptions::default()
        };
        self.worker.complete(None, prompt, &options).await
    }

    async fn generate_grounded(&self, prompt: &str) -> bn_llm::Result<String> {
        self.grounded
            .complete(None, prompt, &ChatOptions::grounded())
            .await
    }
}

const VERIFICATION_SYSTEM: &str = "You check answers before they reach the user. \
Compare the draft with the task. If the draft is correct, complete and safe, reply with \
the draft exactly as written and nothing else. Otherwise reply with a short list of the \
concrete problems (at most three) and how to fix each one.";

const CODE_REVIEW_SYSTEM: &str = "You review code and technical answers. Look for real \
failures, not style: wrong logic, unhandled edge cases, unsafe operations. If there is \
nothing worth fixing, reply with the text exactly as written and nothing else. Otherwise \
list up to three likely failures and up to three checks that would catch them.";

pub struct LlmCritic {
    chain: ModelChain,
}

impl LlmCritic {
    pub fn new(chain: ModelChain) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl Critic for LlmCritic {
    async fn critique(&self, kind: CritiqueKind, text: &str, task: &str) -> bn_llm::Result<String> {
        let system = match kind {
            CritiqueKind::Verification => VERIFICATION_SYSTEM,
            CritiqueKind::CodeReview => CODE_REVIEW_SYSTEM,
        };
        let prompt = format!("Task:\n{task}\n\nDraft:\n{text}");
        let options = ChatOptions {
            temperature: Some(0.2),
            ..ChatOptions::default()
        };
        self.chain.complete(Some(system), &prompt, &options).await
    }
}

const ROUTER_SYSTEM: &str = r#"You decide how much autonomy a personal assistant needs for one request.

Automation levels:
0 - answer from model knowledge only
1 - answer with web search (news, prices, anything current)
2 - answer plus a critic pass (verification or code review)
3 - multi-step work, may run read-only shell commands in a sandbox
4 - multi-step work under explicit turn and time limits
5 - maximum autonomy, long-running multi-step work

Rules:
- Prefer the lowest level that can answer well.
- Set use_web for anything time-sensitive.
- Set require_code_review when the answer is mainly code.
- Set require_verification for facts that matter (health, money, law).
- Suggest a memory write only for durable facts about the user, never for the task itself.

Return ONLY a JSON object with these fields:
{"suggested_automation_level": 0-5,
 "execution_mode": "direct" | "agent_loop",
 "tools_required": ["generate" | "generate_web" | "critic" | "bash"],
 "use_web": bool,
 "require_verification": bool,
 "require_code_review": bool,
 "require_task_decomposition": bool,
 "suggest_memory_write": bool,
 "memory_to_write": null | {"type": "fact" | "profile" | "preference", "key": "...", "value": "..."},
 "governors": {"max_turns": int, "max_execution_time_seconds": int, "max_budget_usd": float},
 "reason": "one sentence"}"#;

pub struct LlmPlanRouter {
    chain: ModelChain,
}

impl LlmPlanRouter {
    pub fn new(chain: ModelChain) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl PlanRouter for LlmPlanRouter {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn decide(&self, message: &str, memory: &MemoryContext) -> bn_llm::Result<Value> {
        let prompt = format!("{}User request:\n{message}", memory.format_for_router());
        let options = ChatOptions {
            temperature: Some(0.0),
            max_tokens: Some(600),
            ..ChatOptions::default()
        };
        let text = self
            .chain
            .complete(Some(ROUTER_SYSTEM), &prompt, &options)
            .await?;
        match extract_json_object(&text) {
            Some(value) => Ok(value),
            None => {
                tracing::warn!(chars = text.len(), "router reply was not a JSON object");
                Ok(Value::Null)
            }
        }
    }
}
