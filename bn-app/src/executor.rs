//! Step executor: maps one step's intent to a capability call.

use crate::capabilities::{Critic, CritiqueKind, TextGenerator};
use crate::catalog::{Intent, WEB_LEVEL};
use crate::memory::MemoryContext;
use crate::plan::{AutonomyLevel, ExecutionPlan};
use crate::run::Step;
use bn_tools::CommandRunner;
use std::sync::Arc;

/// Per-step inputs that are not part of the step itself.
pub struct StepInputs<'a> {
    pub task: &'a str,
    pub plan: &'a ExecutionPlan,
    pub current_level: AutonomyLevel,
    pub prior_results: &'a [String],
    pub memory: &'a MemoryContext,
}

#[derive(Clone)]
pub struct StepExecutor {
    generator: Arc<dyn TextGenerator>,
    critic: Arc<dyn Critic>,
    runner: Arc<dyn CommandRunner>,
}

impl StepExecutor {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        critic: Arc<dyn Critic>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            generator,
            critic,
            runner,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(step_id = step.step_id, intent = %step.intent))]
    pub async fn execute(&self, step: &Step, inputs: &StepInputs<'_>) -> bn_llm::Result<String> {
        let instruction = step.instruction.as_str();
        let previous = || {
            inputs
                .prior_results
                .last()
                .map(String::as_str)
                .unwrap_or(instruction)
        };

        match &step.intent {
            Intent::Research => {
                let prompt = with_memory(inputs.memory, instruction);
                if inputs.plan.use_web && inputs.current_level >= WEB_LEVEL {
                    self.generator.generate_grounded(&prompt).await
                } else {
                    self.generator.generate(&prompt).await
                }
            }
            Intent::Verify => {
                self.critic
                    .critique(CritiqueKind::Verification, previous(), inputs.task)
                    .await
            }
            Intent::CodeReview => {
                self.critic
                    .critique(CritiqueKind::CodeReview, previous(), inputs.task)
                    .await
            }
            Intent::Bash => Ok(self.runner.run_sandboxed(instruction).await),
            Intent::Summarize | Intent::Finalize => {
                let gathered = if inputs.prior_results.is_empty() {
                    instruction.to_string()
                } else {
                    inputs.prior_results.join("\n---\n")
                };
                let prompt = format!(
                    "User request: {}\n\nGathered information:\n{gathered}\n\n\
                     Provide a comprehensive final answer in the same language as the \
                     user's request.",
                    inputs.task
                );
                self.generator
                    .generate(&with_memory(inputs.memory, &prompt))
                    .await
            }
            Intent::Write | Intent::Edit | Intent::Todo => Ok(format!("[Task noted: {instruction}]")),
            Intent::Unknown(name) => Ok(format!("[Unknown intent: {name}]")),
        }
    }
}

pub fn with_memory(memory: &MemoryContext, prompt: &str) -> String {
    format!("{}{prompt}", memory.format_for_worker())
}
