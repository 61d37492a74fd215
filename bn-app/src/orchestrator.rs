//! Orchestrator: plan a message, decide whether the user must approve, then run it through
//! the direct path (levels 0-2) or the agent loop (3+).

use crate::agent_loop::{AgentLoop, ExecutionOutcome};
use crate::capabilities::{Capabilities, Critic, CritiqueKind, PlanRouter, TextGenerator};
use crate::catalog::CapabilityCatalog;
use crate::commands::is_explicit_remember;
use crate::executor::with_memory;
use crate::locale::Locale;
use crate::memory::MemoryContext;
use crate::plan::{ExecutionMode, ExecutionPlan, GovernorDefaults};
use crate::run::{ExecutionContext, RunState};
use std::sync::Arc;
use std::time::Instant;

/// Refinement generations allowed per direct-path call.
const MAX_REFINEMENT_PASSES: u32 = 1;
const MEMORY_PREVIEW_MAX_CHARS: usize = 120;

pub struct Orchestrator {
    router: Arc<dyn PlanRouter>,
    generator: Arc<dyn TextGenerator>,
    critic: Arc<dyn Critic>,
    agent: AgentLoop,
    locale: Locale,
    defaults: GovernorDefaults,
}

impl Orchestrator {
    pub fn new(
        caps: Capabilities,
        catalog: Arc<CapabilityCatalog>,
        locale: Locale,
        defaults: GovernorDefaults,
    ) -> Self {
        let agent = AgentLoop::new(
            caps.generator.clone(),
            caps.critic.clone(),
            caps.runner,
            catalog,
            locale,
            defaults,
        );
        Self {
            router: caps.router,
            generator: caps.generator,
            critic: caps.critic,
            agent,
            locale,
            defaults,
        }
    }

    pub fn governor_defaults(&self) -> &GovernorDefaults {
        &self.defaults
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn plan(&self, message: &str, memory: &MemoryContext) -> bn_llm::Result<ExecutionPlan> {
        let raw = self.router.decide(message, memory).await?;
        let plan = ExecutionPlan::normalize(&raw, &self.defaults);
        tracing::info!(
            level = %plan.autonomy_level,
            mode = ?plan.execution_mode,
            tools = ?plan.tools_required,
            use_web = plan.use_web,
            verify = plan.require_verification,
            code_review = plan.require_code_review,
            governors = ?plan.governors,
            memory_write = plan.suggest_memory_write,
            "execution plan"
        );
        Ok(plan)
    }

    /// A suggested memory write needs consent unless the user asked for it explicitly;
    /// anything above level 1 needs consent regardless.
    pub fn needs_approval(&self, plan: &ExecutionPlan, message: &str) -> bool {
        if plan.suggest_memory_write && !is_explicit_remember(self.locale, message) {
            return true;
        }
        plan.autonomy_level.value() > 1
    }

    pub fn format_approval_request(&self, plan: &ExecutionPlan) -> String {
        let l = self.locale;
        let mut lines = vec![
            l.approval_header().to_string(),
            l.proposed_level(plan.autonomy_level.value()),
        ];
        if !plan.reason.is_empty() {
            lines.push(format!("{}{}", l.reason_label(), plan.reason));
        }
        if !plan.tools_required.is_empty() {
            lines.push(format!("{}{}", l.tools_label(), plan.tools_required.join(", ")));
        }

        let g = &plan.governors;
        let limits: Vec<String> = [
            g.max_budget_usd.map(|v| format!("max_budget_usd={v}")),
            g.max_tokens.map(|v| format!("max_tokens={v}")),
            g.max_turns.map(|v| format!("max_turns={v}")),
            g.max_execution_time_seconds
                .map(|v| format!("max_execution_time_seconds={v}")),
        ]
        .into_iter()
        .flatten()
        .collect();
        if !limits.is_empty() {
            lines.push(format!("{}{}", l.limits_label(), limits.join(", ")));
        }

        if let (true, Some(write)) = (plan.suggest_memory_write, &plan.memory_to_write) {
            lines.push(String::new());
            lines.push(l.memory_preview_header().to_string());
            lines.push(format!("type: {}", write.kind));
            lines.push(format!("key: {}", write.key));
            lines.push(format!("value: {}", shorten(&write.value, MEMORY_PREVIEW_MAX_CHARS)));
        }

        lines.push(l.approval_prompt().to_string());
        lines.join("\n")
    }

    #[tracing::instrument(level = "info", skip_all, fields(level = %plan.autonomy_level, mode = ?plan.execution_mode))]
    pub async fn execute(
        &self,
        message: &str,
        plan: &ExecutionPlan,
        ctx: &ExecutionContext,
        resume: Option<RunState>,
    ) -> bn_llm::Result<ExecutionOutcome> {
        let started = Instant::now();
        let outcome = match plan.execution_mode {
            ExecutionMode::AgentLoop => self.agent.run(message, plan, ctx, resume).await,
            ExecutionMode::Direct => self.execute_direct(message, plan, ctx).await?,
        };
        tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "execution finished");
        Ok(outcome)
    }

    async fn execute_direct(
        &self,
        message: &str,
        plan: &ExecutionPlan,
        ctx: &ExecutionContext,
    ) -> bn_llm::Result<ExecutionOutcome> {
        if ctx.is_cancelled() {
            return Ok(self.direct_cancelled());
        }
        let mut draft = self.generate(message, plan.use_web, &ctx.memory).await?;
        let mut refinements = 0u32;

        for kind in [CritiqueKind::Verification, CritiqueKind::CodeReview] {
            if ctx.is_cancelled() {
                return Ok(self.direct_cancelled());
            }
            let enabled = match kind {
                CritiqueKind::Verification => plan.require_verification,
                CritiqueKind::CodeReview => plan.require_code_review,
            };
            if !enabled {
                continue;
            }

            let critique = self.critic.critique(kind, &draft, message).await?;
            if critique.trim().is_empty() || !differs_materially(&critique, &draft) {
                tracing::debug!(kind = kind.as_str(), "critic accepted draft");
                continue;
            }
            if ctx.is_cancelled() {
                return Ok(self.direct_cancelled());
            }
            if refinements < MAX_REFINEMENT_PASSES {
                refinements += 1;
                tracing::info!(kind = kind.as_str(), "critic requested changes; refining once");
                draft = match kind {
                    CritiqueKind::Verification => {
                        let prompt = format!(
                            "{message}\n\n---\nCritic feedback (apply fixes, keep final answer \
                             concise):\n{critique}\n---\nReturn the corrected final answer only."
                        );
                        self.generate(&prompt, plan.use_web, &ctx.memory).await?
                    }
                    CritiqueKind::CodeReview => {
                        let prompt = format!(
                            "{message}\n\n---\nCode review feedback (apply fixes):\n{critique}\n\
                             ---\nReturn the corrected final code/answer only."
                        );
                        self.generate(&prompt, false, &ctx.memory).await?
                    }
                };
            } else {
                tracing::info!(kind = kind.as_str(), "refinement budget spent; applying critique");
                draft = critique;
            }
        }

        if ctx.is_cancelled() {
            return Ok(self.direct_cancelled());
        }
        Ok(ExecutionOutcome::Finished {
            answer: draft,
            stopped: false,
            state: RunState::default(),
        })
    }

    async fn generate(&self, prompt: &str, use_web: bool, memory: &MemoryContext) -> bn_llm::Result<String> {
        let prompt = with_memory(memory, prompt);
        if use_web {
            self.generator.generate_grounded(&prompt).await
        } else {
            self.generator.generate(&prompt).await
        }
    }

    fn direct_cancelled(&self) -> ExecutionOutcome {
        ExecutionOutcome::Cancelled {
            answer: self.locale.stopped().to_string(),
            state: RunState::default(),
        }
    }
}

/// Whitespace-insensitive inequality.
pub fn differs_materially(a: &str, b: &str) -> bool {
    !a.split_whitespace().eq(b.split_whitespace())
}

fn shorten(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
