//! Plan → gate → execute → observe loop for level 3+ plans.
//!
//! The loop runs under two governors (turns and wall-clock time, accumulated across
//! pauses) and polls the cancellation flag at every step boundary. A step that needs more
//! than one level above what the user approved suspends the run; the returned
//! [`Suspension`] carries everything needed to resume at that step.

use crate::capabilities::{Critic, TextGenerator};
use crate::catalog::{CapabilityCatalog, Intent};
use crate::escalation::{EscalationGate, GateDecision};
use crate::executor::{StepExecutor, StepInputs};
use crate::locale::Locale;
use crate::plan::{AutonomyLevel, ExecutionPlan, GovernorDefaults};
use crate::planner::Planner;
use crate::run::{ExecutionContext, RunState, StepStatus};
use bn_tools::CommandRunner;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Suspension {
    pub approval_request: String,
    pub proposed_plan: ExecutionPlan,
    pub resume_state: RunState,
    pub requested_level: AutonomyLevel,
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// `stopped` is true when a governor ended the run.
    Finished {
        answer: String,
        stopped: bool,
        state: RunState,
    },
    Cancelled {
        answer: String,
        state: RunState,
    },
    Suspended(Box<Suspension>),
}

impl ExecutionOutcome {
    /// Text to send back to the user.
    pub fn reply(&self) -> &str {
        match self {
            Self::Finished { answer, .. } | Self::Cancelled { answer, .. } => answer,
            Self::Suspended(s) => &s.approval_request,
        }
    }
}

pub struct AgentLoop {
    planner: Planner,
    executor: StepExecutor,
    gate: EscalationGate,
    catalog: Arc<CapabilityCatalog>,
    generator: Arc<dyn TextGenerator>,
    locale: Locale,
    defaults: GovernorDefaults,
}

impl AgentLoop {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        critic: Arc<dyn Critic>,
        runner: Arc<dyn CommandRunner>,
        catalog: Arc<CapabilityCatalog>,
        locale: Locale,
        defaults: GovernorDefaults,
    ) -> Self {
        Self {
            planner: Planner::new(generator.clone()),
            executor: StepExecutor::new(generator.clone(), critic, runner),
            gate: EscalationGate::new(catalog.clone()),
            catalog,
            generator,
            locale,
            defaults,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(level = %plan.autonomy_level))]
    pub async fn run(
        &self,
        task: &str,
        plan: &ExecutionPlan,
        ctx: &ExecutionContext,
        resume: Option<RunState>,
    ) -> ExecutionOutcome {
        let approved = plan.autonomy_level;
        let mut current = approved;
        let max_turns = plan.governors.max_turns.unwrap_or(self.defaults.max_turns);
        let max_time = plan
            .governors
            .max_execution_time_seconds
            .unwrap_or(self.defaults.max_execution_time_seconds) as f64;

        let resumed = resume.is_some();
        let mut state = resume.unwrap_or_default();
        let elapsed_before = state.elapsed_seconds;
        let started = Instant::now();
        let elapsed = || elapsed_before + started.elapsed().as_secs_f64();

        tracing::info!(
            max_turns,
            max_time,
            resumed,
            completed = state.completed_steps.len(),
            elapsed_before,
            "agent loop started"
        );

        'turns: while state.iteration < max_turns {
            if ctx.is_cancelled() {
                return self.cancelled(state, elapsed());
            }
            if elapsed() > max_time {
                tracing::info!(max_time, "time governor reached");
                break;
            }

            let available = self.catalog.available_intents(current);
            let steps = self
                .planner
                .plan_next_steps(
                    task,
                    &state.completed_steps,
                    &available,
                    state.next_step_id,
                    plan.use_web,
                )
                .await;
            if steps.is_empty() {
                tracing::info!("planner returned no steps");
                let answer = state
                    .last_result()
                    .unwrap_or(self.locale.governor_no_output())
                    .to_string();
                return self.finished(state, elapsed(), answer, false);
            }

            for mut step in steps {
                if ctx.is_cancelled() {
                    return self.cancelled(state, elapsed());
                }
                if elapsed() > max_time {
                    tracing::info!(max_time, "time governor reached");
                    break 'turns;
                }

                match self.gate.check(&step, current, approved) {
                    GateDecision::Allow => {}
                    GateDecision::AutoApproved(record) => {
                        tracing::info!(
                            from = %record.current_level,
                            to = %record.requested_level,
                            reason = %record.reason,
                            "escalation auto-approved"
                        );
                        current = record.requested_level;
                        state.escalations.push(record);
                    }
                    GateDecision::Blocked { required } => {
                        tracing::info!(step_id = step.step_id, %required, "escalation needs approval");
                        let approval_request = self.locale.escalation_request(
                            step.step_id,
                            step.intent.as_str(),
                            required.value(),
                            current.value(),
                        );
                        state.next_step_id = step.step_id;
                        state.elapsed_seconds = elapsed();
                        return ExecutionOutcome::Suspended(Box::new(Suspension {
                            approval_request,
                            proposed_plan: plan.with_level(required, &self.defaults),
                            resume_state: state,
                            requested_level: required,
                        }));
                    }
                }

                let inputs = StepInputs {
                    task,
                    plan,
                    current_level: current,
                    prior_results: &state.results,
                    memory: &ctx.memory,
                };
                let output = match self.executor.execute(&step, &inputs).await {
                    Ok(text) => {
                        step.finish(StepStatus::Done, &text);
                        Some(text)
                    }
                    Err(e) => {
                        tracing::warn!(%e, step_id = step.step_id, "step failed");
                        step.finish(StepStatus::Failed, &e.to_string());
                        None
                    }
                };
                tracing::info!(
                    step_id = step.step_id,
                    intent = %step.intent,
                    status = ?step.status,
                    "step finished"
                );

                let final_answer = (step.intent == Intent::Finalize)
                    .then(|| output.clone())
                    .flatten()
                    .filter(|t| !t.trim().is_empty());
                state.record(step, output);
                if let Some(answer) = final_answer {
                    return self.finished(state, elapsed(), answer, false);
                }
            }

            state.iteration += 1;
        }

        let answer = self.compile_after_governor(task, &state).await;
        self.finished(state, elapsed(), answer, true)
    }

    async fn compile_after_governor(&self, task: &str, state: &RunState) -> String {
        let Some(last) = state.last_result() else {
            return self.locale.governor_no_output().to_string();
        };
        let prompt = format!(
            "User request: {task}\n\nGathered info:\n{}\n\n\
             Compile a final answer. Note: execution was limited by time/turn governors.",
            state.results.join("\n---\n")
        );
        match self.generator.generate(&prompt).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => last.to_string(),
            Err(e) => {
                tracing::warn!(%e, "governor compilation failed; using last result");
                last.to_string()
            }
        }
    }

    fn finished(&self, mut state: RunState, elapsed: f64, answer: String, stopped: bool) -> ExecutionOutcome {
        state.elapsed_seconds = elapsed;
        log_summary(&state, stopped);
        ExecutionOutcome::Finished {
            answer,
            stopped,
            state,
        }
    }

    fn cancelled(&self, mut state: RunState, elapsed: f64) -> ExecutionOutcome {
        tracing::info!("kill switch observed");
        state.elapsed_seconds = elapsed;
        log_summary(&state, true);
        let answer = state
            .last_result()
            .unwrap_or(self.locale.stopped())
            .to_string();
        ExecutionOutcome::Cancelled { answer, state }
    }
}

fn log_summary(state: &RunState, stopped: bool) {
    let failed = state.failed_steps();
    tracing::info!(
        steps_done = state.completed_steps.len() - failed,
        failed,
        escalations = state.escalations.len(),
        elapsed_seconds = state.elapsed_seconds,
        stopped,
        "agent loop summary"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryContext;
    use crate::testing::{FnGenerator, RecordingRunner, ScriptedCritic, exhausted};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const PLANNER: &str = "You are a step planner";

    /// Planner prompts get `planner_reply`; finalize prompts get "final answer"; governor
    /// compilation gets "compiled"; everything else is research.
    fn scripted(planner_reply: &'static str) -> FnGenerator {
        FnGenerator::new(move |prompt, _| {
            Ok(if prompt.starts_with(PLANNER) {
                planner_reply.to_string()
            } else if prompt.contains("Compile a final answer") {
                "compiled".to_string()
            } else if prompt.starts_with("User request:") {
                "final answer".to_string()
            } else {
                format!("notes on {prompt}")
            })
        })
    }

    struct Fixture {
        generator: Arc<FnGenerator>,
        runner: Arc<RecordingRunner>,
        agent: AgentLoop,
    }

    fn fixture(generator: FnGenerator, overrides: &[(&str, u8)]) -> Fixture {
        let generator = Arc::new(generator);
        let runner = Arc::new(RecordingRunner::default());
        let overrides: BTreeMap<String, u8> =
            overrides.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        let agent = AgentLoop::new(
            generator.clone(),
            Arc::new(ScriptedCritic::default()),
            runner.clone(),
            Arc::new(CapabilityCatalog::with_overrides(&overrides)),
            Locale::En,
            GovernorDefaults::default(),
        );
        Fixture {
            generator,
            runner,
            agent,
        }
    }

    fn plan(raw: serde_json::Value) -> ExecutionPlan {
        ExecutionPlan::normalize(&raw, &GovernorDefaults::default())
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(CancellationToken::new(), MemoryContext::default())
    }

    fn step_ids(state: &RunState) -> Vec<u64> {
        state.completed_steps.iter().map(|s| s.step_id).collect()
    }

    #[tokio::test]
    async fn finalize_with_text_ends_the_run() {
        let fx = fixture(
            scripted(
                r#"{"steps": [{"intent": "research", "instruction": "find prices"},
                              {"intent": "finalize", "instruction": "answer"},
                              {"intent": "research", "instruction": "never runs"}]}"#,
            ),
            &[],
        );
        let outcome = fx.agent.run("laptops", &plan(json!({ "autonomy_level": 3 })), &ctx(), None).await;
        match outcome {
            ExecutionOutcome::Finished {
                answer,
                stopped,
                state,
            } => {
                assert_eq!(answer, "final answer");
                assert!(!stopped);
                assert_eq!(step_ids(&state), vec![1, 2]);
                assert_eq!(state.results, vec!["notes on find prices", "final answer"]);
                assert_eq!(state.next_step_id, 3);
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn one_level_escalation_is_recorded_and_runs() {
        let fx = fixture(
            scripted(
                r#"{"steps": [{"intent": "bash", "instruction": "git status", "tools": ["bash"]},
                              {"intent": "finalize", "instruction": "answer"}]}"#,
            ),
            &[("bash", 4)],
        );
        let outcome = fx.agent.run("repo state", &plan(json!({ "autonomy_level": 3 })), &ctx(), None).await;
        let ExecutionOutcome::Finished { state, .. } = outcome else {
            panic!("expected finish");
        };
        assert_eq!(state.escalations.len(), 1);
        assert_eq!(state.escalations[0].requested_level.value(), 4);
        assert_eq!(state.escalations[0].reason, "Step #1 (bash) requires level 4");
        assert!(state.tools_used.contains("bash"));
        assert_eq!(fx.runner.commands(), vec!["git status".to_string()]);
    }

    #[tokio::test]
    async fn blocked_escalation_suspends_and_resumes_at_the_same_step() {
        let fx = fixture(
            scripted(
                r#"{"steps": [{"intent": "research", "instruction": "look"},
                              {"intent": "bash", "instruction": "ls"},
                              {"intent": "finalize", "instruction": "answer"}]}"#,
            ),
            &[("bash", 5)],
        );
        let approved = plan(json!({ "autonomy_level": 3 }));
        let outcome = fx.agent.run("list files", &approved, &ctx(), None).await;
        let ExecutionOutcome::Suspended(suspension) = outcome else {
            panic!("expected suspension");
        };
        assert_eq!(suspension.requested_level.value(), 5);
        assert_eq!(suspension.proposed_plan.autonomy_level.value(), 5);
        assert_eq!(suspension.resume_state.next_step_id, 2);
        assert_eq!(step_ids(&suspension.resume_state), vec![1]);
        assert!(suspension.approval_request.contains("Step #2 (bash) requires Level 5"));
        assert!(fx.runner.commands().is_empty());

        let outcome = fx
            .agent
            .run(
                "list files",
                &suspension.proposed_plan,
                &ctx(),
                Some(suspension.resume_state.clone()),
            )
            .await;
        let ExecutionOutcome::Finished { answer, state, .. } = outcome else {
            panic!("expected finish after resume");
        };
        assert_eq!(answer, "final answer");
        assert_eq!(step_ids(&state), vec![1, 2, 3, 4]);
        assert_eq!(state.completed_steps[2].intent, Intent::Bash);
        assert_eq!(fx.runner.commands(), vec!["ls".to_string()]);
        let prompts = fx.generator.prompts();
        let last_planner = prompts.iter().rev().find(|p| p.starts_with(PLANNER)).unwrap();
        assert!(last_planner.contains("The first new step is step 2."));
    }

    #[tokio::test]
    async fn turn_governor_compiles_what_was_gathered() {
        let fx = fixture(
            scripted(r#"{"steps": [{"intent": "research", "instruction": "dig"}]}"#),
            &[],
        );
        let plan = plan(json!({ "autonomy_level": 4, "governors": { "max_turns": 1 } }));
        let outcome = fx.agent.run("deep topic", &plan, &ctx(), None).await;
        let ExecutionOutcome::Finished { answer, stopped, state } = outcome else {
            panic!("expected finish");
        };
        assert!(stopped);
        assert_eq!(answer, "compiled");
        assert_eq!(state.iteration, 1);
        let compile_prompt = fx.generator.prompts().pop().unwrap();
        assert!(compile_prompt.starts_with("User request: deep topic\n\nGathered info:\nnotes on dig"));
    }

    #[tokio::test(start_paused = true)]
    async fn time_governor_stops_between_steps() {
        let fx = fixture(
            scripted(
                r#"{"steps": [{"intent": "research", "instruction": "a"},
                              {"intent": "research", "instruction": "b"}]}"#,
            )
            .with_delay(Duration::from_secs(40)),
            &[],
        );
        let plan = plan(json!({
            "autonomy_level": 4,
            "governors": { "max_execution_time_seconds": 60 }
        }));
        let outcome = fx.agent.run("slow", &plan, &ctx(), None).await;
        let ExecutionOutcome::Finished { stopped, state, .. } = outcome else {
            panic!("expected finish");
        };
        assert!(stopped);
        assert_eq!(step_ids(&state), vec![1]);
        assert!(state.elapsed_seconds >= 80.0);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_time_accumulates_across_resume() {
        let fx = fixture(
            scripted(r#"{"steps": [{"intent": "research", "instruction": "a"}]}"#)
                .with_delay(Duration::from_secs(10)),
            &[],
        );
        let plan = plan(json!({
            "autonomy_level": 4,
            "governors": { "max_execution_time_seconds": 60 }
        }));
        let resume = RunState {
            elapsed_seconds: 55.0,
            ..RunState::default()
        };
        let outcome = fx.agent.run("slow", &plan, &ctx(), Some(resume)).await;
        let ExecutionOutcome::Finished { stopped, state, .. } = outcome else {
            panic!("expected finish");
        };
        assert!(stopped);
        assert!(state.completed_steps.is_empty());
        assert_eq!(state.results.len(), 0);
    }

    #[tokio::test]
    async fn cancellation_before_first_step_runs_nothing() {
        let fx = fixture(scripted(r#"{"steps": [{"intent": "research"}]}"#), &[]);
        let ctx = ctx();
        ctx.cancel.cancel();
        let outcome = fx.agent.run("t", &plan(json!({ "autonomy_level": 3 })), &ctx, None).await;
        let ExecutionOutcome::Cancelled { answer, state } = outcome else {
            panic!("expected cancellation");
        };
        assert_eq!(answer, "Stopped.");
        assert!(state.completed_steps.is_empty());
        assert!(fx.generator.calls().is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_observed_at_the_next_step_boundary() {
        let token = CancellationToken::new();
        let trip = token.clone();
        let generator = FnGenerator::new(move |prompt, _| {
            if prompt.starts_with(PLANNER) {
                return Ok(r#"{"steps": [{"intent": "research", "instruction": "one"},
                                        {"intent": "research", "instruction": "two"}]}"#
                    .to_string());
            }
            trip.cancel();
            Ok(format!("done {prompt}"))
        });
        let fx = fixture(generator, &[]);
        let ctx = ExecutionContext::new(token, MemoryContext::default());
        let outcome = fx.agent.run("t", &plan(json!({ "autonomy_level": 3 })), &ctx, None).await;
        let ExecutionOutcome::Cancelled { answer, state } = outcome else {
            panic!("expected cancellation");
        };
        assert_eq!(answer, "done one");
        assert_eq!(step_ids(&state), vec![1]);
    }

    #[tokio::test]
    async fn failing_steps_do_not_abort_the_run() {
        let generator = FnGenerator::new(|prompt, _| {
            if prompt.starts_with(PLANNER) {
                Ok(r#"{"steps": [{"intent": "research", "instruction": "x"}]}"#.to_string())
            } else {
                Err(exhausted("worker"))
            }
        });
        let fx = fixture(generator, &[]);
        let plan = plan(json!({ "autonomy_level": 3, "governors": { "max_turns": 2 } }));
        let outcome = fx.agent.run("t", &plan, &ctx(), None).await;
        let ExecutionOutcome::Finished { answer, stopped, state } = outcome else {
            panic!("expected finish");
        };
        assert!(stopped);
        assert_eq!(state.failed_steps(), 2);
        assert_eq!(step_ids(&state), vec![1, 2]);
        assert_eq!(answer, Locale::En.governor_no_output());
        assert!(state.completed_steps[0].result_summary.contains("scripted failure"));
    }

    #[tokio::test]
    async fn empty_plan_ends_normally_with_last_result() {
        let fx = fixture(scripted(r#"{"steps": []}"#), &[]);
        let resume = RunState {
            results: vec!["earlier".to_string()],
            next_step_id: 4,
            ..RunState::default()
        };
        let outcome = fx
            .agent
            .run("t", &plan(json!({ "autonomy_level": 3 })), &ctx(), Some(resume))
            .await;
        let ExecutionOutcome::Finished { answer, stopped, .. } = outcome else {
            panic!("expected finish");
        };
        assert_eq!(answer, "earlier");
        assert!(!stopped);
    }
}
