//! Step planner: asks the worker model for the next one to three steps.

use crate::capabilities::TextGenerator;
use crate::catalog::Intent;
use crate::run::Step;
use bn_llm::extract_json_object;
use serde_json::Value;
use std::sync::Arc;

pub const MAX_STEPS_PER_TURN: usize = 3;
const PROGRESS_SUMMARY_MAX_CHARS: usize = 100;
pub const FALLBACK_INSTRUCTION: &str = "Compile final answer from gathered information";

#[derive(Clone)]
pub struct Planner {
    generator: Arc<dyn TextGenerator>,
}

impl Planner {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    /// Next steps with ids starting at `next_step_id`. A failed or unparsable reply, or one whose
    /// steps all lack an intent, yields a single `finalize` step; an explicit empty list is
    /// returned as-is.
    #[tracing::instrument(level = "debug", skip_all, fields(next_step_id = next_step_id))]
    pub async fn plan_next_steps(
        &self,
        task: &str,
        completed: &[Step],
        available: &[Intent],
        next_step_id: u64,
        allow_web: bool,
    ) -> Vec<Step> {
        let prompt = planner_prompt(task, completed, available, next_step_id, allow_web);
        let reply = match self.generator.generate(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(%e, "planner generation failed; finalizing");
                return vec![fallback_step(next_step_id)];
            }
        };
        match parse_steps(&reply, next_step_id) {
            Some(steps) => steps,
            None => {
                tracing::warn!(chars = reply.len(), "planner reply unparsable; finalizing");
                vec![fallback_step(next_step_id)]
            }
        }
    }
}

fn fallback_step(step_id: u64) -> Step {
    Step::new(
        step_id,
        Intent::Finalize,
        FALLBACK_INSTRUCTION,
        vec!["generate".to_string()],
    )
}

fn planner_prompt(
    task: &str,
    completed: &[Step],
    available: &[Intent],
    next_step_id: u64,
    allow_web: bool,
) -> String {
    let progress = if completed.is_empty() {
        "No steps completed yet.".to_string()
    } else {
        let lines: Vec<String> = completed
            .iter()
            .map(|s| {
                let summary: String = s
                    .result_summary
                    .chars()
                    .take(PROGRESS_SUMMARY_MAX_CHARS)
                    .collect();
                format!(
                    "  Step {}: [{}] {:?} - {}",
                    s.step_id, s.intent, s.status, summary
                )
            })
            .collect();
        format!("Completed steps:\n{}", lines.join("\n"))
    };
    let intents: Vec<&str> = available.iter().map(Intent::as_str).collect();
    let tools = if allow_web {
        "generate, generate_web"
    } else {
        "generate"
    };

    format!(
        "You are a step planner. Plan the next 1-3 steps toward the task.\n\n\
         Reply with JSON only, no markdown:\n\
         {{\"steps\": [{{\"intent\": \"...\", \"instruction\": \"...\", \"tools\": [\"...\"]}}]}}\n\n\
         Allowed intents: {intents}\n\
         Available tools: {tools}\n\n\
         Task: {task}\n\n\
         {progress}\n\n\
         Use \"finalize\" once the task is done or enough information is gathered.\n\
         The first new step is step {next_step_id}.",
        intents = intents.join(", "),
    )
}

fn parse_steps(reply: &str, next_step_id: u64) -> Option<Vec<Step>> {
    let value = extract_json_object(reply)?;
    let items = value.get("steps")?.as_array()?;
    let steps = items
        .iter()
        .filter_map(|item| {
            let intent = item.get("intent")?.as_str()?.trim();
            if intent.is_empty() {
                return None;
            }
            let instruction = item
                .get("instruction")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            let tools = item
                .get("tools")
                .and_then(Value::as_array)
                .map(|t| t.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            Some((Intent::from(intent), instruction, tools))
        })
        .take(MAX_STEPS_PER_TURN)
        .enumerate()
        .map(|(i, (intent, instruction, tools))| {
            Step::new(next_step_id + i as u64, intent, instruction, tools)
        })
        .collect::<Vec<_>>();
    if steps.is_empty() && !items.is_empty() {
        tracing::warn!(items = items.len(), "planner reply had no usable steps");
        return None;
    }
    Some(steps)
}
