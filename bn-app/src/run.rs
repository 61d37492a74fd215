//! Agent-loop bookkeeping: steps, run state and escalation records.

use crate::catalog::Intent;
use crate::memory::MemoryContext;
use crate::plan::AutonomyLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

pub const RESULT_SUMMARY_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: u64,
    pub intent: Intent,
    pub instruction: String,
    pub tools: Vec<String>,
    pub status: StepStatus,
    pub result_summary: String,
}

impl Step {
    pub fn new(step_id: u64, intent: Intent, instruction: impl Into<String>, tools: Vec<String>) -> Self {
        Self {
            step_id,
            intent,
            instruction: instruction.into(),
            tools,
            status: StepStatus::Pending,
            result_summary: String::new(),
        }
    }

    pub fn finish(&mut self, status: StepStatus, text: &str) {
        self.status = status;
        self.result_summary = text.chars().take(RESULT_SUMMARY_MAX_CHARS).collect();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub current_level: AutonomyLevel,
    pub requested_level: AutonomyLevel,
    pub reason: String,
}

/// Everything the loop needs to pick up where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub completed_steps: Vec<Step>,
    /// Non-empty step outputs, in execution order.
    pub results: Vec<String>,
    pub tools_used: BTreeSet<String>,
    pub escalations: Vec<EscalationRecord>,
    pub iteration: u32,
    pub next_step_id: u64,
    pub elapsed_seconds: f64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            completed_steps: Vec::new(),
            results: Vec::new(),
            tools_used: BTreeSet::new(),
            escalations: Vec::new(),
            iteration: 0,
            next_step_id: 1,
            elapsed_seconds: 0.0,
        }
    }
}

impl RunState {
    pub fn last_result(&self) -> Option<&str> {
        self.results.last().map(String::as_str)
    }

    pub fn failed_steps(&self) -> usize {
        self.completed_steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count()
    }

    /// Records a finished step and advances the id counter past it.
    pub fn record(&mut self, step: Step, output: Option<String>) {
        self.tools_used.extend(step.tools.iter().cloned());
        self.next_step_id = self.next_step_id.max(step.step_id + 1);
        if let Some(text) = output.filter(|t| !t.trim().is_empty()) {
            self.results.push(text);
        }
        self.completed_steps.push(step);
    }
}

/// Live context of one execution: the user's cancellation flag and their memory snapshot.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub cancel: CancellationToken,
    pub memory: MemoryContext,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken, memory: MemoryContext) -> Self {
        Self { cancel, memory }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
