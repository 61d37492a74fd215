//! Execution plans.
//!
//! The router model returns loosely shaped JSON. [`ExecutionPlan::normalize`] turns any JSON
//! value into a complete plan: unknown or malformed fields fall back to their defaults, the
//! level is clamped into `0..=5` and the execution mode is derived from the level.

use crate::commands::truncate_chars;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const MAX_LEVEL: u8 = 5;
/// Plans at or above this level run through the agent loop.
pub const AGENT_LOOP_LEVEL: u8 = 3;
/// Plans at or above this level always carry explicit turn, time and budget limits.
pub const GOVERNED_LEVEL: u8 = 4;

const MEMORY_KEY_MAX_CHARS: usize = 40;
const MEMORY_VALUE_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AutonomyLevel(u8);

impl AutonomyLevel {
    pub const ZERO: Self = Self(0);

    pub const fn from_const(value: u8) -> Self {
        if value > MAX_LEVEL {
            Self(MAX_LEVEL)
        } else {
            Self(value)
        }
    }

    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(0, MAX_LEVEL as i64) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn mode(self) -> ExecutionMode {
        if self.0 >= AGENT_LOOP_LEVEL {
            ExecutionMode::AgentLoop
        } else {
            ExecutionMode::Direct
        }
    }
}

impl From<u8> for AutonomyLevel {
    fn from(value: u8) -> Self {
        Self::clamped(value as i64)
    }
}

impl fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Direct,
    AgentLoop,
}

/// Per-run resource limits. Absent fields mean "no explicit limit".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Governors {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_execution_time_seconds: Option<u64>,
}

impl Governors {
    pub fn is_empty(&self) -> bool {
        self.max_budget_usd.is_none()
            && self.max_tokens.is_none()
            && self.max_turns.is_none()
            && self.max_execution_time_seconds.is_none()
    }

    fn from_value(value: &Value) -> Self {
        Self {
            max_budget_usd: value.get("max_budget_usd").and_then(as_f64).filter(|v| *v >= 0.0),
            max_tokens: value.get("max_tokens").and_then(as_u64),
            max_turns: value
                .get("max_turns")
                .and_then(as_u64)
                .and_then(|v| u32::try_from(v).ok()),
            max_execution_time_seconds: value.get("max_execution_time_seconds").and_then(as_u64),
        }
    }

    fn fill_loop_defaults(&mut self, defaults: &GovernorDefaults) {
        self.max_turns.get_or_insert(defaults.max_turns);
        self.max_execution_time_seconds
            .get_or_insert(defaults.max_execution_time_seconds);
        self.max_budget_usd.get_or_insert(defaults.max_budget_usd);
    }
}

/// Limits applied when a plan leaves them out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GovernorDefaults {
    pub max_turns: u32,
    pub max_execution_time_seconds: u64,
    pub max_budget_usd: f64,
}

impl Default for GovernorDefaults {
    fn default() -> Self {
        Self {
            max_turns: 5,
            max_execution_time_seconds: 120,
            max_budget_usd: 0.50,
        }
    }
}

impl From<&crate::config::AgentConfig> for GovernorDefaults {
    fn from(cfg: &crate::config::AgentConfig) -> Self {
        Self {
            max_turns: cfg.default_max_turns,
            max_execution_time_seconds: cfg.default_max_execution_time_seconds,
            max_budget_usd: cfg.default_max_budget_usd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryWrite {
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    pub value: String,
}

impl MemoryWrite {
    /// All-or-nothing: a suggestion without a key or a value is dropped.
    fn from_value(value: &Value) -> Option<Self> {
        let text = |field: &str| {
            value
                .get(field)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };
        let key = text("key")?;
        let val = text("value")?;
        Some(Self {
            kind: text("type").unwrap_or("fact").to_string(),
            key: truncate_chars(key, MEMORY_KEY_MAX_CHARS),
            value: truncate_chars(val, MEMORY_VALUE_MAX_CHARS),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub autonomy_level: AutonomyLevel,
    pub execution_mode: ExecutionMode,
    pub tools_required: Vec<String>,
    pub use_web: bool,
    pub require_verification: bool,
    pub require_code_review: bool,
    pub require_task_decomposition: bool,
    pub governors: Governors,
    pub suggest_memory_write: bool,
    pub memory_to_write: Option<MemoryWrite>,
    pub reason: String,
}

impl ExecutionPlan {
    /// Builds a complete plan from arbitrary router output. Never fails.
    pub fn normalize(raw: &Value, defaults: &GovernorDefaults) -> Self {
        let level = raw
            .get("autonomy_level")
            .or_else(|| raw.get("suggested_automation_level"))
            .and_then(as_i64)
            .map(AutonomyLevel::clamped)
            .unwrap_or_default();

        let tools_required = raw
            .get("tools_required")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let flag = |field: &str| raw.get(field).and_then(Value::as_bool).unwrap_or(false);

        let mut governors = raw
            .get("governors")
            .map(Governors::from_value)
            .unwrap_or_default();
        if level.value() >= GOVERNED_LEVEL {
            governors.fill_loop_defaults(defaults);
        }

        let memory_to_write = raw.get("memory_to_write").and_then(MemoryWrite::from_value);

        let reason = raw
            .get("reason")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();

        Self {
            autonomy_level: level,
            execution_mode: level.mode(),
            tools_required,
            use_web: flag("use_web"),
            require_verification: flag("require_verification"),
            require_code_review: flag("require_code_review"),
            require_task_decomposition: flag("require_task_decomposition"),
            governors,
            suggest_memory_write: flag("suggest_memory_write") && memory_to_write.is_some(),
            memory_to_write,
            reason,
        }
    }

    /// Same plan at another level, with the mode and loop governors re-derived.
    pub fn with_level(&self, level: AutonomyLevel, defaults: &GovernorDefaults) -> Self {
        let mut plan = self.clone();
        plan.autonomy_level = level;
        plan.execution_mode = level.mode();
        if level.value() >= GOVERNED_LEVEL {
            plan.governors.fill_loop_defaults(defaults);
        }
        plan
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    as_i64(value).and_then(|v| u64::try_from(v).ok())
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}
