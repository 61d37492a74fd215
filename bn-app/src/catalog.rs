//! Intent catalog: what each kind of step needs before it may run.

use crate::plan::AutonomyLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Minimum level at which research steps may use grounded (web) generation.
pub const WEB_LEVEL: AutonomyLevel = AutonomyLevel::from_const(1);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Intent {
    Research,
    Summarize,
    Finalize,
    Write,
    Edit,
    Todo,
    Verify,
    CodeReview,
    Bash,
    Unknown(String),
}

impl Intent {
    pub const KNOWN: [Intent; 9] = [
        Intent::Research,
        Intent::Summarize,
        Intent::Finalize,
        Intent::Write,
        Intent::Edit,
        Intent::Todo,
        Intent::Verify,
        Intent::CodeReview,
        Intent::Bash,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::Research => "research",
            Self::Summarize => "summarize",
            Self::Finalize => "finalize",
            Self::Write => "write",
            Self::Edit => "edit",
            Self::Todo => "todo",
            Self::Verify => "verify",
            Self::CodeReview => "code_review",
            Self::Bash => "bash",
            Self::Unknown(raw) => raw,
        }
    }
}

impl From<&str> for Intent {
    fn from(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "research" => Self::Research,
            "summarize" => Self::Summarize,
            "finalize" => Self::Finalize,
            "write" => Self::Write,
            "edit" => Self::Edit,
            "todo" => Self::Todo,
            "verify" => Self::Verify,
            "code_review" => Self::CodeReview,
            "bash" => Self::Bash,
            _ => Self::Unknown(raw.trim().to_string()),
        }
    }
}

impl From<String> for Intent {
    fn from(raw: String) -> Self {
        Self::from(raw.as_str())
    }
}

impl From<Intent> for String {
    fn from(intent: Intent) -> Self {
        intent.as_str().to_string()
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum autonomy level per intent. Unlisted intents require level 0.
#[derive(Debug, Clone)]
pub struct CapabilityCatalog {
    levels: BTreeMap<Intent, AutonomyLevel>,
}

impl Default for CapabilityCatalog {
    fn default() -> Self {
        let levels = Intent::KNOWN
            .into_iter()
            .map(|intent| {
                let level = match intent {
                    Intent::Research | Intent::Summarize | Intent::Finalize => 0,
                    Intent::Write | Intent::Edit | Intent::Todo => 2,
                    Intent::Verify | Intent::CodeReview => 2,
                    Intent::Bash => 3,
                    Intent::Unknown(_) => 0,
                };
                (intent, AutonomyLevel::from(level))
            })
            .collect();
        Self { levels }
    }
}

impl CapabilityCatalog {
    /// Default table with per-intent overrides from `[agent].intent_levels`.
    pub fn with_overrides(overrides: &BTreeMap<String, u8>) -> Self {
        let mut catalog = Self::default();
        for (name, level) in overrides {
            catalog
                .levels
                .insert(Intent::from(name.as_str()), AutonomyLevel::from(*level));
        }
        catalog
    }

    pub fn minimum_level(&self, intent: &Intent) -> AutonomyLevel {
        self.levels.get(intent).copied().unwrap_or_default()
    }

    /// Intents runnable at `level`, in catalog order.
    pub fn available_intents(&self, level: AutonomyLevel) -> Vec<Intent> {
        self.levels
            .iter()
            .filter(|(_, min)| **min <= level)
            .map(|(intent, _)| intent.clone())
            .collect()
    }
}
