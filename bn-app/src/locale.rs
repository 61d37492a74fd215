//! User-facing phrases and messages.
//!
//! Every string a user can read, and every control phrase a user can type, lives here so a
//! deployment speaks one language consistently.

use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    He,
}

impl FromStr for Locale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "en" | "english" => Ok(Self::En),
            "he" | "hebrew" | "iw" => Ok(Self::He),
            other => Err(format!("unsupported locale {other:?}; expected en or he")),
        }
    }
}

/// Literal control phrases, matched case-insensitively against the trimmed message.
pub struct Phrases {
    pub kill: &'static [&'static str],
    pub approve: &'static [&'static str],
    pub reject: &'static [&'static str],
    /// Regex with one capture group for the requested level digit.
    pub change_level: &'static str,
    pub remember_prefix: &'static str,
    pub forget_prefix: &'static str,
    pub recall: &'static [&'static str],
}

const EN_PHRASES: Phrases = Phrases {
    kill: &["stop", "kill", "abort", "/stop"],
    approve: &["yes", "y", "ok", "approve"],
    reject: &["no", "n", "reject", "cancel"],
    change_level: r"^(?:change (?:level to|to level)|level)\s*(\d)$",
    remember_prefix: "remember:",
    forget_prefix: "forget:",
    recall: &["what do you remember", "what do you remember?", "/memories"],
};

const HE_PHRASES: Phrases = Phrases {
    kill: &["עצור", "תפסיק", "/stop"],
    approve: &["כן", "אשר", "מאשר"],
    reject: &["לא", "בטל"],
    change_level: r"^(?:שנה רמה ל-?|שנה לרמה|רמה)\s*(\d)$",
    remember_prefix: "תזכור:",
    forget_prefix: "תשכח:",
    recall: &["מה אתה זוכר", "מה אתה זוכר?", "/memories"],
};

impl Locale {
    pub fn phrases(self) -> &'static Phrases {
        match self {
            Self::En => &EN_PHRASES,
            Self::He => &HE_PHRASES,
        }
    }

    pub fn apology(self) -> &'static str {
        match self {
            Self::En => "Sorry, I ran into a problem. Try again?",
            Self::He => "מצטער, נתקלתי בבעיה. נסה שוב?",
        }
    }

    pub fn stopped(self) -> &'static str {
        match self {
            Self::En => "Stopped.",
            Self::He => "נעצר.",
        }
    }

    pub fn kill_ack(self) -> &'static str {
        match self {
            Self::En => "Stopped. Any running or pending task was cancelled.",
            Self::He => "עצרתי. כל משימה פעילה או ממתינה בוטלה.",
        }
    }

    pub fn nothing_to_stop(self) -> &'static str {
        match self {
            Self::En => "Nothing is running right now.",
            Self::He => "אין כרגע משימה פעילה.",
        }
    }

    pub fn rejected(self) -> &'static str {
        match self {
            Self::En => "OK, cancelled.",
            Self::He => "בסדר, בוטל.",
        }
    }

    /// Prefix for a suspended agent run that a level change moved to a direct answer.
    pub fn partial_run_discarded(self) -> &'static str {
        match self {
            Self::En => "Earlier steps were discarded; answering directly at the new level.",
            Self::He => "השלבים הקודמים נזנחו; עונה ישירות ברמה החדשה.",
        }
    }

    pub fn pending_reminder(self) -> &'static str {
        match self {
            Self::En => "A plan is waiting for your approval. Reply yes / no / change level N.",
            Self::He => "יש תוכנית שממתינה לאישורך. השב כן / לא / שנה רמה ל-N.",
        }
    }

    pub fn approval_header(self) -> &'static str {
        match self {
            Self::En => "Approval required before execution.",
            Self::He => "נדרש אישור לפני ביצוע.",
        }
    }

    pub fn proposed_level(self, level: u8) -> String {
        match self {
            Self::En => format!("Proposed automation level: Level {level}."),
            Self::He => format!("רמת אוטומציה מוצעת: Level {level}."),
        }
    }

    pub fn reason_label(self) -> &'static str {
        match self {
            Self::En => "Reason: ",
            Self::He => "סיבה: ",
        }
    }

    pub fn tools_label(self) -> &'static str {
        match self {
            Self::En => "Required tools: ",
            Self::He => "כלים נדרשים: ",
        }
    }

    pub fn limits_label(self) -> &'static str {
        match self {
            Self::En => "Limits: ",
            Self::He => "מגבלות: ",
        }
    }

    pub fn memory_preview_header(self) -> &'static str {
        match self {
            Self::En => "Benjamin suggests saving this memory:",
            Self::He => "המערכת מציעה לשמור זיכרון:",
        }
    }

    pub fn approval_prompt(self) -> &'static str {
        match self {
            Self::En => "Approve? (yes / no / change level)",
            Self::He => "לאשר? (כן / לא / שנה רמה)",
        }
    }

    pub fn escalation_request(self, step_id: u64, intent: &str, required: u8, current: u8) -> String {
        match self {
            Self::En => format!(
                "Higher permission is required to continue.\n\
                 Step #{step_id} ({intent}) requires Level {required}.\n\
                 Current level: {current}.\n\
                 Approve raising to Level {required}? (yes / no)"
            ),
            Self::He => format!(
                "בזמן הביצוע נדרשת הרשאה גבוהה יותר.\n\
                 שלב #{step_id} ({intent}) דורש Level {required}.\n\
                 רמה נוכחית: {current}.\n\
                 לאשר העלאה ל-Level {required}? (כן / לא)"
            ),
        }
    }

    pub fn governor_no_output(self) -> &'static str {
        match self {
            Self::En => {
                "I reached the execution limit before gathering any information. \
                 Try again with larger governors."
            }
            Self::He => "הגעתי למגבלת הביצוע ולא הספקתי לאסוף מידע. נסה שוב עם governors גדולים יותר.",
        }
    }

    pub fn remembered(self, key: &str, value: &str) -> String {
        match self {
            Self::En => format!("Saved: {key} = {value}"),
            Self::He => format!("נשמר: {key} = {value}"),
        }
    }

    pub fn remember_usage(self) -> &'static str {
        match self {
            Self::En => "What should I remember? Try \"remember: key: value\".",
            Self::He => "מה לזכור? נסה \"תזכור: נושא: ערך\".",
        }
    }

    pub fn forgotten(self, key: &str, count: usize) -> String {
        match (self, count) {
            (Self::En, 0) => format!("I had nothing stored under '{key}'."),
            (Self::En, n) => format!("Forgot {n} item(s) stored under '{key}'."),
            (Self::He, 0) => format!("לא היה שמור שום דבר תחת '{key}'."),
            (Self::He, n) => format!("נמחקו {n} פריטים תחת '{key}'."),
        }
    }

    pub fn recall_header(self) -> &'static str {
        match self {
            Self::En => "Here is what I remember:",
            Self::He => "זה מה שאני זוכר:",
        }
    }

    pub fn recall_empty(self) -> &'static str {
        match self {
            Self::En => "I don't have anything stored about you yet.",
            Self::He => "אין לי עדיין מידע שמור עליך.",
        }
    }

    pub fn greeting(self) -> &'static str {
        match self {
            Self::En => "👋 Hi! I'm Benjamin.",
            Self::He => "👋 היי! אני בנימין.",
        }
    }

    pub fn conversation_reset(self) -> &'static str {
        match self {
            Self::En => "Started a fresh conversation.",
            Self::He => "התחלנו שיחה חדשה.",
        }
    }

    pub fn status(self, pending: bool, active: bool, window: usize) -> String {
        let yes_no = |b: bool| match (self, b) {
            (Self::En, true) => "yes",
            (Self::En, false) => "no",
            (Self::He, true) => "כן",
            (Self::He, false) => "לא",
        };
        match self {
            Self::En => format!(
                "Pending approval: {}\nRunning task: {}\nRecent exchanges kept: {window}",
                yes_no(pending),
                yes_no(active)
            ),
            Self::He => format!(
                "ממתין לאישור: {}\nמשימה פעילה: {}\nהחלפות אחרונות בזיכרון: {window}",
                yes_no(pending),
                yes_no(active)
            ),
        }
    }
}
