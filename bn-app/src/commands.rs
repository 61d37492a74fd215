//! Control-phrase parser.
//!
//! Recognizes the kill switch, slash commands, explicit memory commands and replies to a
//! pending approval. Anything else is an ordinary request for the orchestrator.

use crate::locale::Locale;
use crate::plan::AutonomyLevel;
use regex::Regex;

const MEMORY_KEY_MAX_CHARS: usize = 40;
const MEMORY_VALUE_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Kill,
    Start,
    NewConversation,
    Status,
    /// Text after the explicit-remember prefix, trimmed.
    Remember(String),
    /// Key after the explicit-forget prefix, trimmed.
    Forget(String),
    Recall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalReply {
    Approve,
    Reject,
    ChangeLevel(AutonomyLevel),
}

pub struct CommandParser {
    locale: Locale,
    change_level: Regex,
}

impl CommandParser {
    pub fn new(locale: Locale) -> anyhow::Result<Self> {
        let change_level = Regex::new(locale.phrases().change_level)
            .map_err(|e| anyhow::anyhow!("compile change-level pattern for {locale:?}: {e}"))?;
        Ok(Self {
            locale,
            change_level,
        })
    }

    pub fn locale(&self) -> Locale {
        self.locale
    }

    pub fn parse_command(&self, input: &str) -> Option<ControlCommand> {
        let phrases = self.locale.phrases();
        let trimmed = input.trim();
        let folded = fold(trimmed);

        if phrases.kill.contains(&folded.as_str()) {
            return Some(ControlCommand::Kill);
        }
        match folded.as_str() {
            "/start" => return Some(ControlCommand::Start),
            "/new" => return Some(ControlCommand::NewConversation),
            "/status" => return Some(ControlCommand::Status),
            _ => {}
        }
        if phrases.recall.contains(&folded.as_str()) {
            return Some(ControlCommand::Recall);
        }
        if let Some(rest) = strip_prefix_ci(trimmed, phrases.forget_prefix) {
            return Some(ControlCommand::Forget(rest.trim().to_string()));
        }
        if let Some(rest) = strip_prefix_ci(trimmed, phrases.remember_prefix) {
            return Some(ControlCommand::Remember(rest.trim().to_string()));
        }
        None
    }

    pub fn parse_reply(&self, input: &str) -> Option<ApprovalReply> {
        let phrases = self.locale.phrases();
        let folded = fold(input.trim());

        if phrases.approve.contains(&folded.as_str()) {
            return Some(ApprovalReply::Approve);
        }
        if phrases.reject.contains(&folded.as_str()) {
            return Some(ApprovalReply::Reject);
        }
        let caps = self.change_level.captures(&folded)?;
        let level = caps.get(1)?.as_str().parse::<i64>().ok()?;
        Some(ApprovalReply::ChangeLevel(AutonomyLevel::clamped(level)))
    }
}

/// True when the message opens with the explicit-remember prefix.
pub fn is_explicit_remember(locale: Locale, input: &str) -> bool {
    strip_prefix_ci(input.trim(), locale.phrases().remember_prefix).is_some()
}

/// Splits an explicit fact into `(key, value)`.
///
/// `"name: Dana"` and `"name = Dana"` split on the first separator; a bare fact uses its
/// first three words as the key. Key and value are capped at 40 and 500 characters.
pub fn parse_fact(text: &str) -> Option<(String, String)> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let (key, value) = match text.find([':', '=']) {
        Some(idx) if idx > 0 => (text[..idx].trim(), text[idx + 1..].trim()),
        _ => {
            let key = text.split_whitespace().take(3).collect::<Vec<_>>().join(" ");
            return Some((
                truncate_chars(&key, MEMORY_KEY_MAX_CHARS),
                truncate_chars(text, MEMORY_VALUE_MAX_CHARS),
            ));
        }
    };
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((
        truncate_chars(key, MEMORY_KEY_MAX_CHARS),
        truncate_chars(value, MEMORY_VALUE_MAX_CHARS),
    ))
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn fold(text: &str) -> String {
    text.trim_end_matches(['.', '!'])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn en() -> CommandParser {
        CommandParser::new(Locale::En).expect("english patterns compile")
    }

    fn he() -> CommandParser {
        CommandParser::new(Locale::He).expect("hebrew patterns compile")
    }

    #[test]
    fn kill_phrases_are_case_insensitive() {
        assert_eq!(en().parse_command("  STOP "), Some(ControlCommand::Kill));
        assert_eq!(en().parse_command("/stop"), Some(ControlCommand::Kill));
        assert_eq!(he().parse_command("עצור"), Some(ControlCommand::Kill));
        assert_eq!(en().parse_command("stop the music"), None);
    }

    #[test]
    fn memory_commands_carry_their_payload() {
        assert_eq!(
            en().parse_command("Remember: name: Dana"),
            Some(ControlCommand::Remember("name: Dana".to_string()))
        );
        assert_eq!(
            he().parse_command("תשכח: עיר"),
            Some(ControlCommand::Forget("עיר".to_string()))
        );
        assert_eq!(he().parse_command("מה אתה זוכר?"), Some(ControlCommand::Recall));
        assert!(is_explicit_remember(Locale::He, "תזכור: אני גר בחיפה"));
        assert!(!is_explicit_remember(Locale::He, "אני גר בחיפה, תזכור"));
    }

    #[test]
    fn slash_commands_are_recognized() {
        assert_eq!(en().parse_command("/new"), Some(ControlCommand::NewConversation));
        assert_eq!(he().parse_command("/status"), Some(ControlCommand::Status));
        assert_eq!(en().parse_command("/start"), Some(ControlCommand::Start));
    }

    #[test]
    fn approval_replies_parse() {
        assert_eq!(en().parse_reply("Yes!"), Some(ApprovalReply::Approve));
        assert_eq!(en().parse_reply("cancel"), Some(ApprovalReply::Reject));
        assert_eq!(he().parse_reply("כן"), Some(ApprovalReply::Approve));
        assert_eq!(he().parse_reply("לא"), Some(ApprovalReply::Reject));
        assert_eq!(en().parse_reply("maybe later"), None);
    }

    #[test]
    fn level_change_patterns_parse_and_clamp() {
        let level = |n: i64| Some(ApprovalReply::ChangeLevel(AutonomyLevel::clamped(n)));
        assert_eq!(en().parse_reply("level 1"), level(1));
        assert_eq!(en().parse_reply("Change level to 3"), level(3));
        assert_eq!(en().parse_reply("change to level 9"), level(5));
        assert_eq!(he().parse_reply("שנה רמה ל-2"), level(2));
        assert_eq!(he().parse_reply("שנה לרמה 4"), level(4));
        assert_eq!(he().parse_reply("רמה 0"), level(0));
    }

    #[test]
    fn facts_split_on_first_separator() {
        assert_eq!(
            parse_fact("city: Haifa: north"),
            Some(("city".to_string(), "Haifa: north".to_string()))
        );
        assert_eq!(
            parse_fact("coffee = no sugar"),
            Some(("coffee".to_string(), "no sugar".to_string()))
        );
        assert_eq!(
            parse_fact("I work at the port authority"),
            Some((
                "I work at".to_string(),
                "I work at the port authority".to_string()
            ))
        );
        assert_eq!(parse_fact("  "), None);
        assert_eq!(parse_fact("key:"), None);
    }

    #[test]
    fn long_facts_are_capped() {
        let long_key = "k".repeat(60);
        let (key, value) = parse_fact(&format!("{long_key}: {}", "v".repeat(900))).unwrap();
        assert_eq!(key.chars().count(), 40);
        assert_eq!(value.chars().count(), 500);
    }
}
