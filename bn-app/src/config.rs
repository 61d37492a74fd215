//! Benjamin configuration loader.
//!
//! TOML on disk, then environment overrides, then validation. Every section has defaults so
//! an almost-empty file (just a token and a key) is a working setup.

use crate::locale::Locale;
use bn_llm::Provider;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BenjaminConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub locale: Locale,
    /// How many past exchanges each user's rolling window keeps.
    #[serde(default = "default_conversation_window")]
    pub conversation_window: usize,
}

fn default_conversation_window() -> usize {
    3
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            locale: Locale::default(),
            conversation_window: default_conversation_window(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
}

impl KeysConfig {
    pub fn for_provider(&self, provider: Provider) -> Option<String> {
        let key = match provider {
            Provider::OpenAI => &self.openai_api_key,
            Provider::Anthropic => &self.anthropic_api_key,
            Provider::Gemini => &self.gemini_api_key,
        };
        key.clone().filter(|k| !k.trim().is_empty())
    }
}

/// Ordered model lists per capability: first entry is primary, the rest are fallbacks.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_router_models")]
    pub router: Vec<String>,
    #[serde(default = "default_worker_models")]
    pub worker: Vec<String>,
    #[serde(default = "default_grounded_models")]
    pub grounded: Vec<String>,
    #[serde(default = "default_critic_models")]
    pub critic: Vec<String>,
}

fn default_router_models() -> Vec<String> {
    vec!["gpt-4o-mini".to_string()]
}

fn default_worker_models() -> Vec<String> {
    vec!["gemini-2.5-flash".to_string()]
}

fn default_grounded_models() -> Vec<String> {
    vec!["gemini-2.5-flash".to_string()]
}

fn default_critic_models() -> Vec<String> {
    vec![
        "claude-sonnet-4-20250514".to_string(),
        "claude-3-5-sonnet-20241022".to_string(),
    ]
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            router: default_router_models(),
            worker: default_worker_models(),
            grounded: default_grounded_models(),
            critic: default_critic_models(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_turns")]
    pub default_max_turns: u32,
    #[serde(default = "default_max_execution_time_seconds")]
    pub default_max_execution_time_seconds: u64,
    #[serde(default = "default_max_budget_usd")]
    pub default_max_budget_usd: f64,
    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
    /// Working directory for sandboxed commands. Defaults to the process cwd.
    #[serde(default)]
    pub sandbox_root: Option<String>,
    /// Whole programs allowed in addition to the built-in read-only set.
    #[serde(default)]
    pub extra_allowed_programs: Vec<String>,
    /// Per-intent minimum level overrides, e.g. `bash = 5`.
    #[serde(default)]
    pub intent_levels: BTreeMap<String, u8>,
}

fn default_max_turns() -> u32 {
    5
}

fn default_max_execution_time_seconds() -> u64 {
    120
}

fn default_max_budget_usd() -> f64 {
    0.50
}

fn default_command_timeout_seconds() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_max_turns: default_max_turns(),
            default_max_execution_time_seconds: default_max_execution_time_seconds(),
            default_max_budget_usd: default_max_budget_usd(),
            command_timeout_seconds: default_command_timeout_seconds(),
            sandbox_root: None,
            extra_allowed_programs: Vec::new(),
            intent_levels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryConfig {
    /// SQLite file. Defaults to `~/.benjamin/data/memory.db`.
    #[serde(default)]
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_enabled() -> bool {
    true
}

fn default_http_port() -> u16 {
    3000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub allowed_users: Vec<String>,
    /// If true, Benjamin answers any sender on external channels.
    ///
    /// Default is false: Telegram senders must appear in `security.allowed_users`.
    #[serde(default)]
    pub allow_all_senders: bool,
}

impl SecurityConfig {
    pub fn is_allowed(&self, sender_id: &str) -> bool {
        self.allow_all_senders || self.allowed_users.iter().any(|u| u == sender_id)
    }
}

impl BenjaminConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::from_toml(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = non_empty("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Some(v) = non_empty("GEMINI_API_KEY") {
            self.keys.gemini_api_key = Some(v);
        }
        if let Some(v) = non_empty("TELEGRAM_BOT_TOKEN").or_else(|| non_empty("TELEGRAM_TOKEN")) {
            self.channels.telegram.bot_token = v;
            self.channels.telegram.enabled = true;
        }
        if let Some(v) = non_empty("BENJAMIN_LOCALE") {
            match v.parse::<Locale>() {
                Ok(locale) => self.general.locale = locale,
                Err(e) => tracing::warn!(%e, "ignoring BENJAMIN_LOCALE"),
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, models) in [
            ("router", &self.models.router),
            ("worker", &self.models.worker),
            ("grounded", &self.models.grounded),
            ("critic", &self.models.critic),
        ] {
            if models.iter().all(|m| m.trim().is_empty()) {
                return Err(anyhow::anyhow!("models.{name} must list at least one model"));
            }
        }
        if self.general.conversation_window == 0 {
            return Err(anyhow::anyhow!("general.conversation_window must be > 0"));
        }
        if self.agent.command_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("agent.command_timeout_seconds must be > 0"));
        }
        if self.agent.default_max_turns == 0 {
            return Err(anyhow::anyhow!("agent.default_max_turns must be > 0"));
        }
        if let Some((intent, level)) = self.agent.intent_levels.iter().find(|(_, l)| **l > 5) {
            return Err(anyhow::anyhow!(
                "agent.intent_levels.{intent} = {level} is outside 0..=5"
            ));
        }
        if self.http.enabled && self.http.port == 0 {
            return Err(anyhow::anyhow!("http.port must be > 0"));
        }
        if self.channels.telegram.enabled && self.channels.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "channels.telegram.bot_token is required when telegram is enabled"
            ));
        }
        Ok(())
    }

    pub fn memory_db_path(&self) -> PathBuf {
        match self.memory.db_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(p) => expand_home(p),
            None => default_data_dir().join("memory.db"),
        }
    }

    pub fn sandbox_root(&self) -> PathBuf {
        match self.agent.sandbox_root.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(p) => expand_home(p),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

fn expand_home(path: &str) -> PathBuf {
    let trimmed = path.trim();
    match trimmed.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(trimmed),
    }
}

pub fn default_root_dir() -> PathBuf {
    Path::new(&home_dir()).join(".benjamin")
}

pub fn default_config_path() -> PathBuf {
    default_root_dir().join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    default_root_dir().join("data")
}
