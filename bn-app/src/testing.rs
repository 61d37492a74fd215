//! Scripted capability fakes for unit tests.

use crate::capabilities::{Capabilities, Critic, CritiqueKind, PlanRouter, TextGenerator};
use crate::catalog::CapabilityCatalog;
use crate::commands::CommandParser;
use crate::handler::MessageHandler;
use crate::locale::Locale;
use crate::memory::{self, MemoryContext, MemoryRecord, MemoryStore};
use crate::orchestrator::Orchestrator;
use crate::plan::GovernorDefaults;
use crate::session::SessionManager;
use async_trait::async_trait;
use bn_llm::LlmError;
use bn_tools::CommandRunner;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type GenerateFn = dyn Fn(&str, bool) -> bn_llm::Result<String> + Send + Sync;

/// Generator driven by a closure of `(prompt, grounded)`. Every call is logged.
pub struct FnGenerator {
    respond: Box<GenerateFn>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, bool)>>,
}

impl FnGenerator {
    pub fn new(respond: impl Fn(&str, bool) -> bn_llm::Result<String> + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fixed(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_, _| Ok(text.clone()))
    }

    /// Each call sleeps on the tokio clock before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<(String, bool)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls().into_iter().map(|(p, _)| p).collect()
    }

    pub fn grounded_calls(&self) -> usize {
        self.calls().iter().filter(|(_, g)| *g).count()
    }

    async fn call(&self, prompt: &str, grounded: bool) -> bn_llm::Result<String> {
        self.calls.lock().unwrap().push((prompt.to_string(), grounded));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.respond)(prompt, grounded)
    }
}

#[async_trait]
impl TextGenerator for FnGenerator {
    async fn generate(&self, prompt: &str) -> bn_llm::Result<String> {
        self.call(prompt, false).await
    }

    async fn generate_grounded(&self, prompt: &str) -> bn_llm::Result<String> {
        self.call(prompt, true).await
    }
}

pub fn exhausted(capability: &str) -> LlmError {
    LlmError::Exhausted {
        capability: capability.to_string(),
        attempts: 1,
        last_error: "scripted failure".to_string(),
    }
}

/// Critic that replays scripted replies, then echoes the text unchanged.
#[derive(Default)]
pub struct ScriptedCritic {
    replies: Mutex<VecDeque<bn_llm::Result<String>>>,
    calls: Mutex<Vec<CritiqueKind>>,
}

impl ScriptedCritic {
    pub fn replying(replies: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.to_string())).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        let critic = Self::default();
        critic.replies.lock().unwrap().push_back(Err(exhausted("critic")));
        critic
    }

    pub fn calls(&self) -> Vec<CritiqueKind> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Critic for ScriptedCritic {
    async fn critique(&self, kind: CritiqueKind, text: &str, _task: &str) -> bn_llm::Result<String> {
        self.calls.lock().unwrap().push(kind);
        match self.replies.lock().unwrap().pop_front() {
            Some(reply) => reply,
            None => Ok(text.to_string()),
        }
    }
}

#[derive(Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<String>>,
}

impl RecordingRunner {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run_sandboxed(&self, command: &str) -> String {
        self.commands.lock().unwrap().push(command.to_string());
        format!("ran: {command}")
    }
}

/// Router that answers every request with the same raw plan.
pub struct ScriptedRouter {
    plan: Mutex<Option<Value>>,
    seen_memory: Mutex<Vec<MemoryContext>>,
}

impl ScriptedRouter {
    pub fn returning(plan: Value) -> Self {
        Self {
            plan: Mutex::new(Some(plan)),
            seen_memory: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            plan: Mutex::new(None),
            seen_memory: Mutex::new(Vec::new()),
        }
    }

    pub fn set_plan(&self, plan: Value) {
        *self.plan.lock().unwrap() = Some(plan);
    }

    pub fn set_failing(&self) {
        *self.plan.lock().unwrap() = None;
    }

    pub fn seen_memory(&self) -> Vec<MemoryContext> {
        self.seen_memory.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlanRouter for ScriptedRouter {
    async fn decide(&self, _message: &str, memory: &MemoryContext) -> bn_llm::Result<Value> {
        self.seen_memory.lock().unwrap().push(memory.clone());
        self.plan
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| exhausted("router"))
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    rows: Mutex<Vec<(String, MemoryRecord)>>,
    upserts: Mutex<usize>,
}

impl InMemoryStore {
    pub fn upserts(&self) -> usize {
        *self.upserts.lock().unwrap()
    }

    pub fn values(&self, user_id: &str) -> Vec<(String, String)> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == user_id)
            .map(|(_, r)| (r.key.clone(), r.value.clone()))
            .collect()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn get_profile(&self, user_id: &str) -> memory::Result<BTreeMap<String, String>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, r)| u == user_id && r.kind == memory::PROFILE_TYPE)
            .map(|(_, r)| (r.key.clone(), r.value.clone()))
            .collect())
    }

    async fn search(&self, user_id: &str, query: &str, limit: usize) -> memory::Result<Vec<MemoryRecord>> {
        let query = query.to_lowercase();
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|(u, _)| u == user_id)
            .filter(|(_, r)| {
                query
                    .split_whitespace()
                    .any(|w| r.key.to_lowercase().contains(w) || r.value.to_lowercase().contains(w))
            })
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn list_recent(&self, user_id: &str, limit: usize) -> memory::Result<Vec<MemoryRecord>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|(u, _)| u == user_id)
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn upsert(&self, user_id: &str, kind: &str, key: &str, value: &str) -> memory::Result<()> {
        *self.upserts.lock().unwrap() += 1;
        let mut rows = self.rows.lock().unwrap();
        rows.retain(|(u, r)| !(u == user_id && r.kind == kind && r.key == key));
        let id = rows.len() as i64 + 1;
        rows.push((
            user_id.to_string(),
            MemoryRecord {
                id,
                kind: kind.to_string(),
                key: key.to_string(),
                value: value.to_string(),
                updated_at_ms: 0,
            },
        ));
        Ok(())
    }

    async fn delete_by_key(&self, user_id: &str, key: &str) -> memory::Result<usize> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|(u, r)| !(u == user_id && r.key == key));
        Ok(before - rows.len())
    }
}

/// A handler over scripted capabilities: every request routes to `plan`, every generation
/// returns `answer`.
pub fn scripted_handler(locale: Locale, plan: Value, answer: &str) -> Arc<MessageHandler> {
    let orchestrator = Orchestrator::new(
        Capabilities {
            router: Arc::new(ScriptedRouter::returning(plan)),
            generator: Arc::new(FnGenerator::fixed(answer)),
            critic: Arc::new(ScriptedCritic::default()),
            runner: Arc::new(RecordingRunner::default()),
        },
        Arc::new(CapabilityCatalog::default()),
        locale,
        GovernorDefaults::default(),
    );
    Arc::new(MessageHandler::new(
        Arc::new(orchestrator),
        Arc::new(SessionManager::new(3)),
        Arc::new(InMemoryStore::default()),
        CommandParser::new(locale).unwrap(),
    ))
}
