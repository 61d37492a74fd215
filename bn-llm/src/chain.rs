//! Ordered fallback over several model clients.
//!
//! A chain is one capability ("router", "worker", "grounded", "critic") backed by a primary
//! model and any number of fallbacks. Failures are logged per attempt; only when every
//! client fails does the caller see [`LlmError::Exhausted`].

use crate::client::LlmClient;
use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatOptions, ChatResponse};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct ModelChain {
    capability: String,
    clients: Vec<LlmClient>,
}

impl ModelChain {
    pub fn new(capability: impl Into<String>, clients: Vec<LlmClient>) -> Self {
        Self {
            capability: capability.into(),
            clients,
        }
    }

    /// Builds one client per model name, picking the api key by provider.
    pub fn from_models<F>(capability: impl Into<String>, models: &[String], key_for: F) -> Self
    where
        F: Fn(crate::client::Provider) -> Option<String>,
    {
        let clients = models
            .iter()
            .filter_map(|model| {
                let provider = crate::client::detect_provider(model);
                match key_for(provider) {
                    Some(key) if !key.trim().is_empty() => Some(LlmClient::new(&key, model)),
                    _ => {
                        tracing::warn!(
                            model = %model,
                            provider = provider.as_str(),
                            "skipping model without api key"
                        );
                        None
                    }
                }
            })
            .collect();
        Self::new(capability, clients)
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn models(&self) -> Vec<&str> {
        self.clients.iter().map(LlmClient::model).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    #[tracing::instrument(level = "info", skip_all, fields(capability = %self.capability))]
    pub async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatResponse> {
        let mut last_error = "no models configured".to_string();
        for (attempt, client) in self.clients.iter().enumerate() {
            let started = Instant::now();
            match client.chat(messages, options).await {
                Ok(resp) => {
                    tracing::info!(
                        model = %client.model(),
                        attempt,
                        latency_ms = started.elapsed().as_millis() as u64,
                        prompt_tokens = resp.usage.prompt_tokens,
                        completion_tokens = resp.usage.completion_tokens,
                        "model call completed"
                    );
                    return Ok(resp);
                }
                Err(e) => {
                    tracing::warn!(
                        model = %client.model(),
                        attempt,
                        latency_ms = started.elapsed().as_millis() as u64,
                        error = %e,
                        "model call failed; trying next model"
                    );
                    last_error = e.to_string();
                }
            }
        }
        Err(LlmError::Exhausted {
            capability: self.capability.clone(),
            attempts: self.clients.len(),
            last_error,
        })
    }

    /// Convenience wrapper: optional system prompt plus one user prompt, text out.
    pub async fn complete(
        &self,
        system: Option<&str>,
        prompt: &str,
        options: &ChatOptions,
    ) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system.filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        let resp = self.chat(&messages, options).await?;
        Ok(resp.content.trim().to_string())
    }
}

/// Pulls the first JSON object out of model text, tolerating ```json fences and prose
/// around the object.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        body = rest.trim_end().strip_suffix("```").unwrap_or(rest).trim();
    }
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
        return Some(v);
    }
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&body[start..=end]).ok()
}
