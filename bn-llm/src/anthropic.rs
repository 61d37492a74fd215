use crate::client::split_system;
use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatOptions, ChatResponse, Role, Usage};
use serde::{Deserialize, Serialize};

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 2048;
const WEB_SEARCH_MAX_USES: u32 = 3;

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, api_key: &str, model: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatResponse> {
        let req = AnthropicRequest::new(&self.model, messages, options)?;

        let response = self
            .http
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "anthropic chat status={status} body={body}"
            )));
        }

        let parsed: AnthropicResponse = serde_json::from_str(&body)?;
        Ok(parsed.into())
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
}

impl AnthropicRequest {
    fn new(model: &str, messages: &[ChatMessage], options: &ChatOptions) -> Result<Self> {
        let (system, rest) = split_system(messages);
        if rest.is_empty() {
            return Err(LlmError::InvalidInput(
                "anthropic requires at least one user or assistant message".to_string(),
            ));
        }

        let tools = if options.web_search {
            vec![serde_json::json!({
                "type": "web_search_20250305",
                "name": "web_search",
                "max_uses": WEB_SEARCH_MAX_USES,
            })]
        } else {
            Vec::new()
        };

        Ok(Self {
            model: model.to_string(),
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages: rest
                .into_iter()
                .map(|m| AnthropicMessage {
                    role: if m.role == Role::Assistant { "assistant" } else { "user" },
                    content: m.content.clone(),
                })
                .collect(),
            temperature: options.temperature,
            tools,
        })
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    /// `server_tool_use`, `web_search_tool_result` and anything newer.
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl From<AnthropicResponse> for ChatResponse {
    fn from(v: AnthropicResponse) -> Self {
        let content = v
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text),
                AnthropicContentBlock::Other => None,
            })
            .collect::<String>();

        ChatResponse {
            content,
            usage: Usage {
                prompt_tokens: v.usage.input_tokens as u32,
                completion_tokens: v.usage.output_tokens as u32,
            },
            finish_reason: v.stop_reason.unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grounded_request_carries_web_search_tool() {
        let messages = [ChatMessage::system("sys"), ChatMessage::user("news?")];
        let req = AnthropicRequest::new("claude-sonnet-4-5", &messages, &ChatOptions::grounded())
            .expect("build request");
        let v = serde_json::to_value(&req).expect("serialize request");
        assert_eq!(v["system"], "sys");
        assert_eq!(v["tools"][0]["name"], "web_search");
        assert_eq!(v["messages"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn system_only_request_is_rejected() {
        let err = AnthropicRequest::new("claude-x", &[ChatMessage::system("s")], &ChatOptions::default())
            .expect_err("no user turn");
        assert!(matches!(err, LlmError::InvalidInput(_)));
    }

    #[test]
    fn text_blocks_are_joined_and_tool_blocks_skipped() {
        let body = r#"{
            "content": [
                {"type": "server_tool_use", "id": "x", "name": "web_search", "input": {}},
                {"type": "text", "text": "Hello "},
                {"type": "web_search_tool_result", "tool_use_id": "x", "content": []},
                {"type": "text", "text": "world"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 2}
        }"#;
        let parsed: AnthropicResponse = serde_json::from_str(body).expect("parse response");
        let resp = ChatResponse::from(parsed);
        assert_eq!(resp.content, "Hello world");
        assert_eq!(resp.usage.completion_tokens, 2);
    }
}
