//! # Model-Call Boundary
//!
//! Chat-completion client used by every stage agent. The wire shape is the
//! OpenAI-compatible `/chat/completions` contract: a message history plus an
//! optional tool catalog in, freeform text or a batch of requested tool
//! invocations out.
//!
//! Retry policy deliberately lives with the callers (the stage agents), not
//! here: a failed request surfaces as an error for the stage's own
//! attempt/backoff loop.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::models::ModelConfig;

/// One turn in a chat conversation.
#[derive(Debug, Clone)]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolInvocation>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolInvocation>) -> Self {
        Self::Assistant {
            content,
            tool_calls,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }
}

/// A callable tool offered to the model for one request.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's argument object
    pub input_schema: Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A single chat-completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    /// Build a request from a model config, a message history, and a tool
    /// catalog. Tool choice is always "auto" when tools are present.
    pub fn new(config: &ModelConfig, messages: Vec<ChatMessage>, tools: Vec<ToolSpec>) -> Self {
        Self {
            model: config.model.clone(),
            messages,
            tools,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// The model's answer: freeform text, requested tool invocations, or both.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolInvocation>,
}

impl ChatOutcome {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn text_or_default(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }
}

/// The seam every stage agent talks through.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, req: &ChatRequest) -> Result<ChatOutcome>;
}

/// HTTP chat-completion client for OpenAI-compatible endpoints.
#[derive(Debug, Clone)]
pub struct HttpChatClient {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpChatClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            client,
        })
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn complete(&self, req: &ChatRequest) -> Result<ChatOutcome> {
        let payload = build_payload(req);
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("chat completion request failed")?;

        let status = response.status();
        let body = response.text().await.context("failed to read chat body")?;
        if !status.is_success() {
            return Err(anyhow!(
                "chat completion returned {}: {}",
                status,
                body.chars().take(400).collect::<String>()
            ));
        }

        let value: Value =
            serde_json::from_str(&body).context("chat completion body was not JSON")?;
        parse_outcome(&value)
    }
}

/// Build the OpenAI-compatible request payload.
fn build_payload(req: &ChatRequest) -> Value {
    let messages: Vec<Value> = req
        .messages
        .iter()
        .map(|m| match m {
            ChatMessage::System { content } => json!({"role": "system", "content": content}),
            ChatMessage::User { content } => json!({"role": "user", "content": content}),
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                let mut msg = json!({"role": "assistant"});
                if let Some(c) = content {
                    msg["content"] = json!(c);
                }
                if !tool_calls.is_empty() {
                    let calls: Vec<Value> = tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments.to_string()
                                }
                            })
                        })
                        .collect();
                    msg["tool_calls"] = json!(calls);
                }
                msg
            }
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
        })
        .collect();

    let mut payload = json!({
        "model": req.model,
        "messages": messages,
        "temperature": req.temperature,
        "max_tokens": req.max_tokens,
        "stream": false
    });
    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema
                    }
                })
            })
            .collect();
        payload["tools"] = json!(tools);
        payload["tool_choice"] = json!("auto");
    }
    payload
}

/// Parse a chat-completion response body into a [`ChatOutcome`].
fn parse_outcome(body: &Value) -> Result<ChatOutcome> {
    let message = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| anyhow!("chat completion response had no choices"))?;

    let text = message
        .get("content")
        .and_then(|c| c.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string);

    let tool_calls = message
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let id = call.get("id")?.as_str()?.to_string();
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let arguments = function
                        .get("arguments")
                        .and_then(|a| a.as_str())
                        .and_then(|raw| serde_json::from_str(raw).ok())
                        .unwrap_or_else(|| json!({}));
                    Some(ToolInvocation {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatOutcome { text, tool_calls })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(tools: Vec<ToolSpec>) -> ChatRequest {
        ChatRequest {
            model: "deepseek-chat".to_string(),
            messages: vec![
                ChatMessage::system("You are terse."),
                ChatMessage::user("hello"),
            ],
            tools,
            temperature: 0.2,
            max_tokens: 512,
        }
    }

    #[test]
    fn test_payload_without_tools() {
        let payload = build_payload(&sample_request(vec![]));
        assert_eq!(payload["model"], "deepseek-chat");
        assert_eq!(payload["messages"].as_array().unwrap().len(), 2);
        assert!(payload.get("tools").is_none());
        assert!(payload.get("tool_choice").is_none());
    }

    #[test]
    fn test_payload_with_tools_sets_auto_choice() {
        let tool = ToolSpec {
            name: "search".to_string(),
            description: "Web search".to_string(),
            input_schema: json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        };
        let payload = build_payload(&sample_request(vec![tool]));
        assert_eq!(payload["tool_choice"], "auto");
        assert_eq!(payload["tools"][0]["function"]["name"], "search");
    }

    #[test]
    fn test_tool_call_roundtrip_in_history() {
        let call = ToolInvocation {
            id: "call_1".to_string(),
            name: "search".to_string(),
            arguments: json!({"query": "founders"}),
        };
        let req = ChatRequest {
            messages: vec![
                ChatMessage::assistant(None, vec![call]),
                ChatMessage::tool("call_1", "result text"),
            ],
            ..sample_request(vec![])
        };
        let payload = build_payload(&req);
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages[0]["tool_calls"][0]["function"]["name"], "search");
        assert_eq!(messages[1]["role"], "tool");
        assert_eq!(messages[1]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_parse_text_outcome() {
        let body = json!({
            "choices": [{"message": {"role": "assistant", "content": "  hi there  "}}]
        });
        let outcome = parse_outcome(&body).unwrap();
        assert_eq!(outcome.text.as_deref(), Some("hi there"));
        assert!(!outcome.has_tool_calls());
    }

    #[test]
    fn test_parse_tool_call_outcome() {
        let body = json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [
                    {"id": "c1", "type": "function",
                     "function": {"name": "search", "arguments": "{\"query\":\"ai founders\"}"}},
                    {"id": "c2", "type": "function",
                     "function": {"name": "search", "arguments": "not json"}}
                ]
            }}]
        });
        let outcome = parse_outcome(&body).unwrap();
        assert_eq!(outcome.tool_calls.len(), 2);
        assert_eq!(outcome.tool_calls[0].arguments["query"], "ai founders");
        // Malformed argument strings degrade to an empty object.
        assert_eq!(outcome.tool_calls[1].arguments, json!({}));
    }

    #[test]
    fn test_parse_rejects_empty_choices() {
        assert!(parse_outcome(&json!({"choices": []})).is_err());
    }
}
