//! Scripted doubles for the ChatClient and ToolDispatch seams, shared by
//! the stage and orchestrator tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::gateway::{ToolDescriptor, ToolDispatch, ToolError};
use crate::llm::{ChatClient, ChatOutcome, ChatRequest};

/// A chat client that replays a fixed script of outcomes.
pub struct ScriptedChat {
    script: Mutex<VecDeque<Result<ChatOutcome>>>,
    fail_always: bool,
    calls: AtomicUsize,
}

impl ScriptedChat {
    pub fn with_outcomes(outcomes: Vec<Result<ChatOutcome>>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            fail_always: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_texts(texts: Vec<String>) -> Self {
        Self::with_outcomes(
            texts
                .into_iter()
                .map(|t| {
                    Ok(ChatOutcome {
                        text: Some(t),
                        tool_calls: vec![],
                    })
                })
                .collect(),
        )
    }

    pub fn repeating_text(text: &str, copies: usize) -> Self {
        Self::with_texts(vec![text.to_string(); copies])
    }

    /// Every call fails, as if the model endpoint were down.
    pub fn always_failing() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fail_always: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of completions requested so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for ScriptedChat {
    async fn complete(&self, _req: &ChatRequest) -> Result<ChatOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_always {
            return Err(anyhow!("model endpoint unavailable"));
        }
        let next = {
            let mut script = self.script.lock().expect("script lock");
            script.pop_front()
        };
        next.unwrap_or_else(|| Err(anyhow!("chat script exhausted")))
    }
}

/// A tool service double with controllable failure and latency.
pub struct ScriptedTools {
    catalog: Vec<ToolDescriptor>,
    catalog_error: bool,
    fail_names: Vec<String>,
    fail_every_other: bool,
    slow: Option<(String, Duration)>,
    call_count: AtomicUsize,
}

impl Default for ScriptedTools {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTools {
    pub fn new() -> Self {
        let catalog = ["web_search", "scrape_profile", "scrape_website"]
            .into_iter()
            .map(|name| ToolDescriptor {
                name: name.to_string(),
                description: format!("{name} tool"),
                input_schema: json!({"type": "object", "properties": {}}),
            })
            .collect();
        Self {
            catalog,
            catalog_error: false,
            fail_names: Vec::new(),
            fail_every_other: false,
            slow: None,
            call_count: AtomicUsize::new(0),
        }
    }

    /// `list_tools` always fails, as if the service never connected.
    pub fn catalog_unavailable() -> Self {
        Self {
            catalog_error: true,
            ..Self::new()
        }
    }

    /// Calls to the named tool fail.
    pub fn fail_on(mut self, name: &str) -> Self {
        self.fail_names.push(name.to_string());
        self
    }

    /// Every second call fails, regardless of tool.
    pub fn fail_every_other(mut self) -> Self {
        self.fail_every_other = true;
        self
    }

    /// Calls to the named tool sleep before answering.
    pub fn slow_on(mut self, name: &str, delay: Duration) -> Self {
        self.slow = Some((name.to_string(), delay));
        self
    }
}

#[async_trait]
impl ToolDispatch for ScriptedTools {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        if self.catalog_error {
            return Err(ToolError::ConnectionTimeout(Duration::from_secs(10)));
        }
        Ok(self.catalog.clone())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let call_index = self.call_count.fetch_add(1, Ordering::SeqCst);

        if let Some((slow_name, delay)) = &self.slow {
            if slow_name == name {
                tokio::time::sleep(*delay).await;
            }
        }
        if self.fail_names.iter().any(|n| n == name) {
            return Err(ToolError::Rpc(format!("{name} rejected the call")));
        }
        if self.fail_every_other && call_index % 2 == 1 {
            return Err(ToolError::Rpc(format!("{name} transient failure")));
        }

        Ok(json!({
            "content": [{
                "type": "text",
                "text": format!("{name} result for {args}")
            }]
        }))
    }
}
