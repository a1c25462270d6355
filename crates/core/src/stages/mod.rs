//! # Stage Agents
//!
//! One module per pipeline stage. Each stage wraps an LLM call loop in the
//! same shape: attempt the work, judge the output, retry on a fixed delay up
//! to a bound, and degrade to a `status: "failed"` payload once the bound is
//! exhausted. Stages never panic the pipeline - the orchestrator decides
//! what a failed payload means.

pub mod discovery;
pub mod enrichment;
pub mod generation;
pub mod planning;

use serde_json::Value;
use std::time::Duration;

use crate::gateway::ToolDispatch;
use crate::llm::{ToolInvocation, ToolSpec};

pub use discovery::{DiscoveryReport, DiscoveryStage, PersonCandidate};
pub use enrichment::{EmailSignals, EnrichedProfile, EnrichmentReport, EnrichmentStage};
pub use generation::{GeneratedMessage, GenerationStage, MessageReport};
pub use planning::{ExecutionPlan, MessageType, PlanningStage};

/// Attempt bound and backoff for one stage.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts (not retries after the first)
    pub attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Result of one dispatched tool call, aligned to the request by position.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub text: String,
    pub ok: bool,
}

/// Dispatch every tool call from one model turn concurrently and wait for
/// the whole batch to settle. An individual failure (or timeout, when a
/// per-call bound is given) degrades to an inline error string; it never
/// aborts sibling calls. The output is position-aligned with the input.
pub(crate) async fn dispatch_tool_calls(
    tools: &dyn ToolDispatch,
    calls: &[ToolInvocation],
    per_call_timeout: Option<Duration>,
) -> Vec<ToolCallResult> {
    let futures = calls.iter().map(|call| async move {
        let invocation = tools.call_tool(&call.name, call.arguments.clone());
        let outcome = match per_call_timeout {
            Some(bound) => match tokio::time::timeout(bound, invocation).await {
                Ok(result) => result,
                // The loser of the race is discarded; the tool service is
                // not told to cancel.
                Err(_) => {
                    return ToolCallResult {
                        text: format!("Tool call '{}' timed out after {:?}", call.name, bound),
                        ok: false,
                    }
                }
            },
            None => invocation.await,
        };
        match outcome {
            Ok(value) => ToolCallResult {
                text: tool_result_text(&value),
                ok: true,
            },
            Err(e) => ToolCallResult {
                text: format!("Tool call '{}' failed: {}", call.name, e),
                ok: false,
            },
        }
    });
    futures::future::join_all(futures).await
}

/// Flatten a tool result into text for the model. Content-block results
/// collapse to their text fields; anything else is passed through as JSON.
pub(crate) fn tool_result_text(value: &Value) -> String {
    if let Some(blocks) = value.get("content").and_then(|c| c.as_array()) {
        let texts: Vec<&str> = blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    value.to_string()
}

/// Convert the gateway catalog into the model-facing tool specs.
pub(crate) fn to_tool_specs(catalog: &[crate::gateway::ToolDescriptor]) -> Vec<ToolSpec> {
    catalog
        .iter()
        .map(|tool| ToolSpec {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: if tool.input_schema.is_null() {
                serde_json::json!({"type": "object", "properties": {}})
            } else {
                tool.input_schema.clone()
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedTools;
    use serde_json::json;

    fn invocation(id: &str, name: &str) -> ToolInvocation {
        ToolInvocation {
            id: id.to_string(),
            name: name.to_string(),
            arguments: json!({"query": id}),
        }
    }

    #[tokio::test]
    async fn test_batch_survives_partial_failure() {
        // Three calls, the middle one fails: the batch still settles with
        // three position-aligned results.
        let tools = ScriptedTools::new().fail_on("broken");
        let calls = vec![
            invocation("c1", "search"),
            invocation("c2", "broken"),
            invocation("c3", "search"),
        ];
        let results = dispatch_tool_calls(&tools, &calls, None).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].ok);
        assert!(!results[1].ok);
        assert!(results[1].text.contains("failed"));
        assert!(results[2].ok);
    }

    #[tokio::test]
    async fn test_slow_call_loses_the_race() {
        let tools = ScriptedTools::new().slow_on("scrape", Duration::from_secs(5));
        let calls = vec![invocation("c1", "scrape"), invocation("c2", "search")];
        let results = dispatch_tool_calls(&tools, &calls, Some(Duration::from_millis(50))).await;
        assert!(!results[0].ok);
        assert!(results[0].text.contains("timed out"));
        assert!(results[1].ok);
    }

    #[test]
    fn test_tool_result_text_content_blocks() {
        let value = json!({"content": [{"type": "text", "text": "alpha"}, {"type": "text", "text": "beta"}]});
        assert_eq!(tool_result_text(&value), "alpha\nbeta");
    }

    #[test]
    fn test_tool_result_text_passthrough() {
        let value = json!({"results": [1, 2, 3]});
        assert_eq!(tool_result_text(&value), value.to_string());
    }
}
