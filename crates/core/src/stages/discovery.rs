//! # Discovery Stage
//!
//! Finds candidate people for the execution plan. One model turn is offered
//! the search tool in auto mode and instructed to fire one call per planned
//! query; every call the model requests is dispatched concurrently, and a
//! failing search degrades to an inline error string instead of aborting
//! the batch. A follow-up call with tool access removed compiles the
//! results into the candidate list.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::extract;
use crate::gateway::ToolDispatch;
use crate::llm::{ChatClient, ChatMessage, ChatRequest};
use crate::models::ModelConfig;
use crate::stages::{dispatch_tool_calls, to_tool_specs, RetryPolicy};
use crate::status::{short_id, Phase, StatusHub};

use super::ExecutionPlan;

/// Default attempt policy: 2 attempts, 2s apart.
pub fn default_policy() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_secs(2))
}

/// One discovered person. The `id` is assigned by this stage and threads
/// the candidate through enrichment and generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonCandidate {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub profile_url: Option<String>,
    #[serde(default)]
    pub company_url: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// 0-10
    #[serde(default)]
    pub confidence_score: f32,
    #[serde(default)]
    pub summary: Option<String>,
}

/// The stage's JSON-serialized output payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    #[serde(default)]
    pub people: Vec<PersonCandidate>,
    #[serde(default)]
    pub search_queries: Vec<String>,
    #[serde(default)]
    pub total_searches: usize,
    #[serde(default)]
    pub status: String,
}

impl DiscoveryReport {
    /// The fail-closed payload emitted when every attempt is exhausted.
    pub fn failed(queries: &[String]) -> Self {
        Self {
            people: Vec::new(),
            search_queries: queries.to_vec(),
            total_searches: 0,
            status: "failed".to_string(),
        }
    }
}

/// The discovery stage agent.
pub struct DiscoveryStage;

impl DiscoveryStage {
    /// Run discovery for the plan. Always returns a JSON payload string;
    /// exhausted retries yield a `status: "failed"` payload rather than an
    /// error.
    pub async fn run(
        plan: &ExecutionPlan,
        request: &str,
        chat: &dyn ChatClient,
        tools: &dyn ToolDispatch,
        hub: &StatusHub,
        model: &ModelConfig,
        policy: &RetryPolicy,
    ) -> String {
        for attempt in 1..=policy.attempts {
            hub.update_info(
                Phase::Discovery,
                format!("Discovery attempt {attempt}/{}", policy.attempts),
            );
            match Self::attempt(plan, request, chat, tools, hub, model).await {
                Ok(report) => {
                    hub.update_data(
                        Phase::Discovery,
                        format!("Found {} candidates", report.people.len()),
                        json!({"people": report.people.len(), "searches": report.total_searches}),
                    );
                    if let Ok(payload) = serde_json::to_string(&report) {
                        return payload;
                    }
                }
                Err(e) => {
                    tracing::warn!("discovery attempt {attempt} failed: {e:#}");
                    hub.update_info(Phase::Discovery, format!("Attempt {attempt} failed: {e}"));
                }
            }
            if attempt < policy.attempts {
                tokio::time::sleep(policy.delay).await;
            }
        }

        serde_json::to_string(&DiscoveryReport::failed(&plan.search_queries))
            .unwrap_or_else(|_| r#"{"people":[],"status":"failed"}"#.to_string())
    }

    async fn attempt(
        plan: &ExecutionPlan,
        request: &str,
        chat: &dyn ChatClient,
        tools: &dyn ToolDispatch,
        hub: &StatusHub,
        model: &ModelConfig,
    ) -> Result<DiscoveryReport> {
        let catalog = tools.list_tools().await.context("tool catalog unavailable")?;
        let search_specs = to_tool_specs(&catalog)
            .into_iter()
            .filter(|t| t.name.to_lowercase().contains("search"))
            .take(1)
            .collect::<Vec<_>>();
        if search_specs.is_empty() {
            bail!("tool service offers no search tool");
        }
        let search_tool = search_specs[0].name.clone();

        let queries = plan
            .search_queries
            .iter()
            .map(|q| format!("- {q}"))
            .collect::<Vec<_>>()
            .join("\n");
        let mut messages = vec![
            ChatMessage::system(DISCOVERY_PROMPT),
            ChatMessage::user(format!(
                "Request: {request}\n\nRun the `{search_tool}` tool once for EACH of these queries, all in parallel:\n{queries}\n\nWe need up to {} strong candidates.",
                plan.target_count
            )),
        ];

        hub.update_progress(Phase::Discovery, "Asking model to fan out searches", 10);
        let turn = chat
            .complete(&ChatRequest::new(model, messages.clone(), search_specs))
            .await
            .context("discovery model call failed")?;

        let mut total_searches = 0;
        if turn.has_tool_calls() {
            total_searches = turn.tool_calls.len();
            hub.update_progress(
                Phase::Discovery,
                format!("Running {total_searches} searches"),
                30,
            );

            let results = dispatch_tool_calls(tools, &turn.tool_calls, None).await;
            let failures = results.iter().filter(|r| !r.ok).count();
            hub.update_progress(
                Phase::Discovery,
                format!(
                    "Searches settled ({} ok, {} degraded)",
                    total_searches - failures,
                    failures
                ),
                60,
            );

            messages.push(ChatMessage::assistant(
                turn.text.clone(),
                turn.tool_calls.clone(),
            ));
            for (call, result) in turn.tool_calls.iter().zip(results) {
                messages.push(ChatMessage::tool(call.id.clone(), result.text));
            }
        } else if turn.text.is_none() {
            bail!("discovery model returned neither text nor tool calls");
        }

        // Compile with tool access removed.
        messages.push(ChatMessage::user(format!(
            "Compile the search results into the final JSON now. Return ONLY the JSON object, with at most {} people.",
            plan.target_count
        )));
        hub.update_progress(Phase::Discovery, "Compiling candidates", 80);
        let compiled = chat
            .complete(&ChatRequest::new(model, messages, vec![]))
            .await
            .context("discovery compile call failed")?;

        let text = compiled.text_or_default();
        if text.len() < 20 {
            bail!("discovery compile output too short");
        }
        let mut report: DiscoveryReport =
            extract::parse_payload(text).context("discovery output did not match shape")?;
        if report.people.is_empty() {
            bail!("discovery produced no candidates");
        }

        report.people.truncate(plan.target_count);
        for (index, person) in report.people.iter_mut().enumerate() {
            if person.id.trim().is_empty() {
                person.id = short_id(&format!("p{}", index + 1));
            }
        }
        report.search_queries = plan.search_queries.clone();
        report.total_searches = total_searches;
        report.status = "success".to_string();
        Ok(report)
    }
}

const DISCOVERY_PROMPT: &str = r#"You are a people-discovery agent. Use the provided search tool to find real people matching the request - invoke it once per given query, in parallel, then compile what you find.

When asked to compile, respond with ONLY this JSON shape:
{
  "people": [
    {"name": "", "company": "", "role": "", "profileUrl": null, "companyUrl": null,
     "email": null, "location": null, "confidenceScore": 0, "summary": ""}
  ],
  "status": "success"
}

Score confidence 0-10 by how well the person matches the request. Prefer fewer, well-evidenced people over guesses."#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolInvocation;
    use crate::testutil::{ScriptedChat, ScriptedTools};

    fn plan() -> ExecutionPlan {
        ExecutionPlan {
            intent: "find ai founders".to_string(),
            search_queries: vec![
                "ai founders seattle".to_string(),
                "ai startup ceo".to_string(),
                "ml company founder".to_string(),
            ],
            target_profile: "Sam from Acme".to_string(),
            message_type: super::super::MessageType::SalesOutreach,
            target_count: 2,
        }
    }

    fn tool_turn(n: usize) -> crate::llm::ChatOutcome {
        crate::llm::ChatOutcome {
            text: None,
            tool_calls: (0..n)
                .map(|i| ToolInvocation {
                    id: format!("call_{i}"),
                    name: "web_search".to_string(),
                    arguments: serde_json::json!({"query": format!("q{i}")}),
                })
                .collect(),
        }
    }

    fn compiled_two_people() -> String {
        r#"{"people": [
            {"name": "Ada Chen", "company": "Looply", "role": "CEO", "confidenceScore": 9},
            {"name": "Ben Ortiz", "company": "Vectorline", "role": "Founder", "confidenceScore": 8}
        ], "status": "success"}"#
            .to_string()
    }

    #[tokio::test]
    async fn test_happy_path_assigns_ids_and_counts_searches() {
        let hub = StatusHub::new();
        let chat = ScriptedChat::with_outcomes(vec![
            Ok(tool_turn(3)),
            Ok(crate::llm::ChatOutcome {
                text: Some(compiled_two_people()),
                tool_calls: vec![],
            }),
        ]);
        let tools = ScriptedTools::new();

        let payload = DiscoveryStage::run(
            &plan(),
            "Find 2 AI founders",
            &chat,
            &tools,
            &hub,
            &ModelConfig::default(),
            &default_policy(),
        )
        .await;

        let report: DiscoveryReport = serde_json::from_str(&payload).unwrap();
        assert_eq!(report.status, "success");
        assert_eq!(report.people.len(), 2);
        assert_eq!(report.total_searches, 3);
        assert!(report.people.iter().all(|p| !p.id.is_empty()));
        let ids: Vec<&str> = report.people.iter().map(|p| p.id.as_str()).collect();
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_partial_search_failures_do_not_abort() {
        // Two of three searches fail; the compile step still runs and the
        // stage still succeeds.
        let hub = StatusHub::new();
        let chat = ScriptedChat::with_outcomes(vec![
            Ok(tool_turn(3)),
            Ok(crate::llm::ChatOutcome {
                text: Some(compiled_two_people()),
                tool_calls: vec![],
            }),
        ]);
        let tools = ScriptedTools::new().fail_every_other();

        let payload = DiscoveryStage::run(
            &plan(),
            "Find 2 AI founders",
            &chat,
            &tools,
            &hub,
            &ModelConfig::default(),
            &default_policy(),
        )
        .await;

        let report: DiscoveryReport = serde_json::from_str(&payload).unwrap();
        assert_eq!(report.status, "success");
        // Degraded calls were still counted as dispatched searches.
        assert_eq!(report.total_searches, 3);
    }

    #[tokio::test]
    async fn test_retry_bound_respected_then_fail_closed() {
        let hub = StatusHub::new();
        // Model always answers with unusable text and never calls tools.
        let chat = ScriptedChat::repeating_text("no json here", 16);
        let tools = ScriptedTools::new();
        let policy = RetryPolicy::new(2, Duration::from_millis(10));

        let payload = DiscoveryStage::run(
            &plan(),
            "Find founders",
            &chat,
            &tools,
            &hub,
            &ModelConfig::default(),
            &policy,
        )
        .await;

        let report: DiscoveryReport = serde_json::from_str(&payload).unwrap();
        assert_eq!(report.status, "failed");
        assert!(report.people.is_empty());
        // 2 attempts x 2 calls each (fan-out turn + compile turn), never a 5th.
        assert_eq!(chat.calls(), 4);
    }

    #[tokio::test]
    async fn test_gateway_failure_degrades_to_failed_payload() {
        let hub = StatusHub::new();
        let chat = ScriptedChat::repeating_text("unused", 4);
        let tools = ScriptedTools::catalog_unavailable();
        let policy = RetryPolicy::new(2, Duration::from_millis(10));

        let payload = DiscoveryStage::run(
            &plan(),
            "Find founders",
            &chat,
            &tools,
            &hub,
            &ModelConfig::default(),
            &policy,
        )
        .await;

        let report: DiscoveryReport = serde_json::from_str(&payload).unwrap();
        assert_eq!(report.status, "failed");
        assert_eq!(chat.calls(), 0);
    }
}
