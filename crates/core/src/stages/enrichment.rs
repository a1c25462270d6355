//! # Enrichment Stage
//!
//! Deepens each discovered candidate into a profile with email-worthy
//! signals. The model gets the full tool catalog (profile scrape, website
//! scrape, search) for a bounded number of rounds; every call requested in
//! a round is dispatched concurrently, raced against a per-call timeout,
//! and degraded to an inline error string on loss. A forced-compilation
//! message with tool access removed guarantees termination.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::extract;
use crate::gateway::ToolDispatch;
use crate::llm::{ChatClient, ChatMessage, ChatRequest};
use crate::models::ModelConfig;
use crate::stages::{dispatch_tool_calls, to_tool_specs, RetryPolicy};
use crate::status::{Phase, StatusHub};

use super::DiscoveryReport;

/// Attempt/backoff plus the tool-loop bounds for enrichment.
#[derive(Debug, Clone)]
pub struct EnrichmentPolicy {
    pub retry: RetryPolicy,
    /// Maximum tool-use rounds before compilation is forced
    pub max_rounds: u32,
    /// Per-tool-call timeout raced against the call
    pub call_timeout: Duration,
}

impl Default for EnrichmentPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(2, Duration::from_secs(3)),
            max_rounds: 2,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Signals the generation stage personalizes from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailSignals {
    #[serde(default)]
    pub pain_points: Vec<String>,
    #[serde(default)]
    pub opportunities: Vec<String>,
    #[serde(default)]
    pub personalized_hooks: Vec<String>,
    #[serde(default)]
    pub current_challenges: Vec<String>,
}

/// One enriched candidate, keyed back to discovery by `candidate_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedProfile {
    #[serde(default)]
    pub candidate_id: String,
    pub name: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub personal_info: Value,
    #[serde(default)]
    pub company_info: Value,
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub recent_activity: Vec<String>,
    #[serde(default)]
    pub confidence_score: f32,
    #[serde(default)]
    pub email_signals: EmailSignals,
}

/// The stage's JSON-serialized output payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentReport {
    #[serde(default)]
    pub enriched_profiles: Vec<EnrichedProfile>,
    #[serde(default)]
    pub total_searches: usize,
    #[serde(default)]
    pub sources_scraped: usize,
    #[serde(default)]
    pub status: String,
}

impl EnrichmentReport {
    /// The fail-closed payload emitted when every attempt is exhausted.
    pub fn failed() -> Self {
        Self {
            enriched_profiles: Vec::new(),
            total_searches: 0,
            sources_scraped: 0,
            status: "failed".to_string(),
        }
    }
}

/// The enrichment stage agent.
pub struct EnrichmentStage;

impl EnrichmentStage {
    /// Run enrichment over discovery's JSON payload. Always returns a JSON
    /// payload string; exhausted retries yield `status: "failed"`.
    pub async fn run(
        discovery_json: &str,
        chat: &dyn ChatClient,
        tools: &dyn ToolDispatch,
        hub: &StatusHub,
        model: &ModelConfig,
        policy: &EnrichmentPolicy,
    ) -> String {
        for attempt in 1..=policy.retry.attempts {
            hub.update_info(
                Phase::Enrichment,
                format!("Enrichment attempt {attempt}/{}", policy.retry.attempts),
            );
            match Self::attempt(discovery_json, chat, tools, hub, model, policy).await {
                Ok(report) => {
                    hub.update_data(
                        Phase::Enrichment,
                        format!("Enriched {} profiles", report.enriched_profiles.len()),
                        json!({
                            "profiles": report.enriched_profiles.len(),
                            "sourcesScraped": report.sources_scraped
                        }),
                    );
                    if let Ok(payload) = serde_json::to_string(&report) {
                        return payload;
                    }
                }
                Err(e) => {
                    tracing::warn!("enrichment attempt {attempt} failed: {e:#}");
                    hub.update_info(Phase::Enrichment, format!("Attempt {attempt} failed: {e}"));
                }
            }
            if attempt < policy.retry.attempts {
                tokio::time::sleep(policy.retry.delay).await;
            }
        }

        serde_json::to_string(&EnrichmentReport::failed())
            .unwrap_or_else(|_| r#"{"enrichedProfiles":[],"status":"failed"}"#.to_string())
    }

    async fn attempt(
        discovery_json: &str,
        chat: &dyn ChatClient,
        tools: &dyn ToolDispatch,
        hub: &StatusHub,
        model: &ModelConfig,
        policy: &EnrichmentPolicy,
    ) -> Result<EnrichmentReport> {
        let discovery: DiscoveryReport = extract::parse_payload(discovery_json)
            .context("enrichment received an unparseable discovery payload")?;

        let catalog = tools.list_tools().await.context("tool catalog unavailable")?;
        let specs = to_tool_specs(&catalog);
        if specs.is_empty() {
            bail!("tool service offers no tools");
        }

        let mut messages = vec![
            ChatMessage::system(ENRICHMENT_PROMPT),
            ChatMessage::user(format!(
                "Enrich each of these candidates. Scrape their profiles and company sites, search for recent activity.\n\n{discovery_json}"
            )),
        ];

        let mut total_searches = 0usize;
        let mut sources_scraped = 0usize;

        for round in 1..=policy.max_rounds {
            let pct = (20 + 30 * (round - 1)).min(80) as u8;
            hub.update_progress(
                Phase::Enrichment,
                format!("Research round {round}/{}", policy.max_rounds),
                pct,
            );
            let turn = chat
                .complete(&ChatRequest::new(model, messages.clone(), specs.clone()))
                .await
                .context("enrichment model call failed")?;

            if !turn.has_tool_calls() {
                // Model is done researching early.
                break;
            }

            total_searches += turn.tool_calls.len();
            let results =
                dispatch_tool_calls(tools, &turn.tool_calls, Some(policy.call_timeout)).await;
            sources_scraped += results.iter().filter(|r| r.ok).count();

            messages.push(ChatMessage::assistant(
                turn.text.clone(),
                turn.tool_calls.clone(),
            ));
            for (call, result) in turn.tool_calls.iter().zip(results) {
                messages.push(ChatMessage::tool(call.id.clone(), result.text));
            }
        }

        // Forced compilation: tool access removed, only the JSON comes back.
        messages.push(ChatMessage::user(
            "Research is over. Emit ONLY the final JSON object now - no further tool use, no prose.",
        ));
        hub.update_progress(Phase::Enrichment, "Compiling enriched profiles", 85);
        let compiled = chat
            .complete(&ChatRequest::new(model, messages, vec![]))
            .await
            .context("enrichment compile call failed")?;

        let mut report: EnrichmentReport = extract::parse_payload(compiled.text_or_default())
            .context("enrichment output did not match shape")?;
        if report.enriched_profiles.is_empty() {
            bail!("enrichment produced no profiles");
        }

        // Thread candidate ids through; fall back to position for entries
        // the model emitted without one.
        for (index, profile) in report.enriched_profiles.iter_mut().enumerate() {
            if profile.candidate_id.trim().is_empty() {
                if let Some(person) = discovery.people.get(index) {
                    profile.candidate_id = person.id.clone();
                }
            }
        }
        report.total_searches = total_searches;
        report.sources_scraped = sources_scraped;
        report.status = "success".to_string();
        Ok(report)
    }
}

const ENRICHMENT_PROMPT: &str = r#"You are a research agent enriching outreach candidates. For each candidate, gather what a thoughtful sender would reference: role and background, company focus, recent activity, and concrete hooks.

When told to compile, respond with ONLY this JSON shape:
{
  "enrichedProfiles": [
    {"candidateId": "", "name": "", "company": "", "role": "",
     "personalInfo": {}, "companyInfo": {},
     "keyInsights": [], "recentActivity": [], "confidenceScore": 0,
     "emailSignals": {"painPoints": [], "opportunities": [], "personalizedHooks": [], "currentChallenges": []}}
  ],
  "status": "success"
}

Copy each candidate's id into candidateId unchanged."#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatOutcome, ToolInvocation};
    use crate::testutil::{ScriptedChat, ScriptedTools};

    fn discovery_payload() -> String {
        r#"{"people": [
            {"id": "p1-abc", "name": "Ada Chen", "company": "Looply", "role": "CEO"},
            {"id": "p2-def", "name": "Ben Ortiz", "company": "Vectorline", "role": "Founder"}
        ], "searchQueries": [], "totalSearches": 3, "status": "success"}"#
            .to_string()
    }

    fn scrape_turn() -> ChatOutcome {
        ChatOutcome {
            text: None,
            tool_calls: vec![
                ToolInvocation {
                    id: "s1".to_string(),
                    name: "scrape_profile".to_string(),
                    arguments: json!({"url": "https://example.com/ada"}),
                },
                ToolInvocation {
                    id: "s2".to_string(),
                    name: "web_search".to_string(),
                    arguments: json!({"query": "Looply news"}),
                },
            ],
        }
    }

    fn compiled_profiles(with_ids: bool) -> String {
        let id1 = if with_ids { "p1-abc" } else { "" };
        let id2 = if with_ids { "p2-def" } else { "" };
        format!(
            r#"{{"enrichedProfiles": [
                {{"candidateId": "{id1}", "name": "Ada Chen", "company": "Looply", "role": "CEO",
                  "keyInsights": ["scaling support team"], "confidenceScore": 8,
                  "emailSignals": {{"painPoints": ["ticket backlog"], "opportunities": [], "personalizedHooks": ["recent funding"], "currentChallenges": []}}}},
                {{"candidateId": "{id2}", "name": "Ben Ortiz", "company": "Vectorline", "role": "Founder", "confidenceScore": 7}}
            ], "status": "success"}}"#
        )
    }

    #[tokio::test]
    async fn test_rounds_then_forced_compile() {
        let hub = StatusHub::new();
        // Two tool rounds, then the forced compile answer.
        let chat = ScriptedChat::with_outcomes(vec![
            Ok(scrape_turn()),
            Ok(scrape_turn()),
            Ok(ChatOutcome {
                text: Some(compiled_profiles(true)),
                tool_calls: vec![],
            }),
        ]);
        let tools = ScriptedTools::new();
        let policy = EnrichmentPolicy {
            retry: RetryPolicy::new(2, Duration::from_millis(10)),
            ..EnrichmentPolicy::default()
        };

        let payload = EnrichmentStage::run(
            &discovery_payload(),
            &chat,
            &tools,
            &hub,
            &ModelConfig::default(),
            &policy,
        )
        .await;

        let report: EnrichmentReport = serde_json::from_str(&payload).unwrap();
        assert_eq!(report.status, "success");
        assert_eq!(report.enriched_profiles.len(), 2);
        assert_eq!(report.total_searches, 4);
        assert_eq!(report.sources_scraped, 4);
        // Exactly max_rounds tool turns + one compile turn.
        assert_eq!(chat.calls(), 3);
    }

    #[tokio::test]
    async fn test_timed_out_call_degrades_and_round_continues() {
        let hub = StatusHub::new();
        let chat = ScriptedChat::with_outcomes(vec![
            Ok(scrape_turn()),
            Ok(ChatOutcome {
                text: Some(compiled_profiles(true)),
                tool_calls: vec![],
            }),
        ]);
        let tools = ScriptedTools::new().slow_on("scrape_profile", Duration::from_secs(5));
        let policy = EnrichmentPolicy {
            retry: RetryPolicy::new(2, Duration::from_millis(10)),
            max_rounds: 1,
            call_timeout: Duration::from_millis(50),
        };

        let payload = EnrichmentStage::run(
            &discovery_payload(),
            &chat,
            &tools,
            &hub,
            &ModelConfig::default(),
            &policy,
        )
        .await;

        let report: EnrichmentReport = serde_json::from_str(&payload).unwrap();
        assert_eq!(report.status, "success");
        // The slow scrape lost its race but the search still counted.
        assert_eq!(report.total_searches, 2);
        assert_eq!(report.sources_scraped, 1);
    }

    #[tokio::test]
    async fn test_position_fallback_when_model_drops_ids() {
        let hub = StatusHub::new();
        // Round one ends research immediately; the forced compile answers
        // without candidate ids.
        let chat = ScriptedChat::with_outcomes(vec![
            Ok(ChatOutcome {
                text: Some("research complete".to_string()),
                tool_calls: vec![],
            }),
            Ok(ChatOutcome {
                text: Some(compiled_profiles(false)),
                tool_calls: vec![],
            }),
        ]);
        let tools = ScriptedTools::new();
        let policy = EnrichmentPolicy::default();

        let payload = EnrichmentStage::run(
            &discovery_payload(),
            &chat,
            &tools,
            &hub,
            &ModelConfig::default(),
            &policy,
        )
        .await;

        let report: EnrichmentReport = serde_json::from_str(&payload).unwrap();
        assert_eq!(report.enriched_profiles[0].candidate_id, "p1-abc");
        assert_eq!(report.enriched_profiles[1].candidate_id, "p2-def");
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail_closed() {
        let hub = StatusHub::new();
        let chat = ScriptedChat::repeating_text("still not json", 16);
        let tools = ScriptedTools::new();
        let policy = EnrichmentPolicy {
            retry: RetryPolicy::new(2, Duration::from_millis(10)),
            ..EnrichmentPolicy::default()
        };

        let payload = EnrichmentStage::run(
            &discovery_payload(),
            &chat,
            &tools,
            &hub,
            &ModelConfig::default(),
            &policy,
        )
        .await;

        let report: EnrichmentReport = serde_json::from_str(&payload).unwrap();
        assert_eq!(report.status, "failed");
        assert!(report.enriched_profiles.is_empty());
    }
}
