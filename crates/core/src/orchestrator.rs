//! # Orchestrator
//!
//! Sequences planning -> discovery -> enrichment -> generation for one run.
//! Each stage's JSON payload is validated before it feeds the next stage; a
//! parse failure or a non-success status throws a phase error that aborts
//! the attempt. The retry at this level wraps the whole pipeline - when
//! attempts remain, a failed attempt restarts from planning.
//!
//! `run` never returns an error: exhausting every attempt produces a
//! `RunResult` with `success: false` and a structured fallback payload for
//! every phase that was not reached.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::gateway::ToolDispatch;
use crate::llm::ChatClient;
use crate::models::ModelConfig;
use crate::pipeline::PhaseMachine;
use crate::stages::discovery::{self, DiscoveryReport, DiscoveryStage};
use crate::stages::enrichment::{EnrichmentPolicy, EnrichmentReport, EnrichmentStage};
use crate::stages::generation::{GenerationPolicy, GenerationStage, MessageReport};
use crate::stages::planning::{ExecutionPlan, PlanningStage};
use crate::stages::RetryPolicy;
use crate::status::{Phase, SessionSummary, StatusHub};

/// Configuration for one orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Model used by every stage
    pub model: ModelConfig,
    /// Whole-pipeline attempts
    pub pipeline_attempts: u32,
    /// Fixed delay between whole-pipeline attempts
    pub pipeline_retry_delay: Duration,
    pub discovery: RetryPolicy,
    pub enrichment: EnrichmentPolicy,
    pub generation: GenerationPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            pipeline_attempts: 2,
            pipeline_retry_delay: Duration::from_secs(3),
            discovery: discovery::default_policy(),
            enrichment: EnrichmentPolicy::default(),
            generation: GenerationPolicy::default(),
        }
    }
}

/// Wall-clock accounting for one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingBreakdown {
    pub total_seconds: f64,
    /// Per-phase durations; phases that never completed are absent
    pub phases: BTreeMap<String, f64>,
}

/// Terminal artifact of one orchestrator invocation. Every field is
/// populated even on total failure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    pub session_id: String,
    pub attempt_number: u32,
    pub plan: ExecutionPlan,
    pub discovery: Value,
    pub enrichment: Value,
    pub messages: Value,
    pub timing: TimingBreakdown,
    pub summary: SessionSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Stage outputs accumulated across one attempt.
#[derive(Default)]
struct AttemptParts {
    plan: Option<ExecutionPlan>,
    discovery: Option<Value>,
    enrichment: Option<Value>,
    messages: Option<Value>,
}

/// The pipeline orchestrator. One instance per run, sharing nothing with
/// concurrent runs except the tool gateway.
pub struct Orchestrator {
    config: OrchestratorConfig,
    chat: Arc<dyn ChatClient>,
    tools: Arc<dyn ToolDispatch>,
    hub: Arc<StatusHub>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        chat: Arc<dyn ChatClient>,
        tools: Arc<dyn ToolDispatch>,
        hub: Arc<StatusHub>,
    ) -> Self {
        Self {
            config,
            chat,
            tools,
            hub,
        }
    }

    pub fn hub(&self) -> &Arc<StatusHub> {
        &self.hub
    }

    /// Run the full pipeline for a request.
    #[tracing::instrument(skip(self, query), fields(session = %self.hub.session_id()))]
    pub async fn run(&self, query: &str) -> RunResult {
        let run_started = Utc::now();
        let attempts = self.config.pipeline_attempts.max(1);
        let mut last_error: Option<String> = None;
        let mut last_parts = AttemptParts::default();

        for attempt in 1..=attempts {
            let mut parts = AttemptParts::default();
            match self.run_attempt(query, &mut parts).await {
                Ok(()) => {
                    self.hub.update_success(
                        Phase::Complete,
                        format!("Pipeline complete on attempt {attempt}"),
                    );
                    return self.assemble(true, attempt, parts, None, run_started, query);
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    tracing::warn!("pipeline attempt {attempt} failed: {message}");
                    last_error = Some(message);
                    last_parts = parts;
                    if attempt < attempts {
                        self.hub.update_info(
                            Phase::Error,
                            format!("Attempt {attempt} failed, restarting pipeline"),
                        );
                        tokio::time::sleep(self.config.pipeline_retry_delay).await;
                    }
                }
            }
        }

        self.hub.update_data(
            Phase::Error,
            "Pipeline failed after all attempts",
            json!({"attempts": attempts, "error": last_error}),
        );
        self.assemble(false, attempts, last_parts, last_error, run_started, query)
    }

    /// One linear pass over the four phases. Planning cannot fail; any
    /// later phase error aborts the remaining phases of this attempt.
    async fn run_attempt(&self, query: &str, parts: &mut AttemptParts) -> Result<()> {
        let mut machine = PhaseMachine::new();

        // Phase 1: planning (never fails outward)
        self.hub
            .start_phase(Phase::Planning, "Building execution plan");
        let plan =
            PlanningStage::run(query, self.chat.as_ref(), &self.hub, &self.config.model).await;
        self.hub.complete_phase(
            Phase::Planning,
            format!("Plan ready: {} queries", plan.search_queries.len()),
        );
        parts.plan = Some(plan.clone());
        machine.advance();

        // Phase 2: discovery
        self.hub
            .start_phase(Phase::Discovery, "Searching for candidates");
        let discovery_json = DiscoveryStage::run(
            &plan,
            query,
            self.chat.as_ref(),
            self.tools.as_ref(),
            &self.hub,
            &self.config.model,
            &self.config.discovery,
        )
        .await;
        let discovery_value = match Self::expect_success(&discovery_json, "discovery") {
            Ok(value) => value,
            Err(e) => {
                self.hub.fail_phase(Phase::Discovery, format!("{e}"));
                machine.fail();
                return Err(e);
            }
        };
        let found = discovery_value
            .get("people")
            .and_then(|p| p.as_array())
            .map(|p| p.len())
            .unwrap_or(0);
        self.hub
            .complete_phase(Phase::Discovery, format!("Discovered {found} candidates"));
        parts.discovery = Some(discovery_value);
        machine.advance();

        // Phase 3: enrichment
        self.hub
            .start_phase(Phase::Enrichment, "Researching candidates");
        let enrichment_json = EnrichmentStage::run(
            &discovery_json,
            self.chat.as_ref(),
            self.tools.as_ref(),
            &self.hub,
            &self.config.model,
            &self.config.enrichment,
        )
        .await;
        let enrichment_value = match Self::expect_success(&enrichment_json, "enrichment") {
            Ok(value) => value,
            Err(e) => {
                self.hub.fail_phase(Phase::Enrichment, format!("{e}"));
                machine.fail();
                return Err(e);
            }
        };
        self.hub
            .complete_phase(Phase::Enrichment, "Profiles enriched");
        parts.enrichment = Some(enrichment_value);
        machine.advance();

        // Phase 4: generation
        self.hub
            .start_phase(Phase::Generation, "Writing outreach messages");
        let messages_json = GenerationStage::run(
            &enrichment_json,
            &plan,
            self.chat.as_ref(),
            &self.hub,
            &self.config.model,
            &self.config.generation,
        )
        .await;
        let messages_value = match Self::expect_success(&messages_json, "generation") {
            Ok(value) => value,
            Err(e) => {
                self.hub.fail_phase(Phase::Generation, format!("{e}"));
                machine.fail();
                return Err(e);
            }
        };
        let written = messages_value
            .get("messages")
            .and_then(|m| m.as_array())
            .map(|m| m.len())
            .unwrap_or(0);
        self.hub
            .complete_phase(Phase::Generation, format!("Wrote {written} messages"));
        parts.messages = Some(messages_value);
        machine.advance();

        debug_assert!(machine.is_success());
        Ok(())
    }

    /// Parse a stage payload and require `status == "success"`.
    fn expect_success(payload: &str, stage: &str) -> Result<Value> {
        let value: Value = serde_json::from_str(payload)
            .with_context(|| format!("{stage} stage returned unparseable JSON"))?;
        let status = value.get("status").and_then(|s| s.as_str()).unwrap_or("");
        if status != "success" {
            bail!("{stage} stage reported status {status:?}");
        }
        Ok(value)
    }

    fn assemble(
        &self,
        success: bool,
        attempt_number: u32,
        parts: AttemptParts,
        last_error: Option<String>,
        run_started: chrono::DateTime<Utc>,
        query: &str,
    ) -> RunResult {
        let phases = self
            .hub
            .phase_records()
            .iter()
            .filter_map(|r| {
                r.duration_seconds
                    .map(|d| (r.phase.as_str().to_string(), d))
            })
            .collect();
        let timing = TimingBreakdown {
            total_seconds: (Utc::now() - run_started).num_milliseconds() as f64 / 1000.0,
            phases,
        };

        // Unreached phases get structured fallback payloads, never holes.
        let plan = parts
            .plan
            .unwrap_or_else(|| PlanningStage::fallback_plan(query));
        let discovery = parts.discovery.unwrap_or_else(|| {
            to_value_or_failed(&DiscoveryReport::failed(&plan.search_queries))
        });
        let enrichment = parts
            .enrichment
            .unwrap_or_else(|| to_value_or_failed(&EnrichmentReport::failed()));
        let messages = parts
            .messages
            .unwrap_or_else(|| to_value_or_failed(&MessageReport::failed()));

        RunResult {
            success,
            session_id: self.hub.session_id().to_string(),
            attempt_number,
            plan,
            discovery,
            enrichment,
            messages,
            timing,
            summary: self.hub.summary(),
            last_error,
        }
    }
}

fn to_value_or_failed<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or_else(|_| json!({"status": "failed"}))
}
