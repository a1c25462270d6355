//! # Generation Stage
//!
//! Writes one outreach message per enriched profile. A single model call
//! with no tools produces the structured message list; a deterministic
//! quality scorer then judges the raw output, and low-scoring attempts are
//! retried before failing closed.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::extract;
use crate::llm::{ChatClient, ChatMessage, ChatRequest};
use crate::models::ModelConfig;
use crate::stages::RetryPolicy;
use crate::status::{Phase, StatusHub};

use super::{EnrichmentReport, ExecutionPlan, MessageType};

/// Attempt/backoff plus acceptance thresholds for generation.
#[derive(Debug, Clone)]
pub struct GenerationPolicy {
    pub retry: RetryPolicy,
    /// Minimum quality score for acceptance
    pub min_score: i32,
    /// Minimum raw output length for acceptance
    pub min_length: usize,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(2, Duration::from_secs(2)),
            min_score: 6,
            min_length: 100,
        }
    }
}

/// One generated outreach message, aligned to its candidate by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedMessage {
    #[serde(default)]
    pub candidate_id: String,
    pub recipient_name: String,
    #[serde(default)]
    pub recipient_email: Option<String>,
    #[serde(default)]
    pub recipient_company: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub personalization_points: Vec<String>,
    #[serde(default)]
    pub confidence_score: f32,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub word_count: usize,
}

/// The stage's JSON-serialized output payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReport {
    #[serde(default)]
    pub messages: Vec<GeneratedMessage>,
    #[serde(default)]
    pub total_messages: usize,
    #[serde(default)]
    pub average_confidence: f32,
    #[serde(default)]
    pub status: String,
}

impl MessageReport {
    /// The fail-closed payload emitted when every attempt is exhausted.
    pub fn failed() -> Self {
        Self {
            messages: Vec::new(),
            total_messages: 0,
            average_confidence: 0.0,
            status: "failed".to_string(),
        }
    }
}

/// Generic phrases that mark boilerplate. Each hit costs 2 points.
const GENERIC_PHRASES: [&str; 8] = [
    "hope this finds you well",
    "hope this email finds you well",
    "to whom it may concern",
    "dear sir or madam",
    "i wanted to reach out",
    "touching base",
    "just checking in",
    "i came across your profile",
];

/// Phrases that signal actual personalization. Zero hits costs 3 points.
const PERSONALIZATION_SIGNALS: [&str; 8] = [
    "i noticed",
    "i saw",
    "congratulations",
    "your recent",
    "your work on",
    "impressed by",
    "specifically",
    "after reading",
];

/// Deterministic quality score for raw generation output. Starts at 10:
/// -2 per generic phrase, -3 with no personalization signal, -1 with no
/// numeric token, -2 when the length is outside the acceptable band.
pub fn score_message_text(text: &str) -> i32 {
    let lower = text.to_lowercase();
    let mut score: i32 = 10;

    for phrase in GENERIC_PHRASES {
        if lower.contains(phrase) {
            score -= 2;
        }
    }
    if !PERSONALIZATION_SIGNALS
        .iter()
        .any(|signal| lower.contains(signal))
    {
        score -= 3;
    }
    if !text.chars().any(|c| c.is_ascii_digit()) {
        score -= 1;
    }
    let length = text.chars().count();
    if !(100..=1500).contains(&length) {
        score -= 2;
    }
    score
}

/// The generation stage agent.
pub struct GenerationStage;

impl GenerationStage {
    /// Generate messages from enrichment's JSON payload plus the plan's
    /// message type and target profile. Always returns a JSON payload
    /// string; exhausted retries yield `status: "failed"`.
    pub async fn run(
        enrichment_json: &str,
        plan: &ExecutionPlan,
        chat: &dyn ChatClient,
        hub: &StatusHub,
        model: &ModelConfig,
        policy: &GenerationPolicy,
    ) -> String {
        for attempt in 1..=policy.retry.attempts {
            hub.update_info(
                Phase::Generation,
                format!("Generation attempt {attempt}/{}", policy.retry.attempts),
            );
            match Self::attempt(enrichment_json, plan, chat, hub, model, policy).await {
                Ok(report) => {
                    hub.update_data(
                        Phase::Generation,
                        format!("Generated {} messages", report.messages.len()),
                        json!({
                            "messages": report.messages.len(),
                            "averageConfidence": report.average_confidence
                        }),
                    );
                    if let Ok(payload) = serde_json::to_string(&report) {
                        return payload;
                    }
                }
                Err(e) => {
                    tracing::warn!("generation attempt {attempt} failed: {e:#}");
                    hub.update_info(Phase::Generation, format!("Attempt {attempt} failed: {e}"));
                }
            }
            if attempt < policy.retry.attempts {
                tokio::time::sleep(policy.retry.delay).await;
            }
        }

        serde_json::to_string(&MessageReport::failed())
            .unwrap_or_else(|_| r#"{"messages":[],"status":"failed"}"#.to_string())
    }

    async fn attempt(
        enrichment_json: &str,
        plan: &ExecutionPlan,
        chat: &dyn ChatClient,
        hub: &StatusHub,
        model: &ModelConfig,
        policy: &GenerationPolicy,
    ) -> Result<MessageReport> {
        let enrichment: EnrichmentReport = extract::parse_payload(enrichment_json)
            .context("generation received an unparseable enrichment payload")?;

        let message_kind = match plan.message_type {
            MessageType::SalesOutreach => "a sales email",
            MessageType::HiringPitch => "a recruiting pitch",
            MessageType::StartupPitch => "an investor pitch email",
            MessageType::Collaboration => "a collaboration proposal",
        };

        hub.update_progress(Phase::Generation, "Drafting messages", 30);
        let outcome = chat
            .complete(&ChatRequest::new(
                model,
                vec![
                    ChatMessage::system(GENERATION_PROMPT),
                    ChatMessage::user(format!(
                        "Write {message_kind} to each profile below, from this sender:\n{}\n\nProfiles:\n{enrichment_json}",
                        plan.target_profile
                    )),
                ],
                vec![],
            ))
            .await
            .context("generation model call failed")?;

        let raw = outcome.text_or_default();
        let score = score_message_text(raw);
        if score < policy.min_score || raw.len() <= policy.min_length {
            bail!(
                "generated output rejected by quality gate (score {score}, length {})",
                raw.len()
            );
        }
        hub.update_progress(
            Phase::Generation,
            format!("Draft accepted (quality {score}/10)"),
            70,
        );

        let mut report: MessageReport =
            extract::parse_payload(raw).context("generation output did not match shape")?;
        if report.messages.is_empty() {
            bail!("generation produced no messages");
        }

        for (index, message) in report.messages.iter_mut().enumerate() {
            if message.candidate_id.trim().is_empty() {
                if let Some(profile) = enrichment.enriched_profiles.get(index) {
                    message.candidate_id = profile.candidate_id.clone();
                }
            }
            message.message_type = plan.message_type;
            if message.word_count == 0 {
                message.word_count = message.body.split_whitespace().count();
            }
        }
        report.total_messages = report.messages.len();
        if report.average_confidence == 0.0 {
            report.average_confidence = report
                .messages
                .iter()
                .map(|m| m.confidence_score)
                .sum::<f32>()
                / report.messages.len() as f32;
        }
        report.status = "success".to_string();
        Ok(report)
    }
}

const GENERATION_PROMPT: &str = r#"You write concise, specific outreach messages. Every message must reference concrete details from the recipient's profile - their recent activity, a named product, a metric. Never open with pleasantries like "hope this finds you well".

Respond with ONLY this JSON shape:
{
  "messages": [
    {"candidateId": "", "recipientName": "", "recipientEmail": null, "recipientCompany": "",
     "subject": "", "body": "", "personalizationPoints": [], "confidenceScore": 0}
  ],
  "status": "success"
}

Copy each profile's candidateId unchanged. Keep bodies under 150 words."#;
