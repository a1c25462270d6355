//! # Planning Stage
//!
//! Converts the free-form request into a structured execution plan: search
//! queries for discovery, a message-type classification, the sender's
//! target profile, and a target candidate count.
//!
//! This stage never fails outward. The model is asked for strict JSON; if
//! the call or the parse fails, a fully deterministic fallback plan is built
//! from keyword heuristics over the request alone.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::extract;
use crate::llm::{ChatClient, ChatMessage, ChatRequest};
use crate::models::ModelConfig;
use crate::status::{Phase, StatusHub};

/// Default number of candidates to discover.
pub const DEFAULT_TARGET_COUNT: usize = 3;
/// Hard cap on requested candidates.
pub const MAX_TARGET_COUNT: usize = 5;
/// Minimum usable query count before the fallback set kicks in.
const MIN_QUERIES: usize = 3;

/// Kind of outreach message to generate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    SalesOutreach,
    HiringPitch,
    StartupPitch,
    Collaboration,
}

/// The execution plan produced once per run. Immutable after planning;
/// consumed by discovery and generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub intent: String,
    pub search_queries: Vec<String>,
    /// Sender identity / value proposition
    pub target_profile: String,
    pub message_type: MessageType,
    pub target_count: usize,
}

/// Loose shape the model is asked to emit. Every field is optional so a
/// partially valid answer still contributes what it can.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanDraft {
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    search_queries: Vec<String>,
    #[serde(default)]
    target_profile: Option<String>,
}

/// The planning stage agent.
pub struct PlanningStage;

impl PlanningStage {
    /// Build an execution plan for the request. Infallible by design: any
    /// model-call or parse failure falls back to [`Self::fallback_plan`].
    pub async fn run(
        query: &str,
        chat: &dyn ChatClient,
        hub: &StatusHub,
        model: &ModelConfig,
    ) -> ExecutionPlan {
        hub.update_info(Phase::Planning, "Analyzing request");

        let request = ChatRequest::new(
            model,
            vec![
                ChatMessage::system(PLANNING_PROMPT),
                ChatMessage::user(query.to_string()),
            ],
            vec![],
        );

        let plan = match chat.complete(&request).await {
            Ok(outcome) => {
                let analysis = outcome.text_or_default();
                match extract::parse_payload::<PlanDraft>(analysis) {
                    Ok(draft) => Self::merge_draft(query, analysis, draft),
                    Err(e) => {
                        tracing::warn!("planning output not parseable ({e}), using fallback plan");
                        hub.update_info(Phase::Planning, "Model output unusable, using fallback plan");
                        // Classification still sees the analysis text.
                        Self::plan_from_heuristics(query, analysis)
                    }
                }
            }
            Err(e) => {
                tracing::warn!("planning model call failed ({e}), using fallback plan");
                hub.update_info(Phase::Planning, "Model unavailable, using fallback plan");
                Self::fallback_plan(query)
            }
        };

        hub.update_progress(Phase::Planning, "Execution plan ready", 100);
        hub.update_data(
            Phase::Planning,
            format!(
                "Planned {} searches for {} candidates",
                plan.search_queries.len(),
                plan.target_count
            ),
            json!(plan),
        );
        plan
    }

    /// Combine a parsed draft with the deterministic pieces. Queries below
    /// the minimum are replaced wholesale by the built-in set.
    fn merge_draft(query: &str, analysis: &str, draft: PlanDraft) -> ExecutionPlan {
        let mut queries: Vec<String> = draft
            .search_queries
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        queries.truncate(10);
        if queries.len() < MIN_QUERIES {
            queries = fallback_queries(query);
        }

        ExecutionPlan {
            intent: draft
                .intent
                .filter(|i| !i.trim().is_empty())
                .unwrap_or_else(|| query.to_string()),
            search_queries: queries,
            target_profile: draft
                .target_profile
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| query.to_string()),
            message_type: classify_message_type(query, analysis),
            target_count: parse_target_count(query),
        }
    }

    fn plan_from_heuristics(query: &str, analysis: &str) -> ExecutionPlan {
        ExecutionPlan {
            message_type: classify_message_type(query, analysis),
            ..Self::fallback_plan(query)
        }
    }

    /// The fully deterministic fallback plan: same query in, same plan out.
    pub fn fallback_plan(query: &str) -> ExecutionPlan {
        ExecutionPlan {
            intent: query.to_string(),
            search_queries: fallback_queries(query),
            target_profile: query.to_string(),
            message_type: classify_message_type(query, ""),
            target_count: parse_target_count(query),
        }
    }
}

/// Keyword-heuristic message-type classification over the original query
/// and the model's analysis text.
pub fn classify_message_type(query: &str, analysis: &str) -> MessageType {
    let haystack = format!("{} {}", query.to_lowercase(), analysis.to_lowercase());

    const SALES: [&str; 6] = ["sell", "sales", "outreach", "customer", "demo", "product"];
    const HIRING: [&str; 6] = ["hire", "hiring", "recruit", "candidate", "job opening", "role"];
    const FUNDING: [&str; 6] = ["investor", "funding", "raise", "vc", "seed", "pitch deck"];

    if SALES.iter().any(|kw| haystack.contains(kw)) {
        MessageType::SalesOutreach
    } else if HIRING.iter().any(|kw| haystack.contains(kw)) {
        MessageType::HiringPitch
    } else if FUNDING.iter().any(|kw| haystack.contains(kw)) {
        MessageType::StartupPitch
    } else {
        MessageType::Collaboration
    }
}

/// Extract an explicit candidate count from the query, capped at
/// [`MAX_TARGET_COUNT`]; defaults to [`DEFAULT_TARGET_COUNT`].
pub fn parse_target_count(query: &str) -> usize {
    let Ok(re) = Regex::new(r"\b([1-9][0-9]?)\b") else {
        return DEFAULT_TARGET_COUNT;
    };
    re.captures(query)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .map(|n| n.min(MAX_TARGET_COUNT))
        .unwrap_or(DEFAULT_TARGET_COUNT)
}

/// Deterministic built-in query set, keyed by keyword heuristics over the
/// request.
pub fn fallback_queries(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();

    if lower.contains("bangalore") {
        return vec![
            "startup founders Bangalore".to_string(),
            "tech company CEO Bangalore".to_string(),
            "SaaS founder Bangalore India".to_string(),
            "Bangalore startup ecosystem leaders".to_string(),
            "early stage founder Bangalore".to_string(),
            "Bangalore tech entrepreneur LinkedIn".to_string(),
            "product startup CTO Bangalore".to_string(),
            "funded startup Bangalore 2024".to_string(),
        ];
    }
    if lower.contains("yc") || lower.contains("y combinator") {
        return vec![
            "Y Combinator founder current batch".to_string(),
            "YC startup CEO LinkedIn".to_string(),
            "Y Combinator alumni founders".to_string(),
            "YC backed company founder".to_string(),
            "Y Combinator demo day startups".to_string(),
            "YC founder twitter".to_string(),
            "Y Combinator seed stage founder".to_string(),
            "YC startup technical founder".to_string(),
        ];
    }

    // Generic set built from the request itself.
    let topic = lower
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .take(4)
        .collect::<Vec<_>>()
        .join(" ");
    let topic = if topic.is_empty() {
        "startup".to_string()
    } else {
        topic
    };
    vec![
        format!("{topic} founders"),
        format!("{topic} CEO LinkedIn"),
        format!("{topic} startup leaders"),
        format!("{topic} decision makers"),
        format!("{topic} company executives"),
        format!("{topic} entrepreneurs"),
        format!("{topic} industry contacts"),
        format!("{topic} professionals directory"),
    ]
}

const PLANNING_PROMPT: &str = r#"You are a business-development planner. Convert the user's request into an execution plan.

Respond with ONLY a JSON object, no prose:
{
  "intent": "one-sentence restatement of the goal",
  "searchQueries": ["8 to 10 diverse web search queries that would surface the people described"],
  "targetProfile": "who the sender is and what value they offer, from the request"
}

Make the search queries varied: role + location, role + industry, platform-specific (LinkedIn, Twitter), event/community angles."#;
