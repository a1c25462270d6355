//! # Prospect Core
//!
//! The engine of the Prospect system - phase-sequenced orchestration of
//! LLM-backed stage agents, with real-time status streaming.
//!
//! ## Architecture
//!
//! - `gateway` - lazy-connecting client to the external tool-invocation service
//! - `llm` - chat-completion boundary the stage agents call through
//! - `stages/` - planning, discovery, enrichment and generation agents
//! - `status` - per-run append-only event hub with pub/sub fan-out
//! - `orchestrator` - pipeline sequencing, whole-pipeline retry, result assembly
//!
//! ## Usage
//!
//! ```rust,ignore
//! use prospect_core::orchestrator::{Orchestrator, OrchestratorConfig};
//! use prospect_core::status::StatusHub;
//!
//! let hub = Arc::new(StatusHub::new());
//! let orchestrator = Orchestrator::new(config, chat, tools, hub.clone());
//! let result = orchestrator.run("Find 2 AI founders in Seattle").await;
//! ```

pub mod extract;
pub mod gateway;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod stages;
pub mod status;

#[cfg(test)]
pub(crate) mod testutil;

pub use gateway::{GatewayConfig, ToolDispatch, ToolGateway};
pub use models::{LlmProvider, ModelConfig};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunResult};
pub use status::{Phase, SessionSummary, StatusEvent, StatusHub};
