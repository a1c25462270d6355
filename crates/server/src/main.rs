//! Prospect Server
//!
//! Axum server exposing the outreach pipeline: one POST kicks off a run and
//! streams its progress back as server-sent events, multiplexing the status
//! hub with the final aggregated result. The run itself is detached from
//! the response stream - a client that disconnects stops receiving writes,
//! but the pipeline runs to completion regardless.

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use prospect_core::llm::ChatClient;
use prospect_core::orchestrator::{Orchestrator, OrchestratorConfig, RunResult};
use prospect_core::status::{PhaseStatus, SessionSummary, StatusEvent};
use prospect_core::{GatewayConfig, LlmProvider, ModelConfig, StatusHub, ToolGateway};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, oneshot, RwLock},
};
use tokio_stream::wrappers::ReceiverStream;
use utoipa::{OpenApi, ToSchema};

/// Application state shared by the API handlers. Each run builds its own
/// orchestrator and status hub; only the tool gateway connection and the
/// persisted config are shared.
struct AppState {
    gateway: Arc<ToolGateway>,
    config: RwLock<PersistedConfig>,
    last_summary: RwLock<Option<SessionSummary>>,
}

type SharedState = Arc<AppState>;

// === API Types ===

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct RunRequest {
    query: Option<String>,
    criteria: Option<String>,
    product_info: Option<String>,
}

#[derive(Serialize, ToSchema)]
struct ApiError {
    error: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    session_id: Option<String>,
    status: String,
    phases: Vec<PhaseSummary>,
    event_count: usize,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct PhaseSummary {
    phase: String,
    status: String,
    duration_seconds: Option<f64>,
    event_count: usize,
}

#[derive(Serialize, ToSchema)]
struct ProviderInfo {
    id: String,
    name: String,
    default_model: String,
    env_var: String,
}

#[derive(Serialize, ToSchema)]
struct ProvidersResponse {
    providers: Vec<ProviderInfo>,
}

// === Config ===

/// Persisted configuration, stored at `.prospect/config.json` and patched
/// through the API with a partial merge.
#[derive(Debug, Clone, Serialize, Deserialize, Default, ToSchema)]
struct PersistedConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_args: Vec<String>,
}

impl PersistedConfig {
    async fn load() -> Self {
        let path = std::path::PathBuf::from(".prospect/config.json");
        if path.exists() {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
                Err(_) => Self::default(),
            }
        } else {
            Self::default()
        }
    }

    async fn save(&self) -> Result<(), std::io::Error> {
        let path = std::path::PathBuf::from(".prospect/config.json");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&path, content).await
    }

    fn merge(&mut self, other: PersistedConfig) {
        if other.provider.is_some() {
            self.provider = other.provider;
        }
        if other.model.is_some() {
            self.model = other.model;
        }
        if other.base_url.is_some() {
            self.base_url = other.base_url;
        }
        if other.temperature.is_some() {
            self.temperature = other.temperature;
        }
        if other.max_tokens.is_some() {
            self.max_tokens = other.max_tokens;
        }
        if other.tool_command.is_some() {
            self.tool_command = other.tool_command;
        }
        if !other.tool_args.is_empty() {
            self.tool_args = other.tool_args;
        }
    }

    fn model_config(&self) -> ModelConfig {
        let provider = match self.provider.as_deref() {
            Some("anthropic") => LlmProvider::Anthropic,
            Some("openai") => LlmProvider::OpenAI,
            Some("openrouter") => LlmProvider::OpenRouter,
            Some("grok") => LlmProvider::Grok,
            Some("deepseek") => LlmProvider::DeepSeek,
            _ => LlmProvider::default(),
        };
        let mut config = ModelConfig::with_provider(
            provider.clone(),
            self.model
                .clone()
                .unwrap_or_else(|| provider.default_model().to_string()),
        );
        config.base_url = self.base_url.clone();
        if let Some(t) = self.temperature {
            config.temperature = t;
        }
        if let Some(m) = self.max_tokens {
            config.max_tokens = m;
        }
        config
    }

    fn gateway_config(&self) -> GatewayConfig {
        match &self.tool_command {
            Some(command) if !command.trim().is_empty() => GatewayConfig {
                command: command.clone(),
                args: self.tool_args.clone(),
                ..GatewayConfig::default()
            },
            _ => GatewayConfig::from_env(),
        }
    }
}

#[derive(Serialize, ToSchema)]
struct ConfigResponse {
    config: PersistedConfig,
}

// === CLI ===

#[derive(Parser, Clone)]
#[command(author, version, about = "Prospect - Autonomous Outreach Pipeline")]
struct Args {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Start the Prospect server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
    /// Run one pipeline from the command line, no server
    Run {
        /// The outreach request
        query: String,
    },
}

// === OpenAPI Definition ===

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Prospect API",
        version = "1.0.0",
        description = "API for the Prospect autonomous outreach pipeline"
    ),
    paths(run_outreach, get_status, get_config, update_config, get_providers),
    components(schemas(
        RunRequest,
        ApiError,
        StatusResponse,
        PhaseSummary,
        PersistedConfig,
        ConfigResponse,
        ProvidersResponse,
        ProviderInfo
    )),
    tags(
        (name = "outreach", description = "Pipeline runs and status"),
        (name = "config", description = "Configuration management"),
        (name = "providers", description = "LLM provider discovery")
    )
)]
struct ApiDoc;

// === API Handlers ===

/// Start a pipeline run and stream its progress as server-sent events.
///
/// Emits `status-update` events for every status-hub append, then either a
/// `final-result` event (the complete RunResult, success or not) or an
/// `error` event, then the `done` sentinel.
#[utoipa::path(
    post,
    path = "/api/v1/outreach/run",
    tag = "outreach",
    request_body = RunRequest,
    responses(
        (status = 200, description = "SSE stream of run events"),
        (status = 400, description = "Invalid request", body = ApiError)
    )
)]
async fn run_outreach(State(state): State<SharedState>, Json(req): Json<RunRequest>) -> Response {
    let query = req.query.as_deref().unwrap_or("").trim().to_string();
    if query.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiError {
                error: "query is required".to_string(),
            }),
        )
            .into_response();
    }

    // Fold the optional context fields into the request text.
    let mut full_query = query;
    if let Some(criteria) = req.criteria.as_deref().filter(|c| !c.trim().is_empty()) {
        full_query.push_str(&format!("\nCriteria: {criteria}"));
    }
    if let Some(product) = req.product_info.as_deref().filter(|p| !p.trim().is_empty()) {
        full_query.push_str(&format!("\nProduct: {product}"));
    }

    let persisted = state.config.read().await.clone();
    let model = persisted.model_config();
    // The stream has not opened yet, so configuration problems come back as
    // a plain JSON client error.
    let chat: Arc<dyn ChatClient> = match model.create_client() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiError {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let hub = Arc::new(StatusHub::new());
    let mut event_rx = hub.subscribe();
    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            model,
            ..OrchestratorConfig::default()
        },
        chat,
        state.gateway.clone(),
        hub.clone(),
    );

    println!("🔍 Run {} started: {}", hub.session_id(), full_query);

    // The run is detached from the response: client disconnect only stops
    // the writes below, never this task.
    let (done_tx, mut done_rx) = oneshot::channel::<RunResult>();
    let summary_state = state.clone();
    tokio::spawn(async move {
        let result = orchestrator.run(&full_query).await;
        *summary_state.last_summary.write().await = Some(result.summary.clone());
        if result.success {
            println!("✅ Run {} complete", result.session_id);
        } else {
            eprintln!(
                "❌ Run {} failed: {}",
                result.session_id,
                result.last_error.as_deref().unwrap_or("unknown error")
            );
        }
        let _ = done_tx.send(result);
    });

    // Bridge hub events plus the final result into the SSE channel.
    let (sse_tx, sse_rx) = mpsc::channel::<Event>(64);
    tokio::spawn(async move {
        // A single comment line establishes the stream before any event.
        if sse_tx
            .send(Event::default().comment("prospect event stream"))
            .await
            .is_err()
        {
            return;
        }
        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Ok(event) => {
                        if sse_tx.send(status_update_event(&event)).await.is_err() {
                            break; // client gone; writes stop, run continues
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                result = &mut done_rx => {
                    // Flush events that were broadcast before the result won
                    // the select.
                    while let Ok(event) = event_rx.try_recv() {
                        if sse_tx.send(status_update_event(&event)).await.is_err() {
                            return;
                        }
                    }
                    let terminal = match result {
                        Ok(result) => {
                            let payload = json!({"type": "final-result", "result": result});
                            Event::default()
                                .event("final-result")
                                .data(payload.to_string())
                        }
                        Err(_) => Event::default().event("error").data(
                            json!({"type": "error", "message": "run aborted before completion"})
                                .to_string(),
                        ),
                    };
                    let _ = sse_tx.send(terminal).await;
                    let _ = sse_tx.send(Event::default().event("done").data("{}")).await;
                    break;
                }
            }
        }
    });

    let stream = ReceiverStream::new(sse_rx).map(Ok::<Event, Infallible>);
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Frame one status event for the wire.
fn status_update_event(event: &StatusEvent) -> Event {
    let payload = json!({
        "type": "status-update",
        "id": event.id,
        "kind": event.kind,
        "phase": event.phase,
        "message": event.message,
        "timestamp": event.timestamp,
        "progress": event.progress,
        "data": event.payload,
    });
    Event::default()
        .event("status-update")
        .data(payload.to_string())
}

fn phase_status_str(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Pending => "pending",
        PhaseStatus::InProgress => "in_progress",
        PhaseStatus::Completed => "completed",
        PhaseStatus::Failed => "failed",
    }
}

/// Get the phase summary of the most recent run
#[utoipa::path(
    get,
    path = "/api/v1/outreach/status",
    tag = "outreach",
    responses(
        (status = 200, description = "Latest run summary", body = StatusResponse)
    )
)]
async fn get_status(State(state): State<SharedState>) -> Json<StatusResponse> {
    match state.last_summary.read().await.as_ref() {
        Some(summary) => Json(StatusResponse {
            session_id: Some(summary.session_id.clone()),
            status: phase_status_str(summary.status).to_string(),
            phases: summary
                .phases
                .iter()
                .map(|p| PhaseSummary {
                    phase: p.phase.as_str().to_string(),
                    status: phase_status_str(p.status).to_string(),
                    duration_seconds: p.duration_seconds,
                    event_count: p.event_count,
                })
                .collect(),
            event_count: summary.event_count,
        }),
        None => Json(StatusResponse {
            session_id: None,
            status: "idle".to_string(),
            phases: vec![],
            event_count: 0,
        }),
    }
}

/// Get current configuration
#[utoipa::path(
    get,
    path = "/api/v1/config",
    tag = "config",
    responses(
        (status = 200, description = "Current configuration", body = ConfigResponse)
    )
)]
async fn get_config(State(state): State<SharedState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        config: state.config.read().await.clone(),
    })
}

/// Update configuration (partial merge)
#[utoipa::path(
    patch,
    path = "/api/v1/config",
    tag = "config",
    request_body = PersistedConfig,
    responses(
        (status = 200, description = "Updated configuration", body = ConfigResponse)
    )
)]
async fn update_config(
    State(state): State<SharedState>,
    Json(updates): Json<PersistedConfig>,
) -> Json<ConfigResponse> {
    let mut config = state.config.write().await;
    config.merge(updates);
    if let Err(e) = config.save().await {
        eprintln!("Failed to save config: {}", e);
    }
    Json(ConfigResponse {
        config: config.clone(),
    })
}

/// Get available LLM providers
#[utoipa::path(
    get,
    path = "/api/v1/providers",
    tag = "providers",
    responses(
        (status = 200, description = "List of supported LLM providers", body = ProvidersResponse)
    )
)]
async fn get_providers() -> Json<ProvidersResponse> {
    Json(ProvidersResponse {
        providers: LlmProvider::all()
            .into_iter()
            .map(|p| ProviderInfo {
                id: serde_json::to_value(&p)
                    .ok()
                    .and_then(|v| v.as_str().map(ToString::to_string))
                    .unwrap_or_default(),
                name: p.display_name().to_string(),
                default_model: p.default_model().to_string(),
                env_var: p.env_var().to_string(),
            })
            .collect(),
    })
}

async fn serve_openapi() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// === Server Entry ===

async fn run_server(port: u16) -> anyhow::Result<()> {
    let persisted = PersistedConfig::load().await;
    let gateway = Arc::new(ToolGateway::new(persisted.gateway_config()));

    let state: SharedState = Arc::new(AppState {
        gateway,
        config: RwLock::new(persisted),
        last_summary: RwLock::new(None),
    });

    let outreach_routes = Router::new()
        .route("/run", post(run_outreach))
        .route("/status", get(get_status));

    let app = Router::new()
        .nest("/api/v1/outreach", outreach_routes)
        .route("/api/v1/config", get(get_config).patch(update_config))
        .route("/api/v1/providers", get(get_providers))
        .route("/api/v1/openapi.json", get(serve_openapi))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    println!("🚀 Prospect Server running at http://{}", addr);
    println!("   Outreach:  POST /api/v1/outreach/run (SSE), GET /status");
    println!("   Config:    /api/v1/config (GET, PATCH)");
    println!("   Providers: /api/v1/providers (GET)");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Run one pipeline from the CLI, printing status events as they happen.
async fn run_once(query: &str) -> anyhow::Result<()> {
    let persisted = PersistedConfig::load().await;
    let model = persisted.model_config();
    let chat: Arc<dyn ChatClient> = Arc::new(model.create_client()?);
    let gateway = Arc::new(ToolGateway::new(persisted.gateway_config()));

    let hub = Arc::new(StatusHub::new());
    let mut rx = hub.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            println!("[{:>10}] {}", event.phase.as_str(), event.message);
        }
    });

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            model,
            ..OrchestratorConfig::default()
        },
        chat,
        gateway.clone(),
        hub.clone(),
    );
    let result = orchestrator.run(query).await;
    gateway.disconnect().await;
    printer.abort();

    if result.success {
        let count = result.messages["messages"]
            .as_array()
            .map(|m| m.len())
            .unwrap_or(0);
        println!("✅ Run complete: {} messages in {:.1}s", count, result.timing.total_seconds);
        println!("{}", serde_json::to_string_pretty(&result.messages)?);
    } else {
        eprintln!(
            "❌ Run failed after {} attempts: {}",
            result.attempt_number,
            result.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    match args.command {
        Some(CliCommand::Run { query }) => run_once(&query).await,
        Some(CliCommand::Serve { port }) => run_server(port).await,
        None => run_server(8080).await,
    }
}
