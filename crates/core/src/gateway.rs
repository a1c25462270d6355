//! # Tool Gateway
//!
//! Client for the external tool-invocation service. The service runs as a
//! child process speaking line-delimited JSON-RPC over stdio; the gateway
//! spawns it lazily on first use and keeps the connection for its own
//! lifetime.
//!
//! Connection setup is single-flight: the connection slot lives behind an
//! async mutex, so concurrent callers arriving during setup simply wait on
//! the lock instead of racing a second spawn. `call_tool` never retries -
//! retry policy belongs to the stage agents.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Default bound on connection establishment.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors surfaced by the gateway.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool service connection timed out after {0:?}")]
    ConnectionTimeout(Duration),
    #[error("failed to launch tool service: {0}")]
    Spawn(String),
    #[error("tool service io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tool service rejected the call: {0}")]
    Rpc(String),
    #[error("tool service closed the connection")]
    ChannelClosed,
}

/// One entry in the externally supplied tool catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's argument object
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// How to launch the tool service.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub command: String,
    pub args: Vec<String>,
    pub connect_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "firecrawl-mcp".to_string()],
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl GatewayConfig {
    /// Read the launch command from `PROSPECT_TOOL_CMD` ("cmd arg arg...").
    pub fn from_env() -> Self {
        match std::env::var("PROSPECT_TOOL_CMD") {
            Ok(raw) if !raw.trim().is_empty() => {
                let mut parts = raw.split_whitespace().map(ToString::to_string);
                let command = parts.next().unwrap_or_else(|| "npx".to_string());
                Self {
                    command,
                    args: parts.collect(),
                    connect_timeout: CONNECT_TIMEOUT,
                }
            }
            _ => Self::default(),
        }
    }
}

type PendingMap = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// Cloneable handles for issuing requests outside the connection lock, so
/// concurrent tool calls multiplex over one child process.
#[derive(Clone)]
struct RequestHandle {
    stdin: Arc<Mutex<ChildStdin>>,
    pending: PendingMap,
    next_id: Arc<AtomicU64>,
}

impl RequestHandle {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }

        let line = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        })
        .to_string();

        let write_result: Result<(), std::io::Error> = async {
            let mut stdin = self.stdin.lock().await;
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = write_result {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            return Err(ToolError::Io(e));
        }

        let response = rx.await.map_err(|_| ToolError::ChannelClosed)?;
        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(ToolError::Rpc(message.to_string()));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}

struct Connection {
    child: Child,
    handle: RequestHandle,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Spawn the tool service and complete the initialize handshake.
    async fn establish(config: &GatewayConfig) -> Result<Self, ToolError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Spawn(format!("{}: {}", config.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::Spawn("tool service stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Spawn("tool service stdout unavailable".to_string()))?;

        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(value) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                let Some(id) = value.get("id").and_then(|i| i.as_u64()) else {
                    continue; // notification, nothing waits on it
                };
                let sender = match reader_pending.lock() {
                    Ok(mut map) => map.remove(&id),
                    Err(_) => break,
                };
                if let Some(tx) = sender {
                    let _ = tx.send(value);
                }
            }
        });

        let connection = Self {
            child,
            handle: RequestHandle {
                stdin: Arc::new(Mutex::new(stdin)),
                pending,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            reader,
        };

        let handle = connection.handle.clone();
        let init = handle.request(
            "initialize",
            json!({
                "clientInfo": {"name": "prospect", "version": env!("CARGO_PKG_VERSION")}
            }),
        );
        let init_result = tokio::time::timeout(config.connect_timeout, init).await;
        match init_result {
            Ok(Ok(_)) => Ok(connection),
            Ok(Err(e)) => {
                connection.shutdown();
                Err(e)
            }
            Err(_) => {
                connection.shutdown();
                Err(ToolError::ConnectionTimeout(config.connect_timeout))
            }
        }
    }

    fn shutdown(mut self) {
        self.reader.abort();
        let _ = self.child.start_kill();
    }
}

/// Lazy-connecting client to the external tool-invocation service.
pub struct ToolGateway {
    config: GatewayConfig,
    conn: Mutex<Option<Connection>>,
}

impl ToolGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    /// Connect if necessary and return request handles.
    ///
    /// Holding the slot's mutex across `establish` is what makes connection
    /// setup single-flight; a failed attempt leaves the slot empty so the
    /// next caller tries again.
    async fn ensure_connected(&self) -> Result<RequestHandle, ToolError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let connection = Connection::establish(&self.config).await?;
            *guard = Some(connection);
        }
        match guard.as_ref() {
            Some(conn) => Ok(conn.handle.clone()),
            None => Err(ToolError::ChannelClosed),
        }
    }

    /// Release the tool service process. Safe to call when never connected,
    /// and repeatedly.
    pub async fn disconnect(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.shutdown();
        }
    }
}

/// The seam the stage agents invoke tools through.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError>;
    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, ToolError>;
}

#[async_trait]
impl ToolDispatch for ToolGateway {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        let handle = self.ensure_connected().await?;
        let result = handle.request("tools/list", json!({})).await?;
        Ok(parse_tool_list(&result))
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let handle = self.ensure_connected().await?;
        handle
            .request("tools/call", json!({"name": name, "arguments": args}))
            .await
    }
}

/// Parse a `tools/list` result into descriptors. Malformed entries are
/// skipped rather than failing the whole catalog.
fn parse_tool_list(result: &Value) -> Vec<ToolDescriptor> {
    result
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| serde_json::from_value(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_list() {
        let result = json!({
            "tools": [
                {"name": "search", "description": "Web search",
                 "inputSchema": {"type": "object"}},
                {"name": "scrape", "description": "Scrape a page"},
                {"bogus": true}
            ]
        });
        let tools = parse_tool_list(&result);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "search");
        assert_eq!(tools[1].input_schema, Value::Null);
    }

    #[test]
    fn test_parse_tool_list_tolerates_missing_field() {
        assert!(parse_tool_list(&json!({})).is_empty());
    }

    #[test]
    fn test_timeout_error_message() {
        let err = ToolError::ConnectionTimeout(Duration::from_secs(10));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_disconnect_without_connecting_is_safe() {
        let gateway = ToolGateway::new(GatewayConfig::default());
        gateway.disconnect().await;
        gateway.disconnect().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let gateway = ToolGateway::new(GatewayConfig {
            command: "prospect-test-no-such-binary".to_string(),
            args: vec![],
            connect_timeout: Duration::from_millis(200),
        });
        let err = gateway.list_tools().await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_unresponsive_service_times_out() {
        // `sleep` accepts stdin but never answers the initialize request.
        let gateway = ToolGateway::new(GatewayConfig {
            command: "sleep".to_string(),
            args: vec!["5".to_string()],
            connect_timeout: Duration::from_millis(200),
        });
        let err = gateway.list_tools().await.unwrap_err();
        assert!(matches!(err, ToolError::ConnectionTimeout(_)));
        gateway.disconnect().await;
    }
}
