//! Out-of-process tool servers (MCP).
//!
//! Servers speak line-delimited JSON-RPC 2.0 over a byte stream, normally a
//! child process's stdio. This module provides:
//! - `mcp.json` configuration with per-server and global timeouts
//! - a generic line transport over any async reader/writer pair
//! - connection setup (`initialize`, `tools/list`) and `tools/call`
//! - a pool that exposes discovered tools to the registry as `mcp_{server}_{tool}`

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex as AsyncMutex;

use crate::logging;
use crate::models::ContentChunk;
use crate::tools::{ToolContext, ToolError, ToolResult, ToolSpec};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// A `tools/call` that outlived the server's execute timeout.
#[derive(Debug, Error)]
#[error("MCP tool '{tool}' on server '{server}' timed out after {seconds}s")]
pub struct McpCallTimeout {
    pub server: String,
    pub tool: String,
    pub seconds: u64,
}

// === Configuration Types ===

/// Full MCP configuration from mcp.json
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct McpConfig {
    #[serde(default)]
    pub timeouts: McpTimeouts,
    #[serde(default, alias = "mcpServers")]
    pub servers: HashMap<String, McpServerConfig>,
}

/// Global timeout configuration, in seconds
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[allow(clippy::struct_field_names)]
pub struct McpTimeouts {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_execute_timeout")]
    pub execute_timeout: u64,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_execute_timeout() -> u64 {
    60
}

impl Default for McpTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            execute_timeout: default_execute_timeout(),
        }
    }
}

/// Configuration for a single MCP server
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct McpServerConfig {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub connect_timeout: Option<u64>,
    #[serde(default)]
    pub execute_timeout: Option<u64>,
    #[serde(default)]
    pub disabled: bool,
}

impl McpServerConfig {
    pub fn effective_connect_timeout(&self, global: &McpTimeouts) -> u64 {
        self.connect_timeout.unwrap_or(global.connect_timeout)
    }

    pub fn effective_execute_timeout(&self, global: &McpTimeouts) -> u64 {
        self.execute_timeout.unwrap_or(global.execute_timeout)
    }
}

impl McpConfig {
    /// Load `path`, or an empty config when the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read MCP config: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse MCP config: {}", path.display()))
    }
}

// === MCP Tool Definition ===

/// Tool discovered from an MCP server
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Disconnected,
}

// === Transport ===

#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn send(&mut self, msg: Value) -> Result<()>;
    async fn recv(&mut self) -> Result<Value>;
}

/// One JSON message per line in each direction.
pub struct LineTransport<R, W> {
    reader: R,
    writer: W,
    _child: Option<Child>,
}

/// Transport to a spawned server process.
pub type StdioTransport = LineTransport<BufReader<ChildStdout>, ChildStdin>;

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send + Sync,
    W: AsyncWrite + Unpin + Send + Sync,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            _child: None,
        }
    }
}

impl StdioTransport {
    /// Spawn the server process; it is killed when the transport drops.
    pub fn spawn(name: &str, config: &McpServerConfig) -> Result<Self> {
        let command = config
            .command
            .as_deref()
            .with_context(|| format!("MCP server '{name}' config must have a 'command'"))?;

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn MCP server '{name}'"))?;
        let stdin = child.stdin.take().context("Failed to get MCP stdin")?;
        let stdout = child.stdout.take().context("Failed to get MCP stdout")?;

        Ok(Self {
            reader: BufReader::new(stdout),
            writer: stdin,
            _child: Some(child),
        })
    }
}

#[async_trait]
impl<R, W> McpTransport for LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send + Sync,
    W: AsyncWrite + Unpin + Send + Sync,
{
    async fn send(&mut self, msg: Value) -> Result<()> {
        let line = serde_json::to_string(&msg)? + "\n";
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Value> {
        let mut line = String::new();
        loop {
            line.clear();
            let bytes = self.reader.read_line(&mut line).await?;
            if bytes == 0 {
                anyhow::bail!("MCP transport closed");
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => return Ok(value),
                Err(err) => logging::debug(format!("Skipping non-JSON MCP line: {err}")),
            }
        }
    }
}

// === McpConnection ===

/// A single initialized connection to an MCP server
pub struct McpConnection {
    name: String,
    transport: Option<Box<dyn McpTransport>>,
    tools: Vec<McpTool>,
    request_id: AtomicU64,
    state: ConnectionState,
    execute_timeout: Duration,
}

impl McpConnection {
    /// Spawn the configured server and initialize it
    pub async fn connect(
        name: String,
        config: &McpServerConfig,
        global_timeouts: &McpTimeouts,
    ) -> Result<Self> {
        let transport = StdioTransport::spawn(&name, config)?;
        Self::establish(
            name,
            Box::new(transport),
            Duration::from_secs(config.effective_connect_timeout(global_timeouts)),
            Duration::from_secs(config.effective_execute_timeout(global_timeouts)),
        )
        .await
    }

    /// Run the handshake and tool discovery over an existing transport
    pub async fn establish(
        name: String,
        transport: Box<dyn McpTransport>,
        connect_timeout: Duration,
        execute_timeout: Duration,
    ) -> Result<Self> {
        let mut conn = Self {
            name: name.clone(),
            transport: Some(transport),
            tools: Vec::new(),
            request_id: AtomicU64::new(1),
            state: ConnectionState::Connecting,
            execute_timeout,
        };

        tokio::time::timeout(connect_timeout, conn.initialize())
            .await
            .with_context(|| format!("MCP server '{name}' initialization timed out"))??;

        conn.state = ConnectionState::Ready;
        tokio::time::timeout(connect_timeout, conn.discover_tools())
            .await
            .with_context(|| format!("MCP server '{name}' discovery timed out"))??;

        logging::info(format!(
            "MCP server '{name}' ready with {} tool(s)",
            conn.tools.len()
        ));
        Ok(conn)
    }

    /// Send initialize request and wait for response
    async fn initialize(&mut self) -> Result<()> {
        let init_id = self.next_id();
        self.send(json!({
            "jsonrpc": "2.0",
            "id": init_id,
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "clientInfo": {
                    "name": "deepseek-agent",
                    "version": env!("CARGO_PKG_VERSION")
                },
                "capabilities": { "tools": {} }
            }
        }))
        .await?;

        let response = self.recv(init_id).await?;
        if let Some(error) = response.get("error") {
            anyhow::bail!("MCP server '{}' rejected initialize: {error}", self.name);
        }

        // Notification: no id, no response expected
        self.send(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .await
    }

    /// Page through `tools/list`
    async fn discover_tools(&mut self) -> Result<()> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = self.request("tools/list", params).await?;
            if let Some(list) = result.get("tools") {
                let page: Vec<McpTool> = serde_json::from_value(list.clone())
                    .with_context(|| format!("Invalid tools/list from '{}'", self.name))?;
                tools.extend(page);
            }
            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        self.tools = tools;
        Ok(())
    }

    /// Invoke a tool, bounded by the execute timeout
    pub async fn call_tool(&mut self, tool_name: &str, arguments: Value) -> Result<Value> {
        let timeout = self.execute_timeout;
        tokio::time::timeout(
            timeout,
            self.request(
                "tools/call",
                json!({
                    "name": tool_name,
                    "arguments": arguments
                }),
            ),
        )
        .await
        .map_err(|_| {
            anyhow::Error::new(McpCallTimeout {
                server: self.name.clone(),
                tool: tool_name.to_string(),
                seconds: timeout.as_secs(),
            })
        })?
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        if self.state != ConnectionState::Ready {
            anyhow::bail!(
                "Failed to call MCP method '{method}': connection '{}' is not ready",
                self.name
            );
        }

        let call_id = self.next_id();
        self.send(json!({
            "jsonrpc": "2.0",
            "id": call_id,
            "method": method,
            "params": params
        }))
        .await?;

        let response = self.recv(call_id).await?;
        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_string);
            anyhow::bail!("MCP error in '{method}': {message}");
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    pub fn tools(&self) -> &[McpTool] {
        &self.tools
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn send(&mut self, msg: Value) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            anyhow::bail!("MCP connection '{}' is closed", self.name);
        };
        if let Err(err) = transport.send(msg).await {
            self.state = ConnectionState::Disconnected;
            return Err(err);
        }
        Ok(())
    }

    /// Wait for the response to `expected_id`, skipping notifications and stale replies
    async fn recv(&mut self, expected_id: u64) -> Result<Value> {
        loop {
            let Some(transport) = self.transport.as_mut() else {
                anyhow::bail!("MCP connection '{}' is closed", self.name);
            };
            let value = match transport.recv().await {
                Ok(value) => value,
                Err(err) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(err);
                }
            };
            if value.get("id").and_then(Value::as_u64) == Some(expected_id) {
                return Ok(value);
            }
        }
    }

    /// Drop the transport, killing a spawned server
    pub fn close(&mut self) {
        self.transport = None;
        self.state = ConnectionState::Disconnected;
    }
}

// === McpPool ===

type SharedConnection = Arc<AsyncMutex<McpConnection>>;

/// Connections to every configured server
pub struct McpPool {
    connections: HashMap<String, SharedConnection>,
    config: McpConfig,
}

impl McpPool {
    pub fn new(config: McpConfig) -> Self {
        Self {
            connections: HashMap::new(),
            config,
        }
    }

    pub fn from_config_path(path: &Path) -> Result<Self> {
        Ok(Self::new(McpConfig::load(path)?))
    }

    /// Connect to all enabled servers, returning errors for failed connections
    pub async fn connect_all(&mut self) -> Vec<(String, anyhow::Error)> {
        let mut names: Vec<String> = self
            .config
            .servers
            .iter()
            .filter(|(_, server)| !server.disabled)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();

        let mut errors = Vec::new();
        for name in names {
            let Some(server) = self.config.servers.get(&name).cloned() else {
                continue;
            };
            logging::info(format!("Starting MCP server '{name}'"));
            match McpConnection::connect(name.clone(), &server, &self.config.timeouts).await {
                Ok(conn) => self.insert_connection(conn),
                Err(err) => {
                    logging::warn(format!("MCP server '{name}' failed to start: {err:#}"));
                    errors.push((name, err));
                }
            }
        }
        errors
    }

    /// Add an already-established connection
    pub fn insert_connection(&mut self, conn: McpConnection) {
        self.connections
            .insert(conn.name().to_string(), Arc::new(AsyncMutex::new(conn)));
    }

    /// Registry handlers for every discovered tool, named `mcp_{server}_{tool}`
    pub async fn tool_handlers(&self) -> Vec<Arc<dyn ToolSpec>> {
        let mut servers: Vec<(&String, &SharedConnection)> = self.connections.iter().collect();
        servers.sort_by(|a, b| a.0.cmp(b.0));

        let mut handlers: Vec<Arc<dyn ToolSpec>> = Vec::new();
        for (server, conn) in servers {
            let tools = conn.lock().await.tools().to_vec();
            for tool in tools {
                handlers.push(Arc::new(McpToolHandler::new(server, tool, conn.clone())));
            }
        }
        handlers
    }

    pub fn server_names(&self) -> Vec<&str> {
        self.config.servers.keys().map(String::as_str).collect()
    }

    pub fn connected_servers(&self) -> Vec<&str> {
        self.connections.keys().map(String::as_str).collect()
    }

    /// Close every connection and forget it
    pub async fn disconnect_all(&mut self) {
        for (name, conn) in self.connections.drain() {
            conn.lock().await.close();
            logging::debug(format!("Disconnected MCP server '{name}'"));
        }
    }

    pub fn config(&self) -> &McpConfig {
        &self.config
    }

    pub fn is_mcp_tool(name: &str) -> bool {
        name.starts_with("mcp_")
    }
}

// === Registry adapter ===

/// Exposes one server tool through the `ToolSpec` contract
pub struct McpToolHandler {
    prefixed_name: String,
    description: String,
    tool: McpTool,
    connection: SharedConnection,
}

impl McpToolHandler {
    fn new(server: &str, tool: McpTool, connection: SharedConnection) -> Self {
        let description = tool
            .description
            .clone()
            .unwrap_or_else(|| format!("Tool '{}' from MCP server '{server}'", tool.name));
        Self {
            prefixed_name: format!("mcp_{server}_{}", tool.name),
            description,
            tool,
            connection,
        }
    }
}

#[async_trait]
impl ToolSpec for McpToolHandler {
    fn name(&self) -> &str {
        &self.prefixed_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        if self.tool.input_schema.is_null() {
            json!({"type": "object", "properties": {}})
        } else {
            self.tool.input_schema.clone()
        }
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let result = self
            .connection
            .lock()
            .await
            .call_tool(&self.tool.name, input)
            .await
            .map_err(call_error)?;
        Ok(tool_result_from_value(&result))
    }
}

fn call_error(err: anyhow::Error) -> ToolError {
    match err.downcast_ref::<McpCallTimeout>() {
        Some(timeout) => ToolError::Timeout {
            seconds: timeout.seconds,
        },
        None => ToolError::execution_failed(format!("MCP tool failed: {err:#}")),
    }
}

/// Map a `tools/call` result onto content chunks and the error flag
pub fn tool_result_from_value(result: &Value) -> ToolResult {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let Some(items) = result.get("content").and_then(Value::as_array) else {
        let rendered = serde_json::to_string_pretty(result).unwrap_or_default();
        return ToolResult::chunks(vec![ContentChunk::text(rendered)], !is_error);
    };

    let chunks = items.iter().filter_map(content_chunk).collect();
    ToolResult::chunks(chunks, !is_error)
}

fn content_chunk(item: &Value) -> Option<ContentChunk> {
    let str_field =
        |value: &Value, key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
    match item.get("type")?.as_str()? {
        "text" => Some(ContentChunk::text(str_field(item, "text")?)),
        "image" => Some(ContentChunk::Image {
            data: str_field(item, "data").unwrap_or_default(),
            mime_type: str_field(item, "mimeType").unwrap_or_default(),
        }),
        "audio" => Some(ContentChunk::Audio {
            data: str_field(item, "data").unwrap_or_default(),
            mime_type: str_field(item, "mimeType").unwrap_or_default(),
        }),
        "resource" => {
            let resource = item.get("resource")?;
            Some(ContentChunk::Resource {
                uri: str_field(resource, "uri")?,
                mime_type: str_field(resource, "mimeType"),
                text: str_field(resource, "text"),
            })
        }
        other => Some(ContentChunk::text(format!("[{other} content]"))),
    }
}

// === Unit Tests ===
