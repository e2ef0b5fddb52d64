//! Clients for remote tool servers, one per transport.
//!
//! Stdio: spawned child with a background receive loop routing responses to
//! pending requests by ID. HTTP: one POST per request to the configured URL.
//! Both cache the `initialize` response and expose the same three calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};

use super::config::EndpointConfig;
use super::protocol::{
    initialize_params, InitializeResult, McpRequest, McpResponse, McpToolDef, McpToolResult,
    ToolCallParams, ToolsListResult,
};
use super::transport::StdioTransport;

/// Client over a spawned stdio tool server.
pub struct StdioMcpClient {
    endpoint_id: String,
    transport: Arc<StdioTransport>,
    next_id: AtomicI64,
    pending: Arc<RwLock<HashMap<i64, oneshot::Sender<Result<Value>>>>>,
    timeout: Duration,
    init: RwLock<Option<InitializeResult>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl StdioMcpClient {
    pub async fn connect(endpoint_id: &str, config: &EndpointConfig) -> Result<Self> {
        let transport =
            Arc::new(StdioTransport::spawn(&config.command, &config.args, &config.env).await?);

        let pending: Arc<RwLock<HashMap<i64, oneshot::Sender<Result<Value>>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        // Background receive loop; routes responses and fails all pending
        // requests if the child dies.
        let recv_transport = Arc::clone(&transport);
        let recv_pending = Arc::clone(&pending);
        let recv_id = endpoint_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!(endpoint = %recv_id, "shutting down receive loop");
                        break;
                    }
                    result = recv_transport.receive() => {
                        match result {
                            Ok(message) => {
                                if let Err(e) = route_message(&message, &recv_pending).await {
                                    tracing::error!(endpoint = %recv_id, "message error: {e}");
                                }
                            }
                            Err(e) => {
                                tracing::error!(endpoint = %recv_id, "receive error: {e}");
                                let mut pending = recv_pending.write().await;
                                for (_, tx) in pending.drain() {
                                    let _ = tx.send(Err(anyhow!("connection lost")));
                                }
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            endpoint_id: endpoint_id.to_string(),
            transport,
            next_id: AtomicI64::new(1),
            pending,
            timeout: config.call_timeout(),
            init: RwLock::new(None),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Perform the protocol handshake; the result is cached.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        if let Some(cached) = self.init.read().await.clone() {
            return Ok(cached);
        }

        let params = serde_json::to_value(initialize_params())?;
        let result: InitializeResult = self.request("initialize", Some(params)).await?;
        tracing::info!(
            endpoint = %self.endpoint_id,
            protocol = %result.protocol_version,
            "endpoint initialized"
        );

        self.notify("notifications/initialized").await?;
        *self.init.write().await = Some(result.clone());
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        let result: ToolsListResult = self.request("tools/list", None).await?;
        Ok(result.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpToolResult> {
        let params = ToolCallParams {
            name: name.to_string(),
            arguments: if arguments.is_null() {
                None
            } else {
                Some(arguments)
            },
        };
        self.request("tools/call", Some(serde_json::to_value(params)?))
            .await
    }

    pub async fn is_alive(&self) -> bool {
        self.transport.is_alive().await
    }

    async fn request<R: for<'de> serde::Deserialize<'de>>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let json = serde_json::to_string(&McpRequest::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(id, tx);
        self.transport.send(&json).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(serde_json::from_value(value)?),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(anyhow!("request cancelled")),
            Err(_) => {
                self.pending.write().await.remove(&id);
                Err(anyhow!(
                    "request timed out after {}s",
                    self.timeout.as_secs()
                ))
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<()> {
        #[derive(serde::Serialize)]
        struct Notification {
            jsonrpc: &'static str,
            method: String,
        }
        let json = serde_json::to_string(&Notification {
            jsonrpc: "2.0",
            method: method.to_string(),
        })?;
        self.transport.send(&json).await
    }
}

impl Drop for StdioMcpClient {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

async fn route_message(
    message: &str,
    pending: &RwLock<HashMap<i64, oneshot::Sender<Result<Value>>>>,
) -> Result<()> {
    let response: McpResponse = serde_json::from_str(message)?;

    if let Some(id) = response.id {
        let mut pending = pending.write().await;
        if let Some(tx) = pending.remove(&id) {
            if let Some(error) = response.error {
                let _ = tx.send(Err(anyhow!(
                    "endpoint error {}: {}",
                    error.code,
                    error.message
                )));
            } else {
                let _ = tx.send(Ok(response.result.unwrap_or(Value::Null)));
            }
        }
        return Ok(());
    }

    if let Some(method) = &response.method {
        tracing::debug!("endpoint notification: {method}");
    }
    Ok(())
}

/// Client over an HTTP endpoint: one JSON-RPC POST per request.
pub struct HttpMcpClient {
    endpoint_id: String,
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    next_id: AtomicI64,
    init: RwLock<Option<InitializeResult>>,
}

impl HttpMcpClient {
    pub fn new(endpoint_id: &str, config: &EndpointConfig) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            url: config.url.clone(),
            headers: config.headers.clone(),
            client: reqwest::Client::builder()
                .timeout(config.call_timeout())
                .build()
                .unwrap_or_default(),
            next_id: AtomicI64::new(1),
            init: RwLock::new(None),
        }
    }

    pub async fn initialize(&self) -> Result<InitializeResult> {
        if let Some(cached) = self.init.read().await.clone() {
            return Ok(cached);
        }

        let params = serde_json::to_value(initialize_params())?;
        let result: InitializeResult = self.request("initialize", Some(params)).await?;
        tracing::info!(
            endpoint = %self.endpoint_id,
            protocol = %result.protocol_version,
            "endpoint initialized"
        );
        *self.init.write().await = Some(result.clone());
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        let result: ToolsListResult = self.request("tools/list", None).await?;
        Ok(result.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpToolResult> {
        let params = ToolCallParams {
            name: name.to_string(),
            arguments: if arguments.is_null() {
                None
            } else {
                Some(arguments)
            },
        };
        self.request("tools/call", Some(serde_json::to_value(params)?))
            .await
    }

    async fn request<R: for<'de> serde::Deserialize<'de>>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = McpRequest::new(id, method, params);

        let mut request = self.client.post(&self.url).json(&frame);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| {
            anyhow!(
                "endpoint {} request failed: {e}",
                self.endpoint_id
            )
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!(
                "endpoint {} returned HTTP {status}",
                self.endpoint_id
            ));
        }

        let parsed: McpResponse = response.json().await?;
        if let Some(error) = parsed.error {
            return Err(anyhow!(
                "endpoint error {}: {}",
                error.code,
                error.message
            ));
        }
        Ok(serde_json::from_value(parsed.result.unwrap_or(Value::Null))?)
    }
}

/// Transport-erased handle used by the manager.
pub enum EndpointClient {
    Stdio(StdioMcpClient),
    Http(HttpMcpClient),
}

impl EndpointClient {
    pub async fn initialize(&self) -> Result<InitializeResult> {
        match self {
            Self::Stdio(c) => c.initialize().await,
            Self::Http(c) => c.initialize().await,
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        match self {
            Self::Stdio(c) => c.list_tools().await,
            Self::Http(c) => c.list_tools().await,
        }
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpToolResult> {
        match self {
            Self::Stdio(c) => c.call_tool(name, arguments).await,
            Self::Http(c) => c.call_tool(name, arguments).await,
        }
    }

    /// Stdio children can die; HTTP endpoints are probed per call.
    pub async fn is_alive(&self) -> bool {
        match self {
            Self::Stdio(c) => c.is_alive().await,
            Self::Http(_) => true,
        }
    }
}
