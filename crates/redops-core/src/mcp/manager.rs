//! Manager for remote tool endpoints.
//!
//! Owns the live endpoint sessions, discovers their tools under an
//! `endpoint_id::tool` qualified name, filters them through the per-tool
//! enable map, and routes calls. Every call produces an execution row in the
//! shared log so local and remote invocations aggregate uniformly.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::tools::record::ExecutionLog;

use super::client::{EndpointClient, HttpMcpClient, StdioMcpClient};
use super::config::{EndpointConfig, EndpointTransport};
use super::protocol::{McpToolDef, McpToolResult};

/// Separator between endpoint ID and tool name in qualified names.
pub const QUALIFIER: &str = "::";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointHealth {
    Disconnected,
    Connected,
    Error(String),
}

/// Endpoint summary for listings.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    pub endpoint_id: String,
    pub transport: EndpointTransport,
    pub enabled: bool,
    pub health: EndpointHealth,
    pub tool_count: usize,
}

/// Remote tool manager.
pub struct RemoteToolManager {
    configs: RwLock<HashMap<String, EndpointConfig>>,
    clients: RwLock<HashMap<String, Arc<EndpointClient>>>,
    log: Arc<ExecutionLog>,
}

impl RemoteToolManager {
    pub fn new(log: Arc<ExecutionLog>) -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            log,
        }
    }

    pub async fn load_configs(&self, configs: HashMap<String, EndpointConfig>) {
        *self.configs.write().await = configs;
    }

    pub async fn upsert_config(&self, endpoint_id: &str, config: EndpointConfig) {
        self.configs
            .write()
            .await
            .insert(endpoint_id.to_string(), config);
    }

    pub async fn remove_config(&self, endpoint_id: &str) {
        self.configs.write().await.remove(endpoint_id);
        self.clients.write().await.remove(endpoint_id);
    }

    pub async fn get_configs(&self) -> HashMap<String, EndpointConfig> {
        self.configs.read().await.clone()
    }

    /// Connect every enabled endpoint. Individual failures are logged and
    /// skipped so one bad endpoint cannot block startup.
    pub async fn connect_all_enabled(&self) {
        let targets: Vec<String> = {
            let configs = self.configs.read().await;
            configs
                .iter()
                .filter(|(_, c)| c.enabled)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for endpoint_id in targets {
            if let Err(e) = self.connect(&endpoint_id).await {
                tracing::warn!(endpoint = %endpoint_id, "failed to connect endpoint: {e:#}");
            }
        }
    }

    /// Connect one endpoint: spawn/build the client, initialize, verify
    /// tool listing works.
    pub async fn connect(&self, endpoint_id: &str) -> Result<()> {
        let config = self
            .configs
            .read()
            .await
            .get(endpoint_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown endpoint: {endpoint_id}"))?;

        self.disconnect(endpoint_id).await;

        let client = match config.transport {
            EndpointTransport::Stdio => {
                EndpointClient::Stdio(StdioMcpClient::connect(endpoint_id, &config).await?)
            }
            EndpointTransport::Http => {
                EndpointClient::Http(HttpMcpClient::new(endpoint_id, &config))
            }
        };

        client.initialize().await?;
        let tools = client.list_tools().await?;
        tracing::info!(
            endpoint = %endpoint_id,
            tools = tools.len(),
            "connected to tool endpoint"
        );

        self.clients
            .write()
            .await
            .insert(endpoint_id.to_string(), Arc::new(client));
        Ok(())
    }

    pub async fn disconnect(&self, endpoint_id: &str) {
        if self.clients.write().await.remove(endpoint_id).is_some() {
            tracing::info!(endpoint = %endpoint_id, "disconnected tool endpoint");
        }
    }

    /// Discover all enabled tools across connected endpoints, qualified as
    /// `endpoint_id::tool` and filtered by the per-tool enable map.
    pub async fn get_all_tools(&self) -> Vec<(String, McpToolDef)> {
        let clients = self.clients.read().await;
        let configs = self.configs.read().await;

        let mut tools = Vec::new();
        for (endpoint_id, client) in clients.iter() {
            let Some(config) = configs.get(endpoint_id) else {
                continue;
            };
            if !config.enabled {
                continue;
            }

            match client.list_tools().await {
                Ok(defs) => {
                    for def in defs {
                        if !config.tool_is_enabled(&def.name) {
                            continue;
                        }
                        tools.push((format!("{endpoint_id}{QUALIFIER}{}", def.name), def));
                    }
                }
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint_id, "tool discovery failed: {e}");
                }
            }
        }
        tools
    }

    /// Call `endpoint_id::tool` with the given arguments.
    ///
    /// Returns the result plus the execution ID recorded for the call. No
    /// retries happen at this layer.
    pub async fn call_tool(
        &self,
        qualified_name: &str,
        arguments: HashMap<String, Value>,
    ) -> (Result<McpToolResult>, String) {
        let Some((endpoint_id, tool_name)) = qualified_name.split_once(QUALIFIER) else {
            return (
                Err(anyhow!(
                    "invalid remote tool name (expected endpoint{QUALIFIER}tool): {qualified_name}"
                )),
                String::new(),
            );
        };

        let execution_id = self.log.begin(qualified_name, &arguments);

        let client = { self.clients.read().await.get(endpoint_id).cloned() };
        let Some(client) = client else {
            let err = anyhow!("endpoint not connected: {endpoint_id}");
            self.log.fail(&execution_id, &err.to_string());
            return (Err(err), execution_id);
        };

        if !client.is_alive().await {
            let err = anyhow!("endpoint {endpoint_id} is unhealthy (process died)");
            self.log.fail(&execution_id, &err.to_string());
            return (Err(err), execution_id);
        }

        let args_value = Value::Object(arguments.into_iter().collect());
        match client.call_tool(tool_name, args_value).await {
            Ok(result) => {
                if result.is_error {
                    self.log.fail(&execution_id, &result.text());
                } else {
                    self.log.complete(&execution_id, &result.text());
                }
                (Ok(result), execution_id)
            }
            Err(e) => {
                self.log.fail(&execution_id, &format!("{e:#}"));
                (Err(e), execution_id)
            }
        }
    }

    /// Endpoint summaries for monitoring.
    pub async fn list_endpoints(&self) -> Vec<EndpointInfo> {
        let configs = self.configs.read().await;
        let clients = self.clients.read().await;

        let mut endpoints = Vec::new();
        for (endpoint_id, config) in configs.iter() {
            let (health, tool_count) = match clients.get(endpoint_id) {
                Some(client) => {
                    if client.is_alive().await {
                        let count = client.list_tools().await.map(|t| t.len()).unwrap_or(0);
                        (EndpointHealth::Connected, count)
                    } else {
                        (EndpointHealth::Error("process died".to_string()), 0)
                    }
                }
                None => (EndpointHealth::Disconnected, 0),
            };
            endpoints.push(EndpointInfo {
                endpoint_id: endpoint_id.clone(),
                transport: config.transport,
                enabled: config.enabled,
                health,
                tool_count,
            });
        }
        endpoints.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        endpoints
    }
}
