//! Unified tool registry.
//!
//! One flat view over three tool populations: locally-declared manifests,
//! remote endpoint tools, and builtin meta-tools. Remote tools carry their
//! `endpoint::tool` qualified name plus an LLM-safe `endpoint__tool` alias,
//! since most model endpoints restrict function names to `[A-Za-z0-9_-]`.
//! The registry owns the bidirectional alias map and accepts either form on
//! `call`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::mcp::{RemoteToolManager, QUALIFIER};
use crate::skills::SkillsManager;
use crate::storage::FileResultStore;

use super::command;
use super::manifest::ToolManifest;
use super::meta;
use super::record::{ExecutionFilter, ExecutionLog, ExecutionRecord, ToolStats};

/// LLM-safe replacement for the qualified-name separator.
const ALIAS_SEPARATOR: &str = "__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolOrigin {
    Local,
    Remote { endpoint_id: String },
    Builtin,
}

/// Catalogue entry for one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// LLM-safe name (equal to `qualified_name` for local and builtin tools).
    pub name: String,
    pub qualified_name: String,
    pub description: String,
    pub input_schema: Value,
    pub origin: ToolOrigin,
}

/// Result of one registry dispatch.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub text: String,
    pub execution_id: String,
    pub is_error: bool,
}

pub struct ToolRegistry {
    local: HashMap<String, ToolManifest>,
    remote: Option<Arc<RemoteToolManager>>,
    store: Arc<FileResultStore>,
    skills: Arc<SkillsManager>,
    log: Arc<ExecutionLog>,
    /// llm_safe_name -> qualified_name, rebuilt on every listing.
    aliases: RwLock<HashMap<String, String>>,
}

impl ToolRegistry {
    pub fn new(
        manifests: Vec<ToolManifest>,
        remote: Option<Arc<RemoteToolManager>>,
        store: Arc<FileResultStore>,
        skills: Arc<SkillsManager>,
        log: Arc<ExecutionLog>,
    ) -> Self {
        let mut local = HashMap::new();
        for manifest in manifests {
            if !manifest.enabled {
                tracing::debug!(tool = %manifest.name, "skipping disabled tool");
                continue;
            }
            tracing::info!(tool = %manifest.name, command = %manifest.command, "registered local tool");
            local.insert(manifest.name.clone(), manifest);
        }

        Self {
            local,
            remote,
            store,
            skills,
            log,
            aliases: RwLock::new(HashMap::new()),
        }
    }

    pub fn execution_log(&self) -> &Arc<ExecutionLog> {
        &self.log
    }

    /// Unified catalogue: enabled local tools, enabled remote tools, and
    /// builtins. Rebuilds the alias map as a side effect so `call` can
    /// translate LLM-safe names back.
    pub async fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = Vec::new();

        for manifest in self.local.values() {
            tools.push(ToolDefinition {
                name: manifest.name.clone(),
                qualified_name: manifest.name.clone(),
                description: manifest.catalogue_description(),
                input_schema: manifest.input_schema(),
                origin: ToolOrigin::Local,
            });
        }

        let mut aliases = HashMap::new();
        if let Some(remote) = &self.remote {
            for (qualified_name, def) in remote.get_all_tools().await {
                let llm_safe = qualified_name.replace(QUALIFIER, ALIAS_SEPARATOR);
                aliases.insert(llm_safe.clone(), qualified_name.clone());

                let endpoint_id = qualified_name
                    .split_once(QUALIFIER)
                    .map(|(ep, _)| ep.to_string())
                    .unwrap_or_default();
                let description = def
                    .short_description
                    .or(def.description)
                    .unwrap_or_default();
                tools.push(ToolDefinition {
                    name: llm_safe,
                    qualified_name,
                    description,
                    input_schema: def.input_schema,
                    origin: ToolOrigin::Remote { endpoint_id },
                });
            }
        }
        *self.aliases.write().await = aliases;

        for (name, description, input_schema) in meta::builtin_definitions() {
            tools.push(ToolDefinition {
                name: name.clone(),
                qualified_name: name,
                description,
                input_schema,
                origin: ToolOrigin::Builtin,
            });
        }

        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Dispatch one tool call by origin.
    ///
    /// Tool-level failures (bad arguments, non-zero exit, remote error
    /// content) come back as an error-flagged outcome; `Err` is reserved for
    /// unknown tools and transport-level faults the model should be told
    /// about in structured form by the caller.
    pub async fn call(
        &self,
        name: &str,
        args: &HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome> {
        let qualified = self.resolve_name(name).await;

        // Builtins run in-process.
        if let Some(output) = meta::call_builtin(&qualified, args, &self.store, &self.skills) {
            let execution_id = self.log.begin(&qualified, args);
            if output.is_error {
                self.log.fail(&execution_id, &output.text);
            } else {
                self.log.complete(&execution_id, &output.text);
            }
            return Ok(CallOutcome {
                text: output.text,
                execution_id,
                is_error: output.is_error,
            });
        }

        // Remote tools carry their endpoint qualifier.
        if qualified.contains(QUALIFIER) {
            let Some(remote) = &self.remote else {
                return Err(anyhow!("no remote endpoints configured"));
            };
            let (result, execution_id) = remote.call_tool(&qualified, args.clone()).await;
            let result = result?;
            return Ok(CallOutcome {
                text: result.text(),
                execution_id,
                is_error: result.is_error,
            });
        }

        let Some(manifest) = self.local.get(&qualified) else {
            return Err(anyhow!("tool {qualified} not found or not enabled"));
        };

        let execution_id = self.log.begin(&qualified, args);
        let output = command::invoke(manifest, args, cancel).await;
        if output.is_error {
            self.log.fail(&execution_id, &output.text);
        } else {
            self.log.complete(&execution_id, &output.text);
        }

        Ok(CallOutcome {
            text: output.text,
            execution_id,
            is_error: output.is_error,
        })
    }

    /// Translate an LLM-safe alias back to its qualified name. Unmapped
    /// names pass through unchanged.
    async fn resolve_name(&self, name: &str) -> String {
        if let Some(qualified) = self.aliases.read().await.get(name) {
            return qualified.clone();
        }
        name.to_string()
    }

    pub fn get_execution(&self, id: &str) -> Option<ExecutionRecord> {
        self.log.get(id)
    }

    pub fn list_executions(
        &self,
        filter: &ExecutionFilter,
        page: usize,
        limit: usize,
    ) -> Vec<ExecutionRecord> {
        self.log.list(filter, page, limit)
    }

    pub fn get_stats(&self) -> Vec<ToolStats> {
        self.log.stats()
    }
}
