//! Main configuration file (YAML) and tool-manifest directory merge.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ai::LlmConfig;
use crate::mcp::EndpointConfig;
use crate::tools::manifest::{load_manifests_from_dir, ToolManifest};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_iterations: usize,
    /// Bytes; tool results above this are parked in the result store.
    pub large_result_threshold: usize,
    pub result_storage_dir: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            large_result_threshold: 50 * 1024,
            result_storage_dir: "tmp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Inline manifests; the tools directory takes precedence on name clash.
    pub tools: Vec<ToolManifest>,
    pub tools_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "data/conversations.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub log: LogSettings,
    pub llm: LlmConfig,
    pub agent: AgentSettings,
    pub security: SecuritySettings,
    /// Remote tool endpoints, keyed by endpoint ID.
    pub endpoints: HashMap<String, EndpointConfig>,
    pub database: DatabaseSettings,
    pub skills_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            log: LogSettings::default(),
            llm: LlmConfig {
                api_key: String::new(),
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4".to_string(),
            },
            agent: AgentSettings::default(),
            security: SecuritySettings {
                tools: Vec::new(),
                tools_dir: "tools".to_string(),
            },
            endpoints: HashMap::new(),
            database: DatabaseSettings::default(),
            skills_dir: "skills".to_string(),
        }
    }
}

impl Config {
    /// Load the config file and fold in the tools directory.
    ///
    /// Relative `tools_dir` and `skills_dir` resolve against the config
    /// file's directory. Manifests from the directory win over inline ones
    /// with the same name.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        let mut config: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("failed to parse config file {path:?}"))?;

        let config_dir = path.parent().unwrap_or_else(|| Path::new("."));

        if !config.security.tools_dir.is_empty() {
            let tools_dir = resolve(config_dir, &config.security.tools_dir);
            let mut tools = load_manifests_from_dir(&tools_dir)
                .with_context(|| format!("failed to load tools from {tools_dir:?}"))?;

            let dir_names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
            for tool in config.security.tools.drain(..) {
                if !dir_names.contains(&tool.name) {
                    tools.push(tool);
                }
            }
            config.security.tools = tools;
        }

        if !config.skills_dir.is_empty() {
            config.skills_dir = resolve(config_dir, &config.skills_dir)
                .to_string_lossy()
                .to_string();
        }

        Ok(config)
    }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p
    } else {
        base.join(p)
    }
}
