//! Per-endpoint configuration for remote tool servers.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointTransport {
    #[default]
    Stdio,
    Http,
}

/// Configuration of one remote endpoint.
///
/// Stdio endpoints declare `command`/`args`/`env`; HTTP endpoints declare
/// `url`/`headers`. `tool_enabled` filters individual tools after discovery;
/// a tool absent from the map is enabled, so newly added upstream tools show
/// up without a config change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub transport: EndpointTransport,

    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub description: String,
    /// Per-call timeout in seconds.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tool_enabled: HashMap<String, bool>,
}

impl EndpointConfig {
    pub fn call_timeout(&self) -> Duration {
        let secs = if self.timeout == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            self.timeout
        };
        Duration::from_secs(secs)
    }

    /// Whether a discovered tool should be surfaced.
    pub fn tool_is_enabled(&self, tool_name: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.tool_enabled.get(tool_name).copied().unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_tool_entries_default_to_enabled() {
        let config = EndpointConfig {
            enabled: true,
            tool_enabled: HashMap::from([("blocked".to_string(), false)]),
            ..Default::default()
        };

        assert!(config.tool_is_enabled("brand_new_tool"));
        assert!(!config.tool_is_enabled("blocked"));
    }

    #[test]
    fn disabled_endpoint_disables_everything() {
        let config = EndpointConfig {
            enabled: false,
            tool_enabled: HashMap::from([("allowed".to_string(), true)]),
            ..Default::default()
        };
        assert!(!config.tool_is_enabled("allowed"));
    }

    #[test]
    fn timeout_defaults_when_unset() {
        let config = EndpointConfig::default();
        assert_eq!(config.call_timeout(), Duration::from_secs(30));

        let custom = EndpointConfig {
            timeout: 5,
            ..Default::default()
        };
        assert_eq!(custom.call_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = r#"
transport: http
url: http://127.0.0.1:8081/mcp
headers:
  x-api-key: secret
timeout: 10
enabled: true
tool_enabled:
  slow_tool: false
"#;
        let config: EndpointConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.transport, EndpointTransport::Http);
        assert_eq!(config.url, "http://127.0.0.1:8081/mcp");
        assert!(!config.tool_is_enabled("slow_tool"));
        assert!(config.tool_is_enabled("fast_tool"));
    }
}
