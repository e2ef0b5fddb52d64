//! Declarative manifests for local command-line tools.
//!
//! A manifest names a command, its fixed arguments, an exit-code allow-list,
//! and a parameter schema that drives both argv construction and the JSON
//! schema shown to the model. Manifests live either inline in the main config
//! or as one YAML file per tool in a tools directory.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// How a parameter is rendered into argv.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamFormat {
    /// `--flag value` (two argv entries); booleans emit the flag alone.
    #[default]
    Flag,
    /// `--flag=value` as a single argv entry.
    Combined,
    /// Bare value at the declared position.
    Positional,
    /// Whitespace-split expansion of `template` with `{flag}`/`{value}`/`{name}`.
    Template,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Int,
    Bool,
    Array,
}

/// One declared parameter of a local tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    /// Command-line flag, e.g. `-p` or `--url`.
    #[serde(default)]
    pub flag: Option<String>,
    /// Ordinal for positional parameters; a parameter is positional iff set.
    #[serde(default)]
    pub position: Option<usize>,
    #[serde(default)]
    pub format: ParamFormat,
    #[serde(default)]
    pub template: Option<String>,
    /// Allowed values, surfaced to the model as a JSON-schema enum.
    #[serde(default)]
    pub options: Vec<String>,
}

/// Declarative description of a local tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolManifest {
    pub name: String,
    pub command: String,
    /// Fixed arguments prepended before any parameter output.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Exit codes treated as success besides zero. Several scanners report
    /// findings through a non-zero exit.
    #[serde(default)]
    pub allowed_exit_codes: Vec<i32>,
}

impl ToolManifest {
    /// Short description for the model catalogue: the explicit short form,
    /// else the first line (or first 100 chars) of the long description.
    pub fn catalogue_description(&self) -> String {
        if !self.short_description.is_empty() {
            return self.short_description.clone();
        }
        let desc = &self.description;
        if desc.len() <= 100 {
            return desc.clone();
        }
        match desc.find('\n') {
            Some(idx) if idx > 0 && idx < 100 => desc[..idx].trim().to_string(),
            _ => {
                let mut end = 100;
                while end > 0 && !desc.is_char_boundary(end) {
                    end -= 1;
                }
                format!("{}...", &desc[..end])
            }
        }
    }

    /// JSON schema for the model, built from the declared parameters.
    pub fn input_schema(&self) -> Value {
        // The exec tool bypasses parameter mapping; when its manifest
        // declares nothing, the model still needs the passthrough shape.
        if self.name == "exec" && self.parameters.is_empty() {
            return json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "Shell command to execute"
                    },
                    "shell": {
                        "type": "string",
                        "description": "Shell to use (default sh)"
                    },
                    "workdir": {
                        "type": "string",
                        "description": "Working directory (optional)"
                    }
                },
                "required": ["command"]
            });
        }

        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for param in &self.parameters {
            let mut prop = serde_json::Map::new();
            prop.insert("type".into(), json!(schema_type(param.param_type)));
            prop.insert("description".into(), json!(param.description));
            if let Some(default) = &param.default {
                prop.insert("default".into(), default.clone());
            }
            if !param.options.is_empty() {
                prop.insert("enum".into(), json!(param.options));
            }
            properties.insert(param.name.clone(), Value::Object(prop));
            if param.required {
                required.push(param.name.clone());
            }
        }

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

fn schema_type(t: ParamType) -> &'static str {
    match t {
        ParamType::String => "string",
        ParamType::Int => "number",
        ParamType::Bool => "boolean",
        ParamType::Array => "array",
    }
}

/// Load a single manifest file, validating the fields the runtime relies on.
pub fn load_manifest_file(path: &Path) -> Result<ToolManifest> {
    let data =
        fs::read_to_string(path).with_context(|| format!("failed to read manifest {path:?}"))?;
    let manifest: ToolManifest = serde_yaml::from_str(&data)
        .with_context(|| format!("failed to parse manifest {path:?}"))?;

    if manifest.name.is_empty() {
        bail!("manifest {path:?} has an empty tool name");
    }
    if manifest.command.is_empty() {
        bail!("manifest {path:?} has an empty command");
    }
    Ok(manifest)
}

/// Load every `.yaml`/`.yml` manifest in a directory.
///
/// A missing directory yields an empty list; an individual file that fails to
/// parse is skipped with a warning so one bad manifest cannot take down the
/// whole catalogue.
pub fn load_manifests_from_dir(dir: &Path) -> Result<Vec<ToolManifest>> {
    let mut manifests = Vec::new();
    if !dir.exists() {
        return Ok(manifests);
    }

    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read tools dir {dir:?}"))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }

        match load_manifest_file(&path) {
            Ok(manifest) => manifests.push(manifest),
            Err(e) => {
                tracing::warn!(path = ?path, "skipping tool manifest: {e:#}");
            }
        }
    }
    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const PORT_SCAN_YAML: &str = r#"
name: port_scan
command: nmap
args: ["-sT", "-sV"]
short_description: Scan a host for open TCP ports
description: |
  Full TCP connect scan with service detection.
  Use ports to narrow the range.
enabled: true
allowed_exit_codes: [1]
parameters:
  - name: target
    type: string
    description: Target IP or hostname
    required: true
    position: 0
    format: positional
  - name: ports
    type: string
    description: "Port range, e.g. 1-1000"
    flag: "-p"
"#;

    #[test]
    fn parses_full_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("port_scan.yaml");
        fs::write(&path, PORT_SCAN_YAML).unwrap();

        let manifest = load_manifest_file(&path).unwrap();
        assert_eq!(manifest.name, "port_scan");
        assert_eq!(manifest.command, "nmap");
        assert_eq!(manifest.args, vec!["-sT", "-sV"]);
        assert_eq!(manifest.allowed_exit_codes, vec![1]);
        assert_eq!(manifest.parameters.len(), 2);
        assert_eq!(manifest.parameters[0].position, Some(0));
        assert_eq!(manifest.parameters[1].flag.as_deref(), Some("-p"));
    }

    #[test]
    fn unknown_parameter_format_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(
            &path,
            "name: bad\ncommand: x\nparameters:\n  - name: p\n    type: string\n    format: wacky\n",
        )
        .unwrap();

        assert!(load_manifest_file(&path).is_err());
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fwd.yaml");
        fs::write(
            &path,
            "name: fwd\ncommand: echo\nenabled: true\nfuture_field: 7\n",
        )
        .unwrap();

        let manifest = load_manifest_file(&path).unwrap();
        assert_eq!(manifest.name, "fwd");
    }

    #[test]
    fn empty_name_or_command_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.yaml");
        fs::write(&path, "name: \"\"\ncommand: x\n").unwrap();
        assert!(load_manifest_file(&path).is_err());

        fs::write(&path, "name: x\ncommand: \"\"\n").unwrap();
        assert!(load_manifest_file(&path).is_err());
    }

    #[test]
    fn dir_loader_skips_broken_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ok.yaml"), "name: ok\ncommand: echo\n").unwrap();
        let mut bad = fs::File::create(dir.path().join("bad.yaml")).unwrap();
        bad.write_all(b"name: [unclosed").unwrap();
        fs::write(dir.path().join("notes.txt"), "not yaml").unwrap();

        let manifests = load_manifests_from_dir(dir.path()).unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].name, "ok");
    }

    #[test]
    fn missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let manifests = load_manifests_from_dir(&dir.path().join("nope")).unwrap();
        assert!(manifests.is_empty());
    }

    #[test]
    fn catalogue_description_prefers_short_form() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("port_scan.yaml");
        fs::write(&path, PORT_SCAN_YAML).unwrap();
        let manifest = load_manifest_file(&path).unwrap();
        assert_eq!(
            manifest.catalogue_description(),
            "Scan a host for open TCP ports"
        );

        let mut no_short = manifest.clone();
        no_short.short_description = String::new();
        assert_eq!(
            no_short.catalogue_description(),
            "Full TCP connect scan with service detection."
        );
    }

    #[test]
    fn catalogue_description_truncates_on_char_boundaries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("port_scan.yaml");
        fs::write(&path, PORT_SCAN_YAML).unwrap();
        let mut manifest = load_manifest_file(&path).unwrap();

        // Multi-byte characters straddling the truncation point must not
        // split mid-character.
        manifest.short_description = String::new();
        manifest.description = "é".repeat(120);
        let short = manifest.catalogue_description();
        assert!(short.ends_with("..."));
        assert!(short.chars().all(|c| c == 'é' || c == '.'));
        assert!(short.len() <= 104);
    }

    #[test]
    fn exec_manifest_without_params_gets_passthrough_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exec.yaml");
        fs::write(&path, "name: exec\ncommand: sh\nenabled: true\n").unwrap();

        let manifest = load_manifest_file(&path).unwrap();
        let schema = manifest.input_schema();
        assert_eq!(schema["properties"]["command"]["type"], "string");
        assert_eq!(schema["required"], json!(["command"]));
    }

    #[test]
    fn input_schema_lists_required_params() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("port_scan.yaml");
        fs::write(&path, PORT_SCAN_YAML).unwrap();
        let manifest = load_manifest_file(&path).unwrap();

        let schema = manifest.input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["target"]["type"], "string");
        assert_eq!(schema["required"], json!(["target"]));
    }
}
