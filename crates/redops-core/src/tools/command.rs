//! Local tool invocation: manifest + arguments → argv → subprocess.
//!
//! The mapping rules:
//! 1. Fixed manifest args come first.
//! 2. Positional parameters follow in ascending `position` order.
//! 3. Flagged parameters follow in declaration order, rendered per their
//!    `format` (`flag`, `combined`, `template`).
//! 4. A required parameter with no value and no default fails before any
//!    subprocess starts.
//!
//! Captured output is stdout and stderr merged. Cancellation kills the child
//! and returns whatever was captured up to that point.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::manifest::{ParamFormat, ParamType, ParameterSpec, ToolManifest};

/// Captured output of a finished (or killed) subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// stdout and stderr, line-merged in arrival order.
    pub output: String,
    /// None when the process was killed by a signal.
    pub exit_code: Option<i32>,
}

/// Result of a local tool invocation, errors included.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// Build the argv for a manifest given the model-supplied arguments.
///
/// Pure function so the mapping rules are testable without spawning anything.
pub fn build_command_args(
    manifest: &ToolManifest,
    args: &HashMap<String, Value>,
) -> Result<Vec<String>> {
    let mut argv: Vec<String> = manifest.args.clone();

    let (mut positional, flagged): (Vec<&ParameterSpec>, Vec<&ParameterSpec>) = manifest
        .parameters
        .iter()
        .partition(|p| p.position.is_some());
    positional.sort_by_key(|p| p.position);

    for param in positional {
        match resolve_value(param, args)? {
            Some(value) => argv.push(format_value(param, &value)),
            None => continue,
        }
    }

    for param in flagged {
        let Some(value) = resolve_value(param, args)? else {
            continue;
        };

        // Booleans switch flags on and off rather than carrying a value.
        if param.param_type == ParamType::Bool {
            if coerce_bool(&value) {
                if let Some(flag) = &param.flag {
                    argv.push(flag.clone());
                }
            }
            continue;
        }

        match param.format {
            ParamFormat::Flag => {
                if let Some(flag) = &param.flag {
                    argv.push(flag.clone());
                }
                let rendered = format_value(param, &value);
                if !rendered.is_empty() {
                    argv.push(rendered);
                }
            }
            ParamFormat::Combined => {
                let rendered = format_value(param, &value);
                match &param.flag {
                    Some(flag) => argv.push(format!("{flag}={rendered}")),
                    None => argv.push(rendered),
                }
            }
            ParamFormat::Template => match &param.template {
                Some(template) => {
                    let expanded = template
                        .replace("{flag}", param.flag.as_deref().unwrap_or(""))
                        .replace("{value}", &format_value(param, &value))
                        .replace("{name}", &param.name);
                    argv.extend(expanded.split_whitespace().map(|s| s.to_string()));
                }
                None => {
                    if let Some(flag) = &param.flag {
                        argv.push(flag.clone());
                    }
                    argv.push(format_value(param, &value));
                }
            },
            ParamFormat::Positional => argv.push(format_value(param, &value)),
        }
    }

    Ok(argv)
}

/// Supplied value, else default, else error for required parameters.
fn resolve_value(
    param: &ParameterSpec,
    args: &HashMap<String, Value>,
) -> Result<Option<Value>> {
    if let Some(value) = args.get(&param.name) {
        if !value.is_null() {
            return Ok(Some(value.clone()));
        }
    }
    if param.required {
        return Err(anyhow!("missing required parameter '{}'", param.name));
    }
    Ok(param.default.clone())
}

/// Stringify a parameter value for argv, coercing weakly-typed input.
fn format_value(param: &ParameterSpec, value: &Value) -> String {
    match param.param_type {
        ParamType::Array => match value {
            Value::Array(items) => items
                .iter()
                .map(plain_string)
                .collect::<Vec<_>>()
                .join(","),
            other => plain_string(other),
        },
        ParamType::Bool => coerce_bool(value).to_string(),
        _ => plain_string(value),
    }
}

fn plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true") || s == "1",
        Value::Number(n) => n.as_i64().map(|v| v != 0).unwrap_or(false),
        _ => false,
    }
}

/// Invoke a local tool: translate the manifest plus arguments into a
/// subprocess and capture its combined output.
///
/// Tool-level failures (bad arguments, non-allowed exit code, spawn errors)
/// come back as an error-flagged [`ToolOutput`] rather than `Err`, so the
/// model gets a structured message it can recover from.
pub async fn invoke(
    manifest: &ToolManifest,
    args: &HashMap<String, Value>,
    cancel: &CancellationToken,
) -> ToolOutput {
    // The exec tool bypasses parameter mapping entirely.
    if manifest.name == "exec" {
        return invoke_exec(args, cancel).await;
    }

    let argv = match build_command_args(manifest, args) {
        Ok(argv) => argv,
        Err(e) => {
            tracing::warn!(tool = %manifest.name, "argument mapping failed: {e}");
            return ToolOutput::error(format!(
                "error: tool {} is missing required arguments: {e}. Received arguments: {}",
                manifest.name,
                serde_json::to_string(args).unwrap_or_default()
            ));
        }
    };

    tracing::info!(tool = %manifest.name, command = %manifest.command, ?argv, "executing tool");

    let result = run_command(&manifest.command, &argv, None, cancel).await;
    finish_output(&manifest.name, &manifest.allowed_exit_codes, result)
}

/// The distinguished exec tool: run a caller-supplied command string under a
/// shell in an optional working directory.
async fn invoke_exec(args: &HashMap<String, Value>, cancel: &CancellationToken) -> ToolOutput {
    let Some(command) = args.get("command").and_then(|v| v.as_str()) else {
        return ToolOutput::error("error: missing command argument");
    };
    if command.is_empty() {
        return ToolOutput::error("error: command argument must not be empty");
    }

    let shell = args
        .get("shell")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("sh");
    let workdir = args
        .get("workdir")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty());

    tracing::warn!(command, shell, workdir = workdir.unwrap_or(""), "executing shell command");

    let argv = vec!["-c".to_string(), command.to_string()];
    let result = run_command(shell, &argv, workdir, cancel).await;
    finish_output("exec", &[], result)
}

fn finish_output(
    tool: &str,
    allowed_exit_codes: &[i32],
    result: Result<CommandOutput>,
) -> ToolOutput {
    let output = match result {
        Ok(output) => output,
        Err(e) => {
            tracing::error!(tool, "tool execution failed: {e:#}");
            return ToolOutput::error(format!("tool execution failed: {e:#}"));
        }
    };

    let success = match output.exit_code {
        Some(0) => true,
        Some(code) => allowed_exit_codes.contains(&code),
        None => false,
    };

    if success {
        ToolOutput {
            text: output.output,
            is_error: false,
        }
    } else {
        let status = output
            .exit_code
            .map(|c| format!("exit code {c}"))
            .unwrap_or_else(|| "killed by signal".to_string());
        tracing::error!(tool, status = %status, "tool exited outside allowed codes");
        ToolOutput::error(format!(
            "tool execution failed: {status}\noutput: {}",
            output.output
        ))
    }
}

/// Spawn a process, merge stdout/stderr line streams, and wait for exit or
/// cancellation. On cancel the child is killed and partial output returned.
pub async fn run_command(
    command: &str,
    argv: &[String],
    workdir: Option<&str>,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    let mut cmd = Command::new(command);
    cmd.args(argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            anyhow!("command not found: {command}. Is it installed and in PATH?")
        } else {
            anyhow!("failed to spawn {command}: {e}")
        }
    })?;

    let buffer = Arc::new(Mutex::new(String::new()));
    let stdout = child.stdout.take().context("child stdout missing")?;
    let stderr = child.stderr.take().context("child stderr missing")?;
    let stdout_task = tokio::spawn(capture_lines(stdout, Arc::clone(&buffer)));
    let stderr_task = tokio::spawn(capture_lines(stderr, Arc::clone(&buffer)));

    let (status, cancelled) = tokio::select! {
        status = child.wait() => (status?, false),
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            (child.wait().await?, true)
        }
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;
    let output = buffer.lock().await.clone();

    if cancelled {
        return Err(anyhow!(
            "command cancelled; partial output ({} bytes): {output}",
            output.len()
        ));
    }

    Ok(CommandOutput {
        output,
        exit_code: status.code(),
    })
}

async fn capture_lines(stream: impl AsyncRead + Unpin, buffer: Arc<Mutex<String>>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut buf = buffer.lock().await;
        buf.push_str(&line);
        buf.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn param(name: &str, param_type: ParamType) -> ParameterSpec {
        ParameterSpec {
            name: name.to_string(),
            param_type,
            description: String::new(),
            required: false,
            default: None,
            flag: None,
            position: None,
            format: ParamFormat::Flag,
            template: None,
            options: Vec::new(),
        }
    }

    fn manifest(parameters: Vec<ParameterSpec>) -> ToolManifest {
        ToolManifest {
            name: "probe".to_string(),
            command: "probe".to_string(),
            args: vec!["--base".to_string()],
            short_description: String::new(),
            description: String::new(),
            enabled: true,
            parameters,
            allowed_exit_codes: Vec::new(),
        }
    }

    fn args(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn positional_params_sort_by_position() {
        let mut second = param("second", ParamType::String);
        second.position = Some(1);
        second.format = ParamFormat::Positional;
        let mut first = param("first", ParamType::String);
        first.position = Some(0);
        first.format = ParamFormat::Positional;

        let m = manifest(vec![second, first]);
        let argv = build_command_args(
            &m,
            &args(&[("first", json!("a")), ("second", json!("b"))]),
        )
        .unwrap();
        assert_eq!(argv, vec!["--base", "a", "b"]);
    }

    #[test]
    fn flag_format_emits_two_entries() {
        let mut p = param("ports", ParamType::String);
        p.flag = Some("-p".to_string());
        let m = manifest(vec![p]);

        let argv = build_command_args(&m, &args(&[("ports", json!("1-1000"))])).unwrap();
        assert_eq!(argv, vec!["--base", "-p", "1-1000"]);
    }

    #[test]
    fn combined_format_joins_with_equals() {
        let mut p = param("level", ParamType::Int);
        p.flag = Some("--level".to_string());
        p.format = ParamFormat::Combined;
        let m = manifest(vec![p]);

        let argv = build_command_args(&m, &args(&[("level", json!(3))])).unwrap();
        assert_eq!(argv, vec!["--base", "--level=3"]);
    }

    #[test]
    fn template_format_expands_and_splits() {
        let mut p = param("wordlist", ParamType::String);
        p.flag = Some("-w".to_string());
        p.format = ParamFormat::Template;
        p.template = Some("{flag} {value} --name {name}".to_string());
        let m = manifest(vec![p]);

        let argv = build_command_args(&m, &args(&[("wordlist", json!("common.txt"))])).unwrap();
        assert_eq!(
            argv,
            vec!["--base", "-w", "common.txt", "--name", "wordlist"]
        );
    }

    #[test]
    fn bool_true_emits_flag_only_false_nothing() {
        let mut verbose = param("verbose", ParamType::Bool);
        verbose.flag = Some("-v".to_string());
        let m = manifest(vec![verbose]);

        let argv = build_command_args(&m, &args(&[("verbose", json!(true))])).unwrap();
        assert_eq!(argv, vec!["--base", "-v"]);

        let argv = build_command_args(&m, &args(&[("verbose", json!(false))])).unwrap();
        assert_eq!(argv, vec!["--base"]);

        // Weakly typed "true" coerces.
        let argv = build_command_args(&m, &args(&[("verbose", json!("true"))])).unwrap();
        assert_eq!(argv, vec!["--base", "-v"]);
    }

    #[test]
    fn missing_required_fails_before_spawn() {
        let mut target = param("target", ParamType::String);
        target.required = true;
        target.position = Some(0);
        let m = manifest(vec![target]);

        let err = build_command_args(&m, &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("target"));
    }

    #[test]
    fn default_fills_missing_optional() {
        let mut depth = param("depth", ParamType::Int);
        depth.flag = Some("-d".to_string());
        depth.default = Some(json!(2));
        let m = manifest(vec![depth]);

        let argv = build_command_args(&m, &HashMap::new()).unwrap();
        assert_eq!(argv, vec!["--base", "-d", "2"]);
    }

    #[test]
    fn array_values_join_with_commas() {
        let mut hosts = param("hosts", ParamType::Array);
        hosts.flag = Some("--hosts".to_string());
        let m = manifest(vec![hosts]);

        let argv =
            build_command_args(&m, &args(&[("hosts", json!(["a", "b", "c"]))])).unwrap();
        assert_eq!(argv, vec!["--base", "--hosts", "a,b,c"]);
    }

    #[tokio::test]
    async fn runs_command_and_captures_output() {
        let cancel = CancellationToken::new();
        let out = run_command(
            "sh",
            &["-c".to_string(), "echo hello; echo oops >&2".to_string()],
            None,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(out.exit_code, Some(0));
        assert!(out.output.contains("hello"));
        assert!(out.output.contains("oops"));
    }

    #[tokio::test]
    async fn allowed_exit_codes_count_as_success() {
        let m = ToolManifest {
            name: "grepper".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo findings; exit 1".to_string()],
            short_description: String::new(),
            description: String::new(),
            enabled: true,
            parameters: Vec::new(),
            allowed_exit_codes: vec![1],
        };

        let cancel = CancellationToken::new();
        let out = invoke(&m, &HashMap::new(), &cancel).await;
        assert!(!out.is_error);
        assert!(out.text.contains("findings"));
    }

    #[tokio::test]
    async fn disallowed_exit_code_keeps_output() {
        let m = ToolManifest {
            name: "failer".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo partial; exit 3".to_string()],
            short_description: String::new(),
            description: String::new(),
            enabled: true,
            parameters: Vec::new(),
            allowed_exit_codes: Vec::new(),
        };

        let cancel = CancellationToken::new();
        let out = invoke(&m, &HashMap::new(), &cancel).await;
        assert!(out.is_error);
        assert!(out.text.contains("exit code 3"));
        assert!(out.text.contains("partial"));
    }

    #[tokio::test]
    async fn exec_tool_runs_shell_command() {
        let m = ToolManifest {
            name: "exec".to_string(),
            command: "sh".to_string(),
            args: Vec::new(),
            short_description: String::new(),
            description: String::new(),
            enabled: true,
            parameters: Vec::new(),
            allowed_exit_codes: Vec::new(),
        };

        let cancel = CancellationToken::new();
        let out = invoke(&m, &args(&[("command", json!("echo via-exec"))]), &cancel).await;
        assert!(!out.is_error);
        assert!(out.text.contains("via-exec"));

        let out = invoke(&m, &HashMap::new(), &cancel).await;
        assert!(out.is_error);
        assert!(out.text.contains("command"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        let result = run_command(
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
            None,
            &cancel,
        )
        .await;

        assert!(result.is_err());
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
