//! The agent execution loop.
//!
//! One turn: compose the conversation, call the model with the current tool
//! catalogue, execute any requested tools through the registry, feed results
//! (or large-result notifications) back, and repeat until the model stops or
//! the iteration budget runs out. Tool failures never abort the loop; they
//! become structured text the model can recover from.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::ai::schema::normalize_schema;
use crate::ai::types::{ChatMessage, Role, ToolSpec};
use crate::ai::LlmClient;
use crate::storage::FileResultStore;
use crate::tools::ToolRegistry;

use super::events::{AgentEvent, EventKind, EventSender};
use super::AgentError;

const DEFAULT_MAX_ITERATIONS: usize = 30;
const DEFAULT_LARGE_RESULT_THRESHOLD: usize = 50 * 1024;
const RESULT_PREVIEW_CHARS: usize = 200;

const SYSTEM_PROMPT: &str = "You are a professional penetration-testing expert \
assisting with authorized security assessments. You can use the available \
security tools to test the agreed target autonomously. Analyze the target and \
choose the best testing strategy.\n\n\
When a tool call fails, follow these principles:\n\
1. Read the error message carefully and understand the concrete cause.\n\
2. If the tool does not exist or is disabled, try an alternative tool that \
achieves the same goal.\n\
3. If the arguments were wrong, correct them based on the error hint and retry.\n\
4. If the tool failed but produced useful output, continue the analysis from \
that output.\n\
5. If a tool is truly unusable, explain the problem to the user and suggest \
alternatives or manual steps.\n\
6. Never stop the whole assessment because a single tool failed; find another \
way to make progress.\n\n\
Tool errors are included in the tool response text. Read them and decide \
rationally.";

/// Tunables for the loop.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_iterations: usize,
    /// Tool results larger than this many bytes are parked in the result
    /// store and replaced with a compact notification.
    pub large_result_threshold: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            large_result_threshold: DEFAULT_LARGE_RESULT_THRESHOLD,
        }
    }
}

impl EngineSettings {
    pub fn normalized(mut self) -> Self {
        if self.max_iterations == 0 {
            self.max_iterations = DEFAULT_MAX_ITERATIONS;
        }
        if self.large_result_threshold == 0 {
            self.large_result_threshold = DEFAULT_LARGE_RESULT_THRESHOLD;
        }
        self
    }
}

/// Terminal result of one turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub response: String,
    /// Execution IDs of every tool invocation made during the turn.
    pub execution_ids: Vec<String>,
}

pub struct AgentEngine {
    llm: Arc<LlmClient>,
    registry: Arc<ToolRegistry>,
    store: Arc<FileResultStore>,
    settings: EngineSettings,
}

impl AgentEngine {
    pub fn new(
        llm: Arc<LlmClient>,
        registry: Arc<ToolRegistry>,
        store: Arc<FileResultStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            llm,
            registry,
            store,
            settings: settings.normalized(),
        }
    }

    /// Run one turn. Emits progress events into `events`; returns the final
    /// response text and the execution IDs of every tool invocation.
    pub async fn run(
        &self,
        user_input: &str,
        history: &[ChatMessage],
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let mut messages = build_messages(user_input, history);
        let mut execution_ids: Vec<String> = Vec::new();
        let max_iterations = self.settings.max_iterations;

        for i in 0..max_iterations {
            let is_last = i + 1 == max_iterations;
            self.check_cancelled(cancel)?;

            let specs = self.tool_catalogue().await;

            let message = if i == 0 {
                "analyzing the request and planning the test strategy".to_string()
            } else if is_last {
                format!("iteration {} (final)", i + 1)
            } else {
                format!("iteration {}", i + 1)
            };
            send(
                events,
                AgentEvent::with_data(
                    EventKind::Iteration,
                    message,
                    json!({"iteration": i + 1, "total": max_iterations, "isLast": is_last}),
                ),
            );

            tracing::info!(iteration = i + 1, messages = messages.len(), "calling model");
            send(events, AgentEvent::new(EventKind::Progress, "calling the model..."));

            let response = self.chat(&messages, &specs, cancel).await?;
            let choice = response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| AgentError::Other(anyhow::anyhow!("model returned no choices")))?;
            let content = choice.message.content.unwrap_or_default();

            if !choice.message.tool_calls.is_empty() {
                if !content.is_empty() {
                    send(
                        events,
                        AgentEvent::with_data(
                            EventKind::Thinking,
                            content.clone(),
                            json!({"iteration": i + 1}),
                        ),
                    );
                }

                let tool_calls = choice.message.tool_calls;
                messages.push(ChatMessage::assistant_with_tool_calls(
                    content,
                    tool_calls.clone(),
                ));

                let total = tool_calls.len();
                for (idx, call) in tool_calls.iter().enumerate() {
                    self.check_cancelled(cancel)?;
                    self.execute_tool_call(
                        call,
                        idx + 1,
                        total,
                        i + 1,
                        &mut messages,
                        &mut execution_ids,
                        events,
                        cancel,
                    )
                    .await;
                }

                if is_last {
                    let response = self
                        .forced_summary(&mut messages, events, cancel)
                        .await?
                        .unwrap_or_else(|| self.max_iterations_response());
                    return Ok(TurnOutcome {
                        response,
                        execution_ids,
                    });
                }
                continue;
            }

            messages.push(ChatMessage::assistant(content.clone()));
            if !content.is_empty() {
                send(
                    events,
                    AgentEvent::with_data(
                        EventKind::Thinking,
                        content.clone(),
                        json!({"iteration": i + 1}),
                    ),
                );
            }

            if is_last {
                let response = match self.forced_summary(&mut messages, events, cancel).await? {
                    Some(summary) => summary,
                    None if !content.is_empty() => content,
                    None => self.max_iterations_response(),
                };
                return Ok(TurnOutcome {
                    response,
                    execution_ids,
                });
            }

            if choice.finish_reason == "stop" {
                send(
                    events,
                    AgentEvent::new(EventKind::Progress, "generating the final response..."),
                );
                return Ok(TurnOutcome {
                    response: content,
                    execution_ids,
                });
            }
        }

        Ok(TurnOutcome {
            response: self.max_iterations_response(),
            execution_ids,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_tool_call(
        &self,
        call: &crate::ai::types::ToolCall,
        index: usize,
        total: usize,
        iteration: usize,
        messages: &mut Vec<ChatMessage>,
        execution_ids: &mut Vec<String>,
        events: &EventSender,
        cancel: &CancellationToken,
    ) {
        let tool_name = &call.function.name;
        let args = &call.function.arguments.0;
        let args_json = serde_json::to_string(args).unwrap_or_default();

        send(
            events,
            AgentEvent::with_data(
                EventKind::ToolCall,
                format!("calling tool: {tool_name}"),
                json!({
                    "toolName": tool_name,
                    "arguments": args_json,
                    "argumentsObj": args,
                    "toolCallId": call.id,
                    "index": index,
                    "total": total,
                    "iteration": iteration,
                }),
            ),
        );

        match self.registry.call(tool_name, args, cancel).await {
            Err(e) => {
                // Dispatch-level failure (unknown tool, dead endpoint). The
                // model gets a structured explanation and the loop goes on.
                let error_text = format_tool_error(tool_name, args, &e);
                messages.push(ChatMessage::tool(call.id.clone(), error_text));
                tracing::warn!(tool = %tool_name, "tool dispatch failed: {e:#}");
                send(
                    events,
                    AgentEvent::with_data(
                        EventKind::ToolResult,
                        format!("tool {tool_name} failed"),
                        json!({
                            "toolName": tool_name,
                            "success": false,
                            "isError": true,
                            "error": e.to_string(),
                            "toolCallId": call.id,
                            "index": index,
                            "total": total,
                            "iteration": iteration,
                        }),
                    ),
                );
            }
            Ok(outcome) => {
                let text = self.apply_large_result_policy(
                    tool_name,
                    &outcome.execution_id,
                    outcome.text,
                );

                messages.push(ChatMessage::tool(call.id.clone(), text.clone()));
                if !outcome.execution_id.is_empty() {
                    execution_ids.push(outcome.execution_id.clone());
                }
                if outcome.is_error {
                    tracing::warn!(tool = %tool_name, "tool returned an error result, continuing");
                }

                send(
                    events,
                    AgentEvent::with_data(
                        EventKind::ToolResult,
                        format!("tool {tool_name} finished"),
                        json!({
                            "toolName": tool_name,
                            "success": !outcome.is_error,
                            "isError": outcome.is_error,
                            "result": text,
                            "resultPreview": preview(&text),
                            "executionId": outcome.execution_id,
                            "toolCallId": call.id,
                            "index": index,
                            "total": total,
                            "iteration": iteration,
                        }),
                    ),
                );
            }
        }
    }

    /// Park oversized results in the store and substitute a compact
    /// notification that tells the model how to drill in.
    fn apply_large_result_policy(
        &self,
        tool_name: &str,
        execution_id: &str,
        text: String,
    ) -> String {
        if text.len() <= self.settings.large_result_threshold || execution_id.is_empty() {
            return text;
        }

        if let Err(e) = self.store.save(execution_id, tool_name, &text) {
            tracing::warn!(execution_id, tool = %tool_name, "failed to save large result: {e:#}");
            return text;
        }

        let line_count = text.split('\n').count();
        format_minimal_notification(execution_id, tool_name, text.len(), line_count)
    }

    /// One extra model call with an empty tool catalogue, forcing a textual
    /// summary on the final iteration.
    async fn forced_summary(
        &self,
        messages: &mut Vec<ChatMessage>,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, AgentError> {
        self.check_cancelled(cancel)?;
        send(
            events,
            AgentEvent::new(
                EventKind::Progress,
                "final iteration: generating summary and next steps...",
            ),
        );

        messages.push(ChatMessage::user(
            "This is the final iteration. Summarize all test results so far, the \
             issues found, and the work completed. If further testing is needed, \
             provide a detailed plan for the next steps. Reply directly without \
             calling any tools.",
        ));

        match self.chat(messages, &[], cancel).await {
            Ok(response) => {
                let summary = response
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .filter(|c| !c.is_empty());
                if summary.is_some() {
                    send(events, AgentEvent::new(EventKind::Progress, "summary complete"));
                }
                Ok(summary)
            }
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(e) => {
                tracing::warn!("forced summary failed: {e}");
                Ok(None)
            }
        }
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        specs: &[ToolSpec],
        cancel: &CancellationToken,
    ) -> Result<crate::ai::ChatResponse, AgentError> {
        match self.llm.chat(messages, specs, cancel).await {
            Ok(response) => Ok(response),
            Err(_) if cancel.is_cancelled() => Err(AgentError::Cancelled),
            Err(e) => Err(AgentError::Other(e.context("model call failed"))),
        }
    }

    /// Current catalogue translated into the model's function shape with
    /// normalised schemas and short descriptions.
    async fn tool_catalogue(&self) -> Vec<ToolSpec> {
        self.registry
            .list_tools()
            .await
            .into_iter()
            .map(|def| {
                ToolSpec::function(
                    def.name,
                    def.description,
                    normalize_schema(&def.input_schema),
                )
            })
            .collect()
    }

    fn check_cancelled(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        if cancel.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn max_iterations_response(&self) -> String {
        format!(
            "Maximum iterations reached ({} rounds). The system executed several \
             rounds of testing but stopped at the iteration budget. Review the \
             executed tool results, or submit a new request to continue testing.",
            self.settings.max_iterations
        )
    }
}

/// The consumer may be gone (client disconnect); the turn finishes anyway.
fn send(events: &EventSender, event: AgentEvent) {
    let _ = events.send(event);
}

/// Compose the turn's message list: system prompt, content-bearing history
/// turns, then the current user input.
fn build_messages(user_input: &str, history: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];

    // Persisted history carries only user/assistant text; intermediate tool
    // traffic is not replayed.
    for msg in history {
        if matches!(msg.role, Role::User | Role::Assistant) && !msg.content.is_empty() {
            messages.push(ChatMessage {
                role: msg.role,
                content: msg.content.clone(),
                tool_calls: Vec::new(),
                tool_call_id: String::new(),
            });
        }
    }

    messages.push(ChatMessage::user(user_input));
    messages
}

/// Compact stand-in for an oversized tool result.
fn format_minimal_notification(
    execution_id: &str,
    tool_name: &str,
    size: usize,
    line_count: usize,
) -> String {
    format!(
        "Tool execution finished. The result was saved (ID: {execution_id}).\n\n\
         Result info:\n\
         - tool: {tool_name}\n\
         - size: {size} bytes ({:.2} KB)\n\
         - lines: {line_count}\n\n\
         Query the full result with:\n\
         - first page: query_execution_result(execution_id=\"{execution_id}\", page=1, limit=100)\n\
         - keyword search: query_execution_result(execution_id=\"{execution_id}\", search=\"keyword\")\n\
         - filter: query_execution_result(execution_id=\"{execution_id}\", filter=\"error\")\n",
        size as f64 / 1024.0
    )
}

/// Structured error text for a failed dispatch, written so the model can
/// choose a recovery path.
fn format_tool_error(
    tool_name: &str,
    args: &HashMap<String, Value>,
    error: &anyhow::Error,
) -> String {
    format!(
        "Tool call failed\n\n\
         Tool name: {tool_name}\n\
         Arguments: {}\n\
         Error: {error:#}\n\n\
         Analyze the cause and take one of these actions:\n\
         1. If the arguments were wrong, correct them and retry.\n\
         2. If the tool is unavailable, try an alternative tool.\n\
         3. If this is a system problem, explain it to the user with suggestions.\n\
         4. If the error output contains useful information, continue the \
         analysis from it.",
        serde_json::to_string(args).unwrap_or_default()
    )
}

fn preview(text: &str) -> String {
    if text.len() <= RESULT_PREVIEW_CHARS {
        return text.to_string();
    }
    let mut end = RESULT_PREVIEW_CHARS;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_notification_names_the_query_tool() {
        let notification =
            format_minimal_notification("exec-123", "port_scan", 50_000, 1_000);

        assert!(notification.contains("exec-123"));
        assert!(notification.contains("port_scan"));
        assert!(notification.contains("50000"));
        assert!(notification.contains("1000"));
        assert!(notification.contains("query_execution_result"));
        // The notification itself must stay tiny relative to the threshold.
        assert!(notification.len() < 1024);
    }

    #[test]
    fn tool_error_text_guides_recovery() {
        let args = HashMap::from([("target".to_string(), json!("10.0.0.1"))]);
        let error = anyhow::anyhow!("tool port_scan not found or not enabled");
        let text = format_tool_error("port_scan", &args, &error);

        assert!(text.contains("port_scan"));
        assert!(text.contains("10.0.0.1"));
        assert!(text.contains("not found or not enabled"));
        assert!(text.contains("alternative tool"));
    }

    #[test]
    fn build_messages_filters_empty_history() {
        let history = vec![
            ChatMessage::user("first request"),
            ChatMessage::assistant(""),
            ChatMessage::assistant("earlier findings"),
            ChatMessage::tool("call-1", "tool traffic is not replayed"),
        ];

        let messages = build_messages("new request", &history);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "first request");
        assert_eq!(messages[2].content, "earlier findings");
        assert_eq!(messages[3].content, "new request");
    }

    #[test]
    fn settings_normalize_zeroes_to_defaults() {
        let settings = EngineSettings {
            max_iterations: 0,
            large_result_threshold: 0,
        }
        .normalized();
        assert_eq!(settings.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(settings.large_result_threshold, DEFAULT_LARGE_RESULT_THRESHOLD);

        let custom = EngineSettings {
            max_iterations: 5,
            large_result_threshold: 100,
        }
        .normalized();
        assert_eq!(custom.max_iterations, 5);
        assert_eq!(custom.large_result_threshold, 100);
    }

    #[test]
    fn preview_truncates_long_text() {
        assert_eq!(preview("short"), "short");
        let long = "y".repeat(400);
        let p = preview(&long);
        assert!(p.len() < 400);
        assert!(p.ends_with("..."));
    }
}
