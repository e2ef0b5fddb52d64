//! End-to-end turns against a mocked chat-completion endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

use redops_core::agent::{AgentEngine, AgentEvent, EngineSettings, EventKind};
use redops_core::ai::{LlmClient, LlmConfig};
use redops_core::skills::SkillsManager;
use redops_core::storage::FileResultStore;
use redops_core::tools::{ExecutionLog, ToolManifest, ToolRegistry};

/// Matches the forced-summary call, which carries no tool catalogue.
struct NoToolCatalogue;

impl Match for NoToolCatalogue {
    fn matches(&self, request: &Request) -> bool {
        !String::from_utf8_lossy(&request.body).contains("\"tools\"")
    }
}

fn shell_tool(name: &str, script: &str) -> ToolManifest {
    ToolManifest {
        name: name.to_string(),
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        short_description: format!("{name} test tool"),
        description: String::new(),
        enabled: true,
        parameters: Vec::new(),
        allowed_exit_codes: Vec::new(),
    }
}

struct Harness {
    engine: AgentEngine,
    store: Arc<FileResultStore>,
    _dir: TempDir,
}

fn harness(server: &MockServer, tools: Vec<ToolManifest>, settings: EngineSettings) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(FileResultStore::new(dir.path()).expect("store"));
    let registry = Arc::new(ToolRegistry::new(
        tools,
        None,
        Arc::clone(&store),
        Arc::new(SkillsManager::empty()),
        Arc::new(ExecutionLog::new()),
    ));
    let llm = Arc::new(LlmClient::new(LlmConfig {
        api_key: "test-key".to_string(),
        base_url: server.uri(),
        model: "test-model".to_string(),
    }));
    let engine = AgentEngine::new(llm, registry, Arc::clone(&store), settings);
    Harness {
        engine,
        store,
        _dir: dir,
    }
}

fn tool_call_response(tool: &str, arguments: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": {
                "role": "assistant",
                "content": "Running a scan first.",
                "tool_calls": [{
                    "id": "call-1",
                    "type": "function",
                    "function": {"name": tool, "arguments": arguments}
                }]
            },
            "finish_reason": "tool_calls"
        }]
    }))
}

fn text_response(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    }))
}

fn drain(mut rx: mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn happy_path_single_tool() {
    let server = MockServer::start().await;

    // The follow-up request carries the tool message; the opening request
    // does not. Mount the more specific mock first.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("tool_call_id"))
        .respond_with(text_response("Port 22 is open on the target."))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(tool_call_response("port_scan", "{\"target\":\"10.0.0.1\"}"))
        .mount(&server)
        .await;

    let h = harness(
        &server,
        vec![shell_tool("port_scan", "echo '22/tcp open ssh'")],
        EngineSettings::default(),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let outcome = h
        .engine
        .run("scan 10.0.0.1 for open ports", &[], &tx, &CancellationToken::new())
        .await
        .expect("turn succeeds");
    drop(tx);

    assert_eq!(outcome.response, "Port 22 is open on the target.");
    assert_eq!(outcome.execution_ids.len(), 1);

    let events = drain(rx);
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds[0], EventKind::Iteration);
    let call_pos = kinds.iter().position(|k| *k == EventKind::ToolCall).unwrap();
    let result_pos = kinds.iter().position(|k| *k == EventKind::ToolResult).unwrap();
    assert!(call_pos < result_pos);
    // The engine never emits terminal events; the transport owns those.
    assert!(events.iter().all(|e| !e.kind.is_terminal()));

    let tool_result = &events[result_pos];
    let data = tool_result.data.as_ref().unwrap();
    assert_eq!(data["success"], json!(true));
    assert_eq!(data["isError"], json!(false));
    assert!(data["result"].as_str().unwrap().contains("22/tcp open ssh"));
    assert_eq!(data["executionId"].as_str().unwrap(), outcome.execution_ids[0]);
}

#[tokio::test]
async fn oversized_results_are_parked_in_the_store() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("tool_call_id"))
        .respond_with(text_response("Summarized the noisy output."))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(tool_call_response("noisy", "{}"))
        .mount(&server)
        .await;

    let h = harness(
        &server,
        vec![shell_tool("noisy", "seq 1 1000")],
        EngineSettings {
            max_iterations: 5,
            large_result_threshold: 500,
        },
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let outcome = h
        .engine
        .run("run the noisy tool", &[], &tx, &CancellationToken::new())
        .await
        .expect("turn succeeds");
    drop(tx);

    assert_eq!(outcome.execution_ids.len(), 1);
    let execution_id = &outcome.execution_ids[0];

    // Full bytes are retrievable from the store.
    let stored = h.store.get(execution_id).expect("stored result");
    assert!(stored.len() > 500);
    assert!(stored.contains("\n999\n1000"));

    // The model saw only the compact notification.
    let events = drain(rx);
    let tool_result = events
        .iter()
        .find(|e| e.kind == EventKind::ToolResult)
        .unwrap();
    let substituted = tool_result.data.as_ref().unwrap()["result"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(substituted.len() < 1024);
    assert!(substituted.contains("query_execution_result"));
    assert!(substituted.contains(execution_id.as_str()));

    // The follow-up request body carried the notification, not the bytes.
    let requests = server.received_requests().await.unwrap();
    let last_body = String::from_utf8_lossy(&requests.last().unwrap().body).to_string();
    assert!(last_body.contains("query_execution_result"));
    assert!(!last_body.contains("\\n999\\n1000"));
}

#[tokio::test]
async fn final_iteration_forces_a_summary_without_tools() {
    let server = MockServer::start().await;

    // The summary call is the only one with no tool catalogue.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(NoToolCatalogue)
        .respond_with(text_response("Summary: two scans executed, review results."))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(tool_call_response("port_scan", "{\"target\":\"10.0.0.1\"}"))
        .mount(&server)
        .await;

    let h = harness(
        &server,
        vec![shell_tool("port_scan", "echo scanned")],
        EngineSettings {
            max_iterations: 2,
            large_result_threshold: 50 * 1024,
        },
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let outcome = h
        .engine
        .run("keep scanning", &[], &tx, &CancellationToken::new())
        .await
        .expect("turn succeeds");
    drop(tx);

    assert_eq!(
        outcome.response,
        "Summary: two scans executed, review results."
    );
    // One tool call per iteration, both executed before the forced summary.
    assert_eq!(outcome.execution_ids.len(), 2);

    let events = drain(rx);
    let iterations: Vec<&AgentEvent> = events
        .iter()
        .filter(|e| e.kind == EventKind::Iteration)
        .collect();
    assert_eq!(iterations.len(), 2);
    assert_eq!(
        iterations[1].data.as_ref().unwrap()["isLast"],
        json!(true)
    );
}

#[tokio::test]
async fn tool_failure_feeds_back_and_the_loop_continues() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("tool_call_id"))
        .respond_with(text_response("That tool does not exist; stopping."))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(tool_call_response("no_such_tool", "{}"))
        .mount(&server)
        .await;

    let h = harness(&server, Vec::new(), EngineSettings::default());

    let (tx, rx) = mpsc::unbounded_channel();
    let outcome = h
        .engine
        .run("use a missing tool", &[], &tx, &CancellationToken::new())
        .await
        .expect("turn still succeeds");
    drop(tx);

    assert_eq!(outcome.response, "That tool does not exist; stopping.");
    assert!(outcome.execution_ids.is_empty());

    let events = drain(rx);
    let tool_result = events
        .iter()
        .find(|e| e.kind == EventKind::ToolResult)
        .unwrap();
    let data = tool_result.data.as_ref().unwrap();
    assert_eq!(data["success"], json!(false));
    assert_eq!(data["isError"], json!(true));

    // The model received a structured error it could react to.
    let requests = server.received_requests().await.unwrap();
    let follow_up = String::from_utf8_lossy(&requests.last().unwrap().body).to_string();
    assert!(follow_up.contains("Tool call failed"));
    assert!(follow_up.contains("no_such_tool"));
}

#[tokio::test]
async fn cancellation_stops_the_turn() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(text_response("should never be used"))
        .mount(&server)
        .await;

    let h = harness(&server, Vec::new(), EngineSettings::default());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = h
        .engine
        .run("anything", &[], &tx, &cancel)
        .await
        .expect_err("cancelled turn fails");
    assert!(err.is_cancelled());
}
