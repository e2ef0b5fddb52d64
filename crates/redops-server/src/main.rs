//! redops server
//!
//! HTTP surface for the agent engine: SSE turn streaming, task control,
//! conversation CRUD, and execution monitoring.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{http::Method, routing::get, Json, Router};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use redops_core::agent::{AgentEngine, EngineSettings};
use redops_core::ai::LlmClient;
use redops_core::mcp::RemoteToolManager;
use redops_core::skills::SkillsManager;
use redops_core::storage::{ConversationStore, Database, FileResultStore};
use redops_core::tools::{ExecutionLog, ToolRegistry};
use redops_core::Config;

mod error;
mod routes;
mod tasks;
mod types;

use tasks::TaskManager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AgentEngine>,
    pub registry: Arc<ToolRegistry>,
    pub conversations: Arc<ConversationStore>,
    pub tasks: Arc<TaskManager>,
    pub remote: Arc<RemoteToolManager>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = load_config(Path::new(&config_path))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .init();

    if config.llm.api_key.is_empty() {
        tracing::warn!("llm.api_key is empty; agent turns will fail until it is configured");
    }

    let (app, _state) = build_app(&config).await?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("redops server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        eprintln!("config file {path:?} not found, using defaults");
        Ok(Config::default())
    }
}

/// Wire every service and build the router.
async fn build_app(config: &Config) -> anyhow::Result<(Router, AppState)> {
    let db = Arc::new(Database::new(&PathBuf::from(&config.database.path))?);
    let conversations = Arc::new(ConversationStore::new(db));

    let result_store = Arc::new(FileResultStore::new(&config.agent.result_storage_dir)?);
    let execution_log = Arc::new(ExecutionLog::new());

    let remote = Arc::new(RemoteToolManager::new(Arc::clone(&execution_log)));
    remote.load_configs(config.endpoints.clone()).await;
    remote.connect_all_enabled().await;

    let skills = Arc::new(SkillsManager::load(Path::new(&config.skills_dir)));
    tracing::info!(
        tools = config.security.tools.len(),
        skills = skills.list().len(),
        endpoints = config.endpoints.len(),
        "loaded catalogue sources"
    );

    let registry = Arc::new(ToolRegistry::new(
        config.security.tools.clone(),
        Some(Arc::clone(&remote)),
        Arc::clone(&result_store),
        skills,
        Arc::clone(&execution_log),
    ));

    let llm = Arc::new(LlmClient::new(config.llm.clone()));
    let engine = Arc::new(AgentEngine::new(
        llm,
        Arc::clone(&registry),
        Arc::clone(&result_store),
        EngineSettings {
            max_iterations: config.agent.max_iterations,
            large_result_threshold: config.agent.large_result_threshold,
        },
    ));

    let state = AppState {
        engine,
        registry,
        conversations,
        tasks: Arc::new(TaskManager::new()),
        remote,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .nest("/api", routes::api_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    Ok((app, state))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        features: HashMap::from([("agent", true), ("tools", true)]),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    features: HashMap<&'static str, bool>,
}
