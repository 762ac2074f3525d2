use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tracing::{info, warn};

use quill_engine::{AgentOrchestrator, ConversationLoop, EngineOrchestrator, LoopConfig};
use quill_llm::provider::DEFAULT_BASE_URL;
use quill_llm::{models, OpenAiProvider, ProviderConfig, RetryPolicy, StreamingClient};
use quill_server::{HubConfig, ServerConfig, StatusService};
use quill_store::{Database, MessageRepo, SessionRepo};
use quill_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "quill", version, about = "Agent orchestration server")]
struct Config {
    #[arg(long, env = "QUILL_PORT", default_value_t = 9091)]
    port: u16,

    /// SQLite database file. Defaults to ~/.quill/quill.db.
    #[arg(long, env = "QUILL_DB_PATH")]
    db_path: Option<PathBuf>,

    #[arg(long, env = "QUILL_PROVIDER_URL", default_value = DEFAULT_BASE_URL)]
    provider_url: String,

    #[arg(long, env = "QUILL_API_KEY", hide_env_values = true)]
    api_key: String,

    #[arg(long, env = "QUILL_MODEL")]
    model: Option<String>,

    #[arg(long, env = "QUILL_MAX_RETRIES", default_value_t = 8)]
    max_retries: u32,

    #[arg(long, env = "QUILL_LOG", default_value = "info")]
    log_level: tracing::Level,

    #[arg(long, env = "QUILL_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// Persist warn+ logs to ~/.quill/logs.db.
    #[arg(long, env = "QUILL_LOG_TO_SQLITE")]
    log_to_sqlite: bool,

    #[arg(long, env = "AGENT_MAX_CONCURRENT", default_value_t = 10)]
    max_concurrent: usize,

    #[arg(long, env = "AGENT_REQUEST_TIMEOUT", default_value_t = 600)]
    request_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: config.log_level,
        format: config.log_format,
        log_to_sqlite: config.log_to_sqlite,
        ..Default::default()
    })?;

    let db_path = match &config.db_path {
        Some(path) => path.clone(),
        None => {
            let dir = quill_telemetry::data_dir();
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            dir.join("quill.db")
        }
    };
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    info!(path = %db_path.display(), "database opened");
    let sessions = SessionRepo::new(db.clone());
    let messages = MessageRepo::new(db);

    let model = config
        .model
        .clone()
        .unwrap_or_else(|| models::default_model().id.to_string());
    if models::find_model(&model).is_none() {
        warn!(model = %model, "model not in catalog, usage will be recorded at zero cost");
    }
    let provider = OpenAiProvider::new(ProviderConfig {
        base_url: config.provider_url.clone(),
        ..ProviderConfig::new(SecretString::from(config.api_key.clone()), model)
    })
    .context("failed to build provider")?;
    let client = Arc::new(StreamingClient::new(
        Arc::new(provider),
        RetryPolicy {
            max_retries: config.max_retries,
            ..Default::default()
        },
    ));

    let tools =
        quill_engine::tools::default_registry().context("failed to build tool registry")?;
    let conversation = Arc::new(ConversationLoop::new(
        client,
        Arc::new(tools),
        Arc::new(messages),
        Arc::new(sessions.clone()),
        LoopConfig::default(),
    ));
    let orchestrator = Arc::new(EngineOrchestrator::new(conversation));

    let handle = quill_server::start(
        ServerConfig {
            port: config.port,
            max_concurrent: config.max_concurrent,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            hub: HubConfig::default(),
        },
        orchestrator.clone(),
        sessions,
        Arc::new(StatusService::new()),
    )
    .await
    .context("failed to start server")?;
    info!(port = handle.port, "quill server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    info!("shutting down");
    let cancelled = orchestrator.cancel_all();
    if cancelled > 0 {
        info!(cancelled, "cancelled in-flight runs");
    }
    handle.shutdown().await;
    Ok(())
}
