use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use joblens_store::JobLogStore;

mod api;
mod assistant;

use assistant::completion::{CompletionBackend, HttpCompletionClient};
use assistant::Assistant;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "joblens-hub", version, about = "JOBLENS analytics hub")]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "127.0.0.1:4000")]
    bind: String,

    /// NDJSON snapshot of job logs to load at startup
    #[arg(long)]
    data: Option<PathBuf>,

    /// Path to config file
    #[arg(long, default_value = "joblens.toml")]
    config: PathBuf,
}

// =============================================================================
// Config
// =============================================================================

#[derive(Deserialize, Default, Clone)]
struct Config {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    completion: CompletionConfig,
}

#[derive(Deserialize, Clone)]
struct ServerConfig {
    #[serde(default = "default_max_page_size")]
    max_page_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_page_size: default_max_page_size(),
        }
    }
}

#[derive(Deserialize, Clone)]
struct CompletionConfig {
    #[serde(default = "default_base_url")]
    base_url: String,
    #[serde(default = "default_model")]
    model: String,
    /// Name of the environment variable holding the bearer credential.
    #[serde(default = "default_api_key_env")]
    api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default = "default_max_summary_records")]
    max_summary_records: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_summary_records: default_max_summary_records(),
        }
    }
}

fn default_max_page_size() -> usize {
    100
}
fn default_base_url() -> String {
    "https://api.groq.com/openai/v1".into()
}
fn default_model() -> String {
    "llama-3.3-70b-versatile".into()
}
fn default_api_key_env() -> String {
    "GROQ_API_KEY".into()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_summary_records() -> usize {
    200
}

// =============================================================================
// Application State
// =============================================================================

struct AppState {
    store: JobLogStore,
    assistant: Assistant,
    config: Config,
    start_time: Instant,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "joblens_hub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Load config
    let config: Config = if args.config.exists() {
        let content = std::fs::read_to_string(&args.config).unwrap_or_default();
        toml::from_str(&content).unwrap_or_default()
    } else {
        Config::default()
    };

    let store = JobLogStore::new();
    if let Some(path) = &args.data {
        match joblens_store::load_ndjson(path) {
            Ok(logs) => {
                let count = logs.len();
                store.insert_batch(logs).await;
                tracing::info!("Loaded {} job logs from {:?}", count, path);
            }
            Err(e) => {
                tracing::error!("Failed to load job logs from {:?}: {}", path, e);
                std::process::exit(1);
            }
        }
    }

    let backend = match std::env::var(&config.completion.api_key_env) {
        Ok(key) if !key.trim().is_empty() => {
            match HttpCompletionClient::new(
                config.completion.base_url.clone(),
                config.completion.model.clone(),
                key,
                Duration::from_secs(config.completion.timeout_secs),
            ) {
                Ok(client) => Some(Arc::new(client) as Arc<dyn CompletionBackend>),
                Err(e) => {
                    tracing::error!("Failed to build completion client: {}", e);
                    std::process::exit(1);
                }
            }
        }
        _ => {
            tracing::warn!(
                "No credential in ${}; /api/chat will report misconfiguration",
                config.completion.api_key_env
            );
            None
        }
    };

    let assistant = Assistant::new(backend, config.completion.max_summary_records);

    let state = Arc::new(AppState {
        store,
        assistant,
        config: config.clone(),
        start_time: Instant::now(),
    });

    let app = Router::new()
        .route("/api/status", get(api::status))
        .route("/api/chat", get(api::chat_probe).post(api::chat))
        .route("/api/joblogs", get(api::list_joblogs))
        .route("/api/metrics/general", get(api::metrics_general))
        .route("/api/metrics/delta", get(api::metrics_delta))
        .route("/api/seed", post(api::seed))
        .layer(CorsLayer::permissive())
        .with_state(state);

    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  JOBLENS hub v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  API:    http://{}/api/status", args.bind);
    tracing::info!("  Chat:   http://{}/api/chat", args.bind);
    tracing::info!("  Model:  {}", config.completion.model);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .expect("Invalid bind address");
    axum::serve(listener, app).await.unwrap();
}
