//! Slack Export Status - HTTP endpoint exposing the durable batch export state
//!
//! Serves `GET /state` so a dashboard or browser tab can follow a running
//! export. Abandoned runs are reported as stale after 45 seconds of silence.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use slack_export::state::{BatchExportState, load_current_state, now_ms, reset_state};
use slack_export::{JsonFileStore, KeyValueStore, Settings};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "slack-export-status")]
#[command(about = "HTTP server exposing Slack export progress")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Settings file used to locate the state file
        #[arg(short, long, default_value = slack_export::settings::SETTINGS_FILE)]
        settings: PathBuf,

        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8787")]
        listen: SocketAddr,
    },
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    store: Arc<dyn KeyValueStore>,
}

#[derive(Debug, Serialize)]
struct StateResponse {
    success: bool,
    state: BatchExportState,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

impl ErrorResponse {
    fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

/// Handler for GET /state
async fn get_state(State(state): State<AppState>) -> impl IntoResponse {
    match load_current_state(state.store.as_ref(), now_ms()).await {
        Ok(current) => Json(StateResponse {
            success: true,
            state: current,
        })
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(format!("Failed to read state: {}", e))),
        )
            .into_response(),
    }
}

/// Handler for POST /state/reset
async fn post_reset(State(state): State<AppState>) -> impl IntoResponse {
    match reset_state(state.store.as_ref()).await {
        Ok(()) => Json(StateResponse {
            success: true,
            state: BatchExportState::default(),
        })
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(format!("Failed to reset state: {}", e))),
        )
            .into_response(),
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/state/reset", post(post_reset))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("slack_export=info,tower_http=info,warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { settings, listen } => {
            if let Err(e) = run_server(&settings, listen).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn run_server(settings_path: &std::path::Path, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load_from(settings_path)?;
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(&settings.slack.state_file));
    let app = build_router(AppState { store });

    println!("Starting Slack Export Status on {}", addr);
    println!("State file: {}", settings.slack.state_file);
    println!();
    println!("Endpoints:");
    println!("  GET  /state         - Current batch export state");
    println!("  POST /state/reset   - Clear the batch export state");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use slack_export::MemoryStore;
    use slack_export::store::{BATCH_STATE_KEY, set_typed};
    use tower::ServiceExt;

    fn create_test_app() -> (Arc<MemoryStore>, Router) {
        let store = Arc::new(MemoryStore::default());
        let router = build_router(AppState { store: store.clone() });
        (store, router)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_get_state_empty() {
        let (_store, app) = create_test_app();
        let response = app
            .oneshot(Request::builder().uri("/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["state"]["active"], json!(false));
        assert_eq!(body["state"]["stage"], json!("idle"));
    }

    #[tokio::test]
    async fn test_get_state_reports_stale_run() {
        let (store, app) = create_test_app();
        let state = BatchExportState {
            active: true,
            total_channels: 2,
            updated_at: now_ms() - 50_000,
            ..Default::default()
        };
        set_typed(store.as_ref(), BATCH_STATE_KEY, &state).await.unwrap();

        let response = app
            .oneshot(Request::builder().uri("/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["state"]["active"], json!(false));
        assert_eq!(body["state"]["stage"], json!("stale"));
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let (store, app) = create_test_app();
        let state = BatchExportState {
            active: true,
            updated_at: now_ms(),
            ..Default::default()
        };
        set_typed(store.as_ref(), BATCH_STATE_KEY, &state).await.unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/state/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let current = load_current_state(store.as_ref(), now_ms()).await.unwrap();
        assert!(!current.active);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (_store, app) = create_test_app();
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
