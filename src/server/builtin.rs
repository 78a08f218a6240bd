//! Built-in HTTP server used when no server command is configured.
//!
//! It serves health endpoints only, which is enough for a platform health
//! check to confirm that the migrate phase finished and the port is bound.

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::{Json, Router, extract::State, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::{ServeOutcome, ServerLauncher, ServerOptions, ShutdownSignal};
use crate::errors::ServerStartError;
use crate::migrate::{AppliedMigration, MigrationReport};
use crate::sequencer::StartupState;

pub struct HealthState {
    pub report: MigrationReport,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    state: StartupState,
    schema_head: Option<String>,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct MigrationsResponse {
    applied: Vec<AppliedMigration>,
    head: Option<String>,
}

async fn health(State(state): State<Arc<HealthState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        state: StartupState::Serving,
        schema_head: state.report.head.clone(),
        started_at: state.started_at,
    })
}

async fn migrations(State(state): State<Arc<HealthState>>) -> Json<MigrationsResponse> {
    Json(MigrationsResponse {
        applied: state.report.applied.clone(),
        head: state.report.head.clone(),
    })
}

/// Requests running longer than `request_timeout` get 408 Request Timeout.
fn timeout_layer(request_timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout)
}

pub fn build_router(state: Arc<HealthState>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/migrations", get(migrations))
        .with_state(state)
        .layer(timeout_layer(request_timeout))
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Clone, Default)]
pub struct BuiltinServer;

impl BuiltinServer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ServerLauncher for BuiltinServer {
    fn describe(&self) -> String {
        "built-in health server".to_string()
    }

    async fn serve(
        &self,
        options: &ServerOptions,
        report: &MigrationReport,
        shutdown: ShutdownSignal,
    ) -> Result<ServeOutcome, ServerStartError> {
        let addr = options.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerStartError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(ServerStartError::Serve)?;

        let state = Arc::new(HealthState {
            report: report.clone(),
            started_at: Utc::now(),
        });
        let app = build_router(state, options.timeout);

        tracing::info!(addr = %local_addr, "Serving on http://{}", local_addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(ServerStartError::Serve)?;
        tracing::info!("Server shut down gracefully");

        Ok(ServeOutcome::requested())
    }
}
