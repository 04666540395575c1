use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use sluice_core::ReplicaId;
use sluice_settings::AdmissionSettings;
use sluice_telemetry::{spawn_snapshot_task, MetricsRecorder};

use crate::admission::Admission;
use crate::handlers::{self, AppState};

/// Server configuration.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub replica: ReplicaId,
    pub request_timeout: Duration,
    /// How often the recorder is written to its snapshot database, if it has one.
    pub snapshot_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            replica: ReplicaId::from_env(),
            request_timeout: Duration::from_secs(30),
            snapshot_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &AdmissionSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            replica: settings
                .replica_id
                .as_deref()
                .map(ReplicaId::from_raw)
                .unwrap_or_else(ReplicaId::from_env),
            ..Self::default()
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(handlers::home))
        .route("/health", get(handlers::health))
        .route("/messages", post(handlers::send_message))
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until `shutdown()` is called on the handle.
pub async fn start(
    config: ServerConfig,
    admission: Arc<dyn Admission>,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let scope = admission.scope();
    let capacity = admission.capacity();
    let state = AppState { admission, metrics: metrics.clone(), replica: config.replica.clone() };
    let router = build_router(state, config.request_timeout);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        replica = %config.replica,
        ?scope,
        capacity,
        "admission server started"
    );

    let cancel = CancellationToken::new();
    let snapshots = spawn_snapshot_task(metrics, config.snapshot_interval, cancel.clone());
    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "admission server failed");
        }
    });

    Ok(ServerHandle { addr: local_addr, cancel, server, snapshots })
}

/// Running server. Dropping it leaves the server running.
pub struct ServerHandle {
    pub addr: SocketAddr,
    cancel: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    snapshots: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Token that stops the server when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.wait().await;
    }

    /// Wait until the server exits and the last metrics snapshot is written.
    pub async fn wait(self) {
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "admission server task ended abnormally");
        }
        self.cancel.cancel();
        if let Err(e) = self.snapshots.await {
            tracing::warn!(error = %e, "metrics snapshot task ended abnormally");
        }
    }
}
