use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use sluice_consumer::{ArbiterConfig, ConsumerConfig, PartitionArbiter, SessionConsumer};
use sluice_core::{ReplicaId, SessionId};
use sluice_gate::{GateConfig, HttpGate};
use sluice_settings::SluiceSettings;
use sluice_store::{Database, QueueConfig, SqliteLockStore, SqliteQueueConnector, SqliteSessionQueue};
use sluice_telemetry::{init_telemetry, spawn_snapshot_task, MetricsRecorder, TelemetryConfig};

#[derive(Parser)]
#[command(name = "sluice", version, about = "Rate-limited session queue consumer")]
struct Cli {
    /// Settings file (defaults to ~/.sluice/settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the admission controller HTTP service.
    Serve,
    /// Run one consumer replica until interrupted.
    Consume,
    /// Enqueue test messages into one session.
    Publish {
        #[arg(long)]
        session: String,
        #[arg(long, default_value_t = 1)]
        count: u32,
        #[arg(long, default_value = "hello")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = sluice_settings::load_settings(cli.config.as_deref()).context("loading settings")?;
    settings.validate().context("invalid settings")?;

    init_telemetry(&TelemetryConfig::from_level_str(
        &settings.telemetry.log_level,
        settings.telemetry.json,
    ));

    match cli.command {
        Command::Serve => serve(&settings).await,
        Command::Consume => consume(&settings).await,
        Command::Publish { session, count, message } => publish(&settings, &session, count, &message),
    }
}

fn queue_config(settings: &SluiceSettings) -> QueueConfig {
    QueueConfig {
        accept_timeout: settings.queue.accept_timeout(),
        poll_interval: settings.queue.poll_interval(),
        message_lock: settings.queue.message_lock(),
        session_lock: settings.queue.session_lock(),
    }
}

fn metrics_recorder(settings: &SluiceSettings) -> anyhow::Result<Arc<MetricsRecorder>> {
    let recorder = match &settings.consumer.metrics_db_path {
        Some(path) => MetricsRecorder::with_snapshot_db(Path::new(path))
            .with_context(|| format!("opening metrics database {path}"))?,
        None => MetricsRecorder::in_memory(),
    };
    Ok(Arc::new(recorder))
}

fn snapshot_interval(settings: &SluiceSettings) -> std::time::Duration {
    std::time::Duration::from_secs(settings.consumer.metrics_snapshot_secs.max(1))
}

/// Cancel `cancel` on Ctrl-C.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
        }
        cancel.cancel();
    });
}

async fn serve(settings: &SluiceSettings) -> anyhow::Result<()> {
    let admission = sluice_server::build_admission(&settings.admission).context("building token bucket")?;
    let metrics = metrics_recorder(settings)?;
    let config = sluice_server::ServerConfig {
        snapshot_interval: snapshot_interval(settings),
        ..sluice_server::ServerConfig::from_settings(&settings.admission)
    };

    let handle = sluice_server::start(config, admission, metrics)
        .await
        .context("starting admission server")?;
    cancel_on_ctrl_c(handle.cancel_token());
    handle.wait().await;
    tracing::info!("admission server stopped");
    Ok(())
}

async fn consume(settings: &SluiceSettings) -> anyhow::Result<()> {
    let replica = ReplicaId::from_env();
    let metrics = metrics_recorder(settings)?;

    let lock_db = Database::open(Path::new(&settings.lock.db_path)).context("opening lock database")?;
    let arbiter = PartitionArbiter::new(
        Arc::new(SqliteLockStore::new(lock_db)),
        ArbiterConfig::from_settings(&settings.lock),
    )?;

    let gate = HttpGate::new(GateConfig {
        base_url: settings.gate.base_url.clone(),
        request_timeout: settings.gate.request_timeout(),
        connect_timeout: settings.gate.connect_timeout(),
    })?;
    if settings.gate.probe_on_start {
        match gate.probe().await {
            Ok(body) => tracing::info!(response = %body, "admission api reachable"),
            Err(e) => tracing::warn!(error = %e, "admission api probe failed"),
        }
    }

    let connector = Arc::new(SqliteQueueConnector::new(&settings.queue.db_path, queue_config(settings)));
    let consumer = SessionConsumer::build(
        connector,
        arbiter,
        Arc::new(gate),
        metrics.clone(),
        ConsumerConfig::from_settings(&settings.consumer),
        replica,
    )
    .await?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let snapshots = spawn_snapshot_task(
        metrics,
        snapshot_interval(settings),
        cancel.clone(),
    );

    let stats = consumer.run(cancel).await;
    if let Err(e) = snapshots.await {
        tracing::warn!(error = %e, "metrics snapshot task ended abnormally");
    }
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn publish(settings: &SluiceSettings, session: &str, count: u32, message: &str) -> anyhow::Result<()> {
    let queue = SqliteSessionQueue::open(Path::new(&settings.queue.db_path), queue_config(settings))
        .context("opening queue database")?;
    let session = SessionId::from_raw(session);
    for i in 0..count {
        let body = serde_json::json!({
            "message": format!("{message} #{i}"),
            "sessionId": session.as_str(),
        });
        let id = queue.enqueue(&session, body.to_string().as_bytes())?;
        tracing::debug!(message_id = %id, "published");
    }
    println!("published {count} message(s) to session {session}; queue depth {}", queue.depth()?);
    Ok(())
}
