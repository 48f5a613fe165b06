use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use jugaad_core::config::{MonitorSettings, RetryPolicy};
use jugaad_core::monitor::ConnectionMonitor;
use jugaad_core::orchestrator::{SendMode, SendOrchestrator};
use jugaad_core::state::{SendOptions, SessionStore};
use jugaad_core::store::SessionStorage;
use jugaad_core::telemetry;
use jugaad_core::transport::ApiClient;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Jugaad")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a lightweight smoke test that exercises the Jugaad core logic.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let store = SessionStore::new(
        SessionStorage::in_directory(temp_dir.path()),
        ApiClient::fake(),
    );
    let monitor = Arc::new(ConnectionMonitor::new(
        store.clone(),
        MonitorSettings::default(),
    ));
    let orchestrator = SendOrchestrator::new(store, monitor.clone(), RetryPolicy::default());

    runtime.block_on(async {
        if !monitor.start().await {
            bail!("mock backend reported unhealthy");
        }
        orchestrator
            .send("ping from xtask", SendOptions::default(), SendMode::Blocking)
            .await?;
        orchestrator
            .send("stream from xtask", SendOptions::default(), SendMode::Streaming)
            .await?;
        monitor.shutdown();
        Ok::<_, anyhow::Error>(())
    })?;

    let reloaded = SessionStore::new(
        SessionStorage::in_directory(temp_dir.path()),
        ApiClient::fake(),
    );
    let messages = reloaded
        .session_summaries()
        .first()
        .map(|summary| summary.message_count)
        .unwrap_or_default();
    if messages != 4 {
        bail!("expected 4 persisted messages, found {messages}");
    }
    info!("messages" = messages, "smoke test session saved");

    Ok(())
}
