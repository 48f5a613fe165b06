pub mod app;
pub mod config;
pub mod render;

pub use app::{parse_command, ChatApp, Command, Flow};
pub use config::{cli_settings_path, load_cli_settings, save_cli_settings, CliSettings};

use anyhow::Result;
use jugaad_core::config::ClientConfig;
use jugaad_core::monitor::ConnectionMonitor;
use jugaad_core::orchestrator::SendOrchestrator;
use jugaad_core::state::SessionStore;
use jugaad_core::store::SessionStorage;
use jugaad_core::transport::ApiClient;
use std::sync::Arc;

/// Store, monitor and orchestrator wired from one client configuration.
pub fn build_orchestrator(config: &ClientConfig) -> Result<Arc<SendOrchestrator>> {
    let api = ApiClient::from_config(config)?;
    let storage = config
        .storage_path
        .as_deref()
        .map(SessionStorage::in_directory)
        .unwrap_or_else(SessionStorage::in_memory);
    let store = SessionStore::new(storage, api);
    let monitor = Arc::new(ConnectionMonitor::new(store.clone(), config.monitor.clone()));
    Ok(Arc::new(SendOrchestrator::new(
        store,
        monitor,
        config.retry.clone(),
    )))
}
