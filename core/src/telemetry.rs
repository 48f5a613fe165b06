use anyhow::Result;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

static SUBSCRIBER_GUARD: OnceLock<()> = OnceLock::new();

pub const LOG_ENV: &str = "JUGAAD_LOG";

/// Initialize the global tracing subscriber for the Jugaad workspace.
///
/// The initialization is idempotent so that unit tests and binaries can call it
/// multiple times without panicking. Logs go to stderr so they never mix with
/// chat output on stdout.
pub fn init_tracing(filter: EnvFilter) -> Result<()> {
    if SUBSCRIBER_GUARD.get().is_some() {
        return Ok(());
    }

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));
    tracing::subscriber::set_global_default(subscriber)?;
    SUBSCRIBER_GUARD.set(()).ok();

    Ok(())
}

/// Filter from `JUGAAD_LOG`, then `RUST_LOG`, then `default_directive`.
pub fn filter_from_env(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive))
}

pub fn init_tracing_from_env(default_directive: &str) -> Result<()> {
    init_tracing(filter_from_env(default_directive))
}
