use crate::config::RetryPolicy;
use crate::error::ChatError;
use crate::monitor::ConnectionMonitor;
use crate::state::{SendOptions, SessionStore};
use std::sync::Arc;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    Blocking,
    #[default]
    Streaming,
}

/// Sends through the store, retrying while the backend is known to be down.
///
/// A failed attempt is retried only when the monitor reports the connection
/// lost, and only after a backoff and a successful re-probe. Otherwise the
/// failure is returned as-is.
pub struct SendOrchestrator {
    store: SessionStore,
    monitor: Arc<ConnectionMonitor>,
    policy: RetryPolicy,
}

impl SendOrchestrator {
    pub fn new(store: SessionStore, monitor: Arc<ConnectionMonitor>, policy: RetryPolicy) -> Self {
        Self {
            store,
            monitor,
            policy,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub async fn send(
        &self,
        content: &str,
        options: SendOptions,
        mode: SendMode,
    ) -> Result<(), ChatError> {
        let mut attempt = 1;
        loop {
            let outcome = match mode {
                SendMode::Blocking => self.store.send_message(content, options.clone()).await,
                SendMode::Streaming => self.store.stream_message(content, options.clone()).await,
            };
            let err = match outcome {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if !err.is_transport()
                || attempt >= self.policy.max_attempts
                || self.monitor.is_connected()
            {
                return Err(err);
            }

            let wait = self.policy.backoff(attempt);
            tracing::info!(attempt, ?wait, "send failed while disconnected; backing off");
            sleep(wait).await;
            if !self.monitor.probe().await {
                return Err(err);
            }
            self.store.rewind_failed_exchange();
            attempt += 1;
        }
    }
}
