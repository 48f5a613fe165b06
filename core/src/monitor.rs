//! Backend health tracking.
//!
//! The monitor probes `/health` when started and then on a fixed interval. A
//! failed probe marks the store disconnected and schedules a single reconnect
//! probe; a newer failure replaces a pending reconnect instead of adding one.

use crate::config::MonitorSettings;
use crate::state::SessionStore;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

pub const RECONNECTING_MESSAGE: &str = "Connection lost. Attempting to reconnect...";

pub struct ConnectionMonitor {
    core: Arc<MonitorCore>,
}

struct MonitorCore {
    store: SessionStore,
    settings: MonitorSettings,
    timers: Mutex<Timers>,
}

#[derive(Default)]
struct Timers {
    periodic: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    reconnect_generation: u64,
    shut_down: bool,
}

impl ConnectionMonitor {
    pub fn new(store: SessionStore, settings: MonitorSettings) -> Self {
        Self {
            core: Arc::new(MonitorCore {
                store,
                settings,
                timers: Mutex::new(Timers::default()),
            }),
        }
    }

    /// Arms the periodic probe and runs the first probe right away.
    pub async fn start(&self) -> bool {
        self.start_periodic();
        self.probe().await
    }

    pub fn start_periodic(&self) {
        let weak = Arc::downgrade(&self.core);
        let period = self.core.settings.health_interval;
        let mut timers = self.core.timers.lock();
        if timers.shut_down {
            return;
        }
        if let Some(previous) = timers.periodic.take() {
            previous.abort();
        }
        timers.periodic = Some(tokio::spawn(periodic_probe(weak, period)));
    }

    pub async fn probe(&self) -> bool {
        self.core.probe().await
    }

    pub fn is_connected(&self) -> bool {
        self.core.store.is_connected()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.core
            .timers
            .lock()
            .reconnect
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancels both timers. Later failures no longer schedule reconnects.
    pub fn shutdown(&self) {
        let mut timers = self.core.timers.lock();
        timers.shut_down = true;
        if let Some(handle) = timers.periodic.take() {
            handle.abort();
        }
        if let Some(handle) = timers.reconnect.take() {
            handle.abort();
        }
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MonitorCore {
    async fn probe(self: &Arc<Self>) -> bool {
        match self.store.api().health_check().await {
            Ok(health) if health.is_usable() => {
                let was_connected = self.store.is_connected();
                self.store.mark_connected();
                if !was_connected {
                    tracing::info!("backend connection restored");
                }
                true
            }
            Ok(health) => {
                tracing::warn!(status = ?health.status, "backend reported unhealthy");
                self.lost();
                false
            }
            Err(err) => {
                tracing::warn!(%err, "health check failed");
                self.lost();
                false
            }
        }
    }

    fn lost(self: &Arc<Self>) {
        self.store.mark_disconnected(RECONNECTING_MESSAGE);
        let mut timers = self.timers.lock();
        if timers.shut_down {
            return;
        }
        if let Some(previous) = timers.reconnect.take() {
            previous.abort();
        }
        timers.reconnect_generation += 1;
        let generation = timers.reconnect_generation;
        let weak = Arc::downgrade(self);
        let delay = self.settings.reconnect_delay;
        tracing::debug!(?delay, "scheduling reconnect probe");
        timers.reconnect = Some(tokio::spawn(async move {
            sleep(delay).await;
            let Some(core) = weak.upgrade() else {
                return;
            };
            {
                let mut timers = core.timers.lock();
                if timers.reconnect_generation != generation {
                    return;
                }
                // Detach so a failing probe can schedule the next attempt.
                timers.reconnect = None;
            }
            core.probe().await;
        }));
    }
}

async fn periodic_probe(core: Weak<MonitorCore>, period: std::time::Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(core) = core.upgrade() else {
            break;
        };
        core.probe().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::transport::ApiClient;
    use std::time::Duration;

    fn monitor() -> (ConnectionMonitor, Arc<MockTransport>, SessionStore) {
        let mock = Arc::new(MockTransport::default());
        let store = SessionStore::in_memory(ApiClient::mock(mock.clone()));
        let monitor = ConnectionMonitor::new(store.clone(), MonitorSettings::default());
        (monitor, mock, store)
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_start_marks_connected() {
        let (monitor, mock, store) = monitor();
        store.mark_disconnected("stale");
        assert!(monitor.start().await);
        assert!(monitor.is_connected());
        assert!(store.error().is_none());
        assert_eq!(mock.health_checks(), 1);
        assert!(!monitor.reconnect_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probes_share_one_reconnect_timer() {
        let (monitor, mock, store) = monitor();
        mock.set_healthy(false);

        assert!(!monitor.probe().await);
        assert!(monitor.reconnect_pending());
        assert!(!store.is_connected());
        assert_eq!(store.error().as_deref(), Some(RECONNECTING_MESSAGE));

        sleep(Duration::from_secs(2)).await;
        assert!(!monitor.probe().await);
        assert!(monitor.reconnect_pending());
        assert_eq!(mock.health_checks(), 2);

        // The first timer (due at 5s) was replaced by one due at 7s.
        sleep(Duration::from_millis(5_500)).await;
        assert_eq!(mock.health_checks(), 3);
        assert!(monitor.reconnect_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_probe_restores_the_connection() {
        let (monitor, mock, store) = monitor();
        mock.script_health([false]);
        assert!(!monitor.probe().await);

        sleep(Duration::from_millis(5_100)).await;
        assert_eq!(mock.health_checks(), 2);
        assert!(store.is_connected());
        assert!(store.error().is_none());
        assert!(!monitor.reconnect_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_probe_runs_until_shutdown() {
        let (monitor, mock, _store) = monitor();
        monitor.start().await;
        sleep(Duration::from_millis(30_100)).await;
        assert_eq!(mock.health_checks(), 2);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(mock.health_checks(), 3);

        monitor.shutdown();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(mock.health_checks(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_monitor_cancels_pending_reconnect() {
        let (monitor, mock, _store) = monitor();
        mock.set_healthy(false);
        monitor.start().await;
        drop(monitor);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(mock.health_checks(), 1);
    }
}
