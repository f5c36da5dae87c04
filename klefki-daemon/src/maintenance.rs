//! Periodic housekeeping: expire idle sessions, trim the replay cache and
//! reload the registry snapshot. The broker already syncs the registry per
//! request; the reload here also covers a missed change.

use std::sync::Arc;
use std::time::Duration;

use klefki_auth::BoundedReplayCache;
use klefki_core::{MachineRegistry, SessionEngine};
use klefki_registry::MachineStore;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Floor for `interval`; tokio rejects a zero period.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// What the sweep touches and how often.
pub struct Maintenance<R> {
    pub engine: Arc<SessionEngine<R>>,
    pub store: Arc<MachineStore>,
    pub replay_cache: Option<Arc<BoundedReplayCache>>,
    /// `None` keeps sessions until they are consumed.
    pub session_max_age: Option<Duration>,
    pub interval: Duration,
}

impl<R: MachineRegistry + 'static> Maintenance<R> {
    /// One sweep. Never fails; problems are logged and retried next tick.
    pub async fn run_once(&self) {
        if let Some(max_age) = self.session_max_age {
            let purged = self.engine.purge_expired(max_age);
            if !purged.is_empty() {
                tracing::info!(
                    count = purged.len(),
                    max_age_secs = max_age.as_secs(),
                    "Purged expired sessions"
                );
                for machine_id in &purged {
                    tracing::debug!(machine_id = %machine_id, "Session expired");
                }
            }
        }

        if let Some(cache) = &self.replay_cache {
            cache.cleanup_expired();
        }

        match self.store.refresh_cache().await {
            Ok(machines) => tracing::debug!(machines, "Registry snapshot refreshed"),
            Err(e) => tracing::warn!(error = %e, "Registry refresh failed, keeping previous snapshot"),
        }
    }

    /// Run sweeps every `interval` until shutdown is signalled.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval.max(MIN_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_once().await,
                    _ = shutdown.recv() => {
                        tracing::debug!("Maintenance task stopping");
                        break;
                    }
                }
            }
        })
    }
}
