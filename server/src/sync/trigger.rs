//! Wakes the executor.
//!
//! Passes for every kind run when connectivity comes back, on a fixed
//! interval, when the host application becomes visible again and on manual
//! request. Nothing runs while offline.

use super::{PassOutcome, SyncExecutor};
use crate::events::{EngineEvent, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

pub struct NetworkTrigger {
    executor: Arc<SyncExecutor>,
    online: watch::Sender<bool>,
    wake: Notify,
    events: EventBus,
}

impl NetworkTrigger {
    /// Create a trigger that starts out online.
    pub fn new(executor: Arc<SyncExecutor>, events: EventBus) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            executor,
            online,
            wake: Notify::new(),
            events,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Record a connectivity change. Returns whether the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
            self.events
                .publish(EngineEvent::ConnectivityChanged { online });
        }
        changed
    }

    /// The host application came back to the foreground.
    pub fn became_visible(&self) {
        tracing::debug!("Host became visible");
        self.request_sync();
    }

    /// Ask the background loop for a pass without waiting for it.
    pub fn request_sync(&self) {
        self.wake.notify_one();
    }

    /// Run passes for every kind now, unless offline.
    pub async fn sync_now(&self) -> Option<Vec<PassOutcome>> {
        if !self.is_online() {
            tracing::debug!("Offline, sync skipped");
            return None;
        }
        Some(self.executor.run_all().await)
    }

    /// Run the trigger loop until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut online = self.online.subscribe();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sync_now().await;
                    }
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *online.borrow_and_update() {
                            self.sync_now().await;
                        }
                    }
                    _ = self.wake.notified() => {
                        self.sync_now().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Network trigger stopped");
        })
    }
}

impl std::fmt::Debug for NetworkTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkTrigger")
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}
