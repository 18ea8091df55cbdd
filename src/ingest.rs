//! Event ingestion loop
//!
//! A single long-lived task consumes the runtime event feed and keeps the
//! registry in sync:
//! - container `start` → inspect → resolve → upsert
//! - container `die`/`stop`/`destroy` → remove the entry that container owns
//!   (when pruning is enabled)
//!
//! When the feed ends or fails the loop resubscribes with exponential backoff.
//! Every (re)connect optionally resyncs from the list of running containers
//! so events missed while disconnected are recovered. Subscriptions replay
//! from a timestamp taken before that listing (or from the last event seen),
//! so a container starting in between is still delivered as an event. The
//! loop's state is published on a watch channel as [`FeedHealth`].

use crate::backoff::calculate_backoff;
use crate::config::DockerSettings;
use crate::events::{EventSource, RuntimeEvent, SourceError};
use crate::registry::SharedRegistry;
use crate::resolver;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Observable state of the event feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeedHealth {
    /// Subscribed, not yet confirmed live
    Connecting,
    /// Receiving events
    Streaming,
    /// Feed dropped; waiting before reconnect attempt `attempt`
    Reconnecting { attempt: u32, last_error: String },
    /// Gave up reconnecting; existing routes keep working but no new
    /// containers are learned
    Degraded { last_error: String },
    /// Loop exited on shutdown
    Stopped,
}

impl FeedHealth {
    pub fn is_degraded(&self) -> bool {
        matches!(self, FeedHealth::Degraded { .. })
    }
}

/// Supervised consumer of an [`EventSource`]
pub struct EventIngestor<S: EventSource> {
    source: Arc<S>,
    registry: SharedRegistry,
    settings: DockerSettings,
    domain: String,
    health_tx: watch::Sender<FeedHealth>,
}

impl<S: EventSource> EventIngestor<S> {
    pub fn new(source: Arc<S>, registry: SharedRegistry, settings: DockerSettings) -> Self {
        let (health_tx, _) = watch::channel(FeedHealth::Connecting);
        Self {
            source,
            registry,
            settings,
            domain: "localhost".to_string(),
            health_tx,
        }
    }

    /// Domain used when logging registrations (`name.domain`)
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Subscribe to feed health changes
    pub fn health(&self) -> watch::Receiver<FeedHealth> {
        self.health_tx.subscribe()
    }

    fn set_health(&self, health: FeedHealth) {
        self.health_tx.send_replace(health);
    }

    /// Run until shutdown, or until the feed is given up.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut failures: u32 = 0;
        let mut last_seen: Option<i64> = None;
        info!("Listening to container runtime events");

        loop {
            let since = *last_seen.get_or_insert_with(unix_now);
            let mut live = false;

            if self.settings.resync_on_connect {
                match self.resync().await {
                    Ok(count) => {
                        debug!(count, routes = self.registry.len(), "Resynced running containers");
                        live = true;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to list running containers");
                    }
                }
            }

            if live {
                failures = 0;
                self.set_health(FeedHealth::Streaming);
            } else if failures == 0 {
                self.set_health(FeedHealth::Connecting);
            }

            debug!(since, "Subscribing to runtime events");
            let mut stream = self.source.subscribe(Some(since));

            let last_error = loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Event ingestion shutting down");
                            self.set_health(FeedHealth::Stopped);
                            return;
                        }
                    }
                    next = stream.next() => {
                        match next {
                            Some(Ok(event)) => {
                                if let Some(time) = event.time {
                                    last_seen = Some(last_seen.map_or(time, |seen| seen.max(time)));
                                }
                                if !live {
                                    live = true;
                                    failures = 0;
                                    self.set_health(FeedHealth::Streaming);
                                }
                                self.handle_event(&event).await;
                            }
                            Some(Err(e)) => break e.to_string(),
                            None => break "event stream ended".to_string(),
                        }
                    }
                }
            };
            drop(stream);

            failures += 1;
            let max = self.settings.max_reconnect_attempts;
            if max > 0 && failures > max {
                error!(
                    attempts = max,
                    error = %last_error,
                    "Event feed lost and reconnect attempts exhausted; serving existing routes only"
                );
                self.set_health(FeedHealth::Degraded { last_error });
                return;
            }

            let delay = calculate_backoff(
                failures,
                self.settings.reconnect_base_ms,
                self.settings.reconnect_max_ms,
            );
            warn!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "Event feed disconnected, reconnecting"
            );
            self.set_health(FeedHealth::Reconnecting {
                attempt: failures,
                last_error,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Event ingestion shutting down");
                        self.set_health(FeedHealth::Stopped);
                        return;
                    }
                }
            }
        }
    }

    /// Apply one runtime event to the registry
    pub async fn handle_event(&self, event: &RuntimeEvent) {
        let Some(container_id) = event.container_id.as_deref() else {
            return;
        };

        if event.is_container_start() {
            self.register(container_id).await;
        } else if event.is_container_stop() && self.settings.prune_on_stop {
            let removed = match event.name.as_deref() {
                Some(name) => self.registry.remove_if_owned(name, container_id),
                None => self.registry.remove_by_container(container_id),
            };
            if let Some(entry) = removed {
                info!(
                    name = %entry.name,
                    container_id,
                    action = %event.action,
                    "Unregistered {}.{}",
                    entry.name,
                    self.domain
                );
            }
        }
    }

    /// Inspect a container and upsert its entry if it is routable.
    ///
    /// Returns whether an entry was registered.
    async fn register(&self, container_id: &str) -> bool {
        let metadata = match self.source.inspect(container_id).await {
            Ok(metadata) => metadata,
            Err(SourceError::NotFound(_)) => {
                debug!(container_id, "Container gone before inspection");
                return false;
            }
            Err(e) => {
                warn!(container_id, error = %e, "Failed to inspect container");
                return false;
            }
        };

        match resolver::resolve(&metadata) {
            Some(entry) => {
                info!(
                    name = %entry.name,
                    address = %entry.address,
                    port = entry.port,
                    container_id,
                    "Registering {}.{} --> http://{}",
                    entry.name,
                    self.domain,
                    entry.authority()
                );
                self.registry.upsert(entry);
                true
            }
            None => {
                debug!(container_id, name = ?metadata.name, "Container is not routable");
                false
            }
        }
    }

    /// Register every running container and, when pruning, drop entries of
    /// containers that are no longer running.
    async fn resync(&self) -> Result<usize, SourceError> {
        let running = self.source.running().await?;
        let mut registered = 0;
        for id in &running {
            if self.register(id).await {
                registered += 1;
            }
        }

        if self.settings.prune_on_stop {
            let live: HashSet<String> = running.into_iter().collect();
            for entry in self.registry.retain_containers(&live) {
                info!(name = %entry.name, "Unregistered {}.{} (container no longer running)", entry.name, self.domain);
            }
        }

        Ok(registered)
    }
}

/// Current unix time in whole seconds
fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
