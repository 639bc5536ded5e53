//! Supervisor: starts every component, hands out the public surface and
//! shuts everything down again.
//!
//! Components only talk through channels. The connection worker owns the
//! socket, the tracker owns the player snapshot, the scheduler owns its
//! entries and the dispatcher owns the send path; this module only wires the
//! channels between them.

use crate::admin::AdminCommands;
use crate::config::ServiceConfig;
use crate::connection::{ConnectionHandle, ConnectionManager, ConnectionStatus};
use crate::dispatcher::{DispatchRequest, Greetings, MessageDispatcher};
use crate::error::{AdminError, ConfigurationError, ConnectionError, PersistenceError};
use crate::events::{EventBus, ServiceEvent};
use crate::geo::{GeoCacheResolver, GeoHandle, GeoLookup, IpApiLookup, UNKNOWN_LOCATION};
use crate::persistence::{MessageRecord, MessageStats, PersistenceGateway};
use crate::scheduler::{MessageScheduler, ScheduleUpdate};
use crate::tracker::PlayerStateTracker;
use log::{error, info, warn};
use shared::{DeliveryResult, MessageJob, ScheduleEntry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const DISPATCH_QUEUE_CAPACITY: usize = 256;
const GEO_RESULTS_CAPACITY: usize = 128;
const SCHEDULE_UPDATES_CAPACITY: usize = 16;

/// Extra time each task gets to stop on top of one command timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Service;

impl Service {
    /// Validates `config`, loads the last snapshot from `persistence` and
    /// starts every component.
    ///
    /// `geo_backend` replaces the HTTP geolocation backend; pass `None` to use
    /// the configured endpoint.
    pub async fn start(
        config: ServiceConfig,
        persistence: Arc<dyn PersistenceGateway>,
        geo_backend: Option<Arc<dyn GeoLookup>>,
    ) -> Result<ServiceHandle, ConfigurationError> {
        Self::launch(config, persistence, geo_backend, EventBus::default()).await
    }

    async fn launch(
        config: ServiceConfig,
        persistence: Arc<dyn PersistenceGateway>,
        geo_backend: Option<Arc<dyn GeoLookup>>,
        events: EventBus,
    ) -> Result<ServiceHandle, ConfigurationError> {
        config.validate()?;
        let scheduler = MessageScheduler::new(config.messages.scheduled.clone())?;

        let known = match persistence.load_last_snapshot().await {
            Ok(known) => known,
            Err(e) => {
                warn!("Could not load the last player snapshot, starting empty: {}", e);
                Vec::new()
            }
        };
        info!(
            "Starting service for {} with {} known players",
            config.address(),
            known.len()
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let (connection, task) =
            ConnectionManager::spawn(&config, events.clone(), shutdown_rx.clone());
        tasks.push(("connection", task));

        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);
        let dispatcher = MessageDispatcher::new(
            Arc::new(connection.clone()),
            persistence.clone(),
            events.clone(),
            Greetings::from(&config.messages),
        );
        tasks.push((
            "dispatcher",
            tokio::spawn(dispatcher.run(dispatch_rx, shutdown_rx.clone())),
        ));

        let mut tracker = PlayerStateTracker::new(connection.clone(), known);
        let mut geo = None;
        if let Some(backend) = geo_backend_for(&config, geo_backend.as_ref()) {
            let (results_tx, results_rx) = mpsc::channel(GEO_RESULTS_CAPACITY);
            let resolver = GeoCacheResolver::new(
                backend,
                Duration::from_millis(config.geo.min_request_gap_ms),
            );
            let (handle, task) = resolver.spawn(results_tx, shutdown_rx.clone());
            tasks.push(("geo", task));
            tracker = tracker.with_geo(handle.clone(), results_rx);
            geo = Some(handle);
        }
        tasks.push((
            "tracker",
            tokio::spawn(tracker.run(
                config.timing.poll_interval(),
                persistence.clone(),
                events.clone(),
                dispatch_tx.clone(),
                shutdown_rx.clone(),
            )),
        ));

        let (schedule_tx, schedule_rx) = mpsc::channel(SCHEDULE_UPDATES_CAPACITY);
        tasks.push((
            "scheduler",
            tokio::spawn(scheduler.run(
                config.timing.scheduler_tick(),
                dispatch_tx.clone(),
                schedule_rx,
                shutdown_rx,
            )),
        ));

        Ok(ServiceHandle {
            admin: AdminCommands::new(connection.clone()),
            config,
            connection,
            persistence,
            geo_backend,
            geo,
            events,
            dispatch: dispatch_tx,
            schedule: schedule_tx,
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

fn geo_backend_for(
    config: &ServiceConfig,
    provided: Option<&Arc<dyn GeoLookup>>,
) -> Option<Arc<dyn GeoLookup>> {
    if !config.geo.enabled {
        return None;
    }
    if let Some(backend) = provided {
        return Some(backend.clone());
    }
    match IpApiLookup::new(&config.geo) {
        Ok(backend) => Some(Arc::new(backend) as Arc<dyn GeoLookup>),
        Err(e) => {
            error!("Geolocation disabled, HTTP client setup failed: {}", e);
            None
        }
    }
}

/// Public surface of a running service.
pub struct ServiceHandle {
    config: ServiceConfig,
    connection: ConnectionHandle,
    admin: AdminCommands,
    persistence: Arc<dyn PersistenceGateway>,
    geo_backend: Option<Arc<dyn GeoLookup>>,
    geo: Option<GeoHandle>,
    events: EventBus,
    dispatch: mpsc::Sender<DispatchRequest>,
    schedule: mpsc::Sender<ScheduleUpdate>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl ServiceHandle {
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Sends `text` to every player through the dispatcher.
    pub async fn broadcast(&self, text: impl Into<String>) -> DeliveryResult {
        let (reply, response) = oneshot::channel();
        let request = DispatchRequest::Send {
            job: MessageJob::broadcast(text),
            reply: Some(reply),
        };
        if self.dispatch.send(request).await.is_err() {
            return DeliveryResult::failed(ConnectionError::ShuttingDown.to_string());
        }
        response
            .await
            .unwrap_or_else(|_| DeliveryResult::failed(ConnectionError::ShuttingDown.to_string()))
    }

    /// Replaces or adds a schedule entry on the running scheduler.
    pub async fn update_schedule(&mut self, entry: ScheduleEntry) -> Result<(), ConfigurationError> {
        let (reply, response) = oneshot::channel();
        let update = ScheduleUpdate {
            entry: entry.clone(),
            reply,
        };
        let stopped = || ConfigurationError::invalid("messages.scheduled", "scheduler is not running");
        self.schedule.send(update).await.map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())??;

        let scheduled = &mut self.config.messages.scheduled;
        match scheduled.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => {
                scheduled.push(entry);
                scheduled.sort_by_key(|e| e.id);
            }
        }
        Ok(())
    }

    pub async fn kick_player(&self, name: &str, reason: &str) -> Result<String, AdminError> {
        self.admin.kick_player(name, reason).await
    }

    pub async fn ban_player(&self, id: &str, duration: Option<&str>) -> Result<String, AdminError> {
        self.admin.ban_player(id, duration).await
    }

    pub async fn unban_player(&self, id: &str) -> Result<String, AdminError> {
        self.admin.unban_player(id).await
    }

    /// Country for `ip`, or "Unknown location" when lookups are disabled or
    /// unavailable.
    pub async fn lookup_country(&self, ip: &str) -> String {
        match &self.geo {
            Some(geo) => geo.lookup_country(ip).await,
            None => UNKNOWN_LOCATION.to_string(),
        }
    }

    pub async fn message_history(&self, limit: usize) -> Result<Vec<MessageRecord>, PersistenceError> {
        self.persistence.message_history(limit).await
    }

    pub async fn message_stats(&self) -> Result<MessageStats, PersistenceError> {
        self.persistence.message_stats().await
    }

    /// Empties the delivery history; player records are kept.
    pub async fn clear_history(&self) -> Result<usize, PersistenceError> {
        self.persistence.clear_history().await
    }

    /// Stops every component and starts them again with `config`, keeping
    /// the persistence gateway and event subscribers. An invalid `config` is
    /// rejected before anything is stopped.
    pub async fn reload(&mut self, config: ServiceConfig) -> Result<(), ConfigurationError> {
        config.validate()?;
        info!("Reloading configuration for {}", config.address());
        self.stop().await;

        let fresh = Service::launch(
            config,
            self.persistence.clone(),
            self.geo_backend.clone(),
            self.events.clone(),
        )
        .await?;
        *self = fresh;
        Ok(())
    }

    pub async fn shutdown(mut self) {
        info!("Shutting down");
        self.stop().await;
        info!("Shutdown complete");
    }

    async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        let grace = self.config.timing.command_timeout() + SHUTDOWN_GRACE;

        for (name, task) in self.tasks.drain(..) {
            let abort = task.abort_handle();
            match timeout(grace, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} task failed: {}", name, e),
                Err(_) => {
                    warn!("{} task did not stop within {:?}, aborting", name, grace);
                    abort.abort();
                }
            }
        }
    }
}
