//! Player presence tracking.
//!
//! Each poll sends `plys`, parses the reply and diffs it against the last
//! known snapshot. The snapshot starts from storage and survives reconnects,
//! so the first poll after a reconnect or restart only reports what really
//! changed while the helper was away.

use crate::connection::ConnectionHandle;
use crate::dispatcher::DispatchRequest;
use crate::error::PollError;
use crate::events::{EventBus, ServiceEvent};
use crate::geo::{GeoHandle, GeoResolution};
use crate::persistence::PersistenceGateway;
use crate::stop_requested;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use shared::protocol::{self, Command};
use shared::{ParsedPlayer, PlayerId, PlayerRecord, PlayerStatus};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

/// What one poll changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerDiff {
    /// Players that came online, including first sightings.
    pub joins: Vec<PlayerRecord>,
    pub leaves: Vec<PlayerRecord>,
    /// Players whose status did not flip but whose details changed, and
    /// offline players seen for the first time.
    pub updates: Vec<PlayerRecord>,
}

impl PlayerDiff {
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty() && self.updates.is_empty()
    }

    /// Every record that must be written to storage.
    pub fn changed(&self) -> impl Iterator<Item = &PlayerRecord> {
        self.joins.iter().chain(&self.leaves).chain(&self.updates)
    }
}

struct GeoLink {
    handle: GeoHandle,
    results: mpsc::Receiver<GeoResolution>,
    pending: HashSet<PlayerId>,
}

pub struct PlayerStateTracker {
    connection: ConnectionHandle,
    snapshot: HashMap<PlayerId, PlayerRecord>,
    geo: Option<GeoLink>,
}

impl PlayerStateTracker {
    /// `known` is the last snapshot loaded from storage.
    pub fn new(connection: ConnectionHandle, known: Vec<PlayerRecord>) -> Self {
        let snapshot = known
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Self {
            connection,
            snapshot,
            geo: None,
        }
    }

    /// Enables country lookups; results are picked up by `take_geo_updates`.
    pub fn with_geo(mut self, handle: GeoHandle, results: mpsc::Receiver<GeoResolution>) -> Self {
        self.geo = Some(GeoLink {
            handle,
            results,
            pending: HashSet::new(),
        });
        self
    }

    pub fn snapshot(&self) -> &HashMap<PlayerId, PlayerRecord> {
        &self.snapshot
    }

    pub fn online_count(&self) -> usize {
        self.snapshot.values().filter(|r| r.is_online()).count()
    }

    /// Fetches the player list and applies it.
    ///
    /// On any error the snapshot is left untouched.
    pub async fn poll(&mut self) -> Result<PlayerDiff, PollError> {
        let reply = self.connection.execute(&Command::ListPlayers).await?;
        let parsed = protocol::parse_player_list(&reply)?;
        Ok(self.apply(&parsed, Utc::now()))
    }

    /// Merges one parsed reply into the snapshot.
    pub fn apply(&mut self, parsed: &[ParsedPlayer], now: DateTime<Utc>) -> PlayerDiff {
        let mut diff = PlayerDiff::default();
        let mut reported = HashSet::with_capacity(parsed.len());

        for player in parsed {
            reported.insert(player.id.as_str());
            match self.snapshot.get_mut(&player.id) {
                Some(record) => {
                    let was_online = record.is_online();
                    let changed = record.absorb(player, now);
                    match (was_online, record.is_online()) {
                        (false, true) => diff.joins.push(record.clone()),
                        (true, false) => diff.leaves.push(record.clone()),
                        _ if changed => diff.updates.push(record.clone()),
                        _ => {}
                    }
                    request_country(&mut self.geo, record);
                }
                None => {
                    let record = PlayerRecord::first_sighting(player, now);
                    if record.is_online() {
                        diff.joins.push(record.clone());
                    } else {
                        diff.updates.push(record.clone());
                    }
                    request_country(&mut self.geo, &record);
                    self.snapshot.insert(record.id.clone(), record);
                }
            }
        }

        // Online players missing from the reply have left.
        for record in self.snapshot.values_mut() {
            if record.is_online() && !reported.contains(record.id.as_str()) {
                record.status = PlayerStatus::Offline;
                record.last_seen = now;
                diff.leaves.push(record.clone());
            }
        }

        debug!(
            "Poll applied: {} joins, {} leaves, {} updates, {} online",
            diff.joins.len(),
            diff.leaves.len(),
            diff.updates.len(),
            self.online_count()
        );
        diff
    }

    /// Drains finished country lookups into the snapshot and returns the
    /// records that changed.
    pub fn take_geo_updates(&mut self) -> Vec<PlayerRecord> {
        let Some(geo) = self.geo.as_mut() else {
            return Vec::new();
        };

        let mut updated = Vec::new();
        while let Ok(resolution) = geo.results.try_recv() {
            geo.pending.remove(&resolution.player_id);
            let Some(country) = resolution.country else {
                continue;
            };
            let Some(record) = self.snapshot.get_mut(&resolution.player_id) else {
                continue;
            };
            // The address changed while the lookup was in flight.
            if record.ip_address != resolution.ip {
                continue;
            }
            if record.country.as_deref() != Some(country.as_str()) {
                record.country = Some(country);
                updated.push(record.clone());
            }
        }
        updated
    }

    /// Polls on a fixed interval until shutdown.
    ///
    /// A poll that outlasts the interval makes the loop skip the missed ticks
    /// instead of queueing them, so polls never overlap.
    pub async fn run(
        mut self,
        every: Duration,
        persistence: Arc<dyn PersistenceGateway>,
        events: EventBus,
        dispatch: mpsc::Sender<DispatchRequest>,
        shutdown: watch::Receiver<bool>,
    ) {
        info!("Player tracker started, polling every {}s", every.as_secs());
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let stop = stop_requested(shutdown);
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut stop => break,
            }

            store(persistence.as_ref(), &self.take_geo_updates()).await;

            if !self.connection.is_connected() {
                debug!("Skipping poll while {}", self.connection.state());
                continue;
            }

            match self.poll().await {
                Ok(diff) => {
                    let changed: Vec<PlayerRecord> = diff.changed().cloned().collect();
                    store(persistence.as_ref(), &changed).await;
                    for record in diff.joins {
                        info!("Player joined: {} ({})", record.name, record.id);
                        events.publish(ServiceEvent::PlayerJoined(record.clone()));
                        if dispatch.send(DispatchRequest::PlayerJoined(record)).await.is_err() {
                            debug!("Dispatcher gone, dropping join notice");
                        }
                    }
                    for record in diff.leaves {
                        info!("Player left: {} ({})", record.name, record.id);
                        events.publish(ServiceEvent::PlayerLeft(record.clone()));
                        if dispatch.send(DispatchRequest::PlayerLeft(record)).await.is_err() {
                            debug!("Dispatcher gone, dropping leave notice");
                        }
                    }
                }
                Err(e) => {
                    warn!("Player poll failed: {}", e);
                    events.publish(ServiceEvent::PollFailed(e.to_string()));
                }
            }
        }
        info!("Player tracker stopped");
    }
}

fn request_country(geo: &mut Option<GeoLink>, record: &PlayerRecord) {
    let Some(geo) = geo.as_mut() else {
        return;
    };
    if !record.is_online()
        || record.ip_address.is_empty()
        || record.country.is_some()
        || geo.pending.contains(&record.id)
    {
        return;
    }
    if geo.handle.request(&record.id, &record.ip_address) {
        geo.pending.insert(record.id.clone());
    } else {
        debug!("Geolocation queue full, will retry {} later", record.id);
    }
}

async fn store(persistence: &dyn PersistenceGateway, records: &[PlayerRecord]) {
    if records.is_empty() {
        return;
    }
    if let Err(e) = persistence.upsert_players(records).await {
        error!("Failed to store {} player records: {}", records.len(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Greetings, MessageDispatcher};
    use crate::error::{ConnectionError, PersistenceError};
    use crate::geo::{GeoAnswer, GeoCacheResolver, GeoLookup};
    use crate::persistence::{MemoryStore, MessageRecord, MessageStats};
    use async_trait::async_trait;
    use shared::{ConnectionState, DeliveryResult, MessageJob, MessageKind};
    use std::collections::VecDeque;
    use std::net::IpAddr;
    use std::sync::Mutex;

    fn online(id: &str, name: &str) -> ParsedPlayer {
        ParsedPlayer {
            id: id.to_string(),
            name: name.to_string(),
            online: true,
            playfield: "Akua".to_string(),
            ..Default::default()
        }
    }

    fn offline(id: &str, name: &str) -> ParsedPlayer {
        ParsedPlayer {
            online: false,
            playfield: String::new(),
            ..online(id, name)
        }
    }

    fn tracker_with(known: Vec<PlayerRecord>) -> PlayerStateTracker {
        PlayerStateTracker::new(ConnectionHandle::detached(Duration::from_secs(1)), known)
    }

    fn ids(records: &[PlayerRecord]) -> Vec<&str> {
        let mut ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_first_poll_reports_online_players_as_joins() {
        let mut tracker = tracker_with(Vec::new());
        let diff = tracker.apply(&[online("1", "Ann"), online("2", "Bo")], Utc::now());

        assert_eq!(ids(&diff.joins), vec!["1", "2"]);
        assert!(diff.leaves.is_empty());
        assert_eq!(tracker.online_count(), 2);
    }

    #[test]
    fn test_unchanged_poll_is_empty() {
        let mut tracker = tracker_with(Vec::new());
        tracker.apply(&[online("1", "Ann")], Utc::now());
        let diff = tracker.apply(&[online("1", "Ann")], Utc::now());
        assert!(diff.is_empty());
    }

    #[test]
    fn test_diff_against_prior_snapshot() {
        let now = Utc::now();
        let known = vec![
            PlayerRecord::first_sighting(&online("A", "Ann"), now),
            PlayerRecord::first_sighting(&online("B", "Bo"), now),
        ];
        let mut tracker = tracker_with(known);

        let diff = tracker.apply(&[online("A", "Ann"), online("C", "Cy")], now);

        assert_eq!(ids(&diff.joins), vec!["C"]);
        assert_eq!(ids(&diff.leaves), vec!["B"]);
        assert!(diff.updates.is_empty());
        assert_eq!(diff.changed().count(), 2);
        assert_eq!(tracker.snapshot()["B"].status, PlayerStatus::Offline);
    }

    #[test]
    fn test_player_listed_offline_leaves_once() {
        let mut tracker = tracker_with(Vec::new());
        tracker.apply(&[online("1", "Ann")], Utc::now());

        let diff = tracker.apply(&[offline("1", "Ann")], Utc::now());
        assert_eq!(ids(&diff.leaves), vec!["1"]);

        let diff = tracker.apply(&[offline("1", "Ann")], Utc::now());
        assert!(diff.is_empty());
    }

    #[test]
    fn test_offline_first_sighting_is_an_update() {
        let mut tracker = tracker_with(Vec::new());
        let diff = tracker.apply(&[offline("9", "Dee")], Utc::now());

        assert!(diff.joins.is_empty());
        assert_eq!(ids(&diff.updates), vec!["9"]);
    }

    #[test]
    fn test_field_change_is_an_update() {
        let mut tracker = tracker_with(Vec::new());
        tracker.apply(&[online("1", "Ann")], Utc::now());

        let moved = ParsedPlayer {
            playfield: "Omicron".to_string(),
            ..online("1", "Ann")
        };
        let diff = tracker.apply(&[moved], Utc::now());
        assert!(diff.joins.is_empty() && diff.leaves.is_empty());
        assert_eq!(diff.updates.len(), 1);
        assert_eq!(diff.updates[0].playfield, "Omicron");
    }

    #[test]
    fn test_empty_server_marks_everyone_left() {
        let mut tracker = tracker_with(Vec::new());
        tracker.apply(&[online("1", "Ann"), online("2", "Bo")], Utc::now());

        let diff = tracker.apply(&[], Utc::now());
        assert_eq!(ids(&diff.leaves), vec!["1", "2"]);
        assert_eq!(tracker.online_count(), 0);
    }

    struct FixedCountry;

    #[async_trait]
    impl GeoLookup for FixedCountry {
        async fn lookup(&self, _ip: IpAddr) -> GeoAnswer {
            GeoAnswer::Country("Norway".to_string())
        }
    }

    #[tokio::test]
    async fn test_country_arrives_as_an_update() {
        let (results_tx, results_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let resolver = GeoCacheResolver::new(Arc::new(FixedCountry), Duration::ZERO);
        let (geo, _task) = resolver.spawn(results_tx, shutdown_rx);
        let mut tracker = tracker_with(Vec::new()).with_geo(geo, results_rx);

        let player = ParsedPlayer {
            ip_address: "84.208.0.1".to_string(),
            ..online("1", "Ann")
        };
        tracker.apply(&[player], Utc::now());

        let mut updates = Vec::new();
        for _ in 0..50 {
            updates = tracker.take_geo_updates();
            if !updates.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].country.as_deref(), Some("Norway"));
        assert_eq!(tracker.snapshot()["1"].country.as_deref(), Some("Norway"));
    }

    /// Remembers every batch of player writes.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        batches: Mutex<Vec<Vec<PlayerId>>>,
    }

    #[async_trait]
    impl PersistenceGateway for RecordingStore {
        async fn upsert_player(&self, record: &PlayerRecord) -> Result<(), PersistenceError> {
            self.upsert_players(std::slice::from_ref(record)).await
        }

        async fn upsert_players(&self, records: &[PlayerRecord]) -> Result<(), PersistenceError> {
            let ids = records.iter().map(|r| r.id.clone()).collect();
            self.batches.lock().unwrap().push(ids);
            self.inner.upsert_players(records).await
        }

        async fn record_message(
            &self,
            job: &MessageJob,
            result: &DeliveryResult,
        ) -> Result<(), PersistenceError> {
            self.inner.record_message(job, result).await
        }

        async fn load_last_snapshot(&self) -> Result<Vec<PlayerRecord>, PersistenceError> {
            self.inner.load_last_snapshot().await
        }

        async fn message_history(&self, limit: usize) -> Result<Vec<MessageRecord>, PersistenceError> {
            self.inner.message_history(limit).await
        }

        async fn message_stats(&self) -> Result<MessageStats, PersistenceError> {
            self.inner.message_stats().await
        }

        async fn clear_history(&self) -> Result<usize, PersistenceError> {
            self.inner.clear_history().await
        }
    }

    fn plys(online: &[(&str, &str)]) -> String {
        let mut reply = format!("Players connected ({}):\n", online.len());
        for (n, (id, name)) in online.iter().enumerate() {
            reply.push_str(&format!("{}: {}, {}, Akua, 10.0.0.{}|55000\n", n + 1, id, name, n + 1));
        }
        reply
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stores_changes_and_greets_players() {
        let mut replies = VecDeque::from([
            plys(&[("1", "Ann"), ("2", "Bo")]),
            plys(&[("1", "Ann"), ("3", "Cy")]),
        ]);
        let said = Arc::new(Mutex::new(Vec::new()));
        let console = said.clone();
        let (connection, status) = ConnectionHandle::scripted(Duration::from_secs(1), move |line| {
            if line == "plys" {
                let reply = if replies.len() > 1 { replies.pop_front() } else { replies.front().cloned() };
                return reply.ok_or(ConnectionError::NotConnected);
            }
            console.lock().unwrap().push(line.to_string());
            Ok("Message broadcast".to_string())
        });
        status.send_modify(|s| s.state = ConnectionState::Connected);

        let store = Arc::new(RecordingStore::default());
        let events = EventBus::new(64);
        let mut deliveries = events.subscribe();
        let (dispatch_tx, dispatch_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let greetings = Greetings {
            welcome: Some("Welcome, <playername>!".to_string()),
            goodbye: Some("Bye <playername>".to_string()),
        };
        let dispatcher = MessageDispatcher::new(
            Arc::new(connection.clone()),
            store.clone(),
            events.clone(),
            greetings,
        );
        let dispatching = tokio::spawn(dispatcher.run(dispatch_rx, shutdown_rx.clone()));
        let tracker = PlayerStateTracker::new(connection, Vec::new());
        let tracking = tokio::spawn(tracker.run(
            Duration::from_secs(10),
            store.clone(),
            events.clone(),
            dispatch_tx,
            shutdown_rx,
        ));

        // Two welcomes from the first poll, a welcome and a goodbye from the second.
        let mut delivered = 0;
        while delivered < 4 {
            let event = tokio::time::timeout(Duration::from_secs(60), deliveries.recv())
                .await
                .expect("deliveries stopped")
                .unwrap();
            if matches!(event, ServiceEvent::Delivery { .. }) {
                delivered += 1;
            }
        }

        assert_eq!(
            *store.batches.lock().unwrap(),
            vec![
                vec!["1".to_string(), "2".to_string()],
                vec!["3".to_string(), "2".to_string()],
            ]
        );
        assert_eq!(
            *said.lock().unwrap(),
            vec![
                "say 'Welcome, Ann!'",
                "say 'Welcome, Bo!'",
                "say 'Welcome, Cy!'",
                "say 'Bye Bo'",
            ]
        );

        let history = store.message_history(10).await.unwrap();
        let kinds: Vec<MessageKind> = history.iter().map(|r| r.job.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::Goodbye,
                MessageKind::Welcome,
                MessageKind::Welcome,
                MessageKind::Welcome,
            ]
        );
        assert!(history.iter().all(|r| r.result.success));

        let snapshot = store.load_last_snapshot().await.unwrap();
        let offline: Vec<&str> = snapshot
            .iter()
            .filter(|r| !r.is_online())
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(offline, vec!["Bo"]);

        shutdown_tx.send(true).unwrap();
        tracking.await.unwrap();
        dispatching.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_skips_polls_while_disconnected() {
        let polls = Arc::new(Mutex::new(0));
        let counter = polls.clone();
        let (connection, _status) = ConnectionHandle::scripted(Duration::from_secs(1), move |_| {
            *counter.lock().unwrap() += 1;
            Ok(plys(&[]))
        });

        let store = Arc::new(RecordingStore::default());
        let (dispatch_tx, _dispatch_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = PlayerStateTracker::new(connection, Vec::new());
        let tracking = tokio::spawn(tracker.run(
            Duration::from_secs(10),
            store.clone(),
            EventBus::new(8),
            dispatch_tx,
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_secs(35)).await;
        shutdown_tx.send(true).unwrap();
        tracking.await.unwrap();

        assert_eq!(*polls.lock().unwrap(), 0);
        assert!(store.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poll_without_connection_keeps_snapshot() {
        let mut tracker = tracker_with(Vec::new());
        tracker.apply(&[online("1", "Ann")], Utc::now());

        let result = tracker.poll().await;
        assert!(matches!(result, Err(PollError::Connection(_))));
        assert_eq!(tracker.online_count(), 1);
    }
}
