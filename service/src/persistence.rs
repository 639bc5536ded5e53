//! Durable storage behind a narrow async interface.
//!
//! The core never depends on how records are stored. `MemoryStore` keeps
//! everything in process; `FileStore` additionally writes the whole state to a
//! bincode file after every change (temp file + rename, so a crash never
//! leaves a torn file).

use crate::error::PersistenceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::{DeliveryResult, MessageJob, MessageKind, PlayerId, PlayerRecord};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// One delivery attempt as stored in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub job: MessageJob,
    pub result: DeliveryResult,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub by_kind: HashMap<MessageKind, usize>,
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn upsert_player(&self, record: &PlayerRecord) -> Result<(), PersistenceError>;

    /// Stores every record of one poll. Stores that write to disk do it once
    /// per call rather than once per record.
    async fn upsert_players(&self, records: &[PlayerRecord]) -> Result<(), PersistenceError> {
        for record in records {
            self.upsert_player(record).await?;
        }
        Ok(())
    }

    /// Stores a delivery attempt, successful or not.
    async fn record_message(
        &self,
        job: &MessageJob,
        result: &DeliveryResult,
    ) -> Result<(), PersistenceError>;

    /// Every known player as last stored.
    async fn load_last_snapshot(&self) -> Result<Vec<PlayerRecord>, PersistenceError>;

    /// Up to `limit` delivery attempts, newest first.
    async fn message_history(&self, limit: usize) -> Result<Vec<MessageRecord>, PersistenceError>;

    async fn message_stats(&self) -> Result<MessageStats, PersistenceError>;

    /// Drops the whole delivery history and returns how many entries it held.
    async fn clear_history(&self) -> Result<usize, PersistenceError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    players: BTreeMap<PlayerId, PlayerRecord>,
    /// Oldest first.
    history: VecDeque<MessageRecord>,
}

impl StoreState {
    fn upsert(&mut self, record: &PlayerRecord) {
        self.players.insert(record.id.clone(), record.clone());
    }

    fn clear_history(&mut self) -> usize {
        let cleared = self.history.len();
        self.history.clear();
        cleared
    }

    fn push_history(&mut self, job: &MessageJob, result: &DeliveryResult, limit: usize) {
        self.history.push_back(MessageRecord {
            job: job.clone(),
            result: result.clone(),
            recorded_at: Utc::now(),
        });
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    fn snapshot(&self) -> Vec<PlayerRecord> {
        self.players.values().cloned().collect()
    }

    fn recent(&self, limit: usize) -> Vec<MessageRecord> {
        self.history.iter().rev().take(limit).cloned().collect()
    }

    fn stats(&self) -> MessageStats {
        let mut stats = MessageStats::default();
        for record in &self.history {
            stats.total += 1;
            if record.result.success {
                stats.successful += 1;
            } else {
                stats.failed += 1;
            }
            *stats.by_kind.entry(record.job.kind).or_insert(0) += 1;
        }
        stats
    }
}

/// In-process store. Lost on exit.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    history_limit: usize,
}

impl MemoryStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            history_limit,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn upsert_player(&self, record: &PlayerRecord) -> Result<(), PersistenceError> {
        self.state.lock().await.upsert(record);
        Ok(())
    }

    async fn record_message(
        &self,
        job: &MessageJob,
        result: &DeliveryResult,
    ) -> Result<(), PersistenceError> {
        self.state
            .lock()
            .await
            .push_history(job, result, self.history_limit);
        Ok(())
    }

    async fn load_last_snapshot(&self) -> Result<Vec<PlayerRecord>, PersistenceError> {
        Ok(self.state.lock().await.snapshot())
    }

    async fn message_history(&self, limit: usize) -> Result<Vec<MessageRecord>, PersistenceError> {
        Ok(self.state.lock().await.recent(limit))
    }

    async fn message_stats(&self) -> Result<MessageStats, PersistenceError> {
        Ok(self.state.lock().await.stats())
    }

    async fn clear_history(&self) -> Result<usize, PersistenceError> {
        Ok(self.state.lock().await.clear_history())
    }
}

/// Store backed by a single bincode file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
    history_limit: usize,
}

impl FileStore {
    /// Opens `path`, starting empty when the file does not exist yet.
    pub async fn open(path: impl AsRef<Path>, history_limit: usize) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: StoreState = bincode::deserialize(&bytes)?;
                info!(
                    "Loaded {} players and {} history entries from {}",
                    state.players.len(),
                    state.history.len(),
                    path.display()
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No data file at {}, starting empty", path.display());
                StoreState::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
            history_limit,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, state: &StoreState) -> Result<(), PersistenceError> {
        let bytes = bincode::serialize(state)?;
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, &bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        debug!("Wrote {} bytes to {}", bytes.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for FileStore {
    async fn upsert_player(&self, record: &PlayerRecord) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state.upsert(record);
        self.flush(&state).await
    }

    async fn upsert_players(&self, records: &[PlayerRecord]) -> Result<(), PersistenceError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        for record in records {
            state.upsert(record);
        }
        self.flush(&state).await
    }

    async fn record_message(
        &self,
        job: &MessageJob,
        result: &DeliveryResult,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state.push_history(job, result, self.history_limit);
        self.flush(&state).await
    }

    async fn load_last_snapshot(&self) -> Result<Vec<PlayerRecord>, PersistenceError> {
        Ok(self.state.lock().await.snapshot())
    }

    async fn message_history(&self, limit: usize) -> Result<Vec<MessageRecord>, PersistenceError> {
        Ok(self.state.lock().await.recent(limit))
    }

    async fn message_stats(&self) -> Result<MessageStats, PersistenceError> {
        Ok(self.state.lock().await.stats())
    }

    async fn clear_history(&self) -> Result<usize, PersistenceError> {
        let mut state = self.state.lock().await;
        let cleared = state.clear_history();
        if cleared > 0 {
            info!("Cleared {} history entries", cleared);
            self.flush(&state).await?;
        }
        Ok(cleared)
    }
}
