//! Recurring announcements.
//!
//! `tick` is a pure function of the clock so the firing rules can be tested
//! without waiting: the first tick after start (or after an entry is updated)
//! only arms an entry, and an armed entry fires once a full interval has
//! passed since it last fired.

use crate::config::validate_schedule;
use crate::dispatcher::DispatchRequest;
use crate::error::ConfigurationError;
use crate::stop_requested;
use log::{debug, info, warn};
use shared::{MessageJob, ScheduleEntry, MAX_SCHEDULE_ENTRIES};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};

/// A request to replace or add one schedule entry on a running scheduler.
#[derive(Debug)]
pub struct ScheduleUpdate {
    pub entry: ScheduleEntry,
    pub reply: oneshot::Sender<Result<(), ConfigurationError>>,
}

#[derive(Debug, Clone)]
pub struct MessageScheduler {
    entries: Vec<ScheduleEntry>,
    warned_empty: HashSet<u8>,
}

impl MessageScheduler {
    pub fn new(entries: Vec<ScheduleEntry>) -> Result<Self, ConfigurationError> {
        validate_schedule(&entries)?;
        let mut entries: Vec<ScheduleEntry> = entries
            .into_iter()
            .map(|entry| ScheduleEntry {
                last_fired: None,
                ..entry
            })
            .collect();
        entries.sort_by_key(|entry| entry.id);
        Ok(Self {
            entries,
            warned_empty: HashSet::new(),
        })
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Jobs due at `now`, in entry id order.
    pub fn tick(&mut self, now: Instant) -> Vec<MessageJob> {
        let mut due = Vec::new();

        for entry in &mut self.entries {
            if !entry.enabled {
                entry.last_fired = None;
                continue;
            }

            let Some(last) = entry.last_fired else {
                entry.last_fired = Some(now);
                continue;
            };
            if now.saturating_duration_since(last) < entry.interval.as_duration() {
                continue;
            }
            entry.last_fired = Some(now);

            if entry.text.trim().is_empty() {
                if self.warned_empty.insert(entry.id) {
                    warn!("Schedule {} is enabled but has no text; skipping", entry.id);
                }
                continue;
            }
            debug!("Schedule {} due ({})", entry.id, entry.interval);
            due.push(MessageJob::scheduled(entry));
        }
        due
    }

    /// Replaces the entry with the same id, or adds it when a slot is free.
    /// The entry is re-armed on the next tick.
    pub fn update_entry(&mut self, entry: ScheduleEntry) -> Result<(), ConfigurationError> {
        entry
            .validate()
            .map_err(|reason| ConfigurationError::invalid("messages.scheduled", reason))?;
        let entry = ScheduleEntry {
            last_fired: None,
            ..entry
        };
        self.warned_empty.remove(&entry.id);

        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => {
                if self.entries.len() >= MAX_SCHEDULE_ENTRIES {
                    return Err(ConfigurationError::invalid(
                        "messages.scheduled",
                        format!("at most {} entries", MAX_SCHEDULE_ENTRIES),
                    ));
                }
                self.entries.push(entry);
                self.entries.sort_by_key(|e| e.id);
            }
        }
        Ok(())
    }

    /// Ticks every `every` and hands due jobs to the dispatcher.
    pub async fn run(
        mut self,
        every: Duration,
        dispatch: mpsc::Sender<DispatchRequest>,
        mut updates: mpsc::Receiver<ScheduleUpdate>,
        shutdown: watch::Receiver<bool>,
    ) {
        let enabled = self.entries.iter().filter(|e| e.enabled).count();
        info!(
            "Message scheduler started with {} entries ({} enabled)",
            self.entries.len(),
            enabled
        );
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let stop = stop_requested(shutdown);
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = tokio::time::Instant::now().into_std();
                    for job in self.tick(now) {
                        let request = DispatchRequest::Send { job, reply: None };
                        if dispatch.send(request).await.is_err() {
                            debug!("Dispatcher gone, stopping scheduler");
                            return;
                        }
                    }
                }
                Some(ScheduleUpdate { entry, reply }) = updates.recv() => {
                    let id = entry.id;
                    let result = self.update_entry(entry);
                    match &result {
                        Ok(()) => info!("Schedule {} updated", id),
                        Err(e) => warn!("Rejected update of schedule {}: {}", id, e),
                    }
                    let _ = reply.send(result);
                }
                _ = &mut stop => break,
            }
        }
        info!("Message scheduler stopped");
    }
}
