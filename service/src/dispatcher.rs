//! The one path every outgoing chat message takes.
//!
//! Welcome and goodbye notices, scheduled announcements and manual
//! broadcasts all end up in `MessageDispatcher::dispatch`, which sends through
//! the connection, classifies the outcome strictly and records the attempt.

use crate::connection::{ConnectionHandle, SendOutcome};
use crate::config::MessageSettings;
use crate::error::ConnectionError;
use crate::events::{EventBus, ServiceEvent};
use crate::persistence::PersistenceGateway;
use crate::stop_requested;
use async_trait::async_trait;
use log::{debug, error, info};
use shared::protocol::Command;
use shared::{DeliveryResult, MessageJob, PlayerRecord};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Where the dispatcher hands commands off.
#[async_trait]
pub trait CommandSink: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn submit(&self, command: &Command) -> SendOutcome;
}

#[async_trait]
impl CommandSink for ConnectionHandle {
    fn is_connected(&self) -> bool {
        ConnectionHandle::is_connected(self)
    }

    async fn submit(&self, command: &Command) -> SendOutcome {
        ConnectionHandle::submit(self, command).await
    }
}

/// Input of the dispatcher task.
#[derive(Debug)]
pub enum DispatchRequest {
    Send {
        job: MessageJob,
        reply: Option<oneshot::Sender<DeliveryResult>>,
    },
    PlayerJoined(PlayerRecord),
    PlayerLeft(PlayerRecord),
}

/// Welcome and goodbye templates; `None` when the notice is turned off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greetings {
    pub welcome: Option<String>,
    pub goodbye: Option<String>,
}

impl Greetings {
    pub fn welcome_for(&self, player: &PlayerRecord) -> Option<MessageJob> {
        self.welcome
            .as_deref()
            .map(|template| MessageJob::welcome(template, &player.name))
    }

    pub fn goodbye_for(&self, player: &PlayerRecord) -> Option<MessageJob> {
        self.goodbye
            .as_deref()
            .map(|template| MessageJob::goodbye(template, &player.name))
    }
}

impl From<&MessageSettings> for Greetings {
    fn from(settings: &MessageSettings) -> Self {
        Self {
            welcome: settings
                .welcome_enabled
                .then(|| settings.welcome_template.clone()),
            goodbye: settings
                .goodbye_enabled
                .then(|| settings.goodbye_template.clone()),
        }
    }
}

pub struct MessageDispatcher {
    sink: Arc<dyn CommandSink>,
    persistence: Arc<dyn PersistenceGateway>,
    events: EventBus,
    greetings: Greetings,
}

impl MessageDispatcher {
    pub fn new(
        sink: Arc<dyn CommandSink>,
        persistence: Arc<dyn PersistenceGateway>,
        events: EventBus,
        greetings: Greetings,
    ) -> Self {
        Self {
            sink,
            persistence,
            events,
            greetings,
        }
    }

    /// Sends one job and records the attempt.
    ///
    /// `success` is true only when the connection explicitly reported a
    /// successful send; anything else is a failure with the reason in
    /// `detail`.
    pub async fn dispatch(&self, job: MessageJob) -> DeliveryResult {
        let result = self.deliver(&job).await;
        self.record(job, result).await
    }

    async fn deliver(&self, job: &MessageJob) -> DeliveryResult {
        if job.text.trim().is_empty() {
            return DeliveryResult::failed("empty message");
        }
        if !self.sink.is_connected() {
            return DeliveryResult::failed(ConnectionError::NotConnected.to_string());
        }
        let outcome = self.sink.submit(&Command::Say(job.text.clone())).await;
        DeliveryResult {
            success: outcome.success,
            detail: outcome.detail,
        }
    }

    async fn record(&self, job: MessageJob, result: DeliveryResult) -> DeliveryResult {
        if result.success {
            info!("Sent {} message: {}", job.kind, job.text);
        } else {
            error!(
                "Failed to send {} message '{}': {}",
                job.kind, job.text, result.detail
            );
        }
        if let Err(e) = self.persistence.record_message(&job, &result).await {
            error!("Failed to record {} message: {}", job.kind, e);
        }
        self.events.publish(ServiceEvent::Delivery {
            job,
            result: result.clone(),
        });
        result
    }

    async fn handle(&self, request: DispatchRequest) {
        match request {
            DispatchRequest::Send { job, reply } => {
                let result = self.dispatch(job).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            DispatchRequest::PlayerJoined(player) => match self.greetings.welcome_for(&player) {
                Some(job) => {
                    self.dispatch(job).await;
                }
                None => debug!("Welcome messages disabled, {} not greeted", player.name),
            },
            DispatchRequest::PlayerLeft(player) => match self.greetings.goodbye_for(&player) {
                Some(job) => {
                    self.dispatch(job).await;
                }
                None => debug!("Goodbye messages disabled, {} not announced", player.name),
            },
        }
    }

    /// Records a request that will never be sent.
    async fn abandon(&self, request: DispatchRequest) {
        let (job, reply) = match request {
            DispatchRequest::Send { job, reply } => (Some(job), reply),
            DispatchRequest::PlayerJoined(player) => (self.greetings.welcome_for(&player), None),
            DispatchRequest::PlayerLeft(player) => (self.greetings.goodbye_for(&player), None),
        };
        if let Some(job) = job {
            let failed = DeliveryResult::failed(ConnectionError::ShuttingDown.to_string());
            let result = self.record(job, failed).await;
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
    }

    /// Serves requests one at a time until shutdown, then records whatever
    /// is still queued as failed.
    pub async fn run(self, mut requests: mpsc::Receiver<DispatchRequest>, shutdown: watch::Receiver<bool>) {
        info!("Message dispatcher started");
        let stop = stop_requested(shutdown);
        tokio::pin!(stop);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
            }
        }

        requests.close();
        while let Ok(request) = requests.try_recv() {
            self.abandon(request).await;
        }
        info!("Message dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use chrono::Utc;
    use shared::{MessageKind, ParsedPlayer};
    use std::sync::Mutex;

    struct StubSink {
        connected: bool,
        outcome: SendOutcome,
        sent: Mutex<Vec<String>>,
    }

    impl StubSink {
        fn new(connected: bool, success: bool, detail: &str) -> Arc<Self> {
            Arc::new(Self {
                connected,
                outcome: SendOutcome {
                    success,
                    detail: detail.to_string(),
                },
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandSink for StubSink {
        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn submit(&self, command: &Command) -> SendOutcome {
            self.sent.lock().unwrap().push(command.to_line());
            self.outcome.clone()
        }
    }

    fn greetings() -> Greetings {
        Greetings::from(&MessageSettings::default())
    }

    fn dispatcher(sink: Arc<StubSink>, store: Arc<MemoryStore>) -> MessageDispatcher {
        MessageDispatcher::new(sink, store, EventBus::new(16), greetings())
    }

    fn player(name: &str) -> PlayerRecord {
        let parsed = ParsedPlayer {
            id: "5".to_string(),
            name: name.to_string(),
            online: true,
            ..Default::default()
        };
        PlayerRecord::first_sighting(&parsed, Utc::now())
    }

    #[tokio::test]
    async fn test_reported_failure_is_recorded_as_failure() {
        let sink = StubSink::new(true, false, "x");
        let store = Arc::new(MemoryStore::default());
        let dispatcher = dispatcher(sink, store.clone());

        let result = dispatcher.dispatch(MessageJob::broadcast("hello")).await;
        assert!(!result.success);
        assert_eq!(result.detail, "x");

        let history = store.message_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].result.success);
        assert_eq!(history[0].result.detail, "x");
    }

    #[tokio::test]
    async fn test_success_sends_say_command() {
        let sink = StubSink::new(true, true, "sent");
        let store = Arc::new(MemoryStore::default());
        let dispatcher = dispatcher(sink.clone(), store.clone());

        let result = dispatcher.dispatch(MessageJob::broadcast("it's late")).await;
        assert!(result.success);
        assert_eq!(sink.sent(), vec!["say 'it\\'s late'".to_string()]);
        assert_eq!(store.message_stats().await.unwrap().successful, 1);
    }

    #[tokio::test]
    async fn test_not_connected_never_sends() {
        let sink = StubSink::new(false, true, "sent");
        let store = Arc::new(MemoryStore::default());
        let dispatcher = dispatcher(sink.clone(), store.clone());

        let result = dispatcher.dispatch(MessageJob::broadcast("hello")).await;
        assert_eq!(result, DeliveryResult::failed("not connected"));
        assert!(sink.sent().is_empty());
        assert_eq!(store.message_stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_empty_text_fails_without_sending() {
        let sink = StubSink::new(true, true, "sent");
        let store = Arc::new(MemoryStore::default());
        let dispatcher = dispatcher(sink.clone(), store);

        let result = dispatcher.dispatch(MessageJob::broadcast("   ")).await;
        assert!(!result.success);
        assert!(sink.sent().is_empty());
    }

    #[test]
    fn test_greetings_follow_toggles() {
        let mut settings = MessageSettings::default();
        settings.goodbye_enabled = false;
        let greetings = Greetings::from(&settings);

        let welcome = greetings.welcome_for(&player("Ann")).unwrap();
        assert_eq!(welcome.kind, MessageKind::Welcome);
        assert_eq!(welcome.text, "Welcome to Space Cowboys, Ann!");
        assert_eq!(welcome.player.as_deref(), Some("Ann"));
        assert!(greetings.goodbye_for(&player("Ann")).is_none());
    }

    #[tokio::test]
    async fn test_run_greets_joining_players() {
        let sink = StubSink::new(true, true, "sent");
        let store = Arc::new(MemoryStore::default());
        let dispatcher = dispatcher(sink.clone(), store.clone());
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.run(rx, shutdown_rx));

        tx.send(DispatchRequest::PlayerJoined(player("Ann"))).await.unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(DispatchRequest::Send {
            job: MessageJob::broadcast("hi all"),
            reply: Some(reply_tx),
        })
        .await
        .unwrap();
        assert!(reply_rx.await.unwrap().success);

        assert_eq!(
            sink.sent(),
            vec![
                "say 'Welcome to Space Cowboys, Ann!'".to_string(),
                "say 'hi all'".to_string(),
            ]
        );

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_jobs_fail_on_shutdown() {
        let sink = StubSink::new(true, true, "sent");
        let store = Arc::new(MemoryStore::default());
        let dispatcher = dispatcher(sink.clone(), store.clone());
        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(DispatchRequest::Send {
            job: MessageJob::broadcast("too late"),
            reply: Some(reply_tx),
        })
        .await
        .unwrap();
        dispatcher.run(rx, shutdown_rx).await;

        let result = reply_rx.await.unwrap();
        assert_eq!(result, DeliveryResult::failed("service shutting down"));
        assert!(sink.sent().is_empty());
        assert_eq!(store.message_stats().await.unwrap().failed, 1);
    }
}
