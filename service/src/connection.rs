//! The single admin connection.
//!
//! One worker task owns the TCP stream. Everything else talks to it through a
//! cloneable `ConnectionHandle`, which queues commands on an mpsc channel and
//! waits for the reply on a oneshot. The queue is drained strictly one command
//! at a time because replies carry no correlation id: the next command is
//! written only after the previous reply was read or the exchange failed.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Reauthenticating
//!       ^             |             |               |
//!       +-------------+-------------+---------------+
//! ```
//!
//! Any exchange failure (timeout included, so a late reply can never be taken
//! for the answer to a later command) drops the stream and schedules a
//! reconnect with exponential backoff.

use crate::auth::{self, AuthStrategy, Credentials};
use crate::backoff::Backoff;
use crate::config::{ServiceConfig, TimingSettings};
use crate::error::{AuthError, ConnectionError};
use crate::events::{EventBus, ServiceEvent};
use crate::transport::LineTransport;
use crate::stop_requested;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use shared::protocol::{self, Command};
use shared::ConnectionState;
use std::collections::HashSet;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const REQUEST_QUEUE_CAPACITY: usize = 256;

/// Snapshot of the connection published to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Failed connects since the last successful one.
    pub reconnect_attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub preferred_strategy: Option<AuthStrategy>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            last_attempt: None,
            preferred_strategy: None,
        }
    }
}

/// Structured answer to one send: `success` is the only field callers may
/// trust for the outcome, `detail` is the server reply or the failure reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub success: bool,
    pub detail: String,
}

impl SendOutcome {
    /// Strict classification: only a non-empty reply that is not an `Error:`
    /// line counts as success.
    pub fn from_reply(reply: Result<String, ConnectionError>) -> Self {
        match reply {
            Ok(text) if text.trim().is_empty() => Self {
                success: false,
                detail: "empty reply".to_string(),
            },
            Ok(text) if protocol::is_error_response(&text) => Self {
                success: false,
                detail: text.trim().to_string(),
            },
            Ok(text) => Self {
                success: true,
                detail: text,
            },
            Err(e) => Self {
                success: false,
                detail: e.to_string(),
            },
        }
    }
}

struct CommandRequest {
    line: String,
    timeout: Duration,
    reply: oneshot::Sender<Result<String, ConnectionError>>,
}

/// Cloneable front end of the connection worker.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    requests: mpsc::Sender<CommandRequest>,
    status: watch::Receiver<ConnectionStatus>,
    command_timeout: Duration,
}

impl ConnectionHandle {
    /// Queues a raw command line and waits for its reply.
    ///
    /// Fails with `NotConnected` without touching the network while the
    /// connection is down, and with `ShuttingDown` once the worker has
    /// stopped.
    pub async fn send_command(
        &self,
        line: impl Into<String>,
        timeout: Duration,
    ) -> Result<String, ConnectionError> {
        let (reply, response) = oneshot::channel();
        let request = CommandRequest {
            line: line.into(),
            timeout,
            reply,
        };
        self.requests
            .send(request)
            .await
            .map_err(|_| ConnectionError::ShuttingDown)?;
        response.await.map_err(|_| ConnectionError::ShuttingDown)?
    }

    /// Sends a typed command with the configured command timeout.
    pub async fn execute(&self, command: &Command) -> Result<String, ConnectionError> {
        self.send_command(command.to_line(), self.command_timeout).await
    }

    pub async fn submit(&self, command: &Command) -> SendOutcome {
        SendOutcome::from_reply(self.execute(command).await)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Waits until the connection reaches `state`, up to `limit`.
    pub async fn wait_for_state(&self, state: ConnectionState, limit: Duration) -> bool {
        let mut status = self.status.clone();
        let reached = timeout(limit, status.wait_for(|s| s.state == state)).await;
        matches!(reached, Ok(Ok(_)))
    }
}

#[cfg(test)]
impl ConnectionHandle {
    /// A handle whose worker is already gone.
    pub(crate) fn detached(command_timeout: Duration) -> Self {
        let (requests, _) = mpsc::channel(1);
        let (_, status) = watch::channel(ConnectionStatus::default());
        Self {
            requests,
            status,
            command_timeout,
        }
    }

    /// A handle whose commands are answered by `answer` instead of a server.
    /// The returned sender sets the state the handle reports.
    pub(crate) fn scripted<F>(
        command_timeout: Duration,
        mut answer: F,
    ) -> (Self, watch::Sender<ConnectionStatus>)
    where
        F: FnMut(&str) -> Result<String, ConnectionError> + Send + 'static,
    {
        let (requests, mut incoming) = mpsc::channel::<CommandRequest>(REQUEST_QUEUE_CAPACITY);
        let (status_tx, status) = watch::channel(ConnectionStatus::default());
        tokio::spawn(async move {
            while let Some(request) = incoming.recv().await {
                let _ = request.reply.send(answer(&request.line));
            }
        });
        let handle = Self {
            requests,
            status,
            command_timeout,
        };
        (handle, status_tx)
    }
}

/// The worker that owns the stream. Create it with `ConnectionManager::spawn`.
pub struct ConnectionManager {
    address: String,
    credentials: Credentials,
    strategies: Vec<AuthStrategy>,
    /// Strategies that got no reply on an earlier stream; skipped until a
    /// pass completes.
    stalled: HashSet<AuthStrategy>,
    timing: TimingSettings,
    backoff: Backoff,
    transport: Option<LineTransport<TcpStream>>,
    status: watch::Sender<ConnectionStatus>,
    events: EventBus,
    requests: mpsc::Receiver<CommandRequest>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionManager {
    /// Starts the worker. It connects right away and keeps reconnecting until
    /// `shutdown` flips to true or every handle is dropped.
    pub fn spawn(
        config: &ServiceConfig,
        events: EventBus,
        shutdown: watch::Receiver<bool>,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let manager = ConnectionManager {
            address: config.address(),
            credentials: Credentials {
                password: config.server.password.clone(),
                usernames: config.server.auth_usernames.clone(),
            },
            strategies: config.server.auth_strategies.clone(),
            stalled: HashSet::new(),
            timing: config.timing.clone(),
            backoff: Backoff::from_timing(&config.timing),
            transport: None,
            status: status_tx,
            events,
            requests: request_rx,
            shutdown,
        };

        let handle = ConnectionHandle {
            requests: request_tx,
            status: status_rx,
            command_timeout: config.timing.command_timeout(),
        };
        (handle, tokio::spawn(manager.run()))
    }

    async fn run(mut self) {
        info!("Connection manager started for {}", self.address);
        let mut pending_delay: Option<Duration> = None;

        loop {
            if self.stopping() {
                break;
            }

            if self.transport.is_none() {
                if let Some(delay) = pending_delay.take() {
                    if !self.wait_out_backoff(delay).await {
                        break;
                    }
                }

                let stop = stop_requested(self.shutdown.clone());
                let connected = tokio::select! {
                    result = self.connect() => result,
                    _ = stop => break,
                };
                if let Err(e) = connected {
                    warn!("Connection to {} failed: {}", self.address, e);
                    pending_delay = Some(self.schedule_reconnect());
                }
                continue;
            }

            let stop = stop_requested(self.shutdown.clone());
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => {
                        debug!("All connection handles dropped");
                        break;
                    }
                },
                _ = stop => break,
            }

            if self.transport.is_none() {
                pending_delay = Some(self.schedule_reconnect());
            }
        }

        self.close().await;
    }

    fn stopping(&self) -> bool {
        // A dropped sender means the owner is gone.
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Sleeps through a backoff delay while answering queued requests with
    /// `NotConnected`. Returns false when the service is stopping.
    async fn wait_out_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let stop = stop_requested(self.shutdown.clone());
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                request = self.requests.recv() => match request {
                    Some(request) => {
                        debug!("Rejecting '{}' while disconnected", request.line);
                        let _ = request.reply.send(Err(ConnectionError::NotConnected));
                    }
                    None => return false,
                },
                _ = &mut stop => return false,
            }
        }
    }

    fn schedule_reconnect(&mut self) -> Duration {
        let delay = self.backoff.next_delay();
        let attempt = self.backoff.attempts();
        warn!(
            "Reconnect attempt {} to {} scheduled in {:.1}s",
            attempt,
            self.address,
            delay.as_secs_f64()
        );
        self.status.send_modify(|s| s.reconnect_attempts = attempt);
        self.events
            .publish(ServiceEvent::ReconnectScheduled { attempt, delay });
        delay
    }

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Connecting);
        self.status
            .send_modify(|s| s.last_attempt = Some(Utc::now()));

        match self.open_session().await {
            Ok((transport, strategy)) => {
                self.transport = Some(transport);
                self.backoff.reset();
                self.status.send_modify(|s| {
                    s.reconnect_attempts = 0;
                    s.preferred_strategy = Some(strategy);
                });
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn open_session(
        &mut self,
    ) -> Result<(LineTransport<TcpStream>, AuthStrategy), ConnectionError> {
        info!("Connecting to {}", self.address);
        let stream = timeout(self.timing.connect_timeout(), TcpStream::connect(&self.address))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        stream.set_nodelay(true)?;

        let mut transport = LineTransport::new(stream, self.timing.response_settle());
        if let Some(banner) = transport.read_banner(self.timing.auth_timeout()).await? {
            debug!("Server banner: {}", banner);
        }

        match self.login(&mut transport).await {
            Ok(strategy) => Ok((transport, strategy)),
            Err(e) => {
                transport.shutdown().await;
                Err(e)
            }
        }
    }

    /// One login pass over `transport`, skipping strategies that stalled on
    /// earlier streams.
    async fn login(
        &mut self,
        transport: &mut LineTransport<TcpStream>,
    ) -> Result<AuthStrategy, ConnectionError> {
        let order = auth::remaining_order(&self.strategies, &self.stalled);
        let preferred = self.status.borrow().preferred_strategy;
        let result = auth::authenticate(
            transport,
            &order,
            preferred,
            &self.credentials,
            self.timing.auth_timeout(),
        )
        .await;

        match &result {
            Ok(_) | Err(AuthError::Refused) => self.stalled.clear(),
            Err(AuthError::Stalled(strategy)) => {
                self.stalled.insert(*strategy);
            }
            Err(AuthError::Connection(_)) => {}
        }
        result.map_err(ConnectionError::from)
    }

    async fn handle_request(&mut self, request: CommandRequest) {
        if request.reply.is_closed() {
            debug!("Caller gave up on '{}' before it was sent", request.line);
            return;
        }
        let result = self.execute(&request.line, request.timeout).await;
        let _ = request.reply.send(result);
    }

    async fn execute(&mut self, line: &str, wait: Duration) -> Result<String, ConnectionError> {
        let Some(mut transport) = self.transport.take() else {
            return Err(ConnectionError::NotConnected);
        };

        let mut result = exchange(&mut transport, line, wait).await;
        if matches!(&result, Ok(reply) if protocol::indicates_auth_expired(reply)) {
            result = match self.reauthenticate(&mut transport).await {
                Ok(()) => exchange(&mut transport, line, wait).await,
                Err(e) => Err(e),
            };
            if matches!(&result, Ok(reply) if protocol::indicates_auth_expired(reply)) {
                result = Err(ConnectionError::AuthFailure);
            }
        }

        match result {
            Ok(reply) => {
                self.transport = Some(transport);
                Ok(reply)
            }
            Err(e) => {
                error!("Command '{}' failed: {}", line, e);
                transport.shutdown().await;
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn reauthenticate(
        &mut self,
        transport: &mut LineTransport<TcpStream>,
    ) -> Result<(), ConnectionError> {
        warn!("Server reports the session is no longer authenticated");
        self.set_state(ConnectionState::Reauthenticating);

        let strategy = self.login(transport).await?;

        self.status
            .send_modify(|s| s.preferred_strategy = Some(strategy));
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    fn set_state(&self, next: ConnectionState) {
        let current = self.status.borrow().state;
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            error!("Ignoring invalid connection transition {} -> {}", current, next);
            return;
        }
        info!("Connection state: {} -> {}", current, next);
        self.status.send_modify(|s| s.state = next);
        self.events.publish(ServiceEvent::ConnectionStateChanged {
            from: current,
            to: next,
        });
    }

    async fn close(&mut self) {
        self.requests.close();
        let mut rejected = 0;
        while let Ok(request) = self.requests.try_recv() {
            let _ = request.reply.send(Err(ConnectionError::ShuttingDown));
            rejected += 1;
        }
        if rejected > 0 {
            info!("Rejected {} queued commands on shutdown", rejected);
        }

        if let Some(mut transport) = self.transport.take() {
            transport.shutdown().await;
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Connection manager stopped");
    }
}

async fn exchange(
    transport: &mut LineTransport<TcpStream>,
    line: &str,
    wait: Duration,
) -> Result<String, ConnectionError> {
    transport.send_line(line).await?;
    transport.read_reply(wait).await
}
