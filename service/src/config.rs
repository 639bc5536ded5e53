//! Service configuration loaded from a TOML file.
//!
//! A `ServiceConfig` is an immutable value handed to every component at
//! construction. Nothing in the service mutates it; a reload builds a new value
//! and restarts the components (see `ServiceHandle::reload`).

use crate::auth::AuthStrategy;
use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use shared::{ScheduleEntry, MAX_SCHEDULE_ENTRIES, PLAYER_NAME_PLACEHOLDER};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Polls faster than this put noticeable load on busy servers.
pub const MIN_POLL_INTERVAL_SECS: u64 = 10;

pub const DEFAULT_WELCOME_TEMPLATE: &str = "Welcome to Space Cowboys, <playername>!";
pub const DEFAULT_GOODBYE_TEMPLATE: &str = "Player <playername> has left our galaxy";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub messages: MessageSettings,
    #[serde(default)]
    pub geo: GeoSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Where the admin endpoint lives and how to log in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    /// Tried in this order; the first one that works is preferred afterwards.
    #[serde(default = "default_auth_strategies")]
    pub auth_strategies: Vec<AuthStrategy>,
    /// Usernames offered by the username/password dialect.
    #[serde(default = "default_auth_usernames")]
    pub auth_usernames: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub command_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    /// Quiet period after the last received chunk that ends a reply.
    pub response_settle_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Fraction of each backoff delay randomized, 0.0 to 1.0.
    pub backoff_jitter: f64,
    pub poll_interval_secs: u64,
    pub scheduler_tick_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSettings {
    pub welcome_enabled: bool,
    pub welcome_template: String,
    pub goodbye_enabled: bool,
    pub goodbye_template: String,
    pub scheduled: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoSettings {
    pub enabled: bool,
    pub endpoint: String,
    pub min_request_gap_ms: u64,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Bincode store; history and players stay in memory when unset.
    pub data_file: Option<PathBuf>,
    pub history_limit: usize,
}

fn default_port() -> u16 {
    30004
}

fn default_auth_strategies() -> Vec<AuthStrategy> {
    AuthStrategy::DEFAULT_ORDER.to_vec()
}

fn default_auth_usernames() -> Vec<String> {
    ["admin", "rcon", "server"].iter().map(|s| s.to_string()).collect()
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            auth_timeout_ms: 3_000,
            response_settle_ms: 100,
            backoff_initial_ms: 5_000,
            backoff_max_ms: 300_000,
            backoff_jitter: 0.1,
            poll_interval_secs: 20,
            scheduler_tick_ms: 1_000,
        }
    }
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            welcome_enabled: true,
            welcome_template: DEFAULT_WELCOME_TEMPLATE.to_string(),
            goodbye_enabled: true,
            goodbye_template: DEFAULT_GOODBYE_TEMPLATE.to_string(),
            scheduled: Vec::new(),
        }
    }
}

impl Default for GeoSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://ip-api.com/json".to_string(),
            min_request_gap_ms: 1_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_file: None,
            history_limit: 1_000,
        }
    }
}

impl TimingSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn response_settle(&self) -> Duration {
        Duration::from_millis(self.response_settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }
}

impl ServiceConfig {
    /// Minimal configuration for a server; every other setting at its default.
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            server: ServerSettings {
                host: host.into(),
                port,
                password: password.into(),
                auth_strategies: default_auth_strategies(),
                auth_usernames: default_auth_usernames(),
            },
            timing: TimingSettings::default(),
            messages: MessageSettings::default(),
            geo: GeoSettings::default(),
            storage: StorageSettings::default(),
        }
    }

    /// Reads and validates a TOML file.
    pub async fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigurationError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigurationError> {
        let config: ServiceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns a copy with the endpoint replaced, as the CLI flags do.
    pub fn with_endpoint(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.server.host = host;
        }
        if let Some(port) = port {
            self.server.port = port;
        }
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let server = &self.server;
        if server.host.trim().is_empty() {
            return Err(ConfigurationError::invalid("server.host", "must not be empty"));
        }
        if server.port == 0 {
            return Err(ConfigurationError::invalid("server.port", "must not be 0"));
        }
        if server.auth_strategies.is_empty() {
            return Err(ConfigurationError::invalid(
                "server.auth_strategies",
                "at least one strategy is required",
            ));
        }
        let unique: HashSet<_> = server.auth_strategies.iter().collect();
        if unique.len() != server.auth_strategies.len() {
            return Err(ConfigurationError::invalid(
                "server.auth_strategies",
                "strategies must not repeat",
            ));
        }
        let needs_password = server.auth_strategies.iter().any(|s| s.uses_password());
        if needs_password && server.password.is_empty() {
            return Err(ConfigurationError::invalid(
                "server.password",
                "required by the configured authentication strategies",
            ));
        }

        let timing = &self.timing;
        if timing.command_timeout_ms == 0
            || timing.connect_timeout_ms == 0
            || timing.auth_timeout_ms == 0
        {
            return Err(ConfigurationError::invalid(
                "timing",
                "command, connect and auth timeouts must be positive",
            ));
        }
        if timing.response_settle_ms == 0 || timing.response_settle_ms >= timing.command_timeout_ms {
            return Err(ConfigurationError::invalid(
                "timing.response_settle_ms",
                "must be positive and shorter than the command timeout",
            ));
        }
        if timing.backoff_initial_ms == 0 || timing.backoff_initial_ms > timing.backoff_max_ms {
            return Err(ConfigurationError::invalid(
                "timing.backoff_initial_ms",
                "must be positive and not above backoff_max_ms",
            ));
        }
        if !(0.0..=1.0).contains(&timing.backoff_jitter) {
            return Err(ConfigurationError::invalid(
                "timing.backoff_jitter",
                "must be between 0.0 and 1.0",
            ));
        }
        if timing.poll_interval_secs < MIN_POLL_INTERVAL_SECS {
            return Err(ConfigurationError::invalid(
                "timing.poll_interval_secs",
                format!("must be at least {}", MIN_POLL_INTERVAL_SECS),
            ));
        }
        if timing.scheduler_tick_ms == 0 {
            return Err(ConfigurationError::invalid(
                "timing.scheduler_tick_ms",
                "must be positive",
            ));
        }

        let messages = &self.messages;
        for (enabled, template, field) in [
            (messages.welcome_enabled, &messages.welcome_template, "messages.welcome_template"),
            (messages.goodbye_enabled, &messages.goodbye_template, "messages.goodbye_template"),
        ] {
            if enabled && template.trim().is_empty() {
                return Err(ConfigurationError::invalid(field, "enabled but empty"));
            }
            if enabled && !template.contains(PLAYER_NAME_PLACEHOLDER) {
                log::warn!("{} has no {} placeholder", field, PLAYER_NAME_PLACEHOLDER);
            }
        }
        validate_schedule(&messages.scheduled)?;

        if self.geo.enabled && self.geo.endpoint.trim().is_empty() {
            return Err(ConfigurationError::invalid("geo.endpoint", "must not be empty"));
        }
        if self.storage.history_limit == 0 {
            return Err(ConfigurationError::invalid(
                "storage.history_limit",
                "must be positive",
            ));
        }

        Ok(())
    }
}

/// Checks slot count, id uniqueness and per-entry bounds.
pub fn validate_schedule(entries: &[ScheduleEntry]) -> Result<(), ConfigurationError> {
    if entries.len() > MAX_SCHEDULE_ENTRIES {
        return Err(ConfigurationError::invalid(
            "messages.scheduled",
            format!("at most {} entries", MAX_SCHEDULE_ENTRIES),
        ));
    }
    let mut ids = HashSet::new();
    for entry in entries {
        entry
            .validate()
            .map_err(|reason| ConfigurationError::invalid("messages.scheduled", reason))?;
        if !ids.insert(entry.id) {
            return Err(ConfigurationError::invalid(
                "messages.scheduled",
                format!("duplicate id {}", entry.id),
            ));
        }
    }
    Ok(())
}
