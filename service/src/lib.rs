//! # RCON Helper Service
//!
//! Long-running companion for a game server's telnet admin endpoint. It keeps
//! one authenticated connection open, notices players joining and leaving,
//! greets and says goodbye to them, sends recurring announcements and records
//! every delivery attempt.
//!
//! ## Core Responsibilities
//!
//! ### Connection Ownership
//! The admin endpoint accepts one command at a time and its replies carry no
//! correlation id. A single worker task owns the socket and drains a command
//! queue in order; every other component talks to it through a
//! `ConnectionHandle`. Lost connections are re-established with capped
//! exponential backoff.
//!
//! ### Player Tracking
//! The player list is polled on a fixed interval and diffed against the last
//! known snapshot. Only joins, leaves and real field changes are written to
//! storage, so a reconnect or a restart never replays a burst of events.
//!
//! ### Message Delivery
//! Welcome, goodbye, scheduled and manual broadcasts all go through one
//! dispatcher. A send counts as delivered only when the connection reports an
//! explicit success, and every attempt is recorded with its outcome.
//!
//! ## Module Organization
//!
//! ### Connection (`connection`, `transport`, `auth`, `backoff`)
//! - Worker task, handle and the published `ConnectionStatus`
//! - Reply framing over the TCP stream
//! - Login dialects tried in priority order
//! - Reconnect delay curve with jitter
//!
//! ### Players (`tracker`, `geo`)
//! - Poll, parse and diff of the player list
//! - IP to country lookups with a cache and request spacing
//!
//! ### Messages (`scheduler`, `dispatcher`, `admin`)
//! - Recurring entries on fixed intervals
//! - The single send path and its history
//! - Kick, ban and unban
//!
//! ### Plumbing (`config`, `error`, `events`, `persistence`, `service`)
//! - TOML configuration and validation
//! - Error taxonomy
//! - Broadcast event bus
//! - Storage gateway with memory and file backends
//! - Supervisor that wires the components and shuts them down
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use service::config::ServiceConfig;
//! use service::persistence::MemoryStore;
//! use service::service::Service;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::new("127.0.0.1", 30004, "secret");
//!     let service = Service::start(config, Arc::new(MemoryStore::default()), None).await?;
//!
//!     let result = service.broadcast("Server restart in 10 minutes").await;
//!     println!("delivered: {} ({})", result.success, result.detail);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod auth;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod geo;
pub mod persistence;
pub mod scheduler;
pub mod service;
pub mod tracker;
pub mod transport;

use tokio::sync::watch;

/// Resolves once `shutdown` turns true or its sender is dropped.
pub(crate) async fn stop_requested(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
