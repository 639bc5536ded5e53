//! Kick, ban and unban.
//!
//! Replies starting with `Error:` become `AdminError::Rejected`.

use crate::connection::ConnectionHandle;
use crate::error::AdminError;
use log::{info, warn};
use shared::protocol::{self, Command};

/// Ban length used when the caller gives none.
pub const DEFAULT_BAN_DURATION: &str = "1d";

/// Moderation commands. They share the connection's command queue with
/// polling and chat, so they are never interleaved with another exchange.
#[derive(Debug, Clone)]
pub struct AdminCommands {
    connection: ConnectionHandle,
}

impl AdminCommands {
    pub fn new(connection: ConnectionHandle) -> Self {
        Self { connection }
    }

    pub async fn kick_player(&self, name: &str, reason: &str) -> Result<String, AdminError> {
        let command = Command::Kick {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let reply = self.run(&command).await?;
        info!("Kicked player {}: {}", name, reason);
        Ok(reply)
    }

    pub async fn ban_player(&self, id: &str, duration: Option<&str>) -> Result<String, AdminError> {
        let duration = duration
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_BAN_DURATION);
        let command = Command::Ban {
            id: id.to_string(),
            duration: duration.to_string(),
        };
        let reply = self.run(&command).await?;
        info!("Banned player {} for {}", id, duration);
        Ok(reply)
    }

    pub async fn unban_player(&self, id: &str) -> Result<String, AdminError> {
        let reply = self.run(&Command::Unban { id: id.to_string() }).await?;
        info!("Unbanned player {}", id);
        Ok(reply)
    }

    async fn run(&self, command: &Command) -> Result<String, AdminError> {
        let reply = self.connection.execute(command).await?;
        if protocol::is_error_response(&reply) {
            warn!("Server rejected '{}': {}", command.to_line(), reply.trim());
            return Err(AdminError::Rejected(reply.trim().to_string()));
        }
        Ok(reply)
    }
}
