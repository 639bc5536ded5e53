//! Login dialects for the admin endpoint.
//!
//! Hosting providers disagree on how the telnet login works, so each dialect
//! is an independent strategy and `authenticate` tries them in priority order.
//! The strategy that succeeded is remembered by the connection manager and
//! tried first on the next connect.
//!
//! A login that gets no reply in time ends the pass: the answer may still be
//! on its way and would be read as the reply to whatever is sent next. The
//! manager drops that stream and resumes with the remaining strategies on a
//! fresh one.

use crate::error::{AuthError, ConnectionError};
use crate::transport::LineTransport;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shared::protocol::{self, Command};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStrategy {
    /// Password followed by CRLF.
    Standard,
    /// No password: the server answers commands right away.
    DirectCommand,
    /// A username line, then the password.
    UsernamePassword,
    /// Password followed by a bare LF.
    NewlineOnly,
}

impl AuthStrategy {
    pub const DEFAULT_ORDER: [AuthStrategy; 4] = [
        AuthStrategy::Standard,
        AuthStrategy::DirectCommand,
        AuthStrategy::UsernamePassword,
        AuthStrategy::NewlineOnly,
    ];

    pub fn uses_password(self) -> bool {
        !matches!(self, AuthStrategy::DirectCommand)
    }

    pub fn name(self) -> &'static str {
        match self {
            AuthStrategy::Standard => "standard",
            AuthStrategy::DirectCommand => "direct_command",
            AuthStrategy::UsernamePassword => "username_password",
            AuthStrategy::NewlineOnly => "newline_only",
        }
    }

    /// Runs this dialect once. `Ok(false)` means the server answered and did
    /// not accept it, so the next dialect may be tried on the same stream.
    /// `Err(Timeout)` means it did not answer at all.
    pub async fn attempt<S>(
        self,
        transport: &mut LineTransport<S>,
        credentials: &Credentials,
        wait: Duration,
    ) -> Result<bool, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self {
            AuthStrategy::Standard => {
                password_exchange(transport, &credentials.password, "\r\n", wait).await
            }
            AuthStrategy::NewlineOnly => {
                password_exchange(transport, &credentials.password, "\n", wait).await
            }
            AuthStrategy::DirectCommand => direct_command(transport, wait).await,
            AuthStrategy::UsernamePassword => username_password(transport, credentials, wait).await,
        }
    }
}

impl fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub password: String,
    pub usernames: Vec<String>,
}

async fn password_exchange<S>(
    transport: &mut LineTransport<S>,
    password: &str,
    terminator: &str,
    wait: Duration,
) -> Result<bool, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    transport
        .send_raw(&format!("{}{}", password, terminator))
        .await?;
    reply_matches(transport, wait, protocol::is_login_success).await
}

async fn direct_command<S>(
    transport: &mut LineTransport<S>,
    wait: Duration,
) -> Result<bool, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    transport.send_line(&Command::Help.to_line()).await?;
    reply_matches(transport, wait, |reply| {
        protocol::looks_like_help(reply) && !protocol::indicates_auth_expired(reply)
    })
    .await
}

async fn username_password<S>(
    transport: &mut LineTransport<S>,
    credentials: &Credentials,
    wait: Duration,
) -> Result<bool, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    for username in &credentials.usernames {
        transport.send_raw(&format!("{}\r\n", username)).await?;
        // Username prompt replies are optional.
        transport.read_banner(wait).await?;
        transport
            .send_raw(&format!("{}\r\n", credentials.password))
            .await?;
        if reply_matches(transport, wait, protocol::is_login_success).await? {
            debug!("Logged in as '{}'", username);
            return Ok(true);
        }
    }
    Ok(false)
}

async fn reply_matches<S, F>(
    transport: &mut LineTransport<S>,
    wait: Duration,
    accept: F,
) -> Result<bool, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    F: Fn(&str) -> bool,
{
    let reply = transport.read_reply(wait).await?;
    Ok(accept(&reply))
}

/// `order` with `preferred` moved to the front.
pub fn attempt_order(order: &[AuthStrategy], preferred: Option<AuthStrategy>) -> Vec<AuthStrategy> {
    let mut ordered = Vec::with_capacity(order.len());
    if let Some(preferred) = preferred.filter(|p| order.contains(p)) {
        ordered.push(preferred);
    }
    ordered.extend(order.iter().copied().filter(|s| Some(*s) != preferred));
    ordered
}

/// `order` without the strategies that stalled on earlier streams.
///
/// Once every strategy has stalled the full order is used again.
pub fn remaining_order(order: &[AuthStrategy], stalled: &HashSet<AuthStrategy>) -> Vec<AuthStrategy> {
    let remaining: Vec<AuthStrategy> = order
        .iter()
        .copied()
        .filter(|s| !stalled.contains(s))
        .collect();
    if remaining.is_empty() {
        order.to_vec()
    } else {
        remaining
    }
}

/// Tries each strategy until one is accepted.
///
/// Returns the accepted strategy, `Refused` when every strategy was refused,
/// `Stalled` as soon as one gets no reply, or the connection error that
/// killed the stream.
pub async fn authenticate<S>(
    transport: &mut LineTransport<S>,
    order: &[AuthStrategy],
    preferred: Option<AuthStrategy>,
    credentials: &Credentials,
    wait: Duration,
) -> Result<AuthStrategy, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    for strategy in attempt_order(order, preferred) {
        debug!("Trying authentication strategy: {}", strategy);
        match strategy.attempt(transport, credentials, wait).await {
            Ok(true) => {
                info!("Authenticated using {} strategy", strategy);
                return Ok(strategy);
            }
            Ok(false) => debug!("Strategy {} was not accepted", strategy),
            Err(ConnectionError::Timeout) => {
                warn!(
                    "No reply to the {} login within {:.1}s, giving up on this stream",
                    strategy,
                    wait.as_secs_f64()
                );
                return Err(AuthError::Stalled(strategy));
            }
            Err(e) => return Err(AuthError::Connection(e)),
        }
    }
    Err(AuthError::Refused)
}
