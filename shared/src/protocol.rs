//! Text protocol spoken by the game server's admin (telnet) endpoint.
//!
//! Replies carry no correlation ids and their layout varies between hosting
//! providers and server versions, so parsing here is line-oriented and
//! tolerant: a line that cannot be understood is skipped, and only a reply
//! with no recognizable structure at all is rejected.

use crate::PlayerStatus;
use log::debug;
use std::collections::HashMap;

/// Marker the server prints after a successful password exchange.
pub const LOGIN_SUCCESS_MARKER: &str = "Logged in successfully";

const CONNECTED_HEADER: &str = "Players connected";
const ONLINE_HEADER: &str = "Global online players list";
const GLOBAL_HEADER: &str = "Global players list";

/// Errors raised when a whole reply is unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty response")]
    Empty,

    #[error("player list response has no recognizable section ({0} lines)")]
    MissingSections(usize),
}

/// Commands the service issues. Every variant renders to a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListPlayers,
    Help,
    Say(String),
    Kick { name: String, reason: String },
    Ban { id: String, duration: String },
    Unban { id: String },
}

impl Command {
    /// Renders the command without the trailing line terminator.
    pub fn to_line(&self) -> String {
        match self {
            Command::ListPlayers => "plys".to_string(),
            Command::Help => "help".to_string(),
            Command::Say(text) => format!("say '{}'", escape_quotes(text)),
            Command::Kick { name, reason } => {
                format!("kick '{}' '{}'", escape_quotes(name), escape_quotes(reason))
            }
            Command::Ban { id, duration } => format!("ban {} {}", id, duration),
            Command::Unban { id } => format!("unban {}", id),
        }
    }
}

fn escape_quotes(text: &str) -> String {
    text.replace('\'', "\\'")
}

/// True when the server rejected a command.
pub fn is_error_response(response: &str) -> bool {
    response.trim_start().starts_with("Error:")
}

/// True when the reply says the session is no longer authenticated.
///
/// Only the first non-empty line is checked: the server puts the refusal
/// there, while later lines of a real reply may hold player-chosen names.
pub fn indicates_auth_expired(response: &str) -> bool {
    let Some(first) = response.lines().map(str::trim).find(|line| !line.is_empty()) else {
        return false;
    };
    let lower = first.to_ascii_lowercase();
    lower.contains("not logged in")
        || lower.contains("login required")
        || lower.contains("wrong password")
}

pub fn is_login_success(response: &str) -> bool {
    response.contains(LOGIN_SUCCESS_MARKER)
}

/// True when the reply looks like the output of `help`.
pub fn looks_like_help(response: &str) -> bool {
    response.contains("Available commands") || response.to_ascii_lowercase().contains("help")
}

/// One player as reported by a single `plys` reply, after merging sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPlayer {
    pub id: String,
    pub name: String,
    pub online: bool,
    pub faction: String,
    pub role: String,
    pub playfield: String,
    pub ip_address: String,
    pub total_playtime: u64,
}

impl ParsedPlayer {
    pub fn status(&self) -> PlayerStatus {
        if self.online {
            PlayerStatus::Online
        } else {
            PlayerStatus::Offline
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Connected,
    Online,
    Global,
}

/// Parses the reply to `plys` into one entry per player id.
///
/// Connected and online-list players are online; players only present in the
/// global list are offline. When an id appears in several sections the
/// non-empty values are merged, with address and playfield taken from the
/// connected section.
pub fn parse_player_list(response: &str) -> Result<Vec<ParsedPlayer>, ParseError> {
    if response.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut section = None;
    let mut seen_header = false;
    let mut entries: Vec<(Section, ParsedPlayer)> = Vec::new();
    let mut line_count = 0;

    for raw in response.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;

        if line.contains(CONNECTED_HEADER) {
            section = Some(Section::Connected);
            seen_header = true;
            continue;
        } else if line.contains(ONLINE_HEADER) {
            section = Some(Section::Online);
            seen_header = true;
            continue;
        } else if line.contains(GLOBAL_HEADER) {
            section = Some(Section::Global);
            seen_header = true;
            continue;
        } else if line.starts_with("---")
            || line.starts_with("Available commands")
            || line.contains("C-Id:")
        {
            continue;
        }

        let Some(current) = section else {
            debug!("Skipping line outside any section: '{}'", line);
            continue;
        };

        let parsed = match current {
            Section::Connected => parse_connected_line(line),
            Section::Online | Section::Global => parse_listed_line(line),
        };

        match parsed {
            Some(player) => entries.push((current, player)),
            None => debug!("Skipping unparsable player line: '{}'", line),
        }
    }

    if !seen_header {
        return Err(ParseError::MissingSections(line_count));
    }

    Ok(merge_sections(entries))
}

/// `"<n>: <id>, <name>, <playfield>, <ip>|<port>"`
fn parse_connected_line(line: &str) -> Option<ParsedPlayer> {
    let (index, rest) = line.split_once(':')?;
    if index.trim().is_empty() || !index.trim().chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let mut fields = rest.splitn(4, ',').map(str::trim);
    let id = parse_id(fields.next()?)?;
    let name = fields.next()?.to_string();
    let playfield = fields.next()?.to_string();
    let address = fields.next()?;
    let ip_address = address.split('|').next()?.trim().to_string();

    if name.is_empty() || ip_address.is_empty() {
        return None;
    }

    Some(ParsedPlayer {
        id,
        name,
        online: true,
        playfield,
        ip_address,
        ..ParsedPlayer::default()
    })
}

/// `"id=<id> name=<name> fac=[<faction>] role=<role> online=<seconds>"`
fn parse_listed_line(line: &str) -> Option<ParsedPlayer> {
    let id = parse_id(token_value(line, "id=")?)?;

    let name = match value_start(line, "name=") {
        Some(start) => {
            let rest = &line[start..];
            let end = rest.find(" fac=").unwrap_or_else(|| {
                rest.find(char::is_whitespace).unwrap_or(rest.len())
            });
            rest[..end].trim().to_string()
        }
        None => "Unknown".to_string(),
    };

    let faction = value_start(line, "fac=[")
        .and_then(|start| {
            let rest = &line[start..];
            rest.find(']').map(|end| rest[..end].to_string())
        })
        .unwrap_or_default();

    let role = token_value(line, "role=").unwrap_or_default().to_string();
    let total_playtime = token_value(line, "online=")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    Some(ParsedPlayer {
        id,
        name,
        faction,
        role,
        total_playtime,
        ..ParsedPlayer::default()
    })
}

/// Accepts a numeric id. Negative ids belong to server-internal entities.
fn parse_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.starts_with('-') {
        debug!("Skipping negative player id {}", raw);
        return None;
    }
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(raw.to_string())
}

/// Byte offset just past `key`, where `key` starts a whitespace-separated token.
fn value_start(line: &str, key: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = line[from..].find(key) {
        let at = from + pos;
        let boundary = at == 0 || line[..at].ends_with(char::is_whitespace);
        if boundary {
            return Some(at + key.len());
        }
        from = at + key.len();
    }
    None
}

fn token_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = value_start(line, key)?;
    let rest = &line[start..];
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let value = &rest[..end];
    (!value.is_empty()).then_some(value)
}

fn merge_sections(entries: Vec<(Section, ParsedPlayer)>) -> Vec<ParsedPlayer> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, ParsedPlayer> = HashMap::new();

    for (section, player) in entries {
        let online = matches!(section, Section::Connected | Section::Online);

        match merged.get_mut(&player.id) {
            Some(existing) => {
                existing.online |= online;
                if section == Section::Connected {
                    existing.ip_address = player.ip_address;
                    existing.playfield = player.playfield;
                } else {
                    fill_if_empty(&mut existing.ip_address, player.ip_address);
                    fill_if_empty(&mut existing.playfield, player.playfield);
                }
                if existing.name.is_empty() || existing.name == "Unknown" {
                    existing.name = player.name;
                }
                fill_if_empty(&mut existing.faction, player.faction);
                fill_if_empty(&mut existing.role, player.role);
                if player.total_playtime > 0 {
                    existing.total_playtime = player.total_playtime;
                }
            }
            None => {
                order.push(player.id.clone());
                merged.insert(player.id.clone(), ParsedPlayer { online, ..player });
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| merged.remove(&id))
        .collect()
}

fn fill_if_empty(slot: &mut String, value: String) {
    if slot.is_empty() && !value.is_empty() {
        *slot = value;
    }
}
