//! Data model shared by the RCON service and its tests.
//!
//! Nothing in this crate performs I/O. The `protocol` module knows how the
//! admin endpoint formats commands and replies; everything else is plain data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

pub mod protocol;

pub use protocol::{ParseError, ParsedPlayer};

/// Maximum number of recurring message slots.
pub const MAX_SCHEDULE_ENTRIES: usize = 10;
/// Maximum length of a scheduled message, in characters.
pub const MAX_MESSAGE_LEN: usize = 200;
/// Placeholder replaced with the player's name in welcome/goodbye templates.
pub const PLAYER_NAME_PLACEHOLDER: &str = "<playername>";

/// Stable player identifier as reported by the server (a Steam id).
pub type PlayerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayerStatus {
    Online,
    Offline,
}

/// Everything known about one player. One record per id, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub name: String,
    pub status: PlayerStatus,
    pub faction: String,
    pub role: String,
    pub ip_address: String,
    /// `None` until a geolocation lookup has answered.
    pub country: Option<String>,
    pub playfield: String,
    pub total_playtime: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PlayerRecord {
    /// Builds the record for an id seen for the first time.
    pub fn first_sighting(parsed: &ParsedPlayer, now: DateTime<Utc>) -> Self {
        Self {
            id: parsed.id.clone(),
            name: parsed.name.clone(),
            status: parsed.status(),
            faction: parsed.faction.clone(),
            role: parsed.role.clone(),
            ip_address: parsed.ip_address.clone(),
            country: None,
            playfield: parsed.playfield.clone(),
            total_playtime: parsed.total_playtime,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == PlayerStatus::Online
    }

    /// Copies the mutable fields reported by a poll into this record.
    ///
    /// Returns true if anything other than `last_seen` changed. Empty values
    /// in the poll never erase known ones; the server omits IP and playfield
    /// for offline players.
    pub fn absorb(&mut self, parsed: &ParsedPlayer, now: DateTime<Utc>) -> bool {
        let before = self.clone();

        self.status = parsed.status();
        if !parsed.name.is_empty() {
            self.name = parsed.name.clone();
        }
        if !parsed.faction.is_empty() {
            self.faction = parsed.faction.clone();
        }
        if !parsed.role.is_empty() {
            self.role = parsed.role.clone();
        }
        if !parsed.playfield.is_empty() {
            self.playfield = parsed.playfield.clone();
        }
        if !parsed.ip_address.is_empty() && parsed.ip_address != self.ip_address {
            self.ip_address = parsed.ip_address.clone();
            self.country = None;
        }
        if parsed.total_playtime > 0 {
            self.total_playtime = parsed.total_playtime;
        }

        let changed = *self != before;
        if self.is_online() || before.is_online() {
            self.last_seen = now;
        }
        changed
    }
}

/// Lifecycle of the single admin connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reauthenticating,
}

impl ConnectionState {
    /// Whether `self -> next` is an edge of the connection state machine.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Reauthenticating)
                | (Reauthenticating, Connected)
                | (Reauthenticating, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reauthenticating => "reauthenticating",
        };
        f.write_str(label)
    }
}

/// The fixed set of recurrence intervals a scheduled message may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleInterval {
    Minutes5,
    Minutes10,
    Minutes15,
    Minutes30,
    Hours1,
    Hours2,
    Hours3,
    Hours6,
    Hours12,
    Hours24,
}

impl ScheduleInterval {
    pub const ALL: [ScheduleInterval; 10] = [
        ScheduleInterval::Minutes5,
        ScheduleInterval::Minutes10,
        ScheduleInterval::Minutes15,
        ScheduleInterval::Minutes30,
        ScheduleInterval::Hours1,
        ScheduleInterval::Hours2,
        ScheduleInterval::Hours3,
        ScheduleInterval::Hours6,
        ScheduleInterval::Hours12,
        ScheduleInterval::Hours24,
    ];

    pub fn minutes(self) -> u64 {
        match self {
            ScheduleInterval::Minutes5 => 5,
            ScheduleInterval::Minutes10 => 10,
            ScheduleInterval::Minutes15 => 15,
            ScheduleInterval::Minutes30 => 30,
            ScheduleInterval::Hours1 => 60,
            ScheduleInterval::Hours2 => 120,
            ScheduleInterval::Hours3 => 180,
            ScheduleInterval::Hours6 => 360,
            ScheduleInterval::Hours12 => 720,
            ScheduleInterval::Hours24 => 1440,
        }
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.minutes() * 60)
    }

    pub fn from_minutes(minutes: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.minutes() == minutes)
    }
}

impl fmt::Display for ScheduleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let minutes = self.minutes();
        if minutes < 60 {
            write!(f, "Every {} minutes", minutes)
        } else if minutes == 60 {
            f.write_str("Every 1 hour")
        } else {
            write!(f, "Every {} hours", minutes / 60)
        }
    }
}

impl FromStr for ScheduleInterval {
    type Err = String;

    /// Accepts labels such as "Every 30 minutes" or "every 2 hours".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let number: u64 = lower
            .split(|c: char| !c.is_ascii_digit())
            .find(|part| !part.is_empty())
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| format!("no number in schedule '{}'", s))?;

        let minutes = if lower.contains("hour") {
            number * 60
        } else if lower.contains("minute") {
            number
        } else {
            return Err(format!("unknown unit in schedule '{}'", s));
        };

        Self::from_minutes(minutes).ok_or_else(|| format!("unsupported schedule '{}'", s))
    }
}

impl Serialize for ScheduleInterval {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ScheduleInterval {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        label.parse().map_err(serde::de::Error::custom)
    }
}

/// One recurring message slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: u8,
    pub enabled: bool,
    pub text: String,
    pub interval: ScheduleInterval,
    /// Set by the scheduler when the entry is armed or fires.
    #[serde(skip)]
    pub last_fired: Option<Instant>,
}

impl ScheduleEntry {
    pub fn new(id: u8, enabled: bool, text: impl Into<String>, interval: ScheduleInterval) -> Self {
        Self {
            id,
            enabled,
            text: text.into(),
            interval,
            last_fired: None,
        }
    }

    /// Checks the bounds every entry must respect.
    pub fn validate(&self) -> Result<(), String> {
        if self.id == 0 || self.id as usize > MAX_SCHEDULE_ENTRIES {
            return Err(format!(
                "schedule id {} outside 1..={}",
                self.id, MAX_SCHEDULE_ENTRIES
            ));
        }
        let len = self.text.chars().count();
        if len > MAX_MESSAGE_LEN {
            return Err(format!(
                "schedule {} text is {} characters (max {})",
                self.id, len, MAX_MESSAGE_LEN
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Broadcast,
    Welcome,
    Goodbye,
    Scheduled,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MessageKind::Broadcast => "broadcast",
            MessageKind::Welcome => "welcome",
            MessageKind::Goodbye => "goodbye",
            MessageKind::Scheduled => "scheduled",
        };
        f.write_str(label)
    }
}

/// Every send goes to the whole server; the protocol has no private message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetScope {
    AllPlayers,
}

/// One outbound message, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageJob {
    pub kind: MessageKind,
    pub scope: TargetScope,
    pub text: String,
    /// Player a welcome/goodbye refers to.
    pub player: Option<String>,
    /// Slot that produced a scheduled job.
    pub schedule_id: Option<u8>,
    pub created_at: DateTime<Utc>,
}

impl MessageJob {
    pub fn broadcast(text: impl Into<String>) -> Self {
        Self::new(MessageKind::Broadcast, text.into(), None, None)
    }

    pub fn scheduled(entry: &ScheduleEntry) -> Self {
        Self::new(MessageKind::Scheduled, entry.text.clone(), None, Some(entry.id))
    }

    pub fn welcome(template: &str, player_name: &str) -> Self {
        Self::new(
            MessageKind::Welcome,
            render_template(template, player_name),
            Some(player_name.to_string()),
            None,
        )
    }

    pub fn goodbye(template: &str, player_name: &str) -> Self {
        Self::new(
            MessageKind::Goodbye,
            render_template(template, player_name),
            Some(player_name.to_string()),
            None,
        )
    }

    fn new(kind: MessageKind, text: String, player: Option<String>, schedule_id: Option<u8>) -> Self {
        Self {
            kind,
            scope: TargetScope::AllPlayers,
            text,
            player,
            schedule_id,
            created_at: Utc::now(),
        }
    }
}

/// Substitutes every `<playername>` occurrence.
pub fn render_template(template: &str, player_name: &str) -> String {
    template.replace(PLAYER_NAME_PLACEHOLDER, player_name)
}

/// Outcome of one send attempt. `success` is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub success: bool,
    pub detail: String,
}

impl DeliveryResult {
    pub fn delivered(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(id: &str, name: &str, online: bool) -> ParsedPlayer {
        ParsedPlayer {
            id: id.to_string(),
            name: name.to_string(),
            online,
            ..ParsedPlayer::default()
        }
    }

    #[test]
    fn test_connection_state_edges() {
        use ConnectionState::*;

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Reauthenticating));
        assert!(Reauthenticating.can_transition_to(Connected));
        assert!(Reauthenticating.can_transition_to(Disconnected));

        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Reauthenticating));
        assert!(!Disconnected.can_transition_to(Reauthenticating));
    }

    #[test]
    fn test_schedule_interval_labels() {
        assert_eq!(ScheduleInterval::Minutes5.to_string(), "Every 5 minutes");
        assert_eq!(ScheduleInterval::Hours1.to_string(), "Every 1 hour");
        assert_eq!(ScheduleInterval::Hours24.to_string(), "Every 24 hours");

        for interval in ScheduleInterval::ALL {
            assert_eq!(interval.to_string().parse::<ScheduleInterval>(), Ok(interval));
        }
    }

    #[test]
    fn test_schedule_interval_parsing_is_lenient_about_case() {
        assert_eq!(
            "every 2 HOURS".parse::<ScheduleInterval>(),
            Ok(ScheduleInterval::Hours2)
        );
        assert_eq!(
            "Every 60 minutes".parse::<ScheduleInterval>(),
            Ok(ScheduleInterval::Hours1)
        );
        assert!("Every 7 minutes".parse::<ScheduleInterval>().is_err());
        assert!("sometimes".parse::<ScheduleInterval>().is_err());
        assert!("Every 3 days".parse::<ScheduleInterval>().is_err());
    }

    #[test]
    fn test_schedule_entry_bounds() {
        let ok = ScheduleEntry::new(1, true, "hello", ScheduleInterval::Minutes5);
        assert!(ok.validate().is_ok());

        let zero = ScheduleEntry::new(0, true, "hello", ScheduleInterval::Minutes5);
        assert!(zero.validate().is_err());

        let too_high = ScheduleEntry::new(11, true, "hello", ScheduleInterval::Minutes5);
        assert!(too_high.validate().is_err());

        let long = ScheduleEntry::new(2, true, "x".repeat(MAX_MESSAGE_LEN + 1), ScheduleInterval::Minutes5);
        assert!(long.validate().is_err());
    }

    #[test]
    fn test_welcome_template_substitution() {
        let job = MessageJob::welcome("Welcome, <playername>! Hi <playername>", "Zed");
        assert_eq!(job.text, "Welcome, Zed! Hi Zed");
        assert_eq!(job.kind, MessageKind::Welcome);
        assert_eq!(job.player.as_deref(), Some("Zed"));
        assert_eq!(job.scope, TargetScope::AllPlayers);
    }

    #[test]
    fn test_scheduled_job_carries_slot() {
        let entry = ScheduleEntry::new(4, true, "Vote for us", ScheduleInterval::Hours1);
        let job = MessageJob::scheduled(&entry);
        assert_eq!(job.schedule_id, Some(4));
        assert_eq!(job.text, "Vote for us");
        assert_eq!(job.kind, MessageKind::Scheduled);
    }

    #[test]
    fn test_absorb_keeps_known_values() {
        let now = Utc::now();
        let mut first = parsed("100", "Alice", true);
        first.ip_address = "8.8.8.8".to_string();
        first.playfield = "Akua".to_string();
        let mut record = PlayerRecord::first_sighting(&first, now);
        record.country = Some("United States".to_string());

        let changed = record.absorb(&parsed("100", "Alice", true), now);
        assert!(!changed);
        assert_eq!(record.ip_address, "8.8.8.8");
        assert_eq!(record.playfield, "Akua");
        assert_eq!(record.country.as_deref(), Some("United States"));
    }

    #[test]
    fn test_absorb_resets_country_on_ip_change() {
        let now = Utc::now();
        let mut first = parsed("100", "Alice", true);
        first.ip_address = "8.8.8.8".to_string();
        let mut record = PlayerRecord::first_sighting(&first, now);
        record.country = Some("United States".to_string());

        let mut moved = parsed("100", "Alice", true);
        moved.ip_address = "1.1.1.1".to_string();
        assert!(record.absorb(&moved, now));
        assert_eq!(record.ip_address, "1.1.1.1");
        assert_eq!(record.country, None);
    }

    #[test]
    fn test_absorb_reports_status_change() {
        let now = Utc::now();
        let mut record = PlayerRecord::first_sighting(&parsed("7", "Bob", true), now);
        assert!(record.absorb(&parsed("7", "Bob", false), now));
        assert_eq!(record.status, PlayerStatus::Offline);
    }

    #[test]
    fn test_delivery_result_constructors() {
        let ok = DeliveryResult::delivered("sent");
        assert!(ok.success);
        let failed = DeliveryResult::failed("x");
        assert!(!failed.success);
        assert_eq!(failed.detail, "x");
    }

    #[test]
    fn test_player_record_bincode_roundtrip() {
        let record = PlayerRecord::first_sighting(&parsed("42", "Carol", true), Utc::now());
        let bytes = bincode::serialize(&record).unwrap();
        let back: PlayerRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, record);
    }
}
