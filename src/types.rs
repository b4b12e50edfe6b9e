//! Core types for discord-archive

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// First second of 2015, the epoch Discord snowflakes count from (milliseconds)
const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;

/// Unique, time-ordered identifier used for all Discord entities
///
/// The upper 42 bits encode the entity's creation timestamp as milliseconds
/// since the platform epoch, which makes ids directly comparable to points
/// in time. Serialized as a string, matching the platform's wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Snowflake(pub u64);

impl Snowflake {
    /// Create a new Snowflake from its raw value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }

    /// The creation instant encoded in this id
    pub fn timestamp(&self) -> DateTime<Utc> {
        let millis = (self.0 >> 22) as i64 + SNOWFLAKE_EPOCH_MS;
        DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl From<u64> for Snowflake {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<Snowflake> for u64 {
    fn from(id: Snowflake) -> Self {
        id.0
    }
}

impl std::fmt::Display for Snowflake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Snowflake {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl Serialize for Snowflake {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SnowflakeVisitor;

        impl serde::de::Visitor<'_> for SnowflakeVisitor {
            type Value = Snowflake;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a snowflake id as a string or integer")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Snowflake, E> {
                v.parse().map(Snowflake).map_err(E::custom)
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Snowflake, E> {
                Ok(Snowflake(v))
            }
        }

        deserializer.deserialize_any(SnowflakeVisitor)
    }
}

/// A Discord user, as observed in message payloads or direct lookups
///
/// Immutable value; the same user may be observed multiple times during an
/// export, with later observations superseding earlier ones by id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Stable user id
    pub id: Snowflake,
    /// Whether this account is a bot
    pub is_bot: bool,
    /// Legacy four-digit discriminator, absent on migrated accounts
    pub discriminator: Option<u16>,
    /// Unique username
    pub name: String,
    /// Global display name (falls back to the username when unset upstream)
    pub display_name: String,
    /// CDN URL of the user's avatar, if any
    pub avatar_url: Option<String>,
}

/// A user's membership in a specific guild
///
/// Carries per-guild overrides (nickname, guild avatar) and role references.
/// A user who has left the guild is represented by a fallback member
/// synthesized from the bare [`User`] record with no roles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// The underlying user identity
    pub user: User,
    /// Per-guild nickname override
    pub nick: Option<String>,
    /// Per-guild avatar override
    pub avatar_url: Option<String>,
    /// Ids of the roles assigned to this member (order not significant)
    pub role_ids: Vec<Snowflake>,
}

impl Member {
    /// Synthesize a fallback member for a user with no current guild
    /// membership record (left the guild, or was deleted).
    pub fn fallback(user: User) -> Self {
        Self {
            user,
            nick: None,
            avatar_url: None,
            role_ids: Vec::new(),
        }
    }
}

/// A guild role
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role id
    pub id: Snowflake,
    /// Role name
    pub name: String,
    /// Position in the role hierarchy (higher = more senior)
    pub position: i64,
    /// Role color packed as 0xRRGGBB; `None` when the role has no color
    pub color: Option<u32>,
}

impl Role {
    /// The role color rendered as a `#rrggbb` string, if the role has one
    pub fn color_hex(&self) -> Option<String> {
        self.color.map(|c| format!("#{:06x}", c & 0x00ff_ffff))
    }
}

/// A guild (server-like container of channels, roles and members)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guild {
    /// Guild id
    pub id: Snowflake,
    /// Guild name
    pub name: String,
    /// CDN URL of the guild icon, if any
    pub icon_url: Option<String>,
}

/// Broad channel classification
///
/// Only the distinction between guild channels and direct messages matters
/// to the core: it selects which reference tables are written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Text channel inside a guild (including threads and voice text)
    #[default]
    GuildText,
    /// Direct message or group direct message channel
    DirectMessage,
}

/// A message channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel id
    pub id: Snowflake,
    /// Owning guild; `None` for direct message channels
    pub guild_id: Option<Snowflake>,
    /// Channel kind
    pub kind: ChannelKind,
    /// Channel name
    pub name: String,
    /// Name of the parent category, if the channel has one
    pub category: Option<String>,
    /// Id of the most recent message, if the channel has ever had one
    pub last_message_id: Option<Snowflake>,
}

impl Channel {
    /// Whether the channel can possibly contain messages after `instant`.
    ///
    /// Based on the last message id's encoded timestamp, so a channel whose
    /// newest message predates the requested lower bound is excluded without
    /// a per-message scan. A channel with no messages at all can never match.
    pub fn may_have_messages_after(&self, instant: DateTime<Utc>) -> bool {
        self.last_message_id
            .is_some_and(|id| id.timestamp() > instant)
    }

    /// Whether the channel can possibly contain messages before `instant`.
    ///
    /// A channel cannot contain messages older than its own creation.
    pub fn may_have_messages_before(&self, instant: DateTime<Utc>) -> bool {
        self.id.timestamp() < instant
    }

    /// Human-readable label used in logs and per-item failure reports
    pub fn label(&self) -> String {
        match &self.category {
            Some(category) => format!("{} / {}", category, self.name),
            None => self.name.clone(),
        }
    }
}

/// Half-open time window restricting which messages an export covers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Only include messages sent after this instant
    pub after: Option<DateTime<Utc>>,
    /// Only include messages sent before this instant
    pub before: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// Unbounded range covering the channel's full history
    pub fn all() -> Self {
        Self::default()
    }

    /// Whether the channel could contain any messages inside this range
    pub fn overlaps(&self, channel: &Channel) -> bool {
        if let Some(after) = self.after
            && !channel.may_have_messages_after(after)
        {
            return false;
        }
        if let Some(before) = self.before
            && !channel.may_have_messages_before(before)
        {
            return false;
        }
        true
    }
}

/// Output format produced by the per-format channel writer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// Dark-themed standalone HTML
    #[default]
    HtmlDark,
    /// Light-themed standalone HTML
    HtmlLight,
    /// Machine-readable JSON
    Json,
    /// Comma-separated values
    Csv,
    /// Plain text transcript
    PlainText,
}

impl ExportFormat {
    /// Whether this format embeds media references in HTML markup
    /// (and therefore needs percent-encoded local paths)
    pub fn is_html(&self) -> bool {
        matches!(self, ExportFormat::HtmlDark | ExportFormat::HtmlLight)
    }
}

/// A single unit of work for the orchestrator: one channel, one time range
#[derive(Clone, Debug)]
pub struct ExportRequest {
    /// The channel to export
    pub channel: Channel,
    /// The time window to cover
    pub range: TimeRange,
    /// The output format the channel writer will produce
    pub format: ExportFormat,
}

/// Outcome of one channel export within a batch
#[derive(Clone, Debug)]
pub enum ItemOutcome {
    /// Export completed; carries the number of messages written
    Exported {
        /// Channel label
        channel: String,
        /// Number of messages written
        messages: u64,
    },
    /// Channel was excluded or turned out to have nothing to export
    Skipped {
        /// Channel label
        channel: String,
        /// Why the channel was skipped
        reason: String,
    },
    /// Export failed with a recoverable error; siblings were unaffected
    Failed {
        /// Channel label
        channel: String,
        /// Failure description
        message: String,
    },
}

/// Aggregate result of a batch export
#[derive(Debug)]
pub struct BatchReport {
    /// Per-channel outcomes, in completion order
    pub outcomes: Vec<ItemOutcome>,
    /// Counter snapshot taken when the batch finished
    pub stats: StatsSnapshot,
}

impl BatchReport {
    /// Number of channels exported successfully
    pub fn exported(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::Exported { .. }))
            .count()
    }

    /// Number of channels that failed
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::Failed { .. }))
            .count()
    }

    /// Total messages written across all successful channels
    pub fn total_messages(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| match o {
                ItemOutcome::Exported { messages, .. } => *messages,
                _ => 0,
            })
            .sum()
    }

    /// The batch as a whole fails only when every item failed
    pub fn is_success(&self) -> bool {
        self.outcomes.is_empty() || self.failed() < self.outcomes.len()
    }
}

/// Counters shared by every export in a batch
///
/// An explicit handle threaded through the export contexts rather than
/// ambient task-local state, so concurrent updates are visible at the type
/// level. All counters are monotonic within one batch.
#[derive(Debug, Default)]
pub struct ExportStats {
    /// Messages written by channel writers
    pub messages_exported: AtomicU64,
    /// Media files transferred from the remote service
    pub media_downloaded: AtomicU64,
    /// Media resolutions satisfied from the session cache or disk
    pub media_reused: AtomicU64,
    /// Media transfers that failed and fell back to the remote URL
    pub media_failed: AtomicU64,
}

impl ExportStats {
    /// Take a point-in-time copy of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_exported: self.messages_exported.load(Ordering::Relaxed),
            media_downloaded: self.media_downloaded.load(Ordering::Relaxed),
            media_reused: self.media_reused.load(Ordering::Relaxed),
            media_failed: self.media_failed.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value copy of [`ExportStats`] counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Messages written by channel writers
    pub messages_exported: u64,
    /// Media files transferred from the remote service
    pub media_downloaded: u64,
    /// Media resolutions satisfied from the session cache or disk
    pub media_reused: u64,
    /// Media transfers that failed and fell back to the remote URL
    pub media_failed: u64,
}
