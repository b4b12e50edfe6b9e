//! Per-channel export context
//!
//! One [`ExportContext`] exists per channel export. It composes the shared
//! per-guild member cache (or a private fallback table when no sharing is
//! needed), the guild's channel and role tables, the session media
//! downloader and the reference-entity writer, and exposes the resolution
//! operations format writers call while rendering messages.

use crate::api::{ApiClient, HttpFetcher};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::export::references::{ReferenceMode, ReferenceWriter};
use crate::media::{MediaDownloader, MediaOutcome};
use crate::member_cache::MemberCache;
use crate::types::{Channel, ExportRequest, ExportStats, Guild, Member, Role, Snowflake, User};
use chrono::{DateTime, FixedOffset, Utc};
use futures::TryStreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A guild's record plus its channel and role tables, fetched once per guild
/// and shared read-only by every channel export belonging to that guild
#[derive(Debug, Default)]
pub struct GuildTables {
    /// The guild itself; `None` for direct-message sessions
    pub guild: Option<Guild>,
    /// Channels by id
    pub channels: HashMap<Snowflake, Channel>,
    /// Roles by id
    pub roles: HashMap<Snowflake, Role>,
}

impl GuildTables {
    /// Fetch the guild record and both tables from the remote API
    pub async fn fetch(api: &dyn ApiClient, guild_id: Snowflake) -> Result<Self> {
        let guild = api.get_guild(guild_id).await?;
        let channels: Vec<Channel> = api.get_guild_channels(guild_id).try_collect().await?;
        let roles: Vec<Role> = api.get_guild_roles(guild_id).try_collect().await?;
        Ok(Self {
            guild: Some(guild),
            channels: channels.into_iter().map(|c| (c.id, c)).collect(),
            roles: roles.into_iter().map(|r| (r.id, r)).collect(),
        })
    }
}

/// Everything an [`ExportContext`] is built from
pub(crate) struct ContextSeed {
    pub(crate) request: ExportRequest,
    pub(crate) config: Arc<Config>,
    pub(crate) api: Arc<dyn ApiClient>,
    pub(crate) fetcher: Arc<dyn HttpFetcher>,
    pub(crate) cancel: CancellationToken,
    pub(crate) stats: Arc<ExportStats>,
    /// Shared per-guild member cache; `None` when this export runs alone
    /// and keeps a private member table instead
    pub(crate) members: Option<Arc<MemberCache>>,
    pub(crate) tables: Arc<GuildTables>,
}

/// Per-channel-export façade over the caches and lookup tables
pub struct ExportContext {
    request: ExportRequest,
    config: Arc<Config>,
    api: Arc<dyn ApiClient>,
    cancel: CancellationToken,
    stats: Arc<ExportStats>,
    members: Option<Arc<MemberCache>>,
    /// Private member table used when no shared cache was supplied
    local_members: Mutex<HashMap<Snowflake, Option<Member>>>,
    tables: Arc<GuildTables>,
    media: MediaDownloader,
    references: ReferenceWriter,
}

impl ExportContext {
    pub(crate) fn new(seed: ContextSeed) -> Self {
        let mode = if seed.request.channel.guild_id.is_some() {
            ReferenceMode::Guild
        } else {
            ReferenceMode::DirectMessages
        };
        let media = MediaDownloader::new(
            &seed.config,
            Arc::clone(&seed.fetcher),
            seed.cancel.clone(),
            Arc::clone(&seed.stats),
        );
        let references =
            ReferenceWriter::new(seed.config.output_dir().clone(), mode);
        Self {
            request: seed.request,
            config: seed.config,
            api: seed.api,
            cancel: seed.cancel,
            stats: seed.stats,
            members: seed.members,
            local_members: Mutex::new(HashMap::new()),
            tables: seed.tables,
            media,
            references,
        }
    }

    /// Build a standalone context for a single-channel export, fetching the
    /// guild tables directly and keeping a private member table.
    pub(crate) async fn create(
        request: ExportRequest,
        config: Arc<Config>,
        api: Arc<dyn ApiClient>,
        fetcher: Arc<dyn HttpFetcher>,
        cancel: CancellationToken,
        stats: Arc<ExportStats>,
    ) -> Result<Self> {
        let tables = match request.channel.guild_id {
            Some(guild_id) => tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                tables = GuildTables::fetch(api.as_ref(), guild_id) => Arc::new(tables?),
            },
            None => Arc::new(GuildTables::default()),
        };
        Ok(Self::new(ContextSeed {
            request,
            config,
            api,
            fetcher,
            cancel,
            stats,
            members: None,
            tables,
        }))
    }

    /// The request this context was built for
    pub fn request(&self) -> &ExportRequest {
        &self.request
    }

    /// The channel being exported
    pub fn channel(&self) -> &Channel {
        &self.request.channel
    }

    /// Shared batch counters
    pub fn stats(&self) -> &ExportStats {
        &self.stats
    }

    /// The guild this export belongs to; `None` for direct messages
    pub fn guild(&self) -> Option<&Guild> {
        self.tables.guild.as_ref()
    }

    /// Look up a channel of the current guild by id (channel mentions)
    pub fn channel_by_id(&self, id: Snowflake) -> Option<&Channel> {
        self.tables.channels.get(&id)
    }

    /// Look up a role of the current guild by id
    pub fn role_by_id(&self, id: Snowflake) -> Option<&Role> {
        self.tables.roles.get(&id)
    }

    /// Resolve a member by id, fetching it on first use.
    ///
    /// Delegates to the shared per-guild cache when one was supplied;
    /// otherwise the context performs the fetch-or-synthesize-fallback
    /// sequence itself against its private table.
    pub async fn resolve_member(
        &self,
        member_id: Snowflake,
        fallback: Option<&User>,
    ) -> Result<Option<Member>> {
        if let Some(cache) = &self.members {
            return cache.resolve(member_id, fallback).await;
        }
        let Some(guild_id) = self.request.channel.guild_id else {
            return Ok(None);
        };

        if let Some(existing) = self.local_members.lock().await.get(&member_id) {
            return Ok(existing.clone());
        }

        let member = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = self.api.get_guild_member(guild_id, member_id) => result?,
        };
        let member = match member {
            Some(member) => Some(member),
            None => {
                let user = match fallback {
                    Some(user) => Some(user.clone()),
                    None => tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                        result = self.api.get_user(member_id) => result?,
                    },
                };
                user.map(Member::fallback)
            }
        };
        self.local_members
            .lock()
            .await
            .insert(member_id, member.clone());
        Ok(member)
    }

    /// Cache-only member lookup; never triggers a fetch
    pub async fn peek_member(&self, member_id: Snowflake) -> Option<Member> {
        if let Some(cache) = &self.members {
            return cache.peek(member_id).await;
        }
        self.local_members
            .lock()
            .await
            .get(&member_id)
            .cloned()
            .flatten()
    }

    /// A user's roles, most senior first
    pub async fn get_user_roles(&self, user_id: Snowflake) -> Vec<Role> {
        let Some(member) = self.peek_member(user_id).await else {
            return Vec::new();
        };
        let mut roles: Vec<Role> = member
            .role_ids
            .iter()
            .filter_map(|id| self.tables.roles.get(id).cloned())
            .collect();
        roles.sort_by(|a, b| b.position.cmp(&a.position));
        roles
    }

    /// A user's effective display color: the color of their most senior
    /// colored role, or `None`
    pub async fn get_user_color(&self, user_id: Snowflake) -> Option<u32> {
        self.get_user_roles(user_id)
            .await
            .into_iter()
            .find_map(|role| role.color)
    }

    /// Resolve a media URL to the string format writers should embed.
    ///
    /// Returns the original URL when media download is disabled or the
    /// transfer failed/was skipped. Downloaded media resolves to a path
    /// relative to the output directory (absolute when the media directory
    /// lies outside the output tree), percent-encoded for HTML formats.
    pub async fn resolve_media_url(&self, url: &str) -> Result<String> {
        if !self.config.media.download_media {
            return Ok(url.to_string());
        }
        match self.media.download(url).await? {
            MediaOutcome::Downloaded(path) => {
                let referenced = path
                    .strip_prefix(self.config.output_dir())
                    .unwrap_or(&path);
                let mut text = path_to_forward_slashes(referenced);
                if self.request.format.is_html() {
                    text = encode_preserving_slashes(&text);
                }
                Ok(text)
            }
            MediaOutcome::Skipped(original) | MediaOutcome::Failed(original) => Ok(original),
        }
    }

    /// Record a user (or their richer member data) for the reference tables
    pub async fn track_user(&self, user: &User) {
        let member = self.peek_member(user.id).await;
        let roles = match &member {
            Some(_) => self.get_user_roles(user.id).await,
            None => Vec::new(),
        };
        self.references.track(user, member.as_ref(), &roles).await;
    }

    /// Merge tracked reference entities to disk; called at every output
    /// partition boundary and once more at session end
    pub async fn flush_references(&self) -> Result<()> {
        self.references.flush().await
    }

    /// Shift a timestamp into the configured output zone (UTC or local)
    pub fn normalize_date(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        if self.config.date.utc {
            instant.fixed_offset()
        } else {
            instant.with_timezone(&chrono::Local).fixed_offset()
        }
    }

    /// Render a timestamp with the configured format string
    pub fn format_date(&self, instant: DateTime<Utc>) -> String {
        self.normalize_date(instant)
            .format(&self.config.date.format)
            .to_string()
    }
}

fn path_to_forward_slashes(path: &Path) -> String {
    let text = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        text.into_owned()
    } else {
        text.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// Percent-encode a relative path for embedding in HTML, keeping the
/// directory separators readable
fn encode_preserving_slashes(path: &str) -> String {
    urlencoding::encode(path).into_owned().replace("%2F", "/")
}
