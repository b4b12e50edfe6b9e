//! Collaborator interfaces consumed by the export core
//!
//! The core deliberately does not own the Discord REST transport. Pagination,
//! authentication and HTTP-level rate-limit backoff live behind [`ApiClient`];
//! per-format message writing lives behind [`ChannelWriter`]; the raw byte
//! fetch used by the media downloader lives behind [`HttpFetcher`], for which
//! a [`ReqwestFetcher`] implementation ships with the crate.

use crate::error::{ApiError, Error, Result};
use crate::types::{Channel, Guild, Member, Role, Snowflake, User};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Remote API client collaborator
///
/// Implementations are expected to apply their own rate-limit backoff
/// internally; the core never retries these calls. Absent entities resolve
/// to `Ok(None)`, not errors, so the caches can record them as confirmed
/// absent.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Fetch a guild by id
    async fn get_guild(&self, guild_id: Snowflake) -> Result<Guild>;

    /// Fetch a guild member, or `None` if the user has no current
    /// membership record (left the guild, or was deleted)
    async fn get_guild_member(
        &self,
        guild_id: Snowflake,
        member_id: Snowflake,
    ) -> Result<Option<Member>>;

    /// Fetch a bare user record, or `None` if the account no longer exists
    async fn get_user(&self, user_id: Snowflake) -> Result<Option<User>>;

    /// Stream all channels of a guild
    fn get_guild_channels(&self, guild_id: Snowflake) -> BoxStream<'_, Result<Channel>>;

    /// Stream all roles of a guild
    fn get_guild_roles(&self, guild_id: Snowflake) -> BoxStream<'_, Result<Role>>;
}

/// Per-format message writer collaborator
///
/// Given a fully wired export context, writes one channel's messages to the
/// output directory (splitting into partitions and flushing reference tables
/// at partition boundaries as it sees fit) and returns the message count.
#[async_trait]
pub trait ChannelWriter: Send + Sync {
    /// Export one channel through the given context
    async fn write_channel(&self, ctx: &crate::export::ExportContext) -> Result<u64>;
}

/// Response body of a raw byte fetch
#[derive(Clone, Debug)]
pub struct FetchedBody {
    /// Raw response bytes
    pub bytes: Vec<u8>,
    /// Declared content type, when the response carried one
    pub content_type: Option<String>,
}

/// Raw byte-fetch collaborator wrapped by the media downloader's retry policy
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Fetch a URL and return its body bytes plus declared content type
    async fn fetch(&self, url: &str) -> Result<FetchedBody>;
}

/// [`HttpFetcher`] implementation backed by a shared [`reqwest::Client`]
#[derive(Clone, Debug, Default)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Create a fetcher with its own connection pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fetcher reusing an existing client (shared connection pool)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedBody> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api(match status.as_u16() {
                401 => ApiError::Unauthorized,
                403 => ApiError::Forbidden {
                    resource: url.to_string(),
                },
                404 => ApiError::NotFound {
                    resource: url.to_string(),
                },
                code => ApiError::Status {
                    status: code,
                    message: status.canonical_reason().unwrap_or("unknown").to_string(),
                },
            }));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await?.to_vec();

        Ok(FetchedBody {
            bytes,
            content_type,
        })
    }
}
