//! Batch export orchestration
//!
//! The [`Archiver`] turns a list of (channel, time range) requests into
//! archives. Per guild it builds exactly one shared [`MemberCache`] and
//! fetches the channel/role tables exactly once; the remaining requests run
//! under bounded parallelism, each with its own [`ExportContext`] bound to
//! the shared per-guild caches. One channel's failure never cancels its
//! siblings; the batch as a whole fails only when every channel failed.

mod context;
mod references;

pub use context::{ExportContext, GuildTables};
pub use references::{ReferenceMode, ReferenceWriter};

use crate::api::{ApiClient, ChannelWriter, HttpFetcher};
use crate::config::Config;
use crate::error::{Error, ExportError, Result};
use crate::types::{BatchReport, ExportRequest, ExportStats, ItemOutcome, Snowflake};
use context::ContextSeed;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Shared per-guild resources handed to every export of that guild
#[derive(Clone)]
struct GuildResources {
    members: Arc<crate::member_cache::MemberCache>,
    tables: Arc<GuildTables>,
}

/// Batch export entry point
///
/// Cloneable handle; all fields are reference-counted. The cancellation
/// token threads through every operation started by this archiver — cancel
/// it (or wire it to [`crate::cancel_on_shutdown_signal`]) to abort a batch
/// at the next suspension point.
#[derive(Clone)]
pub struct Archiver {
    api: Arc<dyn ApiClient>,
    fetcher: Arc<dyn HttpFetcher>,
    config: Arc<Config>,
    cancel: CancellationToken,
}

impl Archiver {
    /// Create an archiver over the given collaborators
    pub fn new(api: Arc<dyn ApiClient>, fetcher: Arc<dyn HttpFetcher>, config: Config) -> Self {
        Self {
            api,
            fetcher,
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    /// The session cancellation token
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Export a single channel without shared caches (the context keeps a
    /// private member table). Returns the number of messages written.
    pub async fn export_channel(
        &self,
        request: ExportRequest,
        writer: &dyn ChannelWriter,
    ) -> Result<u64> {
        let stats = Arc::new(ExportStats::default());
        let ctx = ExportContext::create(
            request,
            Arc::clone(&self.config),
            Arc::clone(&self.api),
            Arc::clone(&self.fetcher),
            self.cancel.clone(),
            Arc::clone(&stats),
        )
        .await?;
        run_export(&ctx, writer).await
    }

    /// Export a batch of channels under bounded parallelism.
    ///
    /// Recoverable per-channel conditions are recorded in the report;
    /// cancellation and fatal errors abort the whole batch.
    pub async fn export_all(
        &self,
        requests: Vec<ExportRequest>,
        writer: Arc<dyn ChannelWriter>,
    ) -> Result<BatchReport> {
        let stats = Arc::new(ExportStats::default());
        let mut outcomes = Vec::new();

        let guilds = self.prepare_guilds(&requests).await?;

        // Cheap early exclusion via each channel's own message-id bounds,
        // before any per-message work is scheduled.
        let mut runnable = Vec::new();
        for request in requests {
            if request.range.overlaps(&request.channel) {
                runnable.push(request);
            } else {
                let label = request.channel.label();
                tracing::warn!(
                    channel = %label,
                    "channel has no messages within the requested period, skipping"
                );
                outcomes.push(ItemOutcome::Skipped {
                    channel: label,
                    reason: "no messages within the requested period".to_string(),
                });
            }
        }

        let parallel = self.config.job.parallel.max(1);
        let semaphore = Arc::new(Semaphore::new(parallel));
        let mut tasks: JoinSet<(String, Result<u64>)> = JoinSet::new();

        for request in runnable {
            let semaphore = Arc::clone(&semaphore);
            let archiver = self.clone();
            let writer = Arc::clone(&writer);
            let stats = Arc::clone(&stats);
            let guild = request
                .channel
                .guild_id
                .and_then(|id| guilds.get(&id).cloned());

            tasks.spawn(async move {
                let label = request.channel.label();
                let result = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::Cancelled)?;
                    let ctx = ExportContext::new(ContextSeed {
                        request,
                        config: Arc::clone(&archiver.config),
                        api: Arc::clone(&archiver.api),
                        fetcher: Arc::clone(&archiver.fetcher),
                        cancel: archiver.cancel.clone(),
                        stats,
                        members: guild.as_ref().map(|g| Arc::clone(&g.members)),
                        tables: guild
                            .map(|g| g.tables)
                            .unwrap_or_else(|| Arc::new(GuildTables::default())),
                    });
                    run_export(&ctx, writer.as_ref()).await
                }
                .await;
                (label, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (label, result) =
                joined.map_err(|e| Error::Other(format!("export task failed: {e}")))?;
            match result {
                Ok(messages) => {
                    tracing::info!(channel = %label, messages, "channel exported");
                    outcomes.push(ItemOutcome::Exported {
                        channel: label,
                        messages,
                    });
                }
                Err(e) if e.is_cancellation() => {
                    tasks.abort_all();
                    return Err(Error::Cancelled);
                }
                Err(Error::Export(
                    e @ (ExportError::EmptyChannel { .. } | ExportError::NoMessagesInRange { .. }),
                )) => {
                    tracing::warn!(channel = %label, reason = %e, "nothing to export");
                    outcomes.push(ItemOutcome::Skipped {
                        channel: label,
                        reason: e.to_string(),
                    });
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(channel = %label, error = %e, "channel export failed");
                    outcomes.push(ItemOutcome::Failed {
                        channel: label,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    // Anything unrecognized is fatal for the whole batch
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        let report = BatchReport {
            outcomes,
            stats: stats.snapshot(),
        };
        summarize(&report);
        Ok(report)
    }

    /// Build one member cache per distinct guild and fetch each guild's
    /// channel and role tables exactly once.
    async fn prepare_guilds(
        &self,
        requests: &[ExportRequest],
    ) -> Result<HashMap<Snowflake, GuildResources>> {
        let guild_ids: BTreeSet<Snowflake> = requests
            .iter()
            .filter_map(|r| r.channel.guild_id)
            .collect();

        let mut guilds = HashMap::new();
        for guild_id in guild_ids {
            let tables = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                tables = GuildTables::fetch(self.api.as_ref(), guild_id) => tables?,
            };
            tracing::debug!(
                %guild_id,
                channels = tables.channels.len(),
                roles = tables.roles.len(),
                "prefetched guild tables"
            );
            guilds.insert(
                guild_id,
                GuildResources {
                    members: Arc::new(crate::member_cache::MemberCache::new(
                        Arc::clone(&self.api),
                        guild_id,
                        self.cancel.clone(),
                    )),
                    tables: Arc::new(tables),
                },
            );
        }
        Ok(guilds)
    }
}

/// Run one channel through the writer and flush its reference tables
async fn run_export(ctx: &ExportContext, writer: &dyn ChannelWriter) -> Result<u64> {
    let messages = writer.write_channel(ctx).await?;
    // Final session flush; writers flush at partition boundaries themselves
    ctx.flush_references().await?;
    ctx.stats()
        .messages_exported
        .fetch_add(messages, Ordering::Relaxed);
    Ok(messages)
}

fn summarize(report: &BatchReport) {
    for outcome in &report.outcomes {
        if let ItemOutcome::Failed { channel, message } = outcome {
            tracing::warn!(channel = %channel, reason = %message, "channel was not exported");
        }
    }
    tracing::info!(
        exported = report.exported(),
        failed = report.failed(),
        messages = report.total_messages(),
        media_downloaded = report.stats.media_downloaded,
        media_failed = report.stats.media_failed,
        "batch finished"
    );
}
