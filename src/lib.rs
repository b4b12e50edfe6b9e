//! # discord-archive
//!
//! Backend library for exporting Discord channel history and referenced
//! media into durable, self-contained archives.
//!
//! ## Design Philosophy
//!
//! discord-archive is designed to be:
//! - **Resilient** - per-channel failures never abort a batch, media
//!   failures never abort a channel
//! - **Deduplicating** - media is content-addressed on disk and transferred
//!   at most once per destination, across concurrent exports
//! - **Library-first** - no CLI or UI, purely a Rust crate for embedding
//! - **Transport-agnostic** - the REST client, message writers and raw byte
//!   fetch are traits supplied by the embedding application
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use discord_archive::{Archiver, Config, ReqwestFetcher};
//! # use discord_archive::{ApiClient, ChannelWriter, ExportFormat, ExportRequest, TimeRange};
//!
//! # async fn example(
//! #     api: Arc<dyn ApiClient>,
//! #     writer: Arc<dyn ChannelWriter>,
//! #     channels: Vec<discord_archive::Channel>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let archiver = Archiver::new(api, Arc::new(ReqwestFetcher::new()), Config::default());
//!
//! let requests = channels
//!     .into_iter()
//!     .map(|channel| ExportRequest {
//!         channel,
//!         range: TimeRange::all(),
//!         format: ExportFormat::HtmlDark,
//!     })
//!     .collect();
//!
//! let report = archiver.export_all(requests, writer).await?;
//! println!("exported {} channels", report.exported());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Collaborator interfaces (API client, byte fetcher, channel writer)
pub mod api;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Export orchestration, context and reference tables
pub mod export;
/// Media download pipeline and path derivation
pub mod media;
/// Shared per-guild member cache with request coalescing
pub mod member_cache;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types
pub mod types;

// Re-export commonly used types
pub use api::{ApiClient, ChannelWriter, FetchedBody, HttpFetcher, ReqwestFetcher};
pub use config::{Config, DateConfig, JobConfig, MediaConfig, MediaLayout, OutputConfig, RetryConfig};
pub use error::{ApiError, Error, ExportError, Result};
pub use export::{Archiver, ExportContext, GuildTables, ReferenceMode, ReferenceWriter};
pub use media::{MediaDownloader, MediaOutcome};
pub use member_cache::MemberCache;
pub use types::{
    BatchReport, Channel, ChannelKind, ExportFormat, ExportRequest, ExportStats, Guild,
    ItemOutcome, Member, Role, Snowflake, StatsSnapshot, TimeRange, User,
};

use tokio_util::sync::CancellationToken;

/// Cancel a session token when the process receives a termination signal.
///
/// Spawn-and-forget companion to [`Archiver::cancellation_token`]: in-flight
/// transfers and fetches abort at their next suspension point and no partial
/// media file is promoted to its canonical name.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// # async fn example(archiver: discord_archive::Archiver) {
/// tokio::spawn(discord_archive::cancel_on_shutdown_signal(
///     archiver.cancellation_token(),
/// ));
/// # }
/// ```
pub async fn cancel_on_shutdown_signal(token: CancellationToken) {
    wait_for_signal().await;
    token.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
