//! Media materialization pipeline
//!
//! Turns remote media URLs observed during an export into deduplicated local
//! files. One [`MediaDownloader`] instance exists per export session; it owns
//! a private per-URL result table and a per-destination-path lock table, so
//! concurrent resolutions of the same resource (including differently-signed
//! URLs that derive to the same path) perform exactly one transfer.
//!
//! Failures never abort an export: a URL that cannot be materialized resolves
//! to [`MediaOutcome::Failed`] and the caller keeps the remote URL in the
//! output. Only cancellation propagates as an error.

pub(crate) mod path;

use crate::api::{FetchedBody, HttpFetcher};
use crate::config::{Config, MediaLayout, RetryConfig};
use crate::error::{Error, Result};
use crate::retry::download_with_retry;
use crate::types::ExportStats;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Textual bodies under this size are error pages, not media
const SMALL_TEXT_BODY_LIMIT: usize = 1000;

/// Bodies under this size that decode as UTF-8 text are inspected for
/// error/HTML markers regardless of declared content type
const TINY_BODY_LIMIT: usize = 100;

/// Result of materializing one URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaOutcome {
    /// Media was transferred (or reused) and lives at this local path
    Downloaded(PathBuf),
    /// URL belongs to an embed-only platform or an ephemeral proxy
    /// thumbnail; it was never fetched and the original URL stands
    Skipped(String),
    /// Transfer or validation failed; the original URL stands
    Failed(String),
}

/// Per-session state guarded by one mutex: outcomes keyed by the original
/// URL, plus resolved final paths keyed by the derived destination so
/// re-signed URLs short-circuit without a second transfer.
#[derive(Default)]
struct SessionState {
    by_url: HashMap<String, MediaOutcome>,
    by_path: HashMap<PathBuf, PathBuf>,
}

/// Session-scoped media downloader (one instance per channel export)
pub struct MediaDownloader {
    media_dir: PathBuf,
    layout: MediaLayout,
    reuse: bool,
    retry: RetryConfig,
    fetcher: Arc<dyn HttpFetcher>,
    cancel: CancellationToken,
    stats: Arc<ExportStats>,
    state: Mutex<SessionState>,
    /// Per-destination-path locks; entries live only while a resolution for
    /// that path is in flight
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl MediaDownloader {
    /// Create a downloader for one export session
    pub fn new(
        config: &Config,
        fetcher: Arc<dyn HttpFetcher>,
        cancel: CancellationToken,
        stats: Arc<ExportStats>,
    ) -> Self {
        Self {
            media_dir: config.media_dir(),
            layout: config.media.layout,
            reuse: config.media.reuse_media,
            retry: config.retry.clone(),
            fetcher,
            cancel,
            stats,
            state: Mutex::new(SessionState::default()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Materialize a URL into a local file, reusing prior work wherever the
    /// derived destination path allows it.
    ///
    /// The only error this returns is cancellation; every other condition
    /// resolves to one of the three [`MediaOutcome`] variants.
    pub async fn download(&self, url: &str) -> Result<MediaOutcome> {
        if path::should_skip(url) {
            tracing::trace!(url, "URL classified as embed-only or ephemeral, skipping");
            return Ok(MediaOutcome::Skipped(url.to_string()));
        }

        let dest = self.media_dir.join(path::derive(url, self.layout));

        // Lock on the destination path, not the URL: distinct URLs that
        // canonicalize to the same file must not race each other.
        let lock = self.lock_for(&dest).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.resolve_locked(url, &dest).await
        };
        self.release_lock(&dest, lock).await;
        outcome
    }

    /// Resolution body; runs with the destination-path lock held.
    async fn resolve_locked(&self, url: &str, dest: &Path) -> Result<MediaOutcome> {
        {
            let mut state = self.state.lock().await;
            if let Some(outcome) = state.by_url.get(url) {
                return Ok(outcome.clone());
            }
            if let Some(final_path) = state.by_path.get(dest).cloned() {
                // A differently-signed URL already resolved this destination
                let outcome = MediaOutcome::Downloaded(final_path);
                state.by_url.insert(url.to_string(), outcome.clone());
                self.stats.media_reused.fetch_add(1, Ordering::Relaxed);
                return Ok(outcome);
            }
        }

        if self.reuse && fs::try_exists(dest).await.unwrap_or(false) {
            tracing::trace!(url, dest = %dest.display(), "reusing media file from disk");
            self.stats.media_reused.fetch_add(1, Ordering::Relaxed);
            return Ok(self.record(url, dest, dest.to_path_buf()).await);
        }

        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = download_with_retry(&self.retry, || self.fetcher.fetch(url)) => result,
        };
        let body = match fetched {
            Ok(body) => body,
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                tracing::warn!(url, error = %e, "media transfer failed, keeping remote URL");
                return Ok(self.fail(url).await);
            }
        };

        if looks_like_error_response(body.content_type.as_deref(), &body.bytes) {
            tracing::warn!(
                url,
                content_type = body.content_type.as_deref().unwrap_or("unknown"),
                len = body.bytes.len(),
                "response is an error page masquerading as media, keeping remote URL"
            );
            return Ok(self.fail(url).await);
        }

        let final_path = destination_with_extension(dest, &body);
        if let Err(e) = self.persist(&final_path, &body.bytes).await {
            if e.is_cancellation() {
                return Err(e);
            }
            tracing::warn!(url, error = %e, "failed to persist media file, keeping remote URL");
            return Ok(self.fail(url).await);
        }

        tracing::debug!(url, dest = %final_path.display(), "media file downloaded");
        self.stats.media_downloaded.fetch_add(1, Ordering::Relaxed);
        Ok(self.record(url, dest, final_path).await)
    }

    /// Write the body next to the destination and promote it atomically, so
    /// a cancelled or failed transfer never leaves a partial file at the
    /// canonical name.
    async fn persist(&self, dest: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file_name = dest
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or_else(|| Error::Other(format!("invalid media path: {}", dest.display())))?;
        let staging = dest.with_file_name(format!("{file_name}.part"));

        fs::write(&staging, bytes).await?;
        fs::rename(&staging, dest).await?;
        Ok(())
    }

    async fn record(&self, url: &str, dest: &Path, final_path: PathBuf) -> MediaOutcome {
        let outcome = MediaOutcome::Downloaded(final_path.clone());
        let mut state = self.state.lock().await;
        state.by_path.insert(dest.to_path_buf(), final_path);
        state.by_url.insert(url.to_string(), outcome.clone());
        outcome
    }

    async fn fail(&self, url: &str) -> MediaOutcome {
        self.stats.media_failed.fetch_add(1, Ordering::Relaxed);
        let outcome = MediaOutcome::Failed(url.to_string());
        self.state
            .lock()
            .await
            .by_url
            .insert(url.to_string(), outcome.clone());
        outcome
    }

    async fn lock_for(&self, dest: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(dest.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop our handle and clear the table entry once nobody else is waiting
    /// on this path.
    async fn release_lock(&self, dest: &Path, held: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(held);
        if let Some(entry) = locks.get(dest)
            && Arc::strong_count(entry) == 1
        {
            locks.remove(dest);
        }
    }
}

/// Detect error responses served in place of media.
///
/// JSON is never valid media. Small textual bodies are error pages. Tiny
/// bodies that decode as text and open with an HTML/JSON/error marker are
/// error pages no matter what content type they claim.
fn looks_like_error_response(content_type: Option<&str>, body: &[u8]) -> bool {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if ct.contains("application/json") {
            return true;
        }
        let textual = ct.starts_with("text/plain")
            || ct.starts_with("text/html")
            || ct.starts_with("text/xml")
            || ct.starts_with("application/xml");
        if textual && body.len() < SMALL_TEXT_BODY_LIMIT {
            return true;
        }
    }

    if body.len() < TINY_BODY_LIMIT
        && let Ok(text) = std::str::from_utf8(body)
    {
        let trimmed = text.trim_start().to_ascii_lowercase();
        return trimmed.starts_with('<') || trimmed.starts_with('{') || trimmed.starts_with("error");
    }

    false
}

/// Append an extension inferred from the response content type when the
/// derived path does not already carry a real one.
fn destination_with_extension(dest: &Path, body: &FetchedBody) -> PathBuf {
    if has_real_extension(dest) {
        return dest.to_path_buf();
    }
    let Some(extension) = body
        .content_type
        .as_deref()
        .and_then(extension_for_content_type)
    else {
        return dest.to_path_buf();
    };
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(extension);
    dest.with_file_name(name)
}

fn has_real_extension(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| !ext.is_empty() && ext.len() <= 10)
}

/// Fixed media-type → extension table for responses whose URL carried none
fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/png" => Some(".png"),
        "image/jpeg" => Some(".jpg"),
        "image/gif" => Some(".gif"),
        "image/webp" => Some(".webp"),
        "image/avif" => Some(".avif"),
        "image/svg+xml" => Some(".svg"),
        "video/mp4" => Some(".mp4"),
        "video/webm" => Some(".webm"),
        "video/quicktime" => Some(".mov"),
        "audio/mpeg" => Some(".mp3"),
        "audio/ogg" => Some(".ogg"),
        "audio/wav" => Some(".wav"),
        "application/pdf" => Some(".pdf"),
        _ => None,
    }
}
