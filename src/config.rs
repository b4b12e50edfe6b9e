//! Configuration types for discord-archive

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Output location configuration
///
/// Groups settings describing where archives and downloaded media land.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory archives are written to (default: "./exports")
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Directory downloaded media is stored under.
    /// Defaults to a `media` directory inside the output directory.
    #[serde(default)]
    pub media_dir: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            media_dir: None,
        }
    }
}

/// Media download behavior
///
/// Groups settings for the asset downloader: whether referenced media is
/// fetched at all, whether files already on disk are reused, and which of
/// the two path layouts is used to file them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Download referenced media alongside the archive (default: false)
    #[serde(default)]
    pub download_media: bool,

    /// Reuse media files already present on disk from previous runs,
    /// skipping the transfer when the destination path exists (default: false)
    #[serde(default)]
    pub reuse_media: bool,

    /// On-disk layout for downloaded media (default: nested)
    #[serde(default)]
    pub layout: MediaLayout,
}

/// On-disk layout for downloaded media
///
/// The two strategies are independent pure functions over the source URL;
/// both are deterministic across runs, which is what makes cross-run reuse
/// and deduplication work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaLayout {
    /// Structured-by-resource-type layout: media is filed into categories
    /// (`attachments/`, `emojis/`, `avatars/`, `external/{host}/`, ...)
    /// with collision-resistant names derived per resource type (default)
    #[default]
    Nested,
    /// Flat layout used by older archives: a truncated original filename
    /// combined with a short hash of the normalized URL
    Legacy,
}

/// Timestamp rendering configuration
///
/// Groups settings controlling how message timestamps are normalized and
/// formatted by the export context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DateConfig {
    /// Normalize timestamps to UTC instead of local time (default: false)
    #[serde(default)]
    pub utc: bool,

    /// `chrono` format string applied to normalized timestamps
    /// (default: "%d-%b-%y %I:%M %p", e.g. "30-Apr-16 11:18 AM")
    #[serde(default = "default_date_format")]
    pub format: String,
}

impl Default for DateConfig {
    fn default() -> Self {
        Self {
            utc: false,
            format: default_date_format(),
        }
    }
}

/// Batch execution configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobConfig {
    /// Maximum number of channels exported concurrently (default: 1).
    /// Values below 1 are treated as 1.
    #[serde(default = "default_parallel")]
    pub parallel: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
        }
    }
}

/// Retry configuration for transient media transfer failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Main configuration for the archiver
///
/// Fields are organized into logical sub-configs:
/// - [`output`](OutputConfig) — archive and media directories
/// - [`media`](MediaConfig) — media download behavior and layout
/// - [`date`](DateConfig) — timestamp normalization and formatting
/// - [`job`](JobConfig) — batch parallelism
/// - [`retry`](RetryConfig) — transfer retry policy
///
/// All sub-config fields are flattened for serialization, so the JSON/TOML
/// representation stays a single flat object with no nesting.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Archive and media directories
    #[serde(flatten)]
    pub output: OutputConfig,

    /// Media download behavior and layout
    #[serde(flatten)]
    pub media: MediaConfig,

    /// Timestamp normalization and formatting
    #[serde(flatten)]
    pub date: DateConfig,

    /// Batch parallelism
    #[serde(flatten)]
    pub job: JobConfig,

    /// Transfer retry policy
    #[serde(default)]
    pub retry: RetryConfig,
}

// Convenience accessors — call sites read `config.output_dir()` etc. without
// reaching through the sub-config structs.
impl Config {
    /// Directory archives are written to
    pub fn output_dir(&self) -> &PathBuf {
        &self.output.output_dir
    }

    /// Directory downloaded media is stored under, resolving the default
    /// `media` directory inside the output directory when unset
    pub fn media_dir(&self) -> PathBuf {
        self.output
            .media_dir
            .clone()
            .unwrap_or_else(|| self.output.output_dir.join("media"))
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./exports")
}

fn default_date_format() -> String {
    "%d-%b-%y %I:%M %p".to_string()
}

fn default_parallel() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
