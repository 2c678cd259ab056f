//! Downloader trait, download reports and structured error types.
//!
//! The [`Downloader`] trait abstracts over the transfer backends (whole-file
//! cache, THREDDS subsets, Copernicus Marine subsets) so the runner can drive
//! any source the same way and tests can substitute fakes.

use crate::cf_time::{CfTimeError, NearestError};
use crate::data::protocol::SourceKind;
use crate::source::ConfigError;
use crate::template::TemplateError;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Structured error types for fetch operations.
///
/// These are displayable in CLI output and log lines alike.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by server (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("authentication required for {url} (HTTP {status})")]
    AuthenticationRequired { url: String, status: u16 },

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("hard stop: remote server keeps failing (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("unexpected response from {url}: {message}")]
    ResponseFormat { url: String, message: String },

    #[error("no data found between {start} and {end}")]
    NoDataInWindow {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("{backend} failed: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Nearest(#[from] NearestError),

    #[error(transparent)]
    CfTime(#[from] CfTimeError),
}

impl FetchError {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        FetchError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether this error means every further request will fail too.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FetchError::CircuitBreakerTripped
                | FetchError::MissingCredentials(_)
                | FetchError::AuthenticationRequired { .. }
        )
    }
}

/// How a single file was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileOutcome {
    /// Fetched from the remote; size in bytes.
    Downloaded { bytes: u64 },
    /// Already present in the local cache.
    Cached,
}

/// What a download call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    /// Local paths, in request order.
    pub files: Vec<PathBuf>,
    pub downloaded: usize,
    pub cached: usize,
    /// Remote paths that did not exist.
    pub missing: Vec<String>,
}

impl DownloadReport {
    pub(crate) fn push(&mut self, path: PathBuf, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Downloaded { .. } => self.downloaded += 1,
            FileOutcome::Cached => self.cached += 1,
        }
        self.files.push(path);
    }
}

/// One expected transfer, computed without touching the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedFetch {
    pub time: NaiveDateTime,
    pub remote: String,
    pub local: PathBuf,
}

/// A configured downloader for one data source.
pub trait Downloader: Send + Sync {
    /// Source name from the catalog.
    fn name(&self) -> &str;

    /// Which backend handles this source.
    fn kind(&self) -> &SourceKind;

    /// Expand templates for each time. Remote wildcards are left unresolved.
    fn plan(&self, times: &[NaiveDateTime]) -> Result<Vec<PlannedFetch>, FetchError>;

    /// Fetch data covering `times` into the local cache.
    fn download(
        &self,
        times: &[NaiveDateTime],
        progress: &dyn FetchProgress,
    ) -> Result<DownloadReport, FetchError>;

    /// False once the shared circuit breaker has tripped.
    fn is_available(&self) -> bool;
}

/// Progress callback for per-file operations.
pub trait FetchProgress: Send + Sync {
    /// Called when starting to fetch an item.
    fn on_start(&self, item: &str, index: usize, total: usize);

    /// Called when an item completes.
    fn on_complete(
        &self,
        item: &str,
        index: usize,
        total: usize,
        result: &Result<FileOutcome, FetchError>,
    );

    /// Called when the whole batch is done.
    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize);
}

/// Progress reporter that emits `tracing` events.
pub struct LogProgress;

impl FetchProgress for LogProgress {
    fn on_start(&self, item: &str, index: usize, total: usize) {
        tracing::debug!("[{}/{}] fetching {item}", index + 1, total);
    }

    fn on_complete(
        &self,
        item: &str,
        _index: usize,
        _total: usize,
        result: &Result<FileOutcome, FetchError>,
    ) {
        match result {
            Ok(FileOutcome::Downloaded { bytes }) => {
                tracing::info!(bytes, "downloaded {item}")
            }
            Ok(FileOutcome::Cached) => tracing::debug!("{item} already cached"),
            Err(e) => tracing::warn!("failed {item}: {e}"),
        }
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize) {
        tracing::info!("batch complete: {succeeded}/{total} succeeded, {failed} failed");
    }
}

/// Progress reporter that discards everything.
pub struct NoProgress;

impl FetchProgress for NoProgress {
    fn on_start(&self, _item: &str, _index: usize, _total: usize) {}

    fn on_complete(
        &self,
        _item: &str,
        _index: usize,
        _total: usize,
        _result: &Result<FileOutcome, FetchError>,
    ) {
    }

    fn on_batch_complete(&self, _succeeded: usize, _failed: usize, _total: usize) {}
}
