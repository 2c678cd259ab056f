//! Whole-file cache downloader for `filecache::<protocol>://` sources.
//!
//! The URL template names one remote file per timestamp; `cache_storage` names
//! the local directory it lands in, under its remote file name. Requested times
//! are expanded to the source's own sampling (`time.freq`) before anything is
//! fetched, then grouped into per-directory batches.

use super::circuit_breaker::CircuitBreaker;
use super::manifest;
use super::protocol::{classify_url, SourceKind, FILECACHE_PREFIX};
use super::provider::{
    DownloadReport, Downloader, FetchError, FetchProgress, FileOutcome, PlannedFetch,
};
use super::remote::{basename, has_wildcard, RemoteFs};
use crate::source::{ConfigError, DataSource, Frequency};
use crate::template::{FormatContext, Template};
use crate::timestamp::{daily_range, date_range};
use chrono::NaiveDateTime;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Remote files that share one local directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub local_dir: PathBuf,
    pub remotes: Vec<String>,
}

impl Batch {
    /// Local destination of each remote, in order.
    pub fn targets(&self) -> impl Iterator<Item = (&str, PathBuf)> + '_ {
        self.remotes
            .iter()
            .map(|r| (r.as_str(), self.local_dir.join(basename(r))))
    }
}

pub struct FileCacheDownloader {
    name: String,
    kind: SourceKind,
    url: Template,
    cache: Template,
    ctx: FormatContext,
    freq: Option<Frequency>,
    fs: Arc<dyn RemoteFs>,
    jobs: usize,
    breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for FileCacheDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCacheDownloader")
            .field("name", &self.name)
            .field("url", &self.url.as_str())
            .field("cache", &self.cache.as_str())
            .field("protocol", &self.fs.protocol())
            .finish()
    }
}

impl FileCacheDownloader {
    pub fn new(
        source: &DataSource,
        fs: Arc<dyn RemoteFs>,
        jobs: usize,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, FetchError> {
        let kind = classify_url(source)?;
        if !matches!(kind, SourceKind::FileCache { .. }) {
            return Err(source
                .invalid(format!("url must start with {FILECACHE_PREFIX}"))
                .into());
        }
        let raw = source.url()?.trim();
        let remote = raw.strip_prefix(FILECACHE_PREFIX).unwrap_or(raw);

        Ok(Self {
            name: source.name.clone(),
            kind,
            url: Template::parse(remote)?,
            cache: Template::parse(source.cache_storage()?)?,
            ctx: source.format_context(),
            freq: source.frequency(),
            fs,
            jobs: jobs.max(1),
            breaker,
        })
    }

    /// Remote and local directory for `t`.
    ///
    /// A `*` in the remote is resolved by globbing and taking the first
    /// match, `None` when nothing matches. With `check_exists` a concrete
    /// remote is checked too.
    pub fn make_path(
        &self,
        t: NaiveDateTime,
        check_exists: bool,
    ) -> Result<(Option<String>, PathBuf), FetchError> {
        let remote = self.url.render(t, &self.ctx)?;
        let local = PathBuf::from(self.cache.render(t, &self.ctx)?);

        let remote = if has_wildcard(&remote) {
            self.fs.glob(&remote)?.into_iter().next()
        } else if check_exists {
            self.fs.exists(&remote)?.then_some(remote)
        } else {
            Some(remote)
        };
        tracing::trace!(remote = ?remote, local = %local.display(), "paths for {t}");
        Ok((remote, local))
    }

    fn freq(&self) -> Result<Frequency, ConfigError> {
        self.freq.ok_or_else(|| ConfigError::MissingField {
            source_name: self.name.clone(),
            field: "time.freq",
        })
    }

    /// Timestamps at the source's sampling between `t0` and `t1`.
    ///
    /// Daily sources use every day. Coarser sources start at the first day
    /// within two steps of `t0` that has a remote file.
    pub fn strided_times(
        &self,
        t0: NaiveDateTime,
        t1: NaiveDateTime,
    ) -> Result<Vec<NaiveDateTime>, FetchError> {
        let freq = self.freq()?;
        if freq.is_daily() {
            tracing::trace!("time frequency is 1 day");
            return Ok(daily_range(t0, t1));
        }
        tracing::trace!(%freq, "searching for starting date");
        let start = self.first_available(t0, freq)?;
        Ok(date_range(start, t1, freq))
    }

    fn first_available(
        &self,
        t0: NaiveDateTime,
        freq: Frequency,
    ) -> Result<NaiveDateTime, FetchError> {
        let end = freq.nth_after(t0, 2).ok_or_else(|| {
            FetchError::InvalidRequest(format!("{freq} steps from {t0} overflow the calendar"))
        })?;
        for t in daily_range(t0, end) {
            if self.make_path(t, true)?.0.is_some() {
                tracing::debug!("found data at {t}");
                return Ok(t);
            }
            tracing::trace!("no data found at {t}");
        }
        Err(FetchError::NoDataInWindow { start: t0, end })
    }

    /// Group the files covering `times` by local directory.
    ///
    /// The range runs from the earliest to the latest requested time. Batches
    /// keep first-seen order and never repeat a local file: when two remotes
    /// land on the same path only the first is kept.
    pub fn make_batches(&self, times: &[NaiveDateTime]) -> Result<Vec<Batch>, FetchError> {
        let (Some(&t0), Some(&t1)) = (times.iter().min(), times.iter().max()) else {
            return Ok(Vec::new());
        };

        tracing::debug!("making folder batches for download");
        let mut batches: Vec<Batch> = Vec::new();
        let mut claimed: HashMap<PathBuf, String> = HashMap::new();
        for t in self.strided_times(t0, t1)? {
            let (Some(remote), local_dir) = self.make_path(t, false)? else {
                continue;
            };
            let target = local_dir.join(basename(&remote));
            if let Some(first) = claimed.get(&target) {
                if *first != remote {
                    tracing::warn!(
                        source = %self.name,
                        "skipping {remote}: {} is already taken by {first}",
                        target.display()
                    );
                }
                continue;
            }
            claimed.insert(target, remote.clone());

            match batches.iter_mut().find(|b| b.local_dir == local_dir) {
                Some(batch) => batch.remotes.push(remote),
                None => batches.push(Batch {
                    local_dir,
                    remotes: vec![remote],
                }),
            }
        }
        Ok(batches)
    }

    fn fetch_one(&self, remote: &str, local: &Path) -> Result<FileOutcome, FetchError> {
        if local.is_file() {
            return Ok(FileOutcome::Cached);
        }
        if !self.breaker.is_allowed() {
            return Err(FetchError::CircuitBreakerTripped);
        }
        let bytes = self.fs.fetch(remote, local)?;
        Ok(FileOutcome::Downloaded { bytes })
    }
}

impl Downloader for FileCacheDownloader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &SourceKind {
        &self.kind
    }

    fn plan(&self, times: &[NaiveDateTime]) -> Result<Vec<PlannedFetch>, FetchError> {
        times
            .iter()
            .map(|&t| {
                let remote = self.url.render(t, &self.ctx)?;
                let local = PathBuf::from(self.cache.render(t, &self.ctx)?).join(basename(&remote));
                Ok(PlannedFetch {
                    time: t,
                    remote,
                    local,
                })
            })
            .collect()
    }

    fn download(
        &self,
        times: &[NaiveDateTime],
        progress: &dyn FetchProgress,
    ) -> Result<DownloadReport, FetchError> {
        let batches = self.make_batches(times)?;
        let targets: Vec<(&str, PathBuf)> = batches.iter().flat_map(Batch::targets).collect();
        let total = targets.len();
        tracing::info!(
            source = %self.name,
            "downloading {total} files to {} locations",
            batches.len()
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .build()
            .map_err(|e| FetchError::Backend {
                backend: "filecache",
                message: format!("failed to start worker pool: {e}"),
            })?;

        let results: Vec<Result<FileOutcome, FetchError>> = pool.install(|| {
            targets
                .par_iter()
                .enumerate()
                .map(|(i, (remote, local))| {
                    progress.on_start(remote, i, total);
                    let result = self.fetch_one(remote, local);
                    progress.on_complete(remote, i, total, &result);
                    result
                })
                .collect()
        });

        let mut report = DownloadReport::default();
        let mut fetched = Vec::new();
        let mut first_error = None;
        let mut failed = 0;
        for ((remote, local), result) in targets.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    if matches!(outcome, FileOutcome::Downloaded { .. }) {
                        fetched.push((local.as_path(), *remote));
                    }
                    report.push(local.clone(), outcome);
                }
                Err(FetchError::NotFound { .. }) => {
                    tracing::warn!(source = %self.name, "remote file missing: {remote}");
                    report.missing.push(remote.to_string());
                }
                Err(e) => {
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }
        progress.on_batch_complete(report.files.len(), failed + report.missing.len(), total);

        manifest::record_all(fetched)?;
        for batch in &batches {
            tracing::info!(
                source = %self.name,
                "fetched {} files to {}",
                batch.remotes.len(),
                batch.local_dir.display()
            );
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn is_available(&self) -> bool {
        self.breaker.is_allowed()
    }
}
