//! Fetch orchestration across the sources of a catalog.

use chrono::{NaiveDate, NaiveDateTime};
use earthfetch_core::data::{
    make_downloader, DownloadOptions, DownloadReport, FetchError, FetchProgress, SourceKind,
};
use earthfetch_core::source::{ConfigError, DataSource, Frequency, SourceCatalog};
use earthfetch_core::timestamp::{date_range, TimestampError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Fetch(#[from] FetchError),

    #[error("invalid date: {0}")]
    Timestamp(#[from] TimestampError),

    #[error("source '{0}' has no time.start; pass a start date")]
    NoStart(String),

    #[error("start {start} is after end {end}")]
    EmptyRange {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Date range requested on the command line. Unset bounds fall back to the
/// source's `time` block.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchRequest {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

/// First and last time to fetch for `source`.
///
/// Missing `end` means today.
pub fn resolve_window(
    source: &DataSource,
    request: &FetchRequest,
) -> Result<(NaiveDateTime, NaiveDateTime), RunError> {
    let time = source.time.clone().unwrap_or_default();
    let start = match request.start {
        Some(start) => start,
        None => time
            .start_time()?
            .ok_or_else(|| RunError::NoStart(source.name.clone()))?,
    };
    let end = match request.end {
        Some(end) => end,
        None => time.end_time()?.unwrap_or_else(today),
    };
    if start > end {
        return Err(RunError::EmptyRange { start, end });
    }
    Ok((start, end))
}

/// Timestamps to fetch for `source`, stepped by `time.freq` (daily when
/// unset).
pub fn resolve_times(
    source: &DataSource,
    request: &FetchRequest,
) -> Result<Vec<NaiveDateTime>, RunError> {
    let (start, end) = resolve_window(source, request)?;
    let freq = source.frequency().unwrap_or_else(Frequency::daily);
    Ok(date_range(start, end, freq))
}

fn today() -> NaiveDateTime {
    chrono::Local::now()
        .date_naive()
        .and_time(chrono::NaiveTime::MIN)
}

/// Outcome of [`fetch_sources`].
#[derive(Debug, Default)]
pub struct FetchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub reports: Vec<(String, DownloadReport)>,
    pub errors: Vec<(String, RunError)>,
}

impl FetchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn files(&self) -> usize {
        self.reports.iter().map(|(_, r)| r.files.len()).sum()
    }
}

/// Fetch the named sources (every source when `names` is empty), one after
/// another.
///
/// A failing source does not stop the run, but once the shared circuit
/// breaker trips the remaining sources are marked failed without being
/// attempted.
pub fn fetch_sources(
    catalog: &SourceCatalog,
    names: &[String],
    request: &FetchRequest,
    options: &DownloadOptions,
    progress: &dyn FetchProgress,
) -> Result<FetchSummary, RunError> {
    let sources = catalog.select(names)?;
    let total = sources.len();
    let mut summary = FetchSummary {
        total,
        ..Default::default()
    };

    for (i, source) in sources.iter().enumerate() {
        tracing::info!("[{}/{total}] fetching source '{}'", i + 1, source.name);

        match fetch_source(source, request, options, progress) {
            Ok(report) => {
                if !report.missing.is_empty() {
                    tracing::warn!(
                        source = %source.name,
                        "{} remote files did not exist",
                        report.missing.len()
                    );
                }
                summary.succeeded += 1;
                summary.reports.push((source.name.clone(), report));
            }
            Err(e) => {
                tracing::error!(source = %source.name, "{e}");
                summary.failed += 1;
                summary.errors.push((source.name.clone(), e));
            }
        }

        if !options.breaker.is_allowed() {
            for rest in &sources[(i + 1)..] {
                summary.failed += 1;
                summary
                    .errors
                    .push((rest.name.clone(), FetchError::CircuitBreakerTripped.into()));
            }
            break;
        }
    }

    tracing::info!(
        "{}/{} sources fetched, {} failed",
        summary.succeeded,
        summary.total,
        summary.failed
    );
    Ok(summary)
}

/// Fetch one source over the resolved range.
pub fn fetch_source(
    source: &DataSource,
    request: &FetchRequest,
    options: &DownloadOptions,
    progress: &dyn FetchProgress,
) -> Result<DownloadReport, RunError> {
    let downloader = make_downloader(source, options)?;
    // file caches expand the range to their own sampling
    let times = match downloader.kind() {
        SourceKind::FileCache { .. } => {
            let (start, end) = resolve_window(source, request)?;
            vec![start, end]
        }
        SourceKind::Thredds | SourceKind::Cmems => resolve_times(source, request)?,
    };
    Ok(downloader.download(&times, progress)?)
}

/// Parse a `--start`/`--end` style date.
pub fn parse_date(raw: &str) -> Result<NaiveDateTime, RunError> {
    Ok(earthfetch_core::timestamp::parse_timestamp(raw)?)
}

/// Midnight of a calendar date.
pub fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SourceCatalog {
        SourceCatalog::from_yaml_str(
            r#"
monthly:
  url: cmems_x
  storage_options: {cache_storage: "./{t:%Y%m%d}.nc"}
  time: {start: 2020-01-31, end: 2020-05-01, freq: 1M}
open:
  url: cmems_x
  storage_options: {cache_storage: "./{t:%Y%m%d}.nc"}
  time: {start: 2020-01-01}
bare:
  url: cmems_x
  storage_options: {cache_storage: "./{t:%Y%m%d}.nc"}
"#,
        )
        .unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDateTime {
        midnight(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[test]
    fn times_follow_source_frequency() {
        let catalog = catalog();
        let times = resolve_times(catalog.get("monthly").unwrap(), &FetchRequest::default())
            .unwrap();
        assert_eq!(
            times,
            vec![
                date(2020, 1, 31),
                date(2020, 2, 29),
                date(2020, 3, 31),
                date(2020, 4, 30),
            ]
        );
    }

    #[test]
    fn request_overrides_source_window() {
        let catalog = catalog();
        let request = FetchRequest {
            start: Some(date(2021, 1, 1)),
            end: Some(date(2021, 1, 3)),
        };
        let times = resolve_times(catalog.get("bare").unwrap(), &request).unwrap();
        assert_eq!(times.len(), 3);
    }

    #[test]
    fn open_ended_sources_run_until_today() {
        let catalog = catalog();
        let (start, end) =
            resolve_window(catalog.get("open").unwrap(), &FetchRequest::default()).unwrap();
        assert_eq!(start, date(2020, 1, 1));
        assert_eq!(end, today());
    }

    #[test]
    fn missing_start_and_reversed_ranges_are_errors() {
        let catalog = catalog();
        assert!(matches!(
            resolve_times(catalog.get("bare").unwrap(), &FetchRequest::default()),
            Err(RunError::NoStart(name)) if name == "bare"
        ));
        let reversed = FetchRequest {
            start: Some(date(2020, 2, 1)),
            end: Some(date(2020, 1, 1)),
        };
        assert!(matches!(
            resolve_window(catalog.get("bare").unwrap(), &reversed),
            Err(RunError::EmptyRange { .. })
        ));
    }

    #[test]
    fn parse_date_accepts_plain_dates() {
        assert_eq!(parse_date("2020-03-01").unwrap(), date(2020, 3, 1));
        assert!(matches!(parse_date("March"), Err(RunError::Timestamp(_))));
    }
}
