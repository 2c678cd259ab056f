//! Downloader for array services (THREDDS, Copernicus Marine).
//!
//! These serve one large dataset rather than one file per date, so each
//! requested time is snapped to the nearest available timestamp and the
//! backend writes a single-time subset of the selected variables to the
//! path rendered from `cache_storage`.

use super::circuit_breaker::CircuitBreaker;
use super::manifest;
use super::protocol::SourceKind;
use super::provider::{
    DownloadReport, Downloader, FetchError, FetchProgress, FileOutcome, PlannedFetch,
};
use super::transport::part_path;
use crate::cf_time::{NearestError, TimeAxis};
use crate::source::{ConfigError, DataSource, Frequency};
use crate::template::{FormatContext, Template};
use crate::timestamp::daily_range;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// A remote dataset that can be subset by time and variable.
pub trait DatasetBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every timestamp the dataset holds.
    fn open_time_axis(&self) -> Result<TimeAxis, FetchError>;

    /// Human-readable description of the request for `t`, shown in plans.
    fn describe(&self, t: NaiveDateTime, variables: &[String]) -> String;

    /// Write the subset at exactly `t` to `dest`; returns its size in bytes.
    fn fetch_subset(
        &self,
        t: NaiveDateTime,
        variables: &[String],
        dest: &Path,
    ) -> Result<u64, FetchError>;
}

pub struct DatasetDownloader {
    name: String,
    kind: SourceKind,
    cache: Template,
    ctx: FormatContext,
    variables: Vec<String>,
    tolerance: Option<Frequency>,
    backend: Box<dyn DatasetBackend>,
    axis: Mutex<Option<Arc<TimeAxis>>>,
    breaker: Arc<CircuitBreaker>,
}

impl DatasetDownloader {
    pub fn new(
        source: &DataSource,
        kind: SourceKind,
        backend: Box<dyn DatasetBackend>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, FetchError> {
        let cache = check_cache_storage(source)?;
        if source.variables.is_empty() {
            return Err(ConfigError::MissingVariables {
                source_name: source.name.clone(),
            }
            .into());
        }

        Ok(Self {
            name: source.name.clone(),
            kind,
            cache,
            ctx: source.format_context(),
            variables: source
                .variables
                .source_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            tolerance: source.tolerance(),
            backend,
            axis: Mutex::new(None),
            breaker,
        })
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// The dataset's time axis, opened on first use.
    pub fn time_axis(&self) -> Result<Arc<TimeAxis>, FetchError> {
        let mut slot = self.axis.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(axis) = slot.as_ref() {
            return Ok(Arc::clone(axis));
        }
        if !self.breaker.is_allowed() {
            return Err(FetchError::CircuitBreakerTripped);
        }
        let axis = Arc::new(self.backend.open_time_axis()?);
        tracing::info!(
            source = %self.name,
            backend = self.backend.name(),
            steps = axis.len(),
            first = ?axis.first(),
            last = ?axis.last(),
            "opened dataset"
        );
        *slot = Some(Arc::clone(&axis));
        Ok(axis)
    }

    /// Nearest available timestamp to `t` and the local path it maps to.
    pub fn resolve(&self, t: NaiveDateTime) -> Result<(NaiveDateTime, PathBuf), FetchError> {
        let axis = self.time_axis()?;
        let tolerance = self.tolerance.and_then(|f| f.span_from(t));
        let t_out = axis.nearest(t, tolerance)?;
        let local = PathBuf::from(self.cache.render(t_out, &self.ctx)?);
        tracing::trace!(requested = %t, nearest = %t_out, local = %local.display(), "resolved");
        Ok((t_out, local))
    }

    fn fetch_time(&self, t_out: NaiveDateTime, local: &Path) -> Result<FileOutcome, FetchError> {
        if local.exists() {
            tracing::debug!(source = %self.name, "{} already exists, skipping", local.display());
            return Ok(FileOutcome::Cached);
        }
        if !self.breaker.is_allowed() {
            return Err(FetchError::CircuitBreakerTripped);
        }
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|e| FetchError::io(parent, e))?;
        }

        let part = part_path(local);
        let bytes = match self.backend.fetch_subset(t_out, &self.variables, &part) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&part);
                return Err(e);
            }
        };
        fs::rename(&part, local).map_err(|e| {
            let _ = fs::remove_file(&part);
            FetchError::io(local, e)
        })?;
        Ok(FileOutcome::Downloaded { bytes })
    }
}

/// `cache_storage` must give every day its own file.
fn check_cache_storage(source: &DataSource) -> Result<Template, FetchError> {
    let raw = source.cache_storage()?;
    if !raw.contains("{t:") {
        return Err(source
            .invalid("storage_options.cache_storage must contain a {t:...} placeholder".into())
            .into());
    }
    if raw.contains('*') {
        return Err(source
            .invalid("storage_options.cache_storage must not contain '*'".into())
            .into());
    }
    let template = Template::parse(raw)?;
    let ctx = source.format_context();

    let (Some(first), Some(last)) = (
        NaiveDate::from_ymd_opt(2000, 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0)),
        NaiveDate::from_ymd_opt(2000, 1, 9).and_then(|d| d.and_hms_opt(0, 0, 0)),
    ) else {
        return Err(FetchError::InvalidRequest("sample dates out of range".into()));
    };
    let sample = daily_range(first, last);
    let unique = sample
        .iter()
        .map(|&t| template.render(t, &ctx))
        .collect::<Result<BTreeSet<_>, _>>()?;
    if unique.len() != sample.len() {
        return Err(source
            .invalid(format!(
                "storage_options.cache_storage '{raw}' must produce a unique path for every day"
            ))
            .into());
    }
    Ok(template)
}

impl Downloader for DatasetDownloader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &SourceKind {
        &self.kind
    }

    /// Paths for the requested times as given; they are not snapped to the
    /// dataset axis.
    fn plan(&self, times: &[NaiveDateTime]) -> Result<Vec<PlannedFetch>, FetchError> {
        times
            .iter()
            .map(|&t| {
                Ok(PlannedFetch {
                    time: t,
                    remote: self.backend.describe(t, &self.variables),
                    local: PathBuf::from(self.cache.render(t, &self.ctx)?),
                })
            })
            .collect()
    }

    fn download(
        &self,
        times: &[NaiveDateTime],
        progress: &dyn FetchProgress,
    ) -> Result<DownloadReport, FetchError> {
        let total = times.len();
        let mut report = DownloadReport::default();
        let mut fetched: Vec<(PathBuf, String)> = Vec::new();
        let mut failed = 0;
        let mut first_error = None;

        for (i, &t) in times.iter().enumerate() {
            let label = format!("{} @ {}", self.name, crate::timestamp::display(t));
            progress.on_start(&label, i, total);

            let mut resolved = None;
            let result = self.resolve(t).and_then(|(t_out, local)| {
                let outcome = self.fetch_time(t_out, &local);
                resolved = Some((t_out, local));
                outcome
            });
            progress.on_complete(&label, i, total, &result);

            match result {
                Ok(outcome) => {
                    if let Some((t_out, local)) = resolved {
                        if matches!(outcome, FileOutcome::Downloaded { .. }) {
                            fetched.push((
                                local.clone(),
                                self.backend.describe(t_out, &self.variables),
                            ));
                        }
                        report.push(local, outcome);
                    }
                }
                Err(FetchError::Nearest(NearestError::OutOfTolerance { nearest, .. })) => {
                    tracing::warn!(
                        source = %self.name,
                        "no timestamp within tolerance of {t} (nearest is {nearest})"
                    );
                    report.missing.push(crate::timestamp::display(t));
                }
                Err(e) => {
                    failed += 1;
                    let fatal = e.is_fatal();
                    first_error.get_or_insert(e);
                    if fatal {
                        break;
                    }
                }
            }
        }
        progress.on_batch_complete(report.files.len(), failed + report.missing.len(), total);

        manifest::record_all(fetched.iter().map(|(p, r)| (p.as_path(), r.as_str())))?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn is_available(&self) -> bool {
        self.breaker.is_allowed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::manifest::CacheManifest;
    use crate::data::provider::NoProgress;
    use crate::source::{StorageOptions, TimeConfig, Variables};
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBackend {
        axis: Vec<NaiveDateTime>,
        opens: Arc<AtomicUsize>,
        fetches: Arc<Mutex<Vec<NaiveDateTime>>>,
        fail: bool,
    }

    impl FakeBackend {
        fn new(axis: Vec<NaiveDateTime>) -> Self {
            Self {
                axis,
                opens: Arc::default(),
                fetches: Arc::default(),
                fail: false,
            }
        }
    }

    impl DatasetBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn open_time_axis(&self) -> Result<TimeAxis, FetchError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(TimeAxis::new(self.axis.clone()))
        }

        fn describe(&self, t: NaiveDateTime, variables: &[String]) -> String {
            format!("fake?time={t}&var={}", variables.join(","))
        }

        fn fetch_subset(
            &self,
            t: NaiveDateTime,
            _variables: &[String],
            dest: &Path,
        ) -> Result<u64, FetchError> {
            if self.fail {
                fs::write(dest, b"partial").unwrap();
                return Err(FetchError::Backend {
                    backend: "fake",
                    message: "boom".into(),
                });
            }
            self.fetches.lock().unwrap().push(t);
            let body = t.to_string();
            fs::write(dest, &body).unwrap();
            Ok(body.len() as u64)
        }
    }

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn source(cache: &str) -> DataSource {
        DataSource {
            name: "chl".into(),
            url: Some("cmems_dataset".into()),
            storage_options: Some(StorageOptions {
                cache_storage: Some(cache.into()),
                ..Default::default()
            }),
            variables: serde_yaml::from_str::<Variables>("[CHL]").unwrap(),
            ..Default::default()
        }
    }

    fn downloader(src: &DataSource, backend: FakeBackend) -> DatasetDownloader {
        DatasetDownloader::new(
            src,
            SourceKind::Cmems,
            Box::new(backend),
            Arc::new(CircuitBreaker::default()),
        )
        .unwrap()
    }

    // ── Validation ──

    #[test]
    fn cache_storage_must_be_unique_per_day() {
        for bad in ["", "./data/chl.nc", "./data/{t:%Y%m}.nc", "./data/{t:%Y%m%d}_*.nc"] {
            let result = DatasetDownloader::new(
                &source(bad),
                SourceKind::Cmems,
                Box::new(FakeBackend::new(vec![])),
                Arc::new(CircuitBreaker::default()),
            );
            assert!(result.is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn variables_are_required() {
        let mut src = source("./{t:%Y%m%d}.nc");
        src.variables = Variables::default();
        let err = DatasetDownloader::new(
            &src,
            SourceKind::Cmems,
            Box::new(FakeBackend::new(vec![])),
            Arc::new(CircuitBreaker::default()),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            FetchError::Config(ConfigError::MissingVariables { .. })
        ));
    }

    // ── Download ──

    #[test]
    fn snaps_to_nearest_and_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(&format!("{}/{{name}}_{{t:%Y%m%d}}.nc", dir.path().display()));
        let backend = FakeBackend::new(vec![day(1), day(5), day(9)]);
        let opens = Arc::clone(&backend.opens);
        let fetches = Arc::clone(&backend.fetches);
        let dl = downloader(&src, backend);

        let report = dl.download(&[day(2), day(4), day(5)], &NoProgress).unwrap();
        assert_eq!(
            report.files,
            vec![
                dir.path().join("chl_20200101.nc"),
                dir.path().join("chl_20200105.nc"),
                dir.path().join("chl_20200105.nc"),
            ]
        );
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.cached, 1);
        assert_eq!(*fetches.lock().unwrap(), vec![day(1), day(5)]);
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        let manifest = CacheManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.len(), 2);
        assert!(!dir.path().join("chl_20200101.nc.part").exists());

        dl.download(&[day(1)], &NoProgress).unwrap();
        assert_eq!(fetches.lock().unwrap().len(), 2);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tolerance_marks_far_times_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = source(&format!("{}/{{t:%Y%m%d}}.nc", dir.path().display()));
        src.time = Some(TimeConfig {
            tolerance: Some("1D".parse().unwrap()),
            ..Default::default()
        });
        let dl = downloader(&src, FakeBackend::new(vec![day(1), day(20)]));

        let report = dl.download(&[day(2), day(10)], &NoProgress).unwrap();
        assert_eq!(report.files, vec![dir.path().join("20200101.nc")]);
        assert_eq!(report.missing, vec!["2020-01-10 00:00:00"]);
        assert!(dl.resolve(day(19) - Duration::hours(1)).is_ok());
    }

    #[test]
    fn failed_subset_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(&format!("{}/{{t:%Y%m%d}}.nc", dir.path().display()));
        let mut backend = FakeBackend::new(vec![day(1)]);
        backend.fail = true;
        let dl = downloader(&src, backend);

        assert!(matches!(
            dl.download(&[day(1)], &NoProgress),
            Err(FetchError::Backend { .. })
        ));
        assert!(!dir.path().join("20200101.nc").exists());
        assert!(!dir.path().join("20200101.nc.part").exists());
    }

    #[test]
    fn empty_dataset_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(&format!("{}/{{t:%Y%m%d}}.nc", dir.path().display()));
        let dl = downloader(&src, FakeBackend::new(vec![]));
        assert!(matches!(
            dl.download(&[day(1)], &NoProgress),
            Err(FetchError::Nearest(NearestError::EmptyAxis))
        ));
    }

    #[test]
    fn plan_uses_requested_times() {
        let src = source("./out/{t:%Y%m%d}.nc");
        let dl = downloader(&src, FakeBackend::new(vec![day(1)]));
        let plan = dl.plan(&[day(3)]).unwrap();
        assert_eq!(plan[0].local, PathBuf::from("./out/20200103.nc"));
        assert!(plan[0].remote.contains("var=CHL"));
    }
}
