//! Local cache status: which planned files are already on disk.

use crate::fetch::RunError;
use chrono::NaiveDateTime;
use earthfetch_core::data::remote::{glob_to_regex, has_wildcard};
use earthfetch_core::data::{Downloader, PlannedFetch};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub time: NaiveDateTime,
    pub local: PathBuf,
    /// Cached file; differs from `local` when the name holds a wildcard.
    pub found: Option<PathBuf>,
}

impl CacheEntry {
    pub fn is_cached(&self) -> bool {
        self.found.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub source: String,
    pub entries: Vec<CacheEntry>,
}

impl CacheStatus {
    pub fn cached(&self) -> usize {
        self.entries.iter().filter(|e| e.is_cached()).count()
    }

    pub fn missing(&self) -> usize {
        self.entries.len() - self.cached()
    }

    pub fn is_complete(&self) -> bool {
        self.missing() == 0
    }
}

/// Check which of the files planned for `times` exist locally.
///
/// Never touches the network. Planned paths that repeat (several times
/// mapping to one file) are reported once.
pub fn cache_status(
    downloader: &dyn Downloader,
    times: &[NaiveDateTime],
) -> Result<CacheStatus, RunError> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for PlannedFetch { time, local, .. } in downloader.plan(times)? {
        if !seen.insert(local.clone()) {
            continue;
        }
        let found = find_local(&local)?;
        entries.push(CacheEntry { time, local, found });
    }
    Ok(CacheStatus {
        source: downloader.name().to_string(),
        entries,
    })
}

fn find_local(local: &Path) -> Result<Option<PathBuf>, RunError> {
    let name = local.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if !has_wildcard(name) {
        return Ok(local.is_file().then(|| local.to_path_buf()));
    }

    let Some(dir) = local.parent() else {
        return Ok(None);
    };
    let pattern = glob_to_regex(name)?;
    let listing = match fs::read_dir(dir) {
        Ok(listing) => listing,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(RunError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };
    let mut matches: Vec<PathBuf> = listing
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| pattern.is_match(n))
        })
        .collect();
    matches.sort();
    Ok(matches.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use earthfetch_core::data::{DownloadOptions, SourceKind};
    use earthfetch_core::source::SourceCatalog;
    use earthfetch_core::make_downloader;

    fn day(d: u32) -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2020, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn status_for(url: &str, cache: &Path, times: &[NaiveDateTime]) -> CacheStatus {
        let yaml = format!(
            "sst:\n  url: 'filecache::{url}'\n  storage_options:\n    cache_storage: '{}/{{t:%Y}}'\n  time: {{freq: 1D}}\n",
            cache.display()
        );
        let catalog = SourceCatalog::from_yaml_str(&yaml).unwrap();
        let dl = make_downloader(catalog.get("sst").unwrap(), &DownloadOptions::default()).unwrap();
        assert!(matches!(dl.kind(), SourceKind::FileCache { .. }));
        cache_status(dl.as_ref(), times).unwrap()
    }

    #[test]
    fn reports_present_and_absent_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("2020")).unwrap();
        fs::write(dir.path().join("2020/sst_20200102.nc"), b"x").unwrap();

        let status = status_for(
            "https://example.org/sst_{t:%Y%m%d}.nc",
            dir.path(),
            &[day(1), day(2), day(3)],
        );
        assert_eq!(status.source, "sst");
        assert_eq!(status.cached(), 1);
        assert_eq!(status.missing(), 2);
        assert!(status.entries[1].is_cached());
        assert!(!status.is_complete());
    }

    #[test]
    fn wildcard_names_match_local_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("2020")).unwrap();
        let file = dir.path().join("2020/sst_20200101_v2.nc");
        fs::write(&file, b"x").unwrap();

        let status = status_for(
            "https://example.org/sst_{t:%Y%m%d}_*.nc",
            dir.path(),
            &[day(1), day(2)],
        );
        assert_eq!(status.entries[0].found.as_deref(), Some(file.as_path()));
        assert_eq!(status.entries[1].found, None);
    }

    #[test]
    fn repeated_paths_are_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let status = status_for(
            "https://example.org/sst_{t:%Y}.nc",
            dir.path(),
            &[day(1), day(2), day(3)],
        );
        assert_eq!(status.entries.len(), 1);
        assert_eq!(status.entries[0].time, day(1));
    }
}
