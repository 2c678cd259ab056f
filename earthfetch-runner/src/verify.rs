//! Integrity check of a cache tree against its checksum manifests.
//!
//! Every directory below the root that holds a manifest is checked: each
//! recorded file is re-hashed and compared with its entry. Files that no
//! longer match are moved aside to `<file>.quarantined` so the next fetch
//! downloads them again; entries for files that disappeared are dropped.

use crate::fetch::RunError;
use earthfetch_core::data::manifest::hash_file;
use earthfetch_core::data::{CacheManifest, MANIFEST_FILE};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const QUARANTINE_SUFFIX: &str = "quarantined";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub manifests: usize,
    pub checked: usize,
    pub intact: usize,
    /// Quarantined copies of files whose contents changed.
    pub corrupt: Vec<PathBuf>,
    /// Recorded files no longer on disk.
    pub missing: Vec<PathBuf>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.missing.is_empty()
    }
}

/// Verify every manifest under `root`.
pub fn verify_cache(root: &Path) -> Result<VerifyReport, RunError> {
    let mut dirs = Vec::new();
    collect_manifest_dirs(root, &mut dirs)?;
    dirs.sort();

    let mut report = VerifyReport::default();
    for dir in dirs {
        verify_dir(&dir, &mut report)?;
    }
    tracing::info!(
        root = %root.display(),
        "verified {} files in {} directories: {} corrupt, {} missing",
        report.checked,
        report.manifests,
        report.corrupt.len(),
        report.missing.len()
    );
    Ok(report)
}

fn collect_manifest_dirs(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RunError> {
    let io_err = |source| RunError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_dir() {
            collect_manifest_dirs(&path, out)?;
        } else if path.file_name().is_some_and(|n| n == MANIFEST_FILE) {
            out.push(dir.to_path_buf());
        }
    }
    Ok(())
}

fn verify_dir(dir: &Path, report: &mut VerifyReport) -> Result<(), RunError> {
    let mut manifest = CacheManifest::load(dir)?;
    report.manifests += 1;

    let mut stale = Vec::new();
    for (name, entry) in &manifest.files {
        let path = dir.join(name);
        report.checked += 1;
        if !path.is_file() {
            tracing::warn!(path = %path.display(), "cached file is missing");
            report.missing.push(path);
            stale.push(name.clone());
            continue;
        }

        let (bytes, digest) = hash_file(&path)?;
        if bytes == entry.bytes && digest == entry.blake3 {
            report.intact += 1;
            continue;
        }

        let quarantined = quarantine_path(&path);
        fs::rename(&path, &quarantined).map_err(|source| RunError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::warn!(
            path = %path.display(),
            expected = %entry.blake3,
            found = %digest,
            "checksum mismatch, quarantined"
        );
        report.corrupt.push(quarantined);
        stale.push(name.clone());
    }

    if !stale.is_empty() {
        for name in &stale {
            manifest.remove(name);
        }
        manifest.save(dir)?;
    }
    Ok(())
}

fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(QUARANTINE_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarantine_keeps_the_original_extension() {
        assert_eq!(
            quarantine_path(Path::new("/cache/2020/sst.nc")),
            PathBuf::from("/cache/2020/sst.nc.quarantined")
        );
    }

    #[test]
    fn empty_tree_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("2020/001")).unwrap();
        let report = verify_cache(dir.path()).unwrap();
        assert_eq!(report, VerifyReport::default());
        assert!(report.is_clean());
    }

    #[test]
    fn missing_root_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            verify_cache(&dir.path().join("absent")),
            Err(RunError::Io { .. })
        ));
    }
}
