//! Checksum manifest kept next to cached files.
//!
//! Layout: `{cache_dir}/.earthfetch-manifest.json`, one per directory, keyed
//! by file name. Saves are atomic (write to `.tmp`, rename into place).

use super::provider::FetchError;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = ".earthfetch-manifest.json";

/// What is known about one cached file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub remote: String,
    pub bytes: u64,
    pub blake3: String,
    pub fetched_at: NaiveDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    #[serde(default)]
    pub files: BTreeMap<String, ManifestEntry>,
}

impl CacheManifest {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Manifest of `dir`; empty when there is none yet.
    pub fn load(dir: &Path) -> Result<Self, FetchError> {
        let path = Self::path_in(dir);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(FetchError::io(&path, e)),
        };
        serde_json::from_str(&content).map_err(|e| FetchError::ResponseFormat {
            url: path.display().to_string(),
            message: format!("corrupt manifest: {e}"),
        })
    }

    pub fn save(&self, dir: &Path) -> Result<(), FetchError> {
        fs::create_dir_all(dir).map_err(|e| FetchError::io(dir, e))?;
        let path = Self::path_in(dir);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| FetchError::InvalidRequest(format!("manifest serialization: {e}")))?;
        fs::write(&tmp, json).map_err(|e| FetchError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            FetchError::io(&path, e)
        })
    }

    /// Hash `file` and record it under its file name.
    pub fn record(&mut self, file: &Path, remote: &str) -> Result<&ManifestEntry, FetchError> {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FetchError::InvalidRequest(format!("bad file name {}", file.display())))?
            .to_string();
        let (bytes, blake3) = hash_file(file)?;
        let entry = ManifestEntry {
            remote: remote.to_string(),
            bytes,
            blake3,
            fetched_at: chrono::Local::now().naive_local(),
        };
        self.files.insert(name.clone(), entry);
        Ok(&self.files[&name])
    }

    pub fn get(&self, file_name: &str) -> Option<&ManifestEntry> {
        self.files.get(file_name)
    }

    pub fn remove(&mut self, file_name: &str) -> Option<ManifestEntry> {
        self.files.remove(file_name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Size and hex BLAKE3 digest of a file.
pub fn hash_file(path: &Path) -> Result<(u64, String), FetchError> {
    let mut file = fs::File::open(path).map_err(|e| FetchError::io(path, e))?;
    let mut hasher = blake3::Hasher::new();
    let bytes = io::copy(&mut file, &mut hasher).map_err(|e| FetchError::io(path, e))?;
    Ok((bytes, hasher.finalize().to_hex().to_string()))
}

/// Record each `(local, remote)` pair in the manifest of its directory.
pub fn record_all<'a>(
    files: impl IntoIterator<Item = (&'a Path, &'a str)>,
) -> Result<(), FetchError> {
    let mut by_dir: BTreeMap<PathBuf, Vec<(&Path, &str)>> = BTreeMap::new();
    for (local, remote) in files {
        let dir = local.parent().map(Path::to_path_buf).unwrap_or_default();
        by_dir.entry(dir).or_default().push((local, remote));
    }
    for (dir, entries) in by_dir {
        let mut manifest = CacheManifest::load(&dir)?;
        for (local, remote) in entries {
            manifest.record(local, remote)?;
        }
        manifest.save(&dir)?;
        tracing::trace!(dir = %dir.display(), files = manifest.len(), "manifest updated");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.nc");
        fs::write(&file, b"netcdf bytes").unwrap();

        let mut manifest = CacheManifest::load(dir.path()).unwrap();
        assert!(manifest.is_empty());
        let entry = manifest.record(&file, "https://x.org/a.nc").unwrap().clone();
        assert_eq!(entry.bytes, 12);
        assert_eq!(entry.blake3, blake3::hash(b"netcdf bytes").to_hex().to_string());
        manifest.save(dir.path()).unwrap();

        let reloaded = CacheManifest::load(dir.path()).unwrap();
        assert_eq!(reloaded.get("a.nc"), Some(&entry));
        assert!(!dir.path().join(".earthfetch-manifest.json.tmp").exists());
    }

    #[test]
    fn corrupt_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), "{not json").unwrap();
        assert!(CacheManifest::load(dir.path()).is_err());
    }

    #[test]
    fn record_all_groups_by_directory() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("2020/a.nc");
        let b = dir.path().join("2021/b.nc");
        for p in [&a, &b] {
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, b"x").unwrap();
        }
        record_all([(a.as_path(), "r/a.nc"), (b.as_path(), "r/b.nc")]).unwrap();
        assert_eq!(
            CacheManifest::load(&dir.path().join("2020")).unwrap().len(),
            1
        );
        assert!(CacheManifest::load(&dir.path().join("2021"))
            .unwrap()
            .get("b.nc")
            .is_some());
    }
}
