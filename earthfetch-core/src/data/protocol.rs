//! Classification of source URLs into downloader backends.

use crate::source::{ConfigError, DataSource};
use regex::Regex;
use serde::Serialize;
use std::fmt;

/// Prefix selecting the whole-file cache downloader.
pub const FILECACHE_PREFIX: &str = "filecache::";

/// Explicit prefix selecting the THREDDS backend.
pub const THREDDS_PREFIX: &str = "thredds::";

/// Remote protocols the file cache can read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
    S3,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::S3 => "s3",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend handling a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum SourceKind {
    FileCache { scheme: Scheme },
    Thredds,
    Cmems,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::FileCache { scheme } => write!(f, "filecache ({scheme})"),
            SourceKind::Thredds => f.write_str("thredds"),
            SourceKind::Cmems => f.write_str("cmems"),
        }
    }
}

/// Decide which backend serves `source`.
///
/// * `filecache::<scheme>://...{t:...}...` is a whole-file cache over http,
///   https or s3; ftp and sftp are recognised but not supported.
/// * `thredds::<url>`, or an http(s) URL mentioning `thredds`, is an
///   OPeNDAP endpoint.
/// * A bare identifier without `/` is a Copernicus Marine dataset id.
pub fn classify_url(source: &DataSource) -> Result<SourceKind, ConfigError> {
    let url = source.url()?.trim();
    let unsupported = || ConfigError::UnsupportedUrl {
        source_name: source.name.clone(),
        url: url.to_string(),
    };

    if let Some(rest) = url.strip_prefix(FILECACHE_PREFIX) {
        let (protocol, _) = rest.split_once("://").ok_or_else(unsupported)?;
        let scheme = match protocol.to_ascii_lowercase().as_str() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            "s3" => Scheme::S3,
            "ftp" | "sftp" => {
                return Err(ConfigError::UnsupportedProtocol {
                    source_name: source.name.clone(),
                    protocol: protocol.to_string(),
                })
            }
            _ => return Err(unsupported()),
        };
        if !url.contains("{t:") {
            return Err(source.invalid(format!(
                "url must have the format {FILECACHE_PREFIX}<protocol>://<path containing {{t:...}}>"
            )));
        }
        return Ok(SourceKind::FileCache { scheme });
    }

    if url.starts_with(THREDDS_PREFIX) {
        return Ok(SourceKind::Thredds);
    }

    if is_http_url(url) {
        if url.to_ascii_lowercase().contains("thredds") {
            return Ok(SourceKind::Thredds);
        }
        return Err(unsupported());
    }

    if !url.contains('/') && !url.contains("://") && is_dataset_id(url) {
        return Ok(SourceKind::Cmems);
    }

    Err(unsupported())
}

/// The OPeNDAP URL of a THREDDS source, without the optional prefix.
pub fn strip_thredds_prefix(url: &str) -> &str {
    url.trim().strip_prefix(THREDDS_PREFIX).unwrap_or(url.trim())
}

fn is_http_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn is_dataset_id(value: &str) -> bool {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$")
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(url: &str) -> DataSource {
        DataSource {
            name: "s".into(),
            url: Some(url.into()),
            ..Default::default()
        }
    }

    #[test]
    fn filecache_schemes() {
        assert_eq!(
            classify_url(&source("filecache::https://x.org/{t:%Y}/f.nc")).unwrap(),
            SourceKind::FileCache {
                scheme: Scheme::Https
            }
        );
        assert_eq!(
            classify_url(&source("filecache::s3://bucket/{t:%Y%m%d}.nc")).unwrap(),
            SourceKind::FileCache { scheme: Scheme::S3 }
        );
    }

    #[test]
    fn ftp_is_recognised_but_unsupported() {
        assert!(matches!(
            classify_url(&source("filecache::ftp://x.org/{t:%Y}.nc")),
            Err(ConfigError::UnsupportedProtocol { protocol, .. }) if protocol == "ftp"
        ));
    }

    #[test]
    fn filecache_requires_time_placeholder() {
        for url in [
            "filecache::https://x.org/static.nc",
            "filecache::https://x.org/{type}/f.nc",
            "filecache::https://x.org/{tile}_{t}.nc",
        ] {
            assert!(
                matches!(classify_url(&source(url)), Err(ConfigError::Invalid { .. })),
                "{url}"
            );
        }
    }

    #[test]
    fn thredds_detection() {
        assert_eq!(
            classify_url(&source(
                "https://thredds.example.org/thredds/dodsC/sst/analysis.nc"
            ))
            .unwrap(),
            SourceKind::Thredds
        );
        assert_eq!(
            classify_url(&source("thredds::https://opendap.example.org/dodsC/x")).unwrap(),
            SourceKind::Thredds
        );
        assert_eq!(
            strip_thredds_prefix("thredds::https://a/dodsC/x"),
            "https://a/dodsC/x"
        );
    }

    #[test]
    fn bare_identifier_is_cmems() {
        assert_eq!(
            classify_url(&source(
                "cmems_obs-oc_glo_bgc-plankton_my_l4-multi-4km_P1D"
            ))
            .unwrap(),
            SourceKind::Cmems
        );
    }

    #[test]
    fn everything_else_is_rejected() {
        for url in ["https://example.org/data.nc", "./local/path", "a b"] {
            assert!(
                matches!(
                    classify_url(&source(url)),
                    Err(ConfigError::UnsupportedUrl { .. })
                ),
                "{url}"
            );
        }
        assert!(matches!(
            classify_url(&DataSource::default()),
            Err(ConfigError::MissingField { field: "url", .. })
        ));
    }
}
