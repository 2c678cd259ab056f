//! Remote file systems behind the file-cache downloader.
//!
//! Paths keep their protocol (`https://...`, `s3://bucket/key`). Globs only
//! accept wildcards in the final path segment: listing is one directory page
//! (HTTP) or one delimited prefix listing (S3, see [`super::s3`]).

use super::provider::FetchError;
use super::transport::HttpTransport;
use regex::Regex;
use std::path::Path;
use url::Url;

/// A remote store holding whole files.
pub trait RemoteFs: Send + Sync {
    fn protocol(&self) -> &str;

    fn exists(&self, path: &str) -> Result<bool, FetchError>;

    /// Paths matching a `*`/`?` pattern, sorted.
    fn glob(&self, pattern: &str) -> Result<Vec<String>, FetchError>;

    /// Copy `path` to `dest`; returns the number of bytes written.
    fn fetch(&self, path: &str, dest: &Path) -> Result<u64, FetchError>;
}

/// Compile a shell-style glob (`*`, `?`) into an anchored regex. Wildcards
/// never cross `/`.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, FetchError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| FetchError::InvalidRequest(format!("glob '{pattern}': {e}")))
}

pub fn has_wildcard(path: &str) -> bool {
    path.contains('*') || path.contains('?')
}

/// Final path segment without any query string.
pub fn basename(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    path.rsplit('/').next().unwrap_or(path)
}

/// Split `pattern` into the directory to list and the file pattern.
pub(crate) fn split_glob(pattern: &str) -> Result<(&str, &str), FetchError> {
    let (dir, file) = pattern
        .rsplit_once('/')
        .ok_or_else(|| FetchError::InvalidRequest(format!("glob '{pattern}' has no directory")))?;
    if has_wildcard(dir) {
        return Err(FetchError::InvalidRequest(format!(
            "wildcards are only supported in the file name: '{pattern}'"
        )));
    }
    Ok((dir, file))
}

/// HTTP(S) file system; directory listings come from `href` links.
pub struct HttpFs {
    protocol: String,
    transport: HttpTransport,
    href: Regex,
}

impl HttpFs {
    pub fn new(protocol: &str, transport: HttpTransport) -> Self {
        Self {
            protocol: protocol.to_string(),
            transport,
            // static pattern
            href: Regex::new(r#"(?i)href\s*=\s*["']([^"'#]+)["']"#).expect("valid href regex"),
        }
    }

    /// Absolute URLs of every link on a directory page.
    pub fn list_links(&self, dir_url: &str) -> Result<Vec<String>, FetchError> {
        let dir_url = if dir_url.ends_with('/') {
            dir_url.to_string()
        } else {
            format!("{dir_url}/")
        };
        let base = Url::parse(&dir_url)
            .map_err(|e| FetchError::InvalidRequest(format!("bad URL '{dir_url}': {e}")))?;
        let page = self.transport.get_text(&dir_url)?;

        let mut links: Vec<String> = self
            .href
            .captures_iter(&page)
            .filter_map(|c| base.join(&c[1]).ok())
            .map(|u| u.to_string())
            .collect();
        links.sort();
        links.dedup();
        Ok(links)
    }
}

impl RemoteFs for HttpFs {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn exists(&self, path: &str) -> Result<bool, FetchError> {
        self.transport.exists(path)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<String>, FetchError> {
        let (dir, _) = split_glob(pattern)?;
        let matcher = glob_to_regex(pattern)?;
        let links = match self.list_links(dir) {
            Ok(links) => links,
            Err(FetchError::NotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(links.into_iter().filter(|l| matcher.is_match(l)).collect())
    }

    fn fetch(&self, path: &str, dest: &Path) -> Result<u64, FetchError> {
        self.transport.download_to(path, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_single_segment() {
        let re = glob_to_regex("https://x.org/d/sst_2020*.nc").unwrap();
        assert!(re.is_match("https://x.org/d/sst_20200101_v2.nc"));
        assert!(!re.is_match("https://x.org/d/sst_2020/01.nc"));
        assert!(!re.is_match("https://x.org/d/sst_20200101.nc4"));
        assert!(glob_to_regex("a?.nc").unwrap().is_match("ab.nc"));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let re = glob_to_regex("f(1)+.nc").unwrap();
        assert!(re.is_match("f(1)+.nc"));
        assert!(!re.is_match("f1.nc"));
    }

    #[test]
    fn wildcards_only_in_file_name() {
        assert!(split_glob("https://x.org/*/a.nc").is_err());
        assert_eq!(
            split_glob("https://x.org/d/*.nc").unwrap(),
            ("https://x.org/d", "*.nc")
        );
    }

    #[test]
    fn basename_drops_query() {
        assert_eq!(basename("https://x.org/a/b.nc?token=1"), "b.nc");
        assert_eq!(basename("s3://bucket/k/c.nc"), "c.nc");
    }
}
