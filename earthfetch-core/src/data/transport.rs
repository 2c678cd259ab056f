//! Blocking HTTP transport with retries and the shared circuit breaker.
//!
//! Every request goes through [`HttpTransport::send`], which retries 429, 5xx,
//! connect and timeout failures with exponential backoff. The
//! [`CircuitBreaker`] sees one outcome per request: a success, or a single
//! failure once the retries are used up. Downloads stream into a uniquely
//! named `.part` file next to the destination and are renamed into place once
//! complete.

use super::circuit_breaker::CircuitBreaker;
use super::provider::FetchError;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Client-wide transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub user_agent: String,
    /// Honour `HTTP_PROXY`/`HTTPS_PROXY` from the environment.
    pub use_system_proxy: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            user_agent: concat!("earthfetch/", env!("CARGO_PKG_VERSION")).to_string(),
            use_system_proxy: true,
        }
    }
}

/// Per-protocol options from `storage_options.http` / `storage_options.https`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpOptions {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub struct HttpTransport {
    client: Client,
    breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    base_delay: Duration,
    auth: Option<(String, Option<String>)>,
}

impl HttpTransport {
    pub fn new(
        config: &TransportConfig,
        options: &HttpOptions,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FetchError::InvalidRequest(format!("header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| FetchError::InvalidRequest(format!("header '{name}': {e}")))?;
            headers.insert(name, value);
        }

        let timeout = options
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(config.timeout);
        let mut builder = Client::builder()
            .timeout(timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers);
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::InvalidRequest(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            breaker,
            max_retries: config.max_retries,
            base_delay: config.base_delay,
            auth: options
                .username
                .clone()
                .map(|user| (user, options.password.clone())),
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Send a request with retry and circuit breaker logic.
    ///
    /// Returns the response for success statuses and for 404; every other
    /// status becomes an error.
    pub fn send(&self, method: Method, url: &str) -> Result<Response, FetchError> {
        if !self.breaker.is_allowed() {
            return Err(FetchError::CircuitBreakerTripped);
        }

        let mut last_error = None;
        let mut retry_after = Duration::ZERO;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.base_delay * 2u32.pow(attempt - 1);
                std::thread::sleep(backoff.max(retry_after));
                tracing::debug!(attempt, url, "retrying request");
            }

            if !self.breaker.is_allowed() {
                return Err(FetchError::CircuitBreakerTripped);
            }

            let mut request = self.client.request(method.clone(), url);
            if let Some((user, password)) = &self.auth {
                request = request.basic_auth(user, password.as_ref());
            }

            match request.send() {
                Ok(resp) => {
                    let status = resp.status();
                    tracing::trace!(%status, url, "response");

                    if status.is_success() || status == StatusCode::NOT_FOUND {
                        self.breaker.record_success();
                        return Ok(resp);
                    }

                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(FetchError::AuthenticationRequired {
                            url: url.to_string(),
                            status: status.as_u16(),
                        });
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let secs = resp
                            .headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(0);
                        // never wait longer than a minute between attempts
                        retry_after = Duration::from_secs(secs.min(60));
                        last_error = Some(FetchError::RateLimited {
                            retry_after_secs: secs,
                        });
                        continue;
                    }

                    if status.is_server_error() {
                        last_error = Some(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(e) => {
                    if e.is_connect() || e.is_timeout() {
                        last_error = Some(FetchError::NetworkUnreachable(e.to_string()));
                        continue;
                    }
                    return Err(FetchError::NetworkUnreachable(e.to_string()));
                }
            }
        }

        self.breaker.record_failure();
        tracing::debug!(url, retries = self.max_retries, "giving up");
        Err(last_error.unwrap_or_else(|| FetchError::NetworkUnreachable(format!(
            "max retries exceeded for {url}"
        ))))
    }

    /// GET that fails with [`FetchError::NotFound`] on 404.
    pub fn get(&self, url: &str) -> Result<Response, FetchError> {
        let resp = self.send(Method::GET, url)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                url: url.to_string(),
            });
        }
        Ok(resp)
    }

    pub fn get_text(&self, url: &str) -> Result<String, FetchError> {
        self.get(url)?
            .text()
            .map_err(|e| FetchError::ResponseFormat {
                url: url.to_string(),
                message: e.to_string(),
            })
    }

    /// Whether `url` resolves. Falls back to GET for servers refusing HEAD.
    pub fn exists(&self, url: &str) -> Result<bool, FetchError> {
        match self.send(Method::HEAD, url) {
            Ok(resp) => Ok(resp.status() != StatusCode::NOT_FOUND),
            Err(FetchError::HttpStatus { status, .. })
                if status == StatusCode::METHOD_NOT_ALLOWED.as_u16()
                    || status == StatusCode::NOT_IMPLEMENTED.as_u16() =>
            {
                Ok(self.send(Method::GET, url)?.status() != StatusCode::NOT_FOUND)
            }
            Err(e) => Err(e),
        }
    }

    /// Stream `url` into `dest` atomically. Returns the number of bytes written.
    pub fn download_to(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let mut resp = self.get(url)?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| FetchError::io(parent, e))?;
        }
        let tmp = in_flight_path(dest);
        let mut file = fs::File::create(&tmp).map_err(|e| FetchError::io(&tmp, e))?;

        let written = match resp.copy_to(&mut file) {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&tmp);
                return Err(FetchError::NetworkUnreachable(format!(
                    "transfer of {url} interrupted: {e}"
                )));
            }
        };
        drop(file);

        fs::rename(&tmp, dest).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            FetchError::io(dest, e)
        })?;
        tracing::trace!(url, dest = %dest.display(), bytes = written, "stored");
        Ok(written)
    }
}

/// `<dest>.part`, the in-flight name of a download.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

static IN_FLIGHT: AtomicU64 = AtomicU64::new(0);

/// `<dest>.<pid>-<n>.part`, never shared by two transfers of this process.
pub fn in_flight_path(dest: &Path) -> PathBuf {
    let n = IN_FLIGHT.fetch_add(1, Ordering::Relaxed);
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}-{n}.part", std::process::id()));
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/tmp/a/sst_20200101.nc")),
            PathBuf::from("/tmp/a/sst_20200101.nc.part")
        );
    }

    #[test]
    fn in_flight_paths_are_distinct() {
        let dest = Path::new("/tmp/a/data.nc");
        let a = in_flight_path(dest);
        let b = in_flight_path(dest);
        assert_ne!(a, b);
        assert_eq!(a.parent(), dest.parent());
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("data.nc."));
        assert!(name.ends_with(".part"));
    }

    #[test]
    fn rejects_bad_header_names() {
        let mut options = HttpOptions::default();
        options.headers.insert("bad header".into(), "x".into());
        let err = HttpTransport::new(
            &TransportConfig::default(),
            &options,
            Arc::new(CircuitBreaker::default()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }

    #[test]
    fn tripped_breaker_refuses_without_network() {
        let breaker = Arc::new(CircuitBreaker::default());
        breaker.trip();
        let transport =
            HttpTransport::new(&TransportConfig::default(), &HttpOptions::default(), breaker)
                .unwrap();
        assert!(matches!(
            transport.send(Method::GET, "http://127.0.0.1:9/never"),
            Err(FetchError::CircuitBreakerTripped)
        ));
    }
}
