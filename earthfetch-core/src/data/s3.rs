//! S3 buckets through `object_store`.
//!
//! Paths are `s3://bucket/key`. Public buckets are read without signing
//! requests; set `anon: false` to sign with the usual `AWS_*` environment
//! variables. `object_store` is async, so each [`S3Fs`] owns a small tokio
//! runtime and blocks on it.

use super::circuit_breaker::CircuitBreaker;
use super::provider::FetchError;
use super::remote::{glob_to_regex, split_glob, RemoteFs};
use super::transport::{in_flight_path, TransportConfig};
use futures::StreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Runtime;

const DEFAULT_REGION: &str = "us-east-1";

/// Options from `storage_options.s3`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S3Options {
    /// Path-style endpoint, e.g. `https://s3.eu-central-1.amazonaws.com`.
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    /// Unsigned requests; public buckets only.
    pub anon: bool,
}

impl Default for S3Options {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            region: None,
            anon: true,
        }
    }
}

pub struct S3Fs {
    options: S3Options,
    timeout: Duration,
    max_retries: usize,
    breaker: Arc<CircuitBreaker>,
    stores: Mutex<HashMap<String, Arc<AmazonS3>>>,
    runtime: Runtime,
}

impl S3Fs {
    pub fn new(
        options: &S3Options,
        config: &TransportConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, FetchError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("earthfetch-s3")
            .enable_all()
            .build()
            .map_err(|e| FetchError::Backend {
                backend: "s3",
                message: format!("failed to start runtime: {e}"),
            })?;
        Ok(Self {
            options: options.clone(),
            timeout: config.timeout,
            max_retries: config.max_retries as usize,
            breaker,
            stores: Mutex::new(HashMap::new()),
            runtime,
        })
    }

    /// Bucket and key of an `s3://bucket/key` path.
    pub fn split(path: &str) -> Result<(&str, &str), FetchError> {
        path.strip_prefix("s3://")
            .and_then(|rest| rest.split_once('/'))
            .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
            .ok_or_else(|| {
                FetchError::InvalidRequest(format!("'{path}' is not an s3://bucket/key path"))
            })
    }

    fn store(&self, bucket: &str) -> Result<Arc<AmazonS3>, FetchError> {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(store) = stores.get(bucket) {
            return Ok(Arc::clone(store));
        }

        let mut builder = if self.options.anon {
            AmazonS3Builder::new().with_skip_signature(true)
        } else {
            AmazonS3Builder::from_env()
        };
        builder = builder
            .with_bucket_name(bucket)
            .with_region(self.options.region.as_deref().unwrap_or(DEFAULT_REGION))
            .with_client_options(ClientOptions::new().with_timeout(self.timeout))
            .with_retry(RetryConfig {
                max_retries: self.max_retries,
                ..Default::default()
            });
        if let Some(endpoint) = &self.options.endpoint_url {
            builder = builder
                .with_endpoint(endpoint.trim_end_matches('/'))
                .with_allow_http(true);
        }
        let store = Arc::new(builder.build().map_err(|e| FetchError::Backend {
            backend: "s3",
            message: format!("bucket '{bucket}': {e}"),
        })?);
        tracing::debug!(bucket, "opened S3 store");
        stores.insert(bucket.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Block on one store operation, keeping the circuit breaker informed.
    fn call<T, F>(
        &self,
        path: &str,
        op: impl FnOnce(Arc<AmazonS3>, ObjectPath) -> F,
    ) -> Result<T, FetchError>
    where
        F: std::future::Future<Output = Result<T, FetchError>>,
    {
        if !self.breaker.is_allowed() {
            return Err(FetchError::CircuitBreakerTripped);
        }
        let (bucket, key) = Self::split(path)?;
        let store = self.store(bucket)?;
        let result = self.runtime.block_on(op(store, ObjectPath::from(key)));
        match &result {
            Ok(_) | Err(FetchError::NotFound { .. }) => self.breaker.record_success(),
            Err(FetchError::Backend { .. }) => self.breaker.record_failure(),
            Err(_) => {}
        }
        result
    }
}

fn store_error(path: &str, e: object_store::Error) -> FetchError {
    match e {
        object_store::Error::NotFound { .. } => FetchError::NotFound {
            url: path.to_string(),
        },
        other => FetchError::Backend {
            backend: "s3",
            message: other.to_string(),
        },
    }
}

impl RemoteFs for S3Fs {
    fn protocol(&self) -> &str {
        "s3"
    }

    fn exists(&self, path: &str) -> Result<bool, FetchError> {
        let found = self.call(path, |store, key| async move {
            store.head(&key).await.map_err(|e| store_error(path, e))
        });
        match found {
            Ok(_) => Ok(true),
            Err(FetchError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn glob(&self, pattern: &str) -> Result<Vec<String>, FetchError> {
        split_glob(pattern)?;
        let (bucket, key_pattern) = Self::split(pattern)?;
        let matcher = glob_to_regex(key_pattern)?;
        let dir = key_pattern.rsplit_once('/').map(|(dir, _)| dir);

        if !self.breaker.is_allowed() {
            return Err(FetchError::CircuitBreakerTripped);
        }
        let store = self.store(bucket)?;
        let listed = self.runtime.block_on(async {
            let prefix = dir.map(ObjectPath::from);
            store.list_with_delimiter(prefix.as_ref()).await
        });
        let listing = match listed {
            Ok(listing) => {
                self.breaker.record_success();
                listing
            }
            Err(e) => {
                let e = store_error(pattern, e);
                if let FetchError::NotFound { .. } = e {
                    return Ok(Vec::new());
                }
                self.breaker.record_failure();
                return Err(e);
            }
        };

        let mut matches: Vec<String> = listing
            .objects
            .iter()
            .map(|meta| meta.location.as_ref())
            .filter(|key| matcher.is_match(key))
            .map(|key| format!("s3://{bucket}/{key}"))
            .collect();
        matches.sort();
        tracing::trace!(pattern, found = matches.len(), "listed bucket");
        Ok(matches)
    }

    fn fetch(&self, path: &str, dest: &Path) -> Result<u64, FetchError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| FetchError::io(parent, e))?;
        }
        let tmp = in_flight_path(dest);
        let written = self.call(path, |store, key| {
            let tmp = tmp.clone();
            async move {
                let mut stream = store
                    .get(&key)
                    .await
                    .map_err(|e| store_error(path, e))?
                    .into_stream();
                let mut file = fs::File::create(&tmp).map_err(|e| FetchError::io(&tmp, e))?;
                let mut written = 0u64;
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| store_error(path, e))?;
                    file.write_all(&chunk).map_err(|e| FetchError::io(&tmp, e))?;
                    written += chunk.len() as u64;
                }
                Ok::<_, FetchError>(written)
            }
        });
        let written = match written {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        fs::rename(&tmp, dest).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            FetchError::io(dest, e)
        })?;
        tracing::trace!(path, dest = %dest.display(), bytes = written, "stored");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3() -> S3Fs {
        S3Fs::new(
            &S3Options::default(),
            &TransportConfig::default(),
            Arc::new(CircuitBreaker::default()),
        )
        .unwrap()
    }

    #[test]
    fn splits_bucket_and_key() {
        assert_eq!(
            S3Fs::split("s3://noaa-goes16/ABI/f.nc").unwrap(),
            ("noaa-goes16", "ABI/f.nc")
        );
        assert!(S3Fs::split("https://b/k").is_err());
        assert!(S3Fs::split("s3://bucket-only").is_err());
        assert!(S3Fs::split("s3:///key").is_err());
    }

    #[test]
    fn options_default_to_anonymous() {
        let options: S3Options =
            serde_yaml::from_str("endpoint_url: http://127.0.0.1:9000").unwrap();
        assert!(options.anon);
        assert_eq!(options.endpoint_url.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(options.region, None);
    }

    #[test]
    fn not_found_maps_to_missing_file() {
        let err = store_error(
            "s3://b/k.nc",
            object_store::Error::NotFound {
                path: "k.nc".into(),
                source: "gone".into(),
            },
        );
        assert!(matches!(err, FetchError::NotFound { url } if url == "s3://b/k.nc"));
    }

    #[test]
    fn tripped_breaker_refuses_without_network() {
        let fs = s3();
        fs.breaker.trip();
        assert!(matches!(
            fs.exists("s3://b/k.nc"),
            Err(FetchError::CircuitBreakerTripped)
        ));
        assert!(matches!(
            fs.glob("s3://b/d/*.nc"),
            Err(FetchError::CircuitBreakerTripped)
        ));
    }

    #[test]
    fn wildcards_outside_the_file_name_are_rejected() {
        assert!(matches!(
            s3().glob("s3://b/*/f.nc"),
            Err(FetchError::InvalidRequest(_))
        ));
    }
}
