//! Builds the right [`Downloader`] for a data source.

use super::circuit_breaker::CircuitBreaker;
use super::cmems::{CmemsBackend, SystemRunner};
use super::dataset::{DatasetBackend, DatasetDownloader};
use super::filecache::FileCacheDownloader;
use super::protocol::{classify_url, Scheme, SourceKind};
use super::provider::{Downloader, FetchError};
use super::remote::{HttpFs, RemoteFs};
use super::s3::{S3Fs, S3Options};
use super::thredds::ThreddsBackend;
use super::transport::{HttpOptions, HttpTransport, TransportConfig};
use crate::source::DataSource;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Settings shared by every downloader of a run.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Parallel transfers within a file-cache batch.
    pub jobs: usize,
    pub transport: TransportConfig,
    /// Shared by all transports built from these options.
    pub breaker: Arc<CircuitBreaker>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            transport: TransportConfig::default(),
            breaker: Arc::new(CircuitBreaker::default()),
        }
    }
}

impl DownloadOptions {
    fn transport_for(&self, http: &HttpOptions) -> Result<HttpTransport, FetchError> {
        HttpTransport::new(&self.transport, http, Arc::clone(&self.breaker))
    }
}

/// Validate `source` and build its downloader.
///
/// `url` and `storage_options` are required for every backend; the URL
/// decides which one is used.
pub fn make_downloader(
    source: &DataSource,
    options: &DownloadOptions,
) -> Result<Box<dyn Downloader>, FetchError> {
    source.url()?;
    source.storage_options()?;
    source.validate()?;

    let kind = classify_url(source)?;
    tracing::debug!(source = %source.name, %kind, "selected downloader");

    match kind {
        SourceKind::FileCache { scheme } => {
            let fs: Arc<dyn RemoteFs> = match scheme {
                Scheme::Http | Scheme::Https => {
                    let http: HttpOptions = protocol_options(source, scheme.as_str())?;
                    let transport = options.transport_for(&http)?;
                    Arc::new(HttpFs::new(scheme.as_str(), transport))
                }
                Scheme::S3 => {
                    let s3: S3Options = protocol_options(source, "s3")?;
                    Arc::new(S3Fs::new(
                        &s3,
                        &options.transport,
                        Arc::clone(&options.breaker),
                    )?)
                }
            };
            let downloader =
                FileCacheDownloader::new(source, fs, options.jobs, Arc::clone(&options.breaker))?;
            Ok(Box::new(downloader))
        }
        SourceKind::Thredds => {
            let http: HttpOptions = protocol_options(source, "thredds")?;
            let backend = ThreddsBackend::from_source(source, options.transport_for(&http)?)?;
            dataset(source, kind, Box::new(backend), options)
        }
        SourceKind::Cmems => {
            let backend = CmemsBackend::from_source(source, Box::new(SystemRunner))?;
            dataset(source, kind, Box::new(backend), options)
        }
    }
}

fn dataset(
    source: &DataSource,
    kind: SourceKind,
    backend: Box<dyn DatasetBackend>,
    options: &DownloadOptions,
) -> Result<Box<dyn Downloader>, FetchError> {
    let downloader = DatasetDownloader::new(source, kind, backend, Arc::clone(&options.breaker))?;
    Ok(Box::new(downloader))
}

fn protocol_options<T>(source: &DataSource, key: &str) -> Result<T, FetchError>
where
    T: DeserializeOwned + Default,
{
    source
        .storage_options()?
        .protocol_options(key)
        .map_err(|e| source.invalid(format!("storage_options.{key}: {e}")).into())
}
