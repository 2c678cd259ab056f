//! Downloaders, transports and the local cache manifest.

pub mod circuit_breaker;
pub mod cmems;
pub mod dataset;
pub mod factory;
pub mod filecache;
pub mod manifest;
pub mod protocol;
pub mod provider;
pub mod remote;
pub mod s3;
pub mod thredds;
pub mod transport;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use dataset::{DatasetBackend, DatasetDownloader};
pub use factory::{make_downloader, DownloadOptions};
pub use filecache::{Batch, FileCacheDownloader};
pub use manifest::{CacheManifest, ManifestEntry, MANIFEST_FILE};
pub use protocol::{classify_url, Scheme, SourceKind};
pub use provider::{
    DownloadReport, Downloader, FetchError, FetchProgress, FileOutcome, LogProgress, NoProgress,
    PlannedFetch,
};
pub use transport::{HttpOptions, HttpTransport, TransportConfig};
