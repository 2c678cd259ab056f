//! earthfetch core: source catalogs, path templates and downloaders.
//!
//! - Source catalog read from YAML ([`source`])
//! - `str.format`-style path templates with strftime time fields ([`template`])
//! - Timestamp parsing and calendar ranges ([`timestamp`], [`cf_time`])
//! - Whole-file cache, THREDDS and Copernicus Marine downloaders ([`data`])

pub mod cf_time;
pub mod data;
pub mod source;
pub mod template;
pub mod timestamp;

pub use data::{make_downloader, DownloadOptions, Downloader, FetchError};
pub use source::{read_sources, ConfigError, DataSource, SourceCatalog};

#[cfg(test)]
mod tests {
    use super::*;

    /// Downloaders are handed across threads by the runner.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<SourceCatalog>();
        require_sync::<SourceCatalog>();
        require_send::<Box<dyn Downloader>>();
        require_sync::<Box<dyn Downloader>>();
        require_send::<FetchError>();
        require_send::<data::FileCacheDownloader>();
        require_sync::<data::DatasetDownloader>();
        require_send::<DownloadOptions>();
        require_sync::<DownloadOptions>();
    }
}
