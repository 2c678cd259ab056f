//! Earthfetch runner: drives downloads across catalog sources and inspects
//! the local cache.
//!
//! - `fetch`: date-range resolution and sequential multi-source fetching
//! - `status`: planned files versus what is already cached
//! - `verify`: checksum verification and quarantine of cached files

pub mod fetch;
pub mod status;
pub mod verify;

pub use fetch::{
    fetch_source, fetch_sources, parse_date, resolve_times, resolve_window, FetchRequest,
    FetchSummary, RunError,
};
pub use status::{cache_status, CacheEntry, CacheStatus};
pub use verify::{verify_cache, VerifyReport};

#[cfg(test)]
mod send_sync_tests {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn runner_types_are_send_sync() {
        assert_send::<super::FetchSummary>();
        assert_send::<super::RunError>();
        assert_sync::<super::RunError>();
        assert_send::<super::CacheStatus>();
        assert_sync::<super::VerifyReport>();
    }
}
