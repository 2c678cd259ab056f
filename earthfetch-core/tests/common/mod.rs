//! wiremock server shared by the integration tests.
//!
//! The downloaders are blocking, so the async wiremock API is driven from a
//! small runtime owned by the fixture. The mock server itself runs on its
//! own threads and keeps answering while the test blocks on a download.

#![allow(dead_code)]

use earthfetch_core::data::{CircuitBreaker, DownloadOptions, TransportConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use wiremock::{Mock, MockServer, Request};

pub struct Fixture {
    runtime: Runtime,
    server: MockServer,
}

impl Fixture {
    pub fn start() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let server = runtime.block_on(MockServer::start());
        Self { runtime, server }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server.uri())
    }

    pub fn mount(&self, mock: Mock) -> &Self {
        self.runtime.block_on(mock.mount(&self.server));
        self
    }

    pub fn requests(&self) -> Vec<Request> {
        self.runtime
            .block_on(self.server.received_requests())
            .unwrap_or_default()
    }

    /// Requests to exactly `path`, any method.
    pub fn hits(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.url.path() == path)
            .count()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method.as_str() == method && r.url.path() == path)
            .count()
    }
}

/// Options with fast retries and no system proxy.
pub fn options(max_retries: u32) -> DownloadOptions {
    DownloadOptions {
        jobs: 2,
        transport: TransportConfig {
            timeout: Duration::from_secs(5),
            max_retries,
            base_delay: Duration::from_millis(1),
            use_system_proxy: false,
            ..TransportConfig::default()
        },
        breaker: Arc::new(CircuitBreaker::new(Duration::from_secs(60))),
    }
}
