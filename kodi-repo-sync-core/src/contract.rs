//! # contract: the network seam of the sync pipeline
//!
//! Everything the pipeline needs from the outside world over HTTP goes through
//! the [`Fetcher`] trait, so the orchestration in [`crate::synchronise`] can be
//! exercised against a `mockall` mock while [`crate::download::HttpFetcher`]
//! is tested separately against a local HTTP server.
//!
//! ## Errors
//! Implementations report failures as [`FetchError`]. A fetch failure is
//! always scoped to one source; the pipeline never aborts on it.

use async_trait::async_trait;
use mockall::automock;
use thiserror::Error;

/// Errors raised while fetching a remote resource.
#[derive(Debug, Error)]
pub enum FetchError {
    /// DNS, connection, TLS or body transfer failure.
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The request did not complete within the configured timeout.
    #[error("timeout fetching {url}")]
    Timeout { url: String },

    /// The server answered with a non-success status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    /// The HTTP client could not be constructed from the settings.
    #[error("cannot build HTTP client: {source}")]
    Client {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Trait for retrieving remote metadata and release archives.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a text document (addons.xml, HTML directory listing).
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;

    /// Fetch a binary payload (a release zip).
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}
