//! HTTP remote fetching with streaming SHA256 computation.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chart_schema::Sha256Digest;
use futures::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::FetchConfig;
use crate::platform::{FetchedFile, RemoteFetcher};

/// Failures fetching a remote file.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The HTTP client could not be configured.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// The request or body transfer failed, including timeouts.
    #[error("Request to {url} failed: {source}")]
    Http {
        /// Requested URL.
        url: String,
        /// Underlying cause.
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status.
    #[error("{url} returned HTTP {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },
}

impl FetchError {
    /// True when the request gave up waiting.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Http { source, .. } if source.is_timeout())
    }
}

/// [`RemoteFetcher`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Build a fetcher from `config`.
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedFile, FetchError> {
        let http = |source| FetchError::Http {
            url: url.to_string(),
            source,
        };

        tracing::debug!(url, "fetching");
        let response = self.client.get(url).send().await.map_err(http)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut stream = response.bytes_stream();
        let mut hasher = Sha256::new();
        let mut data = BytesMut::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(http)?;
            hasher.update(&chunk);
            data.extend_from_slice(&chunk);
        }

        let sha256 = Sha256Digest::from_hasher(hasher);
        tracing::debug!(url, size = data.len(), %sha256, "fetched");

        Ok(FetchedFile {
            url: url.to_string(),
            data: Bytes::from(data),
            sha256,
        })
    }
}
