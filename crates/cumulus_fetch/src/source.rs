//! Byte sources for downloads.
//!
//! The manager pulls bytes through the [`ChunkSource`] / [`ByteStream`] trait
//! pair so the HTTP client can be swapped out: tests script chunk sequences,
//! production uses [`HttpSource`] over reqwest.

use crate::error::FetchError;
use async_trait::async_trait;
use bytes::Bytes;

/// Opens byte streams for URLs.
#[async_trait(?Send)]
pub trait ChunkSource {
    /// Starts fetching `url`, returning the response byte stream.
    ///
    /// Implementations must fail here (not in the stream) when the remote
    /// side refuses the request, e.g. on a non-success HTTP status.
    async fn open(&self, url: &str) -> Result<Box<dyn ByteStream>, FetchError>;
}

/// An in-flight response body, consumed chunk by chunk.
#[async_trait(?Send)]
pub trait ByteStream {
    /// Returns the next chunk, or `None` once the body is complete.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, FetchError>;
}

/// HTTP GET source backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    /// Creates a source with a default client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Creates a source over a pre-configured client (auth headers, proxy).
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl ChunkSource for HttpSource {
    async fn open(&self, url: &str) -> Result<Box<dyn ByteStream>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                code: status.as_u16(),
            });
        }
        Ok(Box::new(HttpStream { response }))
    }
}

struct HttpStream {
    response: reqwest::Response,
}

#[async_trait(?Send)]
impl ByteStream for HttpStream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, FetchError> {
        self.response
            .chunk()
            .await
            .map_err(|e| FetchError::transport(e.to_string()))
    }
}
