//! HTTP client wrapper shared by all source adapters.
//!
//! Two reqwest clients share one configuration apart from their timeouts:
//! short-lived metadata and resolution requests fail fast, while piece
//! streams get a generous connect timeout and a per-chunk idle timeout
//! instead of a total one.

use futures_util::StreamExt;
use reqwest::{Client, ClientBuilder, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument};

use super::constants::{
    METADATA_CONNECT_TIMEOUT, METADATA_TOTAL_TIMEOUT, STREAM_CONNECT_TIMEOUT, STREAM_READ_TIMEOUT,
};
use super::error::FetchError;
use crate::source::PieceStream;

/// User-Agent sent with every request.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("mirrordl/{version}")
}

/// HTTP client for metadata requests and piece streams.
///
/// Create once and clone freely; clones share connection pools.
#[derive(Debug, Clone)]
pub struct HttpClient {
    metadata: Client,
    streaming: Client,
}

impl HttpClient {
    /// Creates a client with the default timeouts.
    ///
    /// - Metadata: connect 10 s, total 30 s
    /// - Streams: connect 30 s, read idle 60 s
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend cannot be
    /// initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        let metadata = base_client_builder()
            .connect_timeout(METADATA_CONNECT_TIMEOUT)
            .timeout(METADATA_TOTAL_TIMEOUT)
            .build()?;
        let streaming = base_client_builder()
            .connect_timeout(STREAM_CONNECT_TIMEOUT)
            .read_timeout(STREAM_READ_TIMEOUT)
            .build()?;
        Ok(Self {
            metadata,
            streaming,
        })
    }

    /// Client for resolution and API requests.
    #[must_use]
    pub fn metadata(&self) -> &Client {
        &self.metadata
    }

    /// Client for piece streams.
    #[must_use]
    pub fn streaming(&self) -> &Client {
        &self.streaming
    }

    /// GETs `url` with the metadata client and returns the body text.
    ///
    /// # Errors
    ///
    /// Transport failures and non-success statuses, classified.
    #[instrument(skip(self))]
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let response = send_checked(self.metadata.get(url), url).await?;
        response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))
    }

    /// Sends `request` on the streaming client and opens the body.
    ///
    /// Anything but `200 OK` is rejected: 408, 429 and 5xx as transient,
    /// everything else as source exhausted.
    ///
    /// # Errors
    ///
    /// Transport failures and non-200 statuses, classified.
    pub async fn open_stream(
        &self,
        request: RequestBuilder,
        url: &str,
    ) -> Result<PieceStream, FetchError> {
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;

        let status = response.status();
        if status != StatusCode::OK {
            debug!(url, status = status.as_u16(), "stream rejected");
            return Err(FetchError::from_status(url, status.as_u16()));
        }

        let total_size = response.content_length();
        let owned_url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| FetchError::from_reqwest(&owned_url, &e)))
            .boxed();
        Ok(PieceStream::new(total_size, body))
    }
}

/// Sends `request`, mapping transport errors and non-success statuses.
///
/// # Errors
///
/// Transport failures and non-success statuses, classified.
pub async fn send_checked(request: RequestBuilder, url: &str) -> Result<Response, FetchError> {
    let response = request
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(url, &e))?;

    if !response.status().is_success() {
        return Err(FetchError::from_status(url, response.status().as_u16()));
    }
    Ok(response)
}

fn base_client_builder() -> ClientBuilder {
    Client::builder().gzip(true).user_agent(default_user_agent())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::{FailureType, classify_error};

    #[test]
    fn test_user_agent_carries_version() {
        let ua = default_user_agent();
        assert!(ua.starts_with("mirrordl/"));
        assert!(ua.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_http_client_builds() {
        let client = HttpClient::new().unwrap();
        let cloned = client.clone();
        drop(cloned);
    }

    #[tokio::test]
    async fn test_invalid_url_is_not_retried() {
        let client = HttpClient::new().unwrap();
        let result = client.get_text("not-a-valid-url").await;
        let error = result.unwrap_err();
        assert_ne!(classify_error(&error), FailureType::Transient, "{error}");
    }
}
