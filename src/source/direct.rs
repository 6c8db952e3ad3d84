//! Plain HTTP GET of the piece URL.

use async_trait::async_trait;
use tracing::instrument;

use super::{PieceStream, SourceAdapter};
use crate::download::{FetchError, HttpClient};

/// Adapter for sources whose piece URL is already the byte stream.
#[derive(Debug, Clone)]
pub struct DirectSource {
    name: String,
    client: HttpClient,
}

impl DirectSource {
    /// Creates the adapter registered as `"direct"`.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self::named("direct", client)
    }

    /// Creates a direct adapter under another source name.
    #[must_use]
    pub fn named(name: impl Into<String>, client: HttpClient) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }
}

#[async_trait]
impl SourceAdapter for DirectSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(source = %self.name))]
    async fn fetch_piece(&self, piece_url: &str) -> Result<PieceStream, FetchError> {
        let request = self.client.streaming().get(piece_url);
        self.client.open_stream(request, piece_url).await
    }
}
