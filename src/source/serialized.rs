//! Per-source serialization for rate-limited hosts.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{PieceStream, SourceAdapter};
use crate::download::FetchError;

/// Wraps an adapter so that at most one transfer from it is in flight.
///
/// The lock is taken before resolution and travels with the returned body:
/// it is released only when that body is dropped, so the next `fetch_piece`
/// waits for the whole previous transfer.
#[derive(Debug)]
pub struct Serialized<S> {
    inner: S,
    lock: Arc<Mutex<()>>,
}

impl<S> Serialized<S> {
    /// Wraps `inner`.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the wrapped adapter.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: SourceAdapter> SourceAdapter for Serialized<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch_piece(&self, piece_url: &str) -> Result<PieceStream, FetchError> {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        debug!(source = self.inner.name(), piece_url, "holding source lock");
        let stream = self.inner.fetch_piece(piece_url).await?;
        let body = stream
            .body
            .map(move |chunk| {
                let _held = &guard;
                chunk
            })
            .boxed();
        Ok(PieceStream::new(stream.total_size, body))
    }
}
