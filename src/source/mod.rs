//! Source adapter contract and registry.
//!
//! A *source* is one mirror site. Its adapter turns a source-specific piece
//! URL into a byte stream, hiding whatever multi-step protocol the site needs.
//! Adapters are looked up by name in a [`SourceRegistry`] that is fixed after
//! startup; adding a site means adding an adapter, never touching the engine.

mod direct;
mod gofile;
mod serialized;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};

use crate::download::{FetchError, HttpClient};

pub use direct::DirectSource;
pub use gofile::{GoFileEndpoints, GoFileSource};
pub use serialized::Serialized;

/// Fallible stream of body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// An opened piece: declared size plus the body.
pub struct PieceStream {
    /// Size announced by the server, if any.
    pub total_size: Option<u64>,
    /// Body chunks.
    pub body: ByteStream,
}

impl PieceStream {
    /// Wraps an already-open body.
    #[must_use]
    pub fn new(total_size: Option<u64>, body: ByteStream) -> Self {
        Self { total_size, body }
    }

    /// Builds a stream over in-memory chunks. The total is their summed length.
    #[must_use]
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        let total = chunks.iter().map(|c| c.len() as u64).sum();
        Self {
            total_size: Some(total),
            body: stream::iter(chunks.into_iter().map(Ok)).boxed(),
        }
    }
}

impl fmt::Debug for PieceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PieceStream")
            .field("total_size", &self.total_size)
            .finish_non_exhaustive()
    }
}

/// Turns a source-specific piece URL into a byte stream.
///
/// Errors must be classified: [`FetchError::Transient`] is retried,
/// [`FetchError::SourceExhausted`] and [`FetchError::Protocol`] abandon the
/// source for the current file.
#[async_trait]
pub trait SourceAdapter: Send + Sync + fmt::Debug {
    /// Registry key, e.g. `"gofile"`.
    fn name(&self) -> &str;

    /// Resolves `piece_url` and opens the final byte stream.
    async fn fetch_piece(&self, piece_url: &str) -> Result<PieceStream, FetchError>;
}

/// Name to adapter mapping. Names are matched case-insensitively, so the
/// upstream key `GoFile` finds the adapter registered as `gofile`.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in `direct` and `gofile` adapters.
    #[must_use]
    pub fn with_defaults(client: &HttpClient) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DirectSource::new(client.clone())));
        registry.register(Arc::new(GoFileSource::new(client.clone())));
        registry
    }

    /// Adds `adapter` under its own name, replacing any previous entry.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters
            .insert(adapter.name().to_ascii_lowercase(), adapter);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Looks up an adapter by source name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Returns true when a source name has an adapter.
    #[must_use]
    pub fn supports(&self, name: &str) -> bool {
        self.adapters.contains_key(&name.to_ascii_lowercase())
    }

    /// Registered source names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Returns true when no adapter is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
