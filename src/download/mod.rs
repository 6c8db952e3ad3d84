//! Acquisition engine: retry, piece scheduling, source fallback and
//! reassembly.
//!
//! # Features
//!
//! - Fixed-delay retry of transient failures with a caller-chosen predicate
//! - Concurrent piece transfers capped by a process-wide [`ConcurrencyBudget`]
//! - Source fallback in random order, each source tried once per file
//! - Streaming reassembly with fingerprint verification and quarantine
//!
//! # Example
//!
//! ```no_run
//! use mirrordl_core::download::HttpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new()?;
//! let page = client.get_text("https://example.com/").await?;
//! println!("{} bytes", page.len());
//! # Ok(())
//! # }
//! ```

mod budget;
pub(crate) mod client;
pub mod constants;
mod engine;
mod error;
mod layout;
mod progress;
mod reassembly;
mod retry;
mod scheduler;

pub use budget::ConcurrencyBudget;
pub use client::{HttpClient, default_user_agent};
pub use engine::{AcquireOutcome, DownloadEngine, DownloadStats, SourceOrder, UnfulfillableReason};
pub use error::{FailureType, FetchError, classify_error, classify_http_status};
pub use layout::{Layout, quarantine_path};
pub use progress::ProgressTimer;
pub use reassembly::{Fingerprinter, ReassemblyError, fingerprints_match, quarantine, reassemble};
pub use retry::{Classify, RetryDecision, RetryError, RetryPolicy, retry};
pub use scheduler::{PieceScheduler, SourceAbandoned};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, FetchError>` explicitly in function signatures.
