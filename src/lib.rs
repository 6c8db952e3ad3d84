//! Mirror Downloader Core Library
//!
//! This library acquires logical files that are published as one or more
//! pieces on several interchangeable mirror sites. For every file it picks a
//! mirror, fetches all pieces concurrently under a process-wide concurrency
//! budget, retries transient failures, falls back to another mirror when one
//! cannot serve the file, then joins the pieces and verifies the published
//! fingerprint.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`task`] - Unit-of-work abstraction with a single-assignment completion signal
//! - [`events`] - Observability sink for retries, progress and outcomes
//! - [`descriptor`] - File descriptors and upstream metadata record parsing
//! - [`source`] - Source adapter contract, registry and reference adapters
//! - [`download`] - Retry, scheduling, fallback and reassembly engine
//! - [`config`] - Acquisition settings and config file loading

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod descriptor;
pub mod download;
pub mod events;
pub mod source;
pub mod task;

// Re-export commonly used types
pub use config::{AcquireConfig, ConfigError, DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS};
pub use descriptor::{FileDescriptor, MetadataError, MetadataRecord, Piece, parse_records};
pub use download::{
    AcquireOutcome, ConcurrencyBudget, DownloadEngine, DownloadStats, FailureType, FetchError,
    Fingerprinter, HttpClient, Layout, PieceScheduler, ReassemblyError, RetryError, RetryPolicy,
    SourceAbandoned, SourceOrder, UnfulfillableReason, classify_error, reassemble, retry,
};
pub use events::{DownloadEvent, EventSink, OutcomeKind, RecordingSink, TracingSink};
pub use source::{
    DirectSource, GoFileSource, PieceStream, Serialized, SourceAdapter, SourceRegistry,
};
pub use task::{Completion, Task, TaskFailure, TaskHandle, TaskOutcome, spawn_task};
