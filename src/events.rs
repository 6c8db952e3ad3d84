//! Observability sink for acquisition diagnostics.
//!
//! The engine reports every retry, progress tick, source abandonment,
//! fingerprint mismatch and final outcome through an [`EventSink`]. Nothing
//! in the crate reads these events back; they exist for operators.
//!
//! [`TracingSink`] renders each event as one `tracing` line and is the
//! default. [`RecordingSink`] keeps events in memory for inspection.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use crate::download::FailureType;

/// Terminal outcome class of one file acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// File was fetched, joined and verified.
    Downloaded,
    /// Final output already existed; nothing was fetched.
    AlreadyPresent,
    /// No source could produce a verified file.
    Unfulfillable,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Downloaded => "downloaded",
            Self::AlreadyPresent => "already-present",
            Self::Unfulfillable => "unfulfillable",
        };
        f.write_str(label)
    }
}

/// A diagnostic event emitted by the acquisition engine.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// One attempt of a retryable operation failed.
    AttemptRetry {
        /// Operation name (usually the URL being fetched).
        name: String,
        /// 1-based index of the attempt that failed.
        attempt: u32,
        /// Configured attempt ceiling.
        max_attempts: u32,
        /// Classification of the failure.
        error_kind: FailureType,
        /// Whether another attempt will follow.
        will_retry: bool,
    },

    /// Periodic progress of one piece transfer.
    PieceProgress {
        /// Working file name of the piece.
        filename: String,
        /// Bytes written so far.
        bytes: u64,
        /// Throughput since the previous report, in bytes per second.
        throughput: f64,
        /// Percent of the declared total, `None` when the server sent no size.
        percent: Option<f64>,
        /// Set on the final report after the stream ended.
        finished: bool,
    },

    /// A source was given up for a file.
    SourceAbandoned {
        /// Final relative output path.
        filename: String,
        /// Source name that was abandoned.
        source: String,
    },

    /// Reassembled content did not match the published fingerprint.
    ReassemblyMismatch {
        /// Final relative output path.
        filename: String,
        /// Fingerprint from metadata.
        expected: String,
        /// Fingerprint of the bytes on disk.
        actual: String,
    },

    /// Terminal outcome for one file.
    AcquisitionOutcome {
        /// Final relative output path.
        filename: String,
        /// Outcome class.
        outcome: OutcomeKind,
    },
}

/// Destination for [`DownloadEvent`]s.
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Records one event. Must not block for long.
    fn emit(&self, event: DownloadEvent);
}

/// Sink that writes each event as a structured `tracing` line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: DownloadEvent) {
        match event {
            DownloadEvent::AttemptRetry {
                name,
                attempt,
                max_attempts,
                error_kind,
                will_retry,
            } => {
                if will_retry {
                    info!(operation = %name, attempt, max_attempts, ?error_kind, "attempt failed, retrying");
                } else {
                    warn!(operation = %name, attempt, max_attempts, ?error_kind, "attempt failed, giving up");
                }
            }
            DownloadEvent::PieceProgress {
                filename,
                bytes,
                throughput,
                percent,
                finished,
            } => {
                #[allow(clippy::cast_precision_loss)]
                let mb = bytes as f64 / 1_048_576.0;
                let kb_per_sec = throughput / 1024.0;
                let percent = percent.map_or_else(|| "?".to_string(), |p| format!("{p:.1}%"));
                let label = if finished { "done downloading" } else { "in progress" };
                info!(
                    %filename,
                    mb = %format!("{mb:.2}"),
                    kb_per_sec = %format!("{kb_per_sec:.2}"),
                    %percent,
                    "{label}"
                );
            }
            DownloadEvent::SourceAbandoned { filename, source } => {
                warn!(%filename, %source, "abandoning source, trying another");
            }
            DownloadEvent::ReassemblyMismatch {
                filename,
                expected,
                actual,
            } => {
                warn!(%filename, %expected, %actual, "fingerprint mismatch");
            }
            DownloadEvent::AcquisitionOutcome { filename, outcome } => match outcome {
                OutcomeKind::Unfulfillable => warn!(%filename, %outcome, "acquisition finished"),
                _ => info!(%filename, %outcome, "acquisition finished"),
            },
        }
    }
}

/// Sink that stores events in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DownloadEvent>>,
}

impl RecordingSink {
    /// Creates an empty recording sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<DownloadEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the number of recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&DownloadEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|event| predicate(event))
            .count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: DownloadEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
