//! Source selection, fallback and per-file acquisition.
//!
//! [`DownloadEngine::acquire`] drives one file through its lifecycle:
//!
//! 1. An existing final output short-circuits to [`AcquireOutcome::AlreadyPresent`].
//! 2. Sources without a registered adapter are dropped; the rest are tried in
//!    random order, each at most once.
//! 3. The [`PieceScheduler`] fetches every piece of the chosen source. When
//!    the source is abandoned its working files are removed before the next
//!    source starts.
//! 4. The pieces are joined and verified. A fingerprint mismatch is final for
//!    the file: the output is quarantined and no other source is tried.
//!
//! [`DownloadEngine::acquire_all`] runs many files at once. Files only share
//! the concurrency budget; one file failing or panicking never affects
//! another.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mirrordl_core::{
//!     ConcurrencyBudget, DownloadEngine, EventSink, FileDescriptor, HttpClient, Layout,
//!     PieceScheduler, RetryPolicy, SourceRegistry, TracingSink,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new()?;
//! let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
//! let scheduler = PieceScheduler::new(ConcurrencyBudget::default(), RetryPolicy::default(), sink);
//! let engine = DownloadEngine::new(
//!     SourceRegistry::with_defaults(&client),
//!     Layout::new(".", "working"),
//!     scheduler,
//! );
//!
//! let file = FileDescriptor::new("paper.pdf", "d41d8cd98f00b204e9800998ecf8427e")
//!     .with_source("direct", ["https://example.com/paper.pdf"]);
//! let outcome = engine.acquire(&file).await;
//! println!("{outcome}");
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use super::layout::Layout;
use super::reassembly::{ReassemblyError, reassemble};
use super::scheduler::PieceScheduler;
use crate::descriptor::{FileDescriptor, Piece};
use crate::events::{DownloadEvent, EventSink, OutcomeKind};
use crate::source::{SourceAdapter, SourceRegistry};
use crate::task::{Task, TaskFailure, TaskOutcome, spawn_task};

/// Why a file could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnfulfillableReason {
    /// None of the descriptor's sources has a registered adapter.
    #[error("no supported source")]
    NoSupportedSource,

    /// Every supported source was tried and abandoned.
    #[error("all sources exhausted")]
    AllSourcesExhausted,

    /// Joined content did not match the published fingerprint.
    #[error("fingerprint mismatch (quarantined at {})", .quarantined.display())]
    FingerprintMismatch {
        /// Where the mismatching output was moved.
        quarantined: PathBuf,
    },

    /// Local failure: file system error, panic or cancellation.
    #[error("local error: {0}")]
    Local(String),
}

/// Terminal result of acquiring one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Fetched, joined and verified.
    Downloaded {
        /// Final output path.
        path: PathBuf,
        /// Lowercase hex fingerprint of the output.
        fingerprint: String,
    },
    /// The final output existed before the call; nothing was fetched.
    AlreadyPresent {
        /// Final output path.
        path: PathBuf,
    },
    /// No verified output could be produced.
    Unfulfillable {
        /// Cause.
        reason: UnfulfillableReason,
    },
}

impl AcquireOutcome {
    fn unfulfillable(reason: UnfulfillableReason) -> Self {
        Self::Unfulfillable { reason }
    }

    /// Outcome class for reporting.
    #[must_use]
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Downloaded { .. } => OutcomeKind::Downloaded,
            Self::AlreadyPresent { .. } => OutcomeKind::AlreadyPresent,
            Self::Unfulfillable { .. } => OutcomeKind::Unfulfillable,
        }
    }

    /// True for [`Downloaded`](Self::Downloaded) and
    /// [`AlreadyPresent`](Self::AlreadyPresent).
    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Unfulfillable { .. })
    }
}

impl fmt::Display for AcquireOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Downloaded { path, fingerprint } => {
                write!(f, "downloaded {} ({fingerprint})", path.display())
            }
            Self::AlreadyPresent { path } => write!(f, "already present: {}", path.display()),
            Self::Unfulfillable { reason } => write!(f, "unfulfillable: {reason}"),
        }
    }
}

/// Counters over every acquisition run by one engine.
///
/// Uses atomic counters so concurrent file tasks can update it without
/// locking.
#[derive(Debug, Default)]
pub struct DownloadStats {
    downloaded: AtomicUsize,
    already_present: AtomicUsize,
    unfulfillable: AtomicUsize,
    sources_abandoned: AtomicUsize,
}

impl DownloadStats {
    /// Creates a new stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Files fetched and verified.
    #[must_use]
    pub fn downloaded(&self) -> usize {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// Files whose output already existed.
    #[must_use]
    pub fn already_present(&self) -> usize {
        self.already_present.load(Ordering::SeqCst)
    }

    /// Files that could not be acquired.
    #[must_use]
    pub fn unfulfillable(&self) -> usize {
        self.unfulfillable.load(Ordering::SeqCst)
    }

    /// Source attempts given up across all files.
    #[must_use]
    pub fn sources_abandoned(&self) -> usize {
        self.sources_abandoned.load(Ordering::SeqCst)
    }

    /// Files with a terminal outcome.
    #[must_use]
    pub fn total(&self) -> usize {
        self.downloaded() + self.already_present() + self.unfulfillable()
    }

    fn record(&self, outcome: &AcquireOutcome) {
        let counter = match outcome.kind() {
            OutcomeKind::Downloaded => &self.downloaded,
            OutcomeKind::AlreadyPresent => &self.already_present,
            OutcomeKind::Unfulfillable => &self.unfulfillable,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_abandoned(&self) {
        self.sources_abandoned.fetch_add(1, Ordering::SeqCst);
    }
}

/// Order in which a file's candidate sources are tried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceOrder {
    /// Uniformly shuffled per file.
    #[default]
    Random,
    /// Source names in sorted order. Reproducible runs.
    Sorted,
}

/// Acquires files by choosing sources, scheduling pieces and reassembling.
///
/// Clones share the concurrency budget and the statistics.
#[derive(Debug, Clone)]
pub struct DownloadEngine {
    registry: Arc<SourceRegistry>,
    layout: Layout,
    scheduler: PieceScheduler,
    order: SourceOrder,
    stats: Arc<DownloadStats>,
}

impl DownloadEngine {
    /// Creates an engine. Events go to the scheduler's sink.
    #[must_use]
    pub fn new(registry: SourceRegistry, layout: Layout, scheduler: PieceScheduler) -> Self {
        debug!(
            sources = ?registry.names(),
            concurrency = scheduler.budget().capacity(),
            "creating download engine"
        );
        Self {
            registry: Arc::new(registry),
            layout,
            scheduler,
            order: SourceOrder::Random,
            stats: Arc::new(DownloadStats::new()),
        }
    }

    /// Sets the source order.
    #[must_use]
    pub fn with_source_order(mut self, order: SourceOrder) -> Self {
        self.order = order;
        self
    }

    /// Output and working roots.
    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Counters over every call so far.
    #[must_use]
    pub fn stats(&self) -> &DownloadStats {
        &self.stats
    }

    fn sink(&self) -> &dyn EventSink {
        self.scheduler.sink().as_ref()
    }

    /// Acquires one file. Never fails: every problem is reported as
    /// [`AcquireOutcome::Unfulfillable`].
    #[instrument(skip(self, descriptor), fields(file = %descriptor))]
    pub async fn acquire(&self, descriptor: &FileDescriptor) -> AcquireOutcome {
        let outcome = self.run(descriptor).await;
        self.finish(descriptor, &outcome);
        outcome
    }

    /// Acquires every file concurrently and returns the outcomes in input
    /// order.
    ///
    /// A panic while acquiring one file is reported as that file's
    /// [`UnfulfillableReason::Local`] outcome.
    #[instrument(skip_all, fields(files = descriptors.len()))]
    pub async fn acquire_all(&self, descriptors: Vec<FileDescriptor>) -> Vec<AcquireOutcome> {
        info!("acquiring {} files", descriptors.len());

        let handles: Vec<_> = descriptors
            .into_iter()
            .map(|descriptor| {
                let handle = spawn_task(FileAcquisition {
                    engine: self.clone(),
                    descriptor: descriptor.clone(),
                });
                (descriptor, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (descriptor, handle) in handles {
            let resolution = handle.wait().await;
            let outcome = match resolution.as_ref() {
                Ok(done) => done.clone().into_vec().into_iter().next().unwrap_or_else(|| {
                    AcquireOutcome::unfulfillable(UnfulfillableReason::Local(
                        "acquisition produced no outcome".to_string(),
                    ))
                }),
                Err(TaskFailure::Failed(never)) => match *never {},
                Err(failure @ (TaskFailure::Panicked(_) | TaskFailure::Cancelled)) => {
                    let outcome = AcquireOutcome::unfulfillable(UnfulfillableReason::Local(
                        failure.to_string(),
                    ));
                    self.finish(&descriptor, &outcome);
                    outcome
                }
            };
            outcomes.push(outcome);
        }

        info!(
            downloaded = self.stats.downloaded(),
            already_present = self.stats.already_present(),
            unfulfillable = self.stats.unfulfillable(),
            sources_abandoned = self.stats.sources_abandoned(),
            "acquisition finished"
        );
        outcomes
    }

    async fn run(&self, descriptor: &FileDescriptor) -> AcquireOutcome {
        let final_path = self.layout.final_path(descriptor);
        if matches!(fs::try_exists(&final_path).await, Ok(true)) {
            debug!(path = %final_path.display(), "output already present");
            return AcquireOutcome::AlreadyPresent { path: final_path };
        }

        let candidates = self.candidates(descriptor);
        if candidates.is_empty() {
            warn!(
                declared = ?descriptor.sources.keys().collect::<Vec<_>>(),
                "no supported source"
            );
            return AcquireOutcome::unfulfillable(UnfulfillableReason::NoSupportedSource);
        }

        for (adapter, urls) in candidates {
            let pieces = self.layout.pieces(descriptor, urls);
            info!(source = adapter.name(), pieces = pieces.len(), "trying source");

            let working = match self
                .scheduler
                .download_all_pieces(&pieces, Arc::clone(&adapter))
                .await
            {
                Ok(paths) => paths,
                Err(abandoned) => {
                    warn!(error = %abandoned, "source abandoned");
                    remove_working_files(&pieces).await;
                    self.stats.increment_abandoned();
                    self.sink().emit(DownloadEvent::SourceAbandoned {
                        filename: descriptor.to_string(),
                        source: adapter.name().to_string(),
                    });
                    continue;
                }
            };

            return match reassemble(&working, &final_path, &descriptor.expected_fingerprint).await
            {
                Ok(fingerprint) => AcquireOutcome::Downloaded {
                    path: final_path,
                    fingerprint,
                },
                Err(ReassemblyError::Mismatch {
                    expected,
                    actual,
                    quarantined,
                }) => {
                    self.sink().emit(DownloadEvent::ReassemblyMismatch {
                        filename: descriptor.to_string(),
                        expected,
                        actual,
                    });
                    AcquireOutcome::unfulfillable(UnfulfillableReason::FingerprintMismatch {
                        quarantined,
                    })
                }
                Err(error) => {
                    remove_working_files(&pieces).await;
                    AcquireOutcome::unfulfillable(UnfulfillableReason::Local(error.to_string()))
                }
            };
        }

        AcquireOutcome::unfulfillable(UnfulfillableReason::AllSourcesExhausted)
    }

    /// Supported sources with at least one piece, in trial order.
    fn candidates<'d>(
        &self,
        descriptor: &'d FileDescriptor,
    ) -> Vec<(Arc<dyn SourceAdapter>, &'d [String])> {
        let mut seen = HashSet::new();
        let mut candidates: Vec<_> = descriptor
            .sources
            .iter()
            .filter(|(_, urls)| !urls.is_empty())
            .filter_map(|(name, urls)| {
                let Some(adapter) = self.registry.get(name) else {
                    debug!(source = %name, "dropping unsupported source");
                    return None;
                };
                if !seen.insert(adapter.name().to_ascii_lowercase()) {
                    warn!(
                        source = %name,
                        adapter = adapter.name(),
                        "dropping duplicate source key"
                    );
                    return None;
                }
                Some((adapter, urls.as_slice()))
            })
            .collect();

        if self.order == SourceOrder::Random {
            candidates.shuffle(&mut rand::thread_rng());
        }
        candidates
    }

    fn finish(&self, descriptor: &FileDescriptor, outcome: &AcquireOutcome) {
        self.stats.record(outcome);
        match outcome {
            AcquireOutcome::Unfulfillable { reason } => {
                warn!(file = %descriptor, %reason, "file unfulfillable");
            }
            other => info!(file = %descriptor, outcome = %other, "file acquired"),
        }
        self.sink().emit(DownloadEvent::AcquisitionOutcome {
            filename: descriptor.to_string(),
            outcome: outcome.kind(),
        });
    }
}

/// Best-effort removal of a source's working files. Missing files are fine.
async fn remove_working_files(pieces: &[Piece]) {
    for piece in pieces {
        match fs::remove_file(&piece.working_path).await {
            Ok(()) => debug!(path = %piece.working_path.display(), "removed working file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %piece.working_path.display(), error = %e, "could not remove working file"),
        }
    }
}

/// One file's acquisition as a task, so a panic stays scoped to that file.
struct FileAcquisition {
    engine: DownloadEngine,
    descriptor: FileDescriptor,
}

impl Task for FileAcquisition {
    type FollowUp = AcquireOutcome;
    type Error = Infallible;

    fn label(&self) -> String {
        self.descriptor.to_string()
    }

    async fn execute(self) -> Result<TaskOutcome<AcquireOutcome>, Infallible> {
        let outcome = self.engine.acquire(&self.descriptor).await;
        Ok(TaskOutcome::FollowUp(outcome))
    }
}
