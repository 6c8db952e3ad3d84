//! Bounded-concurrency download of every piece of one source.
//!
//! Each piece runs as its own [`DownloadAttempt`] task. A task takes one slot
//! of the shared [`ConcurrencyBudget`], then drives the adapter through
//! [`retry`], streaming the body into the piece's working file. The pieces of
//! a source form a structured group: the first piece that fails cancels all
//! of its siblings, and the group only returns once every sibling has
//! released its slot and closed its file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use super::budget::ConcurrencyBudget;
use super::constants::{PROGRESS_INITIAL_DELAY, PROGRESS_INTERVAL};
use super::error::{FailureType, FetchError};
use super::progress::ProgressTimer;
use super::retry::{Classify, RetryError, RetryPolicy, retry};
use crate::descriptor::Piece;
use crate::events::EventSink;
use crate::source::SourceAdapter;
use crate::task::{Task, TaskFailure, TaskHandle, TaskOutcome, spawn_task};

/// A source could not deliver every piece and was given up for this file.
#[derive(Debug, Clone, Error)]
#[error("source {source_name} abandoned at piece {piece} ({failure}): {reason}")]
pub struct SourceAbandoned {
    /// Source that was given up.
    pub source_name: String,
    /// Index of the piece whose failure ended the group.
    pub piece: u32,
    /// Classification of that failure.
    pub failure: FailureType,
    /// Human-readable cause.
    pub reason: String,
}

impl SourceAbandoned {
    fn from_failure(
        source_name: &str,
        piece: u32,
        failure: &TaskFailure<RetryError<FetchError>>,
    ) -> Self {
        let (kind, reason) = match failure {
            TaskFailure::Failed(error) => (error.source_error().failure_type(), error.to_string()),
            TaskFailure::Panicked(message) => {
                (FailureType::Local, format!("piece task panicked: {message}"))
            }
            TaskFailure::Cancelled => (FailureType::Local, "piece task cancelled".to_string()),
        };
        Self {
            source_name: source_name.to_string(),
            piece,
            failure: kind,
            reason,
        }
    }
}

/// One piece download: budget slot, retried fetch, streamed write.
struct DownloadAttempt {
    piece: Piece,
    adapter: Arc<dyn SourceAdapter>,
    budget: ConcurrencyBudget,
    policy: RetryPolicy,
    sink: Arc<dyn EventSink>,
    progress_initial: Duration,
    progress_interval: Duration,
}

impl DownloadAttempt {
    /// Opens the piece stream and writes it to the working path from byte 0.
    async fn attempt_once(&self) -> Result<u64, FetchError> {
        let path = &self.piece.working_path;
        let mut stream = self.adapter.fetch_piece(&self.piece.source_url).await?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::io(parent, e))?;
        }
        let file = File::create(path)
            .await
            .map_err(|e| FetchError::io(path, e))?;
        let mut writer = BufWriter::new(file);

        let filename = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        let timer = ProgressTimer::start(
            filename,
            stream.total_size,
            Arc::clone(&self.sink),
            self.progress_initial,
            self.progress_interval,
        );

        while let Some(chunk) = stream.body.next().await {
            let chunk = chunk?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| FetchError::io(path, e))?;
            timer.add(chunk.len() as u64);
        }

        writer.flush().await.map_err(|e| FetchError::io(path, e))?;
        let bytes = timer.bytes();
        timer.finish();
        Ok(bytes)
    }
}

impl Task for DownloadAttempt {
    type FollowUp = PathBuf;
    type Error = RetryError<FetchError>;

    fn label(&self) -> String {
        format!("{} piece {}", self.adapter.name(), self.piece.index)
    }

    async fn execute(self) -> Result<TaskOutcome<PathBuf>, Self::Error> {
        let _permit = self.budget.acquire().await.map_err(|e| RetryError::NotRetriable {
            attempt: 0,
            source: FetchError::io(&self.piece.working_path, std::io::Error::other(e)),
        })?;

        let bytes = retry(
            &self.piece.source_url,
            &self.policy,
            self.sink.as_ref(),
            FailureType::is_retriable,
            || self.attempt_once(),
        )
        .await?;

        debug!(
            piece = self.piece.index,
            bytes,
            path = %self.piece.working_path.display(),
            "piece written"
        );
        Ok(TaskOutcome::FollowUp(self.piece.working_path))
    }
}

/// Aborts every task of the group when dropped, so an abandoned or cancelled
/// caller never leaves transfers running.
struct AttemptGroup(Vec<TaskHandle<PathBuf, RetryError<FetchError>>>);

impl AttemptGroup {
    fn abort_all(&self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

impl Drop for AttemptGroup {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// Runs all pieces of one source concurrently under the shared budget.
#[derive(Debug, Clone)]
pub struct PieceScheduler {
    budget: ConcurrencyBudget,
    policy: RetryPolicy,
    sink: Arc<dyn EventSink>,
    progress_initial: Duration,
    progress_interval: Duration,
}

impl PieceScheduler {
    /// Creates a scheduler with the default progress timing (10 s, then every 30 s).
    #[must_use]
    pub fn new(budget: ConcurrencyBudget, policy: RetryPolicy, sink: Arc<dyn EventSink>) -> Self {
        Self {
            budget,
            policy,
            sink,
            progress_initial: PROGRESS_INITIAL_DELAY,
            progress_interval: PROGRESS_INTERVAL,
        }
    }

    /// Overrides progress report timing.
    #[must_use]
    pub fn with_progress(mut self, initial_delay: Duration, interval: Duration) -> Self {
        self.progress_initial = initial_delay;
        self.progress_interval = interval;
        self
    }

    /// The shared budget.
    #[must_use]
    pub fn budget(&self) -> &ConcurrencyBudget {
        &self.budget
    }

    /// The event sink shared with every piece.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Downloads every piece and returns the working paths in declared piece
    /// order.
    ///
    /// # Errors
    ///
    /// [`SourceAbandoned`] for the first piece that failed. By then every
    /// sibling has been cancelled and has finished; working files already
    /// written are left for the caller to remove.
    #[instrument(skip(self, pieces, adapter), fields(source = adapter.name(), pieces = pieces.len()))]
    pub async fn download_all_pieces(
        &self,
        pieces: &[Piece],
        adapter: Arc<dyn SourceAdapter>,
    ) -> Result<Vec<PathBuf>, SourceAbandoned> {
        info!(
            "downloading {} pieces from {}",
            pieces.len(),
            adapter.name()
        );

        let group = AttemptGroup(
            pieces
                .iter()
                .map(|piece| {
                    spawn_task(DownloadAttempt {
                        piece: piece.clone(),
                        adapter: Arc::clone(&adapter),
                        budget: self.budget.clone(),
                        policy: self.policy.clone(),
                        sink: Arc::clone(&self.sink),
                        progress_initial: self.progress_initial,
                        progress_interval: self.progress_interval,
                    })
                })
                .collect(),
        );

        let mut pending: FuturesUnordered<_> = group
            .0
            .iter()
            .enumerate()
            .map(|(slot, handle)| {
                let completion = handle.completion();
                async move { (slot, completion.wait().await) }
            })
            .collect();

        let mut paths: Vec<Option<PathBuf>> = vec![None; pieces.len()];
        while let Some((slot, resolution)) = pending.next().await {
            match resolution.as_ref() {
                Ok(outcome) => {
                    paths[slot] = outcome.clone().into_vec().into_iter().next();
                }
                Err(failure) => {
                    let abandoned =
                        SourceAbandoned::from_failure(adapter.name(), pieces[slot].index, failure);
                    warn!(error = %abandoned, "piece failed, cancelling siblings");
                    group.abort_all();
                    while pending.next().await.is_some() {}
                    return Err(abandoned);
                }
            }
        }

        paths
            .into_iter()
            .zip(pieces)
            .map(|(path, piece)| {
                path.ok_or_else(|| SourceAbandoned {
                    source_name: adapter.name().to_string(),
                    piece: piece.index,
                    failure: FailureType::Local,
                    reason: "piece finished without a working file".to_string(),
                })
            })
            .collect()
    }
}
