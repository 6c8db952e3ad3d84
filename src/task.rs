//! Unit-of-work abstraction.
//!
//! A [`Task`] runs exactly once: [`Task::execute`] consumes the value. When
//! spawned with [`spawn_task`] its result, a panic, or its cancellation is
//! written once to a [`Completion`] that any number of waiters can observe.
//! Nothing a task does can crash the process or vanish silently.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// What a finished task hands back to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome<F> {
    /// No further work.
    Done,
    /// One follow-up.
    FollowUp(F),
    /// Several follow-ups, in order.
    FollowUps(Vec<F>),
}

impl<F> TaskOutcome<F> {
    /// Flattens the outcome into a list of follow-ups.
    pub fn into_vec(self) -> Vec<F> {
        match self {
            Self::Done => Vec::new(),
            Self::FollowUp(item) => vec![item],
            Self::FollowUps(items) => items,
        }
    }
}

/// Why a task did not produce an outcome.
#[derive(Debug, Error)]
pub enum TaskFailure<E> {
    /// `execute` returned an error.
    #[error("{0}")]
    Failed(E),
    /// `execute` panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The task was aborted or dropped before finishing.
    #[error("task cancelled")]
    Cancelled,
}

/// A unit of work that runs at most once.
pub trait Task: Send + 'static {
    /// Value handed back on success.
    type FollowUp: Send + Sync + 'static;
    /// Error returned by a failed execution.
    type Error: fmt::Display + Send + Sync + 'static;

    /// Short name used in logs.
    fn label(&self) -> String;

    /// Performs the work.
    fn execute(
        self,
    ) -> impl Future<Output = Result<TaskOutcome<Self::FollowUp>, Self::Error>> + Send;
}

/// Shared, immutable resolution of a task.
pub type Resolution<F, E> = Arc<Result<TaskOutcome<F>, TaskFailure<E>>>;

/// Single-assignment completion signal. Cheap to clone; every clone observes
/// the same resolution.
pub struct Completion<F, E> {
    rx: watch::Receiver<Option<Resolution<F, E>>>,
}

impl<F, E> Clone for Completion<F, E> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<F, E> fmt::Debug for Completion<F, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("resolved", &self.rx.borrow().is_some())
            .finish()
    }
}

impl<F, E> Completion<F, E> {
    /// Waits until the task is resolved.
    pub async fn wait(&self) -> Resolution<F, E> {
        let mut rx = self.rx.clone();
        let resolved = rx.wait_for(Option::is_some).await.ok().and_then(|r| r.clone());
        // The sender is only dropped after writing, so `None` cannot be observed
        // in practice; treat it as cancellation.
        resolved.unwrap_or_else(|| Arc::new(Err(TaskFailure::Cancelled)))
    }

    /// Returns the resolution if the task has finished.
    #[must_use]
    pub fn try_get(&self) -> Option<Resolution<F, E>> {
        self.rx.borrow().clone()
    }
}

/// Writes the resolution exactly once. Dropping an unresolved resolver
/// records [`TaskFailure::Cancelled`].
struct Resolver<F, E> {
    label: String,
    tx: Option<watch::Sender<Option<Resolution<F, E>>>>,
}

impl<F, E> Resolver<F, E> {
    fn resolve(mut self, result: Result<TaskOutcome<F>, TaskFailure<E>>) {
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(Arc::new(result)));
        }
    }
}

impl<F, E> Drop for Resolver<F, E> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            debug!(task = %self.label, "task cancelled");
            tx.send_replace(Some(Arc::new(Err(TaskFailure::Cancelled))));
        }
    }
}

/// Handle to a spawned task.
pub struct TaskHandle<F, E> {
    label: String,
    completion: Completion<F, E>,
    abort: AbortHandle,
}

impl<F, E> fmt::Debug for TaskHandle<F, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("label", &self.label)
            .field("completion", &self.completion)
            .finish_non_exhaustive()
    }
}

impl<F, E> TaskHandle<F, E> {
    /// Returns the task label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns a waiter for the task's resolution.
    #[must_use]
    pub fn completion(&self) -> Completion<F, E> {
        self.completion.clone()
    }

    /// Cancels the task. A no-op once it has finished.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Waits for the task's resolution.
    pub async fn wait(&self) -> Resolution<F, E> {
        self.completion.wait().await
    }
}

/// Runs `task` on the tokio runtime and returns its handle.
///
/// Must be called from within a runtime.
pub fn spawn_task<T: Task>(task: T) -> TaskHandle<T::FollowUp, T::Error> {
    let label = task.label();
    let (tx, rx) = watch::channel(None);
    let resolver = Resolver {
        label: label.clone(),
        tx: Some(tx),
    };

    let join = tokio::spawn(async move {
        // Bound first so it drops last: on abort the task's resources are
        // released before `Cancelled` becomes visible.
        let resolver = resolver;
        let result = match AssertUnwindSafe(task.execute()).catch_unwind().await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(error)) => {
                debug!(task = %resolver.label, %error, "task failed");
                Err(TaskFailure::Failed(error))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(task = %resolver.label, %message, "task panicked");
                Err(TaskFailure::Panicked(message))
            }
        };
        resolver.resolve(result);
    });

    TaskHandle {
        label,
        completion: Completion { rx },
        abort: join.abort_handle(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    enum Behavior {
        Succeed(Vec<u32>),
        Fail,
        Panic,
        Hang,
    }

    struct Scripted(Behavior);

    impl Task for Scripted {
        type FollowUp = u32;
        type Error = Boom;

        fn label(&self) -> String {
            "scripted".to_string()
        }

        async fn execute(self) -> Result<TaskOutcome<u32>, Boom> {
            match self.0 {
                Behavior::Succeed(items) if items.is_empty() => Ok(TaskOutcome::Done),
                Behavior::Succeed(items) if items.len() == 1 => {
                    Ok(TaskOutcome::FollowUp(items[0]))
                }
                Behavior::Succeed(items) => Ok(TaskOutcome::FollowUps(items)),
                Behavior::Fail => Err(Boom),
                Behavior::Panic => panic!("scripted panic"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(TaskOutcome::Done)
                }
            }
        }
    }

    #[test]
    fn test_outcome_into_vec() {
        assert!(TaskOutcome::<u32>::Done.into_vec().is_empty());
        assert_eq!(TaskOutcome::FollowUp(7).into_vec(), vec![7]);
        assert_eq!(TaskOutcome::FollowUps(vec![1, 2]).into_vec(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_success_is_observed_by_every_waiter() {
        let handle = spawn_task(Scripted(Behavior::Succeed(vec![1, 2, 3])));
        let first = handle.completion();
        let second = handle.completion();

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert!(Arc::ptr_eq(&a, &b));
        match a.as_ref() {
            Ok(TaskOutcome::FollowUps(items)) => assert_eq!(items, &vec![1, 2, 3]),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_is_recorded_on_completion() {
        let handle = spawn_task(Scripted(Behavior::Fail));
        let resolution = handle.wait().await;
        assert!(matches!(resolution.as_ref(), Err(TaskFailure::Failed(Boom))));
    }

    #[tokio::test]
    async fn test_panic_is_recorded_not_propagated() {
        let handle = spawn_task(Scripted(Behavior::Panic));
        let resolution = handle.wait().await;
        match resolution.as_ref() {
            Err(TaskFailure::Panicked(message)) => assert!(message.contains("scripted panic")),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_resolves_cancelled() {
        let handle = spawn_task(Scripted(Behavior::Hang));
        tokio::task::yield_now().await;
        assert!(handle.completion().try_get().is_none());

        handle.abort();
        let resolution = handle.wait().await;
        assert!(matches!(resolution.as_ref(), Err(TaskFailure::Cancelled)));
    }

    #[tokio::test]
    async fn test_resolution_is_stable_after_finish() {
        let handle = spawn_task(Scripted(Behavior::Succeed(vec![9])));
        let first = handle.wait().await;
        handle.abort();
        let again = handle.completion().try_get().unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(matches!(first.as_ref(), Ok(TaskOutcome::FollowUp(9))));
    }
}
