//! Periodic progress reports for one piece transfer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::events::{DownloadEvent, EventSink};

#[derive(Debug)]
struct ProgressState {
    filename: String,
    total: Option<u64>,
    bytes: AtomicU64,
    started: Instant,
    last: Mutex<(Instant, u64)>,
    sink: Arc<dyn EventSink>,
}

impl ProgressState {
    #[allow(clippy::cast_precision_loss)]
    fn report(&self, finished: bool) {
        let now = Instant::now();
        let bytes = self.bytes.load(Ordering::Relaxed);
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);

        let (since, base) = if finished {
            (self.started, 0)
        } else {
            *last
        };
        let elapsed = now.duration_since(since).as_secs_f64();
        let throughput = if elapsed > 0.0 {
            bytes.saturating_sub(base) as f64 / elapsed
        } else {
            0.0
        };
        let percent = self.total.map(|total| {
            if total == 0 {
                100.0
            } else {
                bytes as f64 / total as f64 * 100.0
            }
        });
        *last = (now, bytes);
        drop(last);

        self.sink.emit(DownloadEvent::PieceProgress {
            filename: self.filename.clone(),
            bytes,
            throughput,
            percent,
            finished,
        });
    }
}

/// Reports progress after an initial delay, then at a fixed interval, until
/// finished or dropped. [`finish`](Self::finish) emits a final report with the
/// average throughput of the whole transfer.
#[derive(Debug)]
pub struct ProgressTimer {
    state: Arc<ProgressState>,
    ticker: JoinHandle<()>,
}

impl ProgressTimer {
    /// Starts the timer. Must be called from within a runtime.
    pub fn start(
        filename: impl Into<String>,
        total: Option<u64>,
        sink: Arc<dyn EventSink>,
        initial_delay: Duration,
        interval: Duration,
    ) -> Self {
        let now = Instant::now();
        let state = Arc::new(ProgressState {
            filename: filename.into(),
            total,
            bytes: AtomicU64::new(0),
            started: now,
            last: Mutex::new((now, 0)),
            sink,
        });

        let ticking = Arc::clone(&state);
        let ticker = tokio::spawn(async move {
            let mut ticks = interval_at(now + initial_delay, interval.max(Duration::from_millis(1)));
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                ticking.report(false);
            }
        });

        Self { state, ticker }
    }

    /// Records `n` more bytes written.
    pub fn add(&self, n: u64) {
        self.state.bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Bytes recorded so far.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.state.bytes.load(Ordering::Relaxed)
    }

    /// Stops the timer and emits the final report.
    pub fn finish(self) {
        self.ticker.abort();
        self.state.report(true);
    }
}

impl Drop for ProgressTimer {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}
