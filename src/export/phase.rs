//! Producer/pool/reporter machinery shared by every export phase.
//!
//! Each phase owns a contiguous progress window, a bounded task channel,
//! a fixed worker pool draining it, and one reporter ticking once per
//! second. The `handled`/`total` counters are atomics: workers (or the
//! producer, for the voice phase) write, the reporter reads.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::progress::{ProgressEvent, ProgressSender};

/// Contiguous progress percentage range assigned to one phase.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PhaseWindow {
    pub low: u8,
    pub high: u8,
}

/// Shared per-phase progress state.
pub(crate) struct PhaseState {
    label: &'static str,
    window: PhaseWindow,
    handled: AtomicU64,
    total: AtomicU64,
    progress: ProgressSender,
}

impl PhaseState {
    pub(crate) fn new(label: &'static str, window: PhaseWindow, progress: ProgressSender) -> Arc<Self> {
        Arc::new(Self {
            label,
            window,
            handled: AtomicU64::new(0),
            total: AtomicU64::new(0),
            progress,
        })
    }

    pub(crate) fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub(crate) fn task_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    /// Maps the handled/total ratio into the phase window, truncating.
    ///
    /// An empty phase reports its low bound until the boundary message
    /// closes it out.
    pub(crate) fn percent(&self) -> u8 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return self.window.low;
        }
        let handled = self.handled.load(Ordering::Relaxed).min(total);
        let span = u64::from(self.window.high - self.window.low);
        self.window.low + (handled * span / total) as u8
    }

    /// Phase-entry boundary message at the window's low edge.
    pub(crate) fn announce_start(&self) {
        let _ = self
            .progress
            .send(ProgressEvent::processing(format!("{} start", self.label), self.window.low));
    }

    /// Terminal boundary message at the window's high edge.
    pub(crate) fn announce_end(&self) {
        let _ = self
            .progress
            .send(ProgressEvent::processing(format!("{} end", self.label), self.window.high));
    }

    /// Emits a non-fatal per-task failure on the stream.
    pub(crate) fn task_error(&self, message: impl Into<String>) {
        let _ = self.progress.send(ProgressEvent::error(message));
    }
}

/// The once-per-second progress ticker of one phase.
///
/// Stopped through a watch signal on every exit path; the phase never
/// finishes with a live reporter behind it.
pub(crate) struct Reporter {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Reporter {
    pub(crate) fn spawn(state: Arc<PhaseState>) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + Duration::from_secs(1);
            let mut ticks = tokio::time::interval_at(start, Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticks.tick() => {
                        let event = ProgressEvent::processing(
                            format!("{} doing", state.label),
                            state.percent(),
                        );
                        let _ = state.progress.send_async(event).await;
                    }
                }
            }
        });
        Self { stop, task }
    }

    pub(crate) async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// Runs `count` workers draining `tasks` until the channel closes.
///
/// Workers are blocking tasks: every per-task operation is file or
/// database I/O. The call returns once the channel is drained and every
/// worker has exited.
pub(crate) async fn run_workers<T, F>(count: usize, tasks: flume::Receiver<T>, handler: Arc<F>)
where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let mut workers = Vec::with_capacity(count);
    for _ in 0..count {
        let rx = tasks.clone();
        let handler = Arc::clone(&handler);
        workers.push(tokio::task::spawn_blocking(move || {
            while let Ok(task) = rx.recv() {
                handler(task);
            }
        }));
    }
    drop(tasks);

    for worker in workers {
        let _ = worker.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::progress;

    #[test]
    fn percent_maps_into_window() {
        let (tx, _rx) = progress::channel();
        let state = PhaseState::new("export databases", PhaseWindow { low: 1, high: 20 }, tx);

        assert_eq!(state.percent(), 1, "empty phase sits at the low edge");

        state.set_total(10);
        assert_eq!(state.percent(), 1);
        for _ in 0..5 {
            state.task_handled();
        }
        assert_eq!(state.percent(), 10);
        for _ in 0..5 {
            state.task_handled();
        }
        assert_eq!(state.percent(), 20);

        // Overcounting never escapes the window.
        state.task_handled();
        assert_eq!(state.percent(), 20);
    }

    #[test]
    fn boundaries_use_window_edges() {
        let (tx, rx) = progress::channel();
        let state = PhaseState::new("export voice notes", PhaseWindow { low: 61, high: 80 }, tx);

        state.announce_start();
        state.task_error("one bad row");
        state.announce_end();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events[0].progress, Some(61));
        assert!(events[0].result.ends_with("start"));
        assert_eq!(events[1].progress, None);
        assert_eq!(events[2].progress, Some(80));
        assert!(events[2].result.ends_with("end"));
    }

    #[tokio::test]
    async fn workers_drain_channel_then_exit() {
        let (tx, rx) = flume::bounded::<u32>(4);
        let sum = Arc::new(AtomicU64::new(0));
        let handler = {
            let sum = Arc::clone(&sum);
            Arc::new(move |n: u32| {
                sum.fetch_add(u64::from(n), Ordering::Relaxed);
            })
        };

        let producer = tokio::task::spawn_blocking(move || {
            for n in 1..=100u32 {
                tx.send(n).unwrap();
            }
        });

        run_workers(8, rx, handler).await;
        producer.await.unwrap();

        assert_eq!(sum.load(Ordering::Relaxed), 5050);
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_ticks_and_stops() {
        let (tx, rx) = progress::channel();
        let state = PhaseState::new("export image dats", PhaseWindow { low: 21, high: 40 }, tx);
        state.set_total(4);
        state.task_handled();

        let reporter = Reporter::spawn(Arc::clone(&state));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        reporter.stop().await;

        let ticks: Vec<_> = rx.try_iter().collect();
        assert!(ticks.len() >= 2, "expected at least two one-second ticks");
        assert!(ticks.iter().all(|e| e.progress == Some(25)));
        assert!(ticks.iter().all(|e| e.result == "export image dats doing"));
    }
}
