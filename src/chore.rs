//! Periodic background work: the chore trait and its runner.
//!
//! Each chore runs on its own tokio task at its own period. The server's
//! stop flag is polled at the top of every cycle, so a stop request ends
//! the chore after the step in progress, never in the middle of one; the
//! runner's shutdown likewise waits out a running step.
//!
//! The runner also keeps a per-chore status record (runs, consecutive
//! failures, last error). A chore's own policy swallows the errors it can
//! live with; a step error reaching the runner repeatedly means the chore
//! cannot complete any cycle at all — the regions are no longer being
//! flushed, checked or rolled — and the runner asks the server to stop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::server::ServerFlags;

/// Step failures in a row before the runner gives up on a chore and stops
/// the server.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// A periodic background task.
#[async_trait::async_trait]
pub trait Chore: Send + Sync {
    /// Chore name for logging and status lookup.
    fn name(&self) -> &'static str;

    /// How often to run one step.
    fn period(&self) -> Duration;

    /// One cycle of work.
    async fn step(&self) -> Result<()>;
}

/// What the runner knows about one chore's recent history.
#[derive(Clone, Debug, Default)]
pub struct ChoreStatus {
    pub runs: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Owns the chore tasks, their status records, and the shared stop flag.
pub struct ChoreRunner {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    statuses: Arc<Mutex<HashMap<&'static str, ChoreStatus>>>,
    shutdown_tx: broadcast::Sender<()>,
    flags: Arc<ServerFlags>,
}

impl ChoreRunner {
    pub fn new(flags: Arc<ServerFlags>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            statuses: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            flags,
        }
    }

    /// Registers a chore and starts its timer loop.
    pub fn register<C: Chore + 'static>(&self, chore: Arc<C>) -> &Self {
        let period = chore.period();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let statuses = self.statuses.clone();
        let flags = self.flags.clone();
        if let Ok(mut statuses) = statuses.lock() {
            statuses.insert(chore.name(), ChoreStatus::default());
        }

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if flags.stop_requested() {
                            tracing::info!(chore = chore.name(), "stop requested, chore exiting");
                            break;
                        }
                        let result = chore.step().await;
                        let failures = record_step(&statuses, chore.name(), &result);
                        if let Err(e) = result {
                            tracing::error!(chore = chore.name(), error = %e, "chore step failed");
                            if failures >= MAX_CONSECUTIVE_FAILURES {
                                tracing::error!(
                                    chore = chore.name(),
                                    failures,
                                    "chore cannot complete a cycle, stopping server"
                                );
                                flags.request_stop();
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!(chore = chore.name(), "chore shutting down");
                        break;
                    }
                }
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
        self
    }

    /// The recorded status of a registered chore.
    pub fn status(&self, name: &str) -> Option<ChoreStatus> {
        self.statuses
            .lock()
            .ok()
            .and_then(|statuses| statuses.get(name).cloned())
    }

    /// Signals every chore and waits for in-progress steps to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock()?;
            tasks.drain(..).collect()
        };
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }
}

fn record_step(
    statuses: &Mutex<HashMap<&'static str, ChoreStatus>>,
    name: &'static str,
    result: &Result<()>,
) -> u32 {
    let Ok(mut statuses) = statuses.lock() else {
        return 0;
    };
    let status = statuses.entry(name).or_default();
    status.runs += 1;
    match result {
        Ok(()) => {
            status.consecutive_failures = 0;
            status.last_error = None;
        }
        Err(e) => {
            status.consecutive_failures += 1;
            status.last_error = Some(e.to_string());
        }
    }
    status.consecutive_failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChore {
        period: Duration,
        counter: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Chore for CountingChore {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn period(&self) -> Duration {
            self.period
        }

        async fn step(&self) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Io("step failed".to_string()));
            }
            Ok(())
        }
    }

    fn counting(period: Duration, counter: &Arc<AtomicUsize>, fail: bool) -> Arc<CountingChore> {
        Arc::new(CountingChore {
            period,
            counter: counter.clone(),
            fail,
        })
    }

    #[tokio::test]
    async fn test_chore_runs_and_records_status() -> Result<()> {
        let flags = Arc::new(ServerFlags::new());
        let runner = ChoreRunner::new(flags);
        let counter = Arc::new(AtomicUsize::new(0));
        runner.register(counting(Duration::from_millis(10), &counter, false));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(counter.load(Ordering::SeqCst) > 1);

        let status = runner.status("counting").expect("status");
        assert!(status.runs > 1);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());

        runner.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_stops_stepping() -> Result<()> {
        let flags = Arc::new(ServerFlags::new());
        let runner = ChoreRunner::new(flags);
        let counter = Arc::new(AtomicUsize::new(0));
        runner.register(counting(Duration::from_millis(10), &counter, false));

        tokio::time::sleep(Duration::from_millis(30)).await;
        runner.shutdown().await?;

        let at_shutdown = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), at_shutdown);
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_flag_ends_chores() -> Result<()> {
        let flags = Arc::new(ServerFlags::new());
        let runner = ChoreRunner::new(flags.clone());
        let counter = Arc::new(AtomicUsize::new(0));
        runner.register(counting(Duration::from_millis(10), &counter, false));

        tokio::time::sleep(Duration::from_millis(30)).await;
        flags.request_stop();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let after_stop = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);

        runner.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_persistent_failure_stops_server() -> Result<()> {
        let flags = Arc::new(ServerFlags::new());
        let runner = ChoreRunner::new(flags.clone());
        let counter = Arc::new(AtomicUsize::new(0));
        runner.register(counting(Duration::from_millis(5), &counter, true));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(flags.stop_requested(), "runner should give up on the chore");

        let status = runner.status("counting").expect("status");
        assert!(status.consecutive_failures >= MAX_CONSECUTIVE_FAILURES);
        assert!(status.last_error.is_some());

        runner.shutdown().await?;
        Ok(())
    }
}
