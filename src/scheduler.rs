// src/scheduler.rs
//
// Owns the periodic refresh loops. A loop re-arms only after its iteration
// settles, so a slow upstream call delays the next tick but never overlaps it.

use crate::errors::FarmResult;
use crate::metrics;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One iteration of a loop.
pub type LoopJob = Arc<dyn Fn() -> BoxFuture<'static, FarmResult<()>> + Send + Sync>;

/// Delay before the next iteration; read after every iteration.
pub type LoopInterval = Arc<dyn Fn() -> Duration + Send + Sync>;

pub fn fixed_interval(period: Duration) -> LoopInterval {
    Arc::new(move || period)
}

struct LoopHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    loops: Vec<LoopHandle>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            loops: Vec::new(),
        }
    }

    /// Spawn a loop that runs `job` now and then again `interval()` after each settle.
    pub fn spawn_loop(&mut self, name: &'static str, interval: LoopInterval, job: LoopJob) {
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut iteration = 0u64;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                iteration += 1;
                let start = Instant::now();
                let outcome = job().await;
                metrics::record_refresh(name, outcome.is_ok(), start.elapsed());
                match outcome {
                    Ok(()) => debug!("[{} #{}] settled in {:?}", name, iteration, start.elapsed()),
                    Err(e) => warn!("⚠️ [{} #{}] {}", name, iteration, e),
                }

                let delay = interval();
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!("[{}] loop stopped", name);
        });
        info!("🚀 Started {} loop", name);
        self.loops.push(LoopHandle { name, handle });
    }

    pub fn loop_names(&self) -> Vec<&'static str> {
        self.loops.iter().map(|l| l.name).collect()
    }

    pub fn is_running(&self) -> bool {
        self.loops.iter().any(|l| !l.handle.is_finished())
    }

    /// Signal every loop and wait for each to finish its current iteration.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for l in self.loops {
            if let Err(e) = l.handle.await {
                warn!("⚠️ [{}] loop ended abnormally: {}", l.name, e);
            }
        }
        info!("✅ Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(counter: Arc<AtomicUsize>, work: Duration) -> LoopJob {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(work).await;
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn loops_rearm_after_settle() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        // 30ms of work + 10ms pause: iterations start at 0, 40, 80, ...
        scheduler.spawn_loop(
            "slow",
            fixed_interval(Duration::from_millis(10)),
            counting_job(Arc::clone(&runs), Duration::from_millis(30)),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_joins_every_loop() {
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        scheduler.spawn_loop("a", fixed_interval(Duration::from_secs(1)), counting_job(Arc::clone(&a), Duration::ZERO));
        scheduler.spawn_loop("b", fixed_interval(Duration::from_secs(5)), counting_job(Arc::clone(&b), Duration::ZERO));
        assert_eq!(scheduler.loop_names(), vec!["a", "b"]);
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        scheduler.stop().await;
        let (a_runs, b_runs) = (a.load(Ordering::SeqCst), b.load(Ordering::SeqCst));
        assert_eq!(b_runs, 2);
        assert!(a_runs >= 5);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(a.load(Ordering::SeqCst), a_runs, "no iterations after stop");
    }

    #[tokio::test(start_paused = true)]
    async fn failing_iterations_keep_the_loop_alive() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let job: LoopJob = Arc::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(crate::errors::FarmError::upstream("test", "down"))
            }
            .boxed()
        });
        let mut scheduler = Scheduler::new();
        scheduler.spawn_loop("flaky", fixed_interval(Duration::from_secs(1)), job);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        scheduler.stop().await;
    }
}
