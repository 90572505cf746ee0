//! Background reclamation of expired counter records.
//!
//! Every distinct caller leaves a record behind, so a long-running process
//! needs something to drop the ones whose window has ended. The sweeper does
//! this on a fixed interval. Checks never depend on it running.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::limiter::RateLimiter;
use crate::error::{Result, TurnstileError};

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic sweep task bound to one limiter.
///
/// The task is not started on construction; call [`Sweeper::start`] from
/// process initialization and [`Sweeper::stop`] during shutdown.
pub struct Sweeper {
    limiter: Arc<RateLimiter>,
    interval: Duration,
    task: Mutex<Option<SweepTask>>,
}

struct SweepTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Create a sweeper for `limiter` running every `interval`.
    pub fn new(limiter: Arc<RateLimiter>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(TurnstileError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            limiter,
            interval,
            task: Mutex::new(None),
        })
    }

    /// Time between sweeps.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the background task is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Spawn the sweep task on the current Tokio runtime.
    ///
    /// Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_sweeps(
            self.limiter.clone(),
            self.interval,
            shutdown_rx,
        ));
        *task = Some(SweepTask { shutdown, handle });

        info!(interval_ms = self.interval.as_millis() as u64, "Sweeper started");
        true
    }

    /// Signal the sweep task to finish and wait for it.
    ///
    /// Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(task) = self.task.lock().take() else {
            return false;
        };

        // The receiver may already be gone if the task exited.
        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Sweeper task ended abnormally");
        }

        info!("Sweeper stopped");
        true
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.handle.abort();
        }
    }
}

async fn run_sweeps(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = limiter.sweep_expired();
                debug!(removed = removed, "Sweep finished");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::policy::RateLimitPolicy;

    fn limiter_at(start_ms: i64) -> (Arc<ManualClock>, Arc<RateLimiter>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let limiter = Arc::new(RateLimiter::with_clock(clock.clone()));
        (clock, limiter)
    }

    #[test]
    fn test_zero_interval_rejected() {
        let limiter = Arc::new(RateLimiter::new());
        assert!(Sweeper::new(limiter, Duration::ZERO).is_err());
    }

    #[test]
    fn test_not_running_until_started() {
        let limiter = Arc::new(RateLimiter::new());
        let sweeper = Sweeper::new(limiter, DEFAULT_SWEEP_INTERVAL).unwrap();
        assert!(!sweeper.is_running());
        assert_eq!(sweeper.interval(), DEFAULT_SWEEP_INTERVAL);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let limiter = Arc::new(RateLimiter::new());
        let sweeper = Sweeper::new(limiter, Duration::from_millis(10)).unwrap();

        assert!(sweeper.start());
        assert!(sweeper.is_running());
        assert!(!sweeper.start());

        assert!(sweeper.stop().await);
        assert!(!sweeper.is_running());
        assert!(!sweeper.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_expired_records() {
        let (clock, limiter) = limiter_at(0);
        let policy = RateLimitPolicy::new(5, 1_000).unwrap();

        limiter.check("api:a", &policy);
        limiter.check("api:b", &policy);
        assert_eq!(limiter.record_count(), 2);

        let sweeper = Sweeper::new(limiter.clone(), Duration::from_millis(10)).unwrap();
        sweeper.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.record_count(), 2);

        clock.advance(1_000);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(limiter.record_count(), 0);

        sweeper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sweeps_after_stop() {
        let (clock, limiter) = limiter_at(0);
        let policy = RateLimitPolicy::new(5, 1_000).unwrap();
        limiter.check("api:a", &policy);

        let sweeper = Sweeper::new(limiter.clone(), Duration::from_millis(10)).unwrap();
        sweeper.start();
        sweeper.stop().await;

        clock.advance(5_000);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.record_count(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let limiter = Arc::new(RateLimiter::new());
        let sweeper = Sweeper::new(limiter, Duration::from_millis(10)).unwrap();

        assert!(sweeper.start());
        sweeper.stop().await;
        assert!(sweeper.start());
        assert!(sweeper.is_running());
        sweeper.stop().await;
    }
}
