use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::store::CacheStore;

const MIN_DELAY: Duration = Duration::from_secs(1);
/// Upper bound for interval and jitter arithmetic.
const MAX_MILLIS: i64 = i64::MAX / 2;

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Time between sweeps. Zero disables the worker.
    pub interval: Duration,
    /// Maximum random deviation from `interval` per sweep.
    pub jitter: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::ZERO,
            jitter: Duration::from_secs(10),
        }
    }
}

pub struct CleanupWorker {
    store: Arc<CacheStore>,
    config: CleanupConfig,
}

impl CleanupWorker {
    pub fn new(store: Arc<CacheStore>, config: CleanupConfig) -> Self {
        Self { store, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if self.config.interval.is_zero() {
            info!("Cleanup disabled");
            return;
        }

        info!(
            interval = %humantime::format_duration(self.config.interval),
            jitter = %humantime::format_duration(self.config.jitter),
            "Cleanups enabled"
        );

        loop {
            let delay = next_delay(self.config.interval, self.config.jitter);
            debug!(delay_ms = delay.as_millis() as u64, "Next cache sweep scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    self.run_cleanup().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_cleanup(&self) {
        let store = self.store.clone();

        match tokio::task::spawn_blocking(move || store.clean()).await {
            Ok(Ok(removed)) => {
                debug!(removed = removed, "Cache sweep finished");
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to clean cache store");
            }
            Err(e) => {
                error!(error = %e, "Cache sweep task failed");
            }
        }
    }
}

/// Delay before the next sweep: `interval` shifted by a uniform offset in
/// `[-jitter, +jitter]`, never shorter than one second.
pub fn next_delay(interval: Duration, jitter: Duration) -> Duration {
    let delay = if jitter.is_zero() {
        interval
    } else {
        let spread = clamped_millis(jitter);
        let offset = rand::rng().random_range(-spread..=spread);
        let millis = clamped_millis(interval).saturating_add(offset).max(0);
        Duration::from_millis(u64::try_from(millis).unwrap_or(0))
    };

    delay.max(MIN_DELAY)
}

fn clamped_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).map_or(MAX_MILLIS, |ms| ms.min(MAX_MILLIS))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::store::CacheKey;

    fn key(c: char) -> CacheKey {
        CacheKey::from_digest(&c.to_string().repeat(64)).unwrap()
    }

    #[test]
    fn test_next_delay_stays_within_jitter() {
        let interval = Duration::from_secs(60);
        let jitter = Duration::from_secs(10);

        for _ in 0..200 {
            let delay = next_delay(interval, jitter);
            assert!(delay >= Duration::from_secs(50), "{delay:?}");
            assert!(delay <= Duration::from_secs(70), "{delay:?}");
        }
    }

    #[test]
    fn test_next_delay_has_floor() {
        assert_eq!(next_delay(Duration::from_millis(10), Duration::ZERO), MIN_DELAY);

        for _ in 0..50 {
            let delay = next_delay(Duration::from_secs(2), Duration::from_secs(30));
            assert!(delay >= MIN_DELAY);
        }
    }

    #[test]
    fn test_next_delay_saturates_huge_values() {
        let delay = next_delay(Duration::MAX, Duration::MAX);
        assert!(delay >= MIN_DELAY);

        let delay = next_delay(Duration::MAX, Duration::ZERO);
        assert_eq!(delay, Duration::MAX);

        let delay = next_delay(Duration::from_secs(5), Duration::MAX);
        assert!(delay >= MIN_DELAY);
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_stops_worker() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(CacheStore::new(temp.path()));
        let worker = CleanupWorker::new(
            store,
            CleanupConfig {
                interval: Duration::from_secs(3600),
                jitter: Duration::ZERO,
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop when the sender goes away")
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_returns_immediately() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(CacheStore::new(temp.path()));
        let worker = CleanupWorker::new(store, CleanupConfig::default());
        let (_tx, rx) = watch::channel(false);

        tokio::time::timeout(Duration::from_secs(1), worker.run(rx))
            .await
            .expect("disabled worker should return");
    }

    #[tokio::test]
    async fn test_sweeps_unlocked_entries_until_shutdown() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(CacheStore::new(temp.path()));
        let (free, busy) = (key('a'), key('b'));
        fs::create_dir_all(store.path(&free)).unwrap();
        fs::create_dir_all(store.path(&busy)).unwrap();
        let guard = store.lock(&busy).await;

        let worker = CleanupWorker::new(
            store.clone(),
            CleanupConfig {
                interval: Duration::from_secs(1),
                jitter: Duration::ZERO,
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.exists(&free) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("unlocked entry should be swept");
        assert!(store.exists(&busy));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop on shutdown")
            .unwrap();

        drop(guard);
    }
}
