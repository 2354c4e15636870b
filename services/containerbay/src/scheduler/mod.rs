//! Fetch scheduler.
//!
//! A bounded queue in front of a fixed pool of fetch workers. Requests for an
//! image that is not cached yet take the key's lock without waiting, enqueue a
//! job that owns that lock, and return immediately. The worker releases the
//! lock once the entry is published or the fetch has failed, so at most one
//! fetch per key is ever in flight.

mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use clap::ValueEnum;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::image::{ImageReference, ImageSource};
use crate::store::{CacheKey, CacheStore, KeyGuard};

/// What to do with new work when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum QueuePolicy {
    /// Wait for space. The request stalls until a worker frees a slot.
    #[default]
    Block,
    /// Refuse the job and let the client retry.
    Reject,
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of fetch workers.
    pub workers: usize,
    /// Maximum number of queued jobs.
    pub queue_capacity: usize,
    pub policy: QueuePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 1,
            policy: QueuePolicy::Block,
        }
    }
}

/// Errors from handing work to the pool.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("fetch queue is full")]
    QueueFull,

    #[error("fetch queue is closed")]
    Closed,
}

/// One fetch for the pool.
#[derive(Debug, Clone)]
pub struct WorkPackage {
    /// Digest-pinned reference to fetch.
    pub reference: ImageReference,
    pub key: CacheKey,
    /// Where the entry ends up once published.
    pub destination: PathBuf,
}

/// Queued job. Holds the key's lock until the worker is done with it.
struct FetchJob {
    package: WorkPackage,
    guard: KeyGuard,
}

/// State of an image from the point of view of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// Cached and servable from this directory.
    Ready(PathBuf),
    /// A fetch was just queued for it.
    Scheduled,
    /// Another request already has a fetch queued or running.
    InProgress,
}

/// Bounded queue plus worker pool.
pub struct FetchScheduler {
    store: Arc<CacheStore>,
    jobs: mpsc::Sender<FetchJob>,
    policy: QueuePolicy,
}

impl FetchScheduler {
    /// Create the queue and spawn the workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: SchedulerConfig,
        store: Arc<CacheStore>,
        source: Arc<dyn ImageSource>,
    ) -> Self {
        let workers = config.workers.max(1);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx: worker::JobReceiver = Arc::new(Mutex::new(rx));

        for id in 0..workers {
            tokio::spawn(worker::run_worker(
                id,
                rx.clone(),
                store.clone(),
                source.clone(),
            ));
        }

        info!(
            workers = workers,
            queue_capacity = config.queue_capacity.max(1),
            policy = ?config.policy,
            "Fetch workers started"
        );

        Self {
            store,
            jobs: tx,
            policy: config.policy,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Return the cached entry for `key`, or make sure a fetch for it is queued.
    ///
    /// `reference` should be pinned to `key` so the fetched bytes match it.
    pub async fn request(
        &self,
        reference: &ImageReference,
        key: &CacheKey,
    ) -> Result<Availability, ScheduleError> {
        if self.store.exists(key) {
            return Ok(Availability::Ready(self.store.path(key)));
        }

        let Some(guard) = self.store.try_lock(key) else {
            debug!(digest = %key, "Fetch already in progress");
            return Ok(Availability::InProgress);
        };

        // A fetch may have finished between the first check and the lock
        if self.store.exists(key) {
            return Ok(Availability::Ready(self.store.path(key)));
        }

        info!(image = %reference, digest = %key, "Not present in cache, scheduling fetch");

        let job = FetchJob {
            package: WorkPackage {
                reference: reference.clone(),
                key: key.clone(),
                destination: self.store.path(key),
            },
            guard,
        };

        match self.policy {
            QueuePolicy::Block => self
                .jobs
                .send(job)
                .await
                .map_err(|_| ScheduleError::Closed)?,
            QueuePolicy::Reject => self.jobs.try_send(job).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!(image = %reference, digest = %key, "Fetch queue full, rejecting");
                    ScheduleError::QueueFull
                }
                mpsc::error::TrySendError::Closed(_) => ScheduleError::Closed,
            })?,
        }

        Ok(Availability::Scheduled)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::{Notify, Semaphore};

    use super::*;
    use crate::image::{FetchTarget, ImageMetadata, OciError, PullError};

    /// Source whose fetches wait for a permit before completing.
    struct GatedSource {
        fetches: AtomicUsize,
        gate: Semaphore,
        started: Notify,
        fail: bool,
    }

    impl GatedSource {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                started: Notify::new(),
                fail,
            })
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageSource for GatedSource {
        async fn inspect(&self, _reference: &ImageReference) -> Result<ImageMetadata, PullError> {
            unreachable!("the scheduler never inspects")
        }

        async fn fetch(
            &self,
            reference: &ImageReference,
            target: &FetchTarget,
        ) -> Result<(), PullError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();

            self.gate.acquire().await.unwrap().forget();

            if self.fail {
                return Err(OciError::NotFound(reference.to_string()).into());
            }
            fs::write(target.rootfs.join("index.html"), "<h1>hi</h1>").unwrap();
            Ok(())
        }
    }

    fn key(c: char) -> CacheKey {
        CacheKey::from_digest(&c.to_string().repeat(64)).unwrap()
    }

    fn pinned(key: &CacheKey) -> ImageReference {
        ImageReference::parse("ghcr.io/org/site:latest")
            .unwrap()
            .pinned(&key.digest())
            .unwrap()
    }

    fn scheduler(
        source: Arc<GatedSource>,
        workers: usize,
        queue_capacity: usize,
        policy: QueuePolicy,
    ) -> (TempDir, FetchScheduler) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(CacheStore::new(temp.path()));
        let config = SchedulerConfig {
            workers,
            queue_capacity,
            policy,
        };
        (temp, FetchScheduler::start(config, store, source))
    }

    async fn wait_until_ready(scheduler: &FetchScheduler, key: &CacheKey) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !scheduler.store().exists(key) || scheduler.store().is_locked(key) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("fetch should complete");
    }

    async fn wait_until_unlocked(scheduler: &FetchScheduler, key: &CacheKey) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.store().is_locked(key) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("lock should be released");
    }

    #[tokio::test]
    async fn test_concurrent_requests_fetch_once() {
        let source = GatedSource::new(false);
        let (_temp, scheduler) = scheduler(source.clone(), 4, 4, QueuePolicy::Block);
        let k = key('a');
        let reference = pinned(&k);

        let (first, second) = tokio::join!(
            scheduler.request(&reference, &k),
            scheduler.request(&reference, &k)
        );
        let mut outcomes = [first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|a| matches!(a, Availability::InProgress));
        assert_eq!(
            outcomes,
            [Availability::Scheduled, Availability::InProgress]
        );

        // Still in flight: more requests do not queue anything
        assert_eq!(
            scheduler.request(&reference, &k).await.unwrap(),
            Availability::InProgress
        );

        source.release(1);
        wait_until_ready(&scheduler, &k).await;

        assert_eq!(source.fetches(), 1);
        assert_eq!(
            scheduler.request(&reference, &k).await.unwrap(),
            Availability::Ready(scheduler.store().path(&k))
        );
        assert!(scheduler.store().path_with(&k, ["index.html"]).is_file());
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_key_absent_and_unlocked() {
        let source = GatedSource::new(true);
        let (_temp, scheduler) = scheduler(source.clone(), 1, 1, QueuePolicy::Block);
        let k = key('b');
        let reference = pinned(&k);

        assert_eq!(
            scheduler.request(&reference, &k).await.unwrap(),
            Availability::Scheduled
        );
        source.release(1);
        wait_until_unlocked(&scheduler, &k).await;

        assert!(!scheduler.store().exists(&k));
        assert_eq!(fs::read_dir(scheduler.store().root()).unwrap().count(), 0);

        // The next request tries again
        assert_eq!(
            scheduler.request(&reference, &k).await.unwrap(),
            Availability::Scheduled
        );
        source.release(1);
        wait_until_unlocked(&scheduler, &k).await;
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_reject_policy_refuses_when_full() {
        let source = GatedSource::new(false);
        let (_temp, scheduler) = scheduler(source.clone(), 1, 1, QueuePolicy::Reject);
        let (a, b, c) = (key('a'), key('b'), key('c'));

        // Occupy the only worker
        let started = source.started.notified();
        assert_eq!(
            scheduler.request(&pinned(&a), &a).await.unwrap(),
            Availability::Scheduled
        );
        started.await;

        // Fill the queue
        assert_eq!(
            scheduler.request(&pinned(&b), &b).await.unwrap(),
            Availability::Scheduled
        );

        let err = scheduler.request(&pinned(&c), &c).await.unwrap_err();
        assert!(matches!(err, ScheduleError::QueueFull));
        // The rejected job gave its lock back
        assert!(!scheduler.store().is_locked(&c));

        source.release(2);
        wait_until_ready(&scheduler, &a).await;
        wait_until_ready(&scheduler, &b).await;
        assert!(!scheduler.store().exists(&c));
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_space() {
        let source = GatedSource::new(false);
        let (_temp, scheduler) = scheduler(source.clone(), 1, 1, QueuePolicy::Block);
        let scheduler = Arc::new(scheduler);
        let (a, b, c) = (key('a'), key('b'), key('c'));

        let started = source.started.notified();
        scheduler.request(&pinned(&a), &a).await.unwrap();
        started.await;
        scheduler.request(&pinned(&b), &b).await.unwrap();

        let blocked = tokio::spawn({
            let scheduler = scheduler.clone();
            let c = c.clone();
            async move { scheduler.request(&pinned(&c), &c).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        assert!(scheduler.store().is_locked(&c));

        source.release(3);
        let outcome = tokio::time::timeout(Duration::from_secs(5), blocked)
            .await
            .expect("request should unblock")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Availability::Scheduled);

        wait_until_ready(&scheduler, &c).await;
        assert_eq!(source.fetches(), 3);
    }

    #[tokio::test]
    async fn test_cached_entry_is_ready_without_fetch() {
        let source = GatedSource::new(false);
        let (_temp, scheduler) = scheduler(source.clone(), 1, 1, QueuePolicy::Block);
        let k = key('d');
        fs::create_dir_all(scheduler.store().path(&k)).unwrap();

        let outcome = scheduler.request(&pinned(&k), &k).await.unwrap();
        assert_eq!(outcome, Availability::Ready(scheduler.store().path(&k)));
        assert_eq!(source.fetches(), 0);
        assert!(!scheduler.store().is_locked(&k));
    }
}
