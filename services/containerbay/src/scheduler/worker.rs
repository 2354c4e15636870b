//! Fetch workers.
//!
//! Each worker drains the shared queue for the life of the process, fetching
//! one image at a time into a staging area and publishing it on success.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use super::FetchJob;
use crate::image::{FetchTarget, ImageSource};
use crate::store::CacheStore;

pub(super) type JobReceiver = Arc<Mutex<mpsc::Receiver<FetchJob>>>;

/// Consume jobs until the queue closes.
pub(super) async fn run_worker(
    id: usize,
    jobs: JobReceiver,
    store: Arc<CacheStore>,
    source: Arc<dyn ImageSource>,
) {
    debug!(worker = id, "Fetch worker started");

    loop {
        let job = jobs.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };
        process(id, &store, source.as_ref(), job).await;
    }

    debug!(worker = id, "Fetch worker stopped");
}

/// Fetch one image. Failures are logged and leave the key absent.
async fn process(id: usize, store: &CacheStore, source: &dyn ImageSource, job: FetchJob) {
    let FetchJob { package, guard } = job;
    let start = Instant::now();

    let staging = match store.stage(&package.key, &guard) {
        Ok(staging) => staging,
        Err(e) => {
            error!(
                worker = id,
                image = %package.reference,
                digest = %package.key,
                error = %e,
                "Failed to prepare staging area"
            );
            return;
        }
    };

    let target = FetchTarget {
        rootfs: staging.rootfs(),
        blobs: staging.blobs(),
    };

    info!(
        worker = id,
        image = %package.reference,
        digest = %package.key,
        "Fetching image"
    );

    if let Err(e) = source.fetch(&package.reference, &target).await {
        error!(
            worker = id,
            image = %package.reference,
            digest = %package.key,
            error = %e,
            "Image fetch failed"
        );
        store.discard(staging);
        return;
    }

    match store.publish(staging) {
        Ok(()) => info!(
            worker = id,
            image = %package.reference,
            destination = %package.destination.display(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Image cached"
        ),
        Err(e) => error!(
            worker = id,
            image = %package.reference,
            digest = %package.key,
            error = %e,
            "Failed to publish image"
        ),
    }

    // The key stays locked until the entry is visible or known to be absent
    drop(guard);
}
