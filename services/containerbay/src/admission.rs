//! Admission control.
//!
//! Looks an image up (manifest only), refuses it when its layers add up to
//! more than the configured limit, and otherwise hands back the cache key and
//! a digest-pinned reference for the fetch.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::image::{ImageReference, ImageSource, PullError, ReferenceError};
use crate::store::{CacheKey, StoreError};

/// Errors from admitting an image.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("while fetching remote image reference: {0}")]
    Upstream(#[from] PullError),

    #[error("max size exceeded: image {size}, threshold {limit}")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("while getting image digest: {0}")]
    Digest(#[from] StoreError),

    #[error("while pinning image digest: {0}")]
    Reference(#[from] ReferenceError),
}

/// An image cleared for serving.
#[derive(Debug, Clone)]
pub struct Admitted {
    /// Cache key (manifest digest).
    pub key: CacheKey,
    /// Total layer size in bytes.
    pub size: u64,
    /// The requested reference pinned to the admitted digest.
    pub pinned: ImageReference,
}

/// Size-gated admission in front of the cache.
pub struct Admission {
    source: Arc<dyn ImageSource>,
    /// Maximum total layer size in bytes, 0 for unlimited.
    max_size: u64,
}

impl Admission {
    pub fn new(source: Arc<dyn ImageSource>, max_size: u64) -> Self {
        Self { source, max_size }
    }

    /// Decide whether `reference` may be served.
    pub async fn admit(&self, reference: &ImageReference) -> Result<Admitted, AdmissionError> {
        let metadata = self.source.inspect(reference).await?;

        if self.max_size != 0 && metadata.total_size > self.max_size {
            warn!(
                image = %reference,
                size = metadata.total_size,
                threshold = self.max_size,
                "Refusing to serve image"
            );
            return Err(AdmissionError::SizeExceeded {
                size: metadata.total_size,
                limit: self.max_size,
            });
        }

        let key = CacheKey::from_digest(&metadata.digest)?;
        let pinned = reference.pinned(&metadata.digest)?;

        info!(
            image = %reference,
            digest = %key,
            size = metadata.total_size,
            layers = metadata.layers,
            "Serving image"
        );

        Ok(Admitted {
            key,
            size: metadata.total_size,
            pinned,
        })
    }
}
