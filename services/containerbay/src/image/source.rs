//! The image puller seam.
//!
//! Everything above this module only needs two questions answered about an
//! image: what is it (digest and size, without downloading layers) and
//! "put its filesystem here". [`ImageSource`] is that contract; the registry
//! backed implementation is [`OciImageSource`].

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::oci::{OciClient, OciConfig, OciError};
use super::reference::ImageReference;
use super::unpack::{unpack_layers, UnpackError};

/// Errors from pulling an image.
#[derive(Debug, Error)]
pub enum PullError {
    #[error(transparent)]
    Oci(#[from] OciError),

    #[error("Unpack failed: {0}")]
    Unpack(#[from] UnpackError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unpack task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What the admission path learns about an image before fetching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    /// Manifest digest, `sha256:<hex>`.
    pub digest: String,
    /// Sum of all layer sizes in bytes.
    pub total_size: u64,
    /// Number of layers.
    pub layers: usize,
}

/// Where a fetch writes.
#[derive(Debug, Clone)]
pub struct FetchTarget {
    /// Receives the extracted filesystem.
    pub rootfs: PathBuf,
    /// Scratch space for downloaded layers.
    pub blobs: PathBuf,
}

/// Fetches image metadata and content.
#[async_trait]
pub trait ImageSource: Send + Sync + 'static {
    /// Resolve an image's manifest without downloading layer content.
    async fn inspect(&self, reference: &ImageReference) -> Result<ImageMetadata, PullError>;

    /// Download and extract the image's flattened filesystem into `target.rootfs`.
    async fn fetch(&self, reference: &ImageReference, target: &FetchTarget)
        -> Result<(), PullError>;
}

/// [`ImageSource`] backed by an OCI registry.
pub struct OciImageSource {
    client: OciClient,
}

impl OciImageSource {
    /// Create a new registry-backed source.
    pub fn new(config: OciConfig) -> Result<Self, PullError> {
        Ok(Self {
            client: OciClient::new(config)?,
        })
    }
}

#[async_trait]
impl ImageSource for OciImageSource {
    async fn inspect(&self, reference: &ImageReference) -> Result<ImageMetadata, PullError> {
        let resolved = self.client.resolve_manifest(reference).await?;

        Ok(ImageMetadata {
            digest: resolved.digest,
            total_size: resolved.manifest.total_layer_size(),
            layers: resolved.manifest.layers.len(),
        })
    }

    async fn fetch(
        &self,
        reference: &ImageReference,
        target: &FetchTarget,
    ) -> Result<(), PullError> {
        let resolved = self.client.resolve_manifest(reference).await?;

        let mut layer_paths = Vec::with_capacity(resolved.manifest.layers.len());
        for (i, layer) in resolved.manifest.layers.iter().enumerate() {
            let layer_path = target.blobs.join(layer.digest.replace(':', "_"));

            debug!(
                layer = i,
                digest = %layer.digest,
                size = layer.size,
                "Pulling layer"
            );

            self.client
                .pull_blob(reference, &layer.digest, &layer_path)
                .await?;
            layer_paths.push(layer_path);
        }

        let rootfs = target.rootfs.clone();
        tokio::task::spawn_blocking(move || unpack_layers(&layer_paths, &rootfs)).await??;

        Ok(())
    }
}
