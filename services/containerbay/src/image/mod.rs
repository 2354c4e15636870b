//! OCI image resolution and fetching.
//!
//! This module handles:
//! - Parsing and validating image references
//! - Resolving manifests (and multi-arch indexes) against a registry
//! - Pulling and verifying layer blobs
//! - Extracting layers into a plain directory tree

mod oci;
mod reference;
mod source;
mod unpack;

pub use oci::{
    Descriptor, ImageIndex, Manifest, OciClient, OciConfig, OciError, Platform,
    RegistryCredentials, ResolvedManifest,
};
pub use reference::{ImageReference, ReferenceError, DEFAULT_REGISTRY, DEFAULT_TAG};
pub use source::{FetchTarget, ImageMetadata, ImageSource, OciImageSource, PullError};
pub use unpack::{unpack_layers, UnpackError};

pub(crate) use reference::is_sha256_hex;
