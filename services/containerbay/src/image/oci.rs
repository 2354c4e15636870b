//! OCI registry client for resolving manifests and pulling blobs.
//!
//! This module implements the pull side of the OCI Distribution Specification,
//! including the token handshake most public registries require even for
//! anonymous pulls.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{header, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::reference::{ImageReference, DEFAULT_REGISTRY};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.docker.distribution.manifest.v2+json";

/// Errors from OCI operations.
#[derive(Debug, Error)]
pub enum OciError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Authentication required for {0}")]
    AuthRequired(String),

    #[error("Token request failed: {0}")]
    Token(String),

    #[error("Registry returned {status} for {url}")]
    UnexpectedStatus { status: StatusCode, url: String },

    #[error("Image index for {0} lists no manifests")]
    EmptyIndex(String),

    #[error("Nested image index at {0}")]
    NestedIndex(String),

    #[error("Pull timeout")]
    Timeout,
}

/// Credentials applied to every registry request.
#[derive(Debug, Clone, Default)]
pub struct RegistryCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Pre-issued bearer token, sent as-is.
    pub token: Option<String>,
}

impl RegistryCredentials {
    fn basic(&self) -> Option<Authorization> {
        self.username.as_ref().map(|username| Authorization::Basic {
            username: username.clone(),
            password: self.password.clone(),
        })
    }
}

/// Target platform used to pick a manifest out of a multi-arch index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Default for Platform {
    fn default() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
        }
    }
}

/// Configuration for the OCI client.
#[derive(Debug, Clone)]
pub struct OciConfig {
    pub credentials: RegistryCredentials,
    pub platform: Platform,
    /// Per-layer pull timeout.
    pub layer_timeout: Duration,
    /// Total timeout for any single request.
    pub total_timeout: Duration,
}

impl Default for OciConfig {
    fn default() -> Self {
        Self {
            credentials: RegistryCredentials::default(),
            platform: Platform::default(),
            layer_timeout: Duration::from_secs(300),  // 5 minutes
            total_timeout: Duration::from_secs(1800), // 30 minutes
        }
    }
}

#[derive(Debug, Clone)]
enum Authorization {
    Bearer(String),
    Basic {
        username: String,
        password: Option<String>,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// An image manifest together with its content digest.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    /// `sha256:<hex>` of the manifest bytes.
    pub digest: String,
    pub manifest: Manifest,
}

/// OCI Distribution client.
pub struct OciClient {
    config: OciConfig,
    client: Client,
    /// Authorization that last worked, keyed by `registry/repository`.
    auth_cache: Mutex<HashMap<String, Authorization>>,
}

impl OciClient {
    /// Create a new OCI client.
    pub fn new(config: OciConfig) -> Result<Self, OciError> {
        let client = Client::builder().timeout(config.total_timeout).build()?;

        Ok(Self {
            config,
            client,
            auth_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a reference to a single-platform image manifest.
    ///
    /// Indexes are narrowed to the configured platform. A pinned reference must
    /// match the digest of the first document the registry returns.
    pub async fn resolve_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<ResolvedManifest, OciError> {
        let (digest, document) = self
            .fetch_manifest(reference, reference.manifest_reference())
            .await?;

        if let Some(expected) = reference.digest() {
            if digest != expected {
                return Err(OciError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest,
                });
            }
        }

        let index = match document {
            ManifestDocument::Image(manifest) => return Ok(ResolvedManifest { digest, manifest }),
            ManifestDocument::Index(index) => index,
        };

        let entry = index
            .select(&self.config.platform)
            .ok_or_else(|| OciError::EmptyIndex(reference.to_string()))?;

        debug!(
            image = %reference,
            index_digest = %digest,
            manifest_digest = %entry.digest,
            "Selected platform manifest from index"
        );

        let (digest, document) = self.fetch_manifest(reference, &entry.digest).await?;
        if digest != entry.digest {
            return Err(OciError::DigestMismatch {
                expected: entry.digest.clone(),
                actual: digest,
            });
        }

        match document {
            ManifestDocument::Image(manifest) => Ok(ResolvedManifest { digest, manifest }),
            ManifestDocument::Index(_) => Err(OciError::NestedIndex(digest)),
        }
    }

    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        manifest_ref: &str,
    ) -> Result<(String, ManifestDocument), OciError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            registry_url(reference.registry()),
            reference.repository(),
            manifest_ref
        );

        debug!(url = %url, "Pulling manifest");

        let response = self.get(reference, &url, Some(MANIFEST_ACCEPT)).await?;
        let response = check_status(response, &format!("{reference} ({manifest_ref})"))?;
        let body = response.bytes().await?;

        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
        let document: ManifestDocument = serde_json::from_slice(&body)?;

        Ok((digest, document))
    }

    /// Pull a blob by digest to a file, verifying its content digest.
    pub async fn pull_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
        dest: &Path,
    ) -> Result<u64, OciError> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            registry_url(reference.registry()),
            reference.repository(),
            digest
        );

        debug!(url = %url, dest = %dest.display(), "Pulling blob");

        let response = tokio::time::timeout(self.config.layer_timeout, self.get(reference, &url, None))
            .await
            .map_err(|_| OciError::Timeout)??;
        let response = check_status(response, digest)?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Download to temporary file, then rename
        let temp_path = dest.with_extension("tmp");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut hasher = Sha256::new();
        let mut total_bytes = 0u64;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            total_bytes += chunk.len() as u64;
        }
        file.sync_all().await?;
        drop(file);

        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != digest {
            tokio::fs::remove_file(&temp_path).await.ok();
            return Err(OciError::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }

        tokio::fs::rename(&temp_path, dest).await?;

        info!(digest = %digest, size = total_bytes, "Blob downloaded");

        Ok(total_bytes)
    }

    /// GET with registry auth, answering one `401` challenge.
    async fn get(
        &self,
        reference: &ImageReference,
        url: &str,
        accept: Option<&str>,
    ) -> Result<Response, OciError> {
        let scope_key = format!("{}/{}", reference.registry(), reference.repository());

        let cached = self
            .auth_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&scope_key)
            .cloned();
        let initial = cached.or_else(|| {
            self.config
                .credentials
                .token
                .clone()
                .map(Authorization::Bearer)
        });

        let response = self.send(url, accept, initial.as_ref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_challenge);

        let auth = match challenge {
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                let scope =
                    scope.unwrap_or_else(|| format!("repository:{}:pull", reference.repository()));
                let token = self
                    .fetch_token(&realm, service.as_deref(), &scope)
                    .await?;
                Authorization::Bearer(token)
            }
            Some(Challenge::Basic) => self
                .config
                .credentials
                .basic()
                .ok_or_else(|| OciError::AuthRequired(reference.to_string()))?,
            None => return Err(OciError::AuthRequired(reference.to_string())),
        };

        let response = self.send(url, accept, Some(&auth)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(OciError::AuthRequired(reference.to_string()));
        }

        self.auth_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope_key, auth);

        Ok(response)
    }

    async fn send(
        &self,
        url: &str,
        accept: Option<&str>,
        auth: Option<&Authorization>,
    ) -> Result<Response, OciError> {
        let mut request = self.client.get(url);

        if let Some(accept) = accept {
            request = request.header(header::ACCEPT, accept);
        }

        request = match auth {
            Some(Authorization::Bearer(token)) => request.bearer_auth(token),
            Some(Authorization::Basic { username, password }) => {
                request.basic_auth(username, password.as_ref())
            }
            None => request,
        };

        Ok(request.send().await?)
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: &str,
    ) -> Result<String, OciError> {
        debug!(realm = %realm, scope = %scope, "Requesting registry token");

        let mut request = self.client.get(realm).query(&[("scope", scope)]);
        if let Some(service) = service {
            request = request.query(&[("service", service)]);
        }
        if let Some(Authorization::Basic { username, password }) = self.config.credentials.basic() {
            request = request.basic_auth(username, password);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(OciError::Token(format!(
                "{} returned {}",
                realm,
                response.status()
            )));
        }

        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| OciError::Token(format!("{realm} returned no token")))
    }
}

/// Base URL for a registry host.
fn registry_url(registry: &str) -> String {
    let host = if registry == DEFAULT_REGISTRY {
        "registry-1.docker.io"
    } else {
        registry
    };

    let plain_http = host == "localhost"
        || host.starts_with("localhost:")
        || host == "127.0.0.1"
        || host.starts_with("127.0.0.1:");

    if plain_http {
        format!("http://{host}")
    } else {
        format!("https://{host}")
    }
}

fn check_status(response: Response, what: &str) -> Result<Response, OciError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(OciError::NotFound(what.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(OciError::AuthRequired(what.to_string()))
        }
        status => Err(OciError::UnexpectedStatus {
            status,
            url: response.url().to_string(),
        }),
    }
}

/// Parse a `WWW-Authenticate` header value.
fn parse_challenge(value: &str) -> Option<Challenge> {
    let value = value.trim();
    let (scheme, params) = value.split_once(' ').unwrap_or((value, ""));

    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut params = parse_auth_params(params);
    Some(Challenge::Bearer {
        realm: params.remove("realm")?,
        service: params.remove("service"),
        scope: params.remove("scope"),
    })
}

/// `key="value",key=value` pairs; quoted values may contain commas.
fn parse_auth_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();

    while let Some((key, after)) = rest.split_once('=') {
        let key = key.trim().to_ascii_lowercase();
        let after = after.trim_start();

        let (value, remainder) = match after.strip_prefix('"') {
            Some(quoted) => match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            },
            None => match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            },
        };

        params.insert(key, value.to_string());
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    params
}

/// OCI image manifest.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Schema version.
    pub schema_version: u32,
    /// Media type.
    #[serde(default)]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors.
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Get total compressed size of all layers.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// OCI image index (or Docker manifest list).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// The entry for `platform`, else the first entry with a real platform.
    fn select(&self, platform: &Platform) -> Option<&Descriptor> {
        self.manifests
            .iter()
            .find(|m| m.platform.as_ref() == Some(platform))
            .or_else(|| {
                self.manifests.iter().find(|m| {
                    m.platform
                        .as_ref()
                        .is_none_or(|p| p.os != "unknown" && p.architecture != "unknown")
                })
            })
    }
}

/// Content descriptor.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the content.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
    /// Platform, for index entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestDocument {
    Index(ImageIndex),
    Image(Manifest),
}
