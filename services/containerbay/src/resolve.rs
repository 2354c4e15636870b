//! Request to image resolution.
//!
//! Strategies, first match wins:
//! 1. standalone image, if configured
//! 2. `/<registry>/<org>/<container>/<rest>` paths
//! 3. magic DNS: `<registry...>.<org>.<container>.<tag>.<suffix>` hosts
//! 4. a `<key>=<image>` TXT record on the request host
//! 5. the default image

use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig as DnsConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from DNS lookups. Never fatal: resolution falls through.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("TXT lookup for '{host}' failed: {message}")]
    Lookup { host: String, message: String },
}

/// TXT record lookups.
#[async_trait]
pub trait TxtLookup: Send + Sync + 'static {
    /// All TXT records of `host`, each flattened to one string.
    async fn lookup_txt(&self, host: &str) -> Result<Vec<String>, ResolveError>;
}

/// [`TxtLookup`] over the hickory resolver.
pub struct HickoryTxtLookup {
    resolver: hickory_resolver::Resolver<TokioConnectionProvider>,
}

impl HickoryTxtLookup {
    /// Resolver using hickory's default upstream configuration.
    pub fn new() -> Self {
        let resolver = hickory_resolver::Resolver::builder_with_config(
            DnsConfig::default(),
            TokioConnectionProvider::default(),
        )
        .build();

        Self { resolver }
    }
}

impl Default for HickoryTxtLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxtLookup for HickoryTxtLookup {
    async fn lookup_txt(&self, host: &str) -> Result<Vec<String>, ResolveError> {
        let lookup = self
            .resolver
            .txt_lookup(host)
            .await
            .map_err(|e| ResolveError::Lookup {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk))
                    .collect::<String>()
            })
            .collect())
    }
}

/// Which strategy produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Standalone,
    Path,
    MagicDns,
    TxtRecord,
    Default,
}

/// An image to serve and the URL prefix to strip before looking up files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub image: String,
    pub strip_prefix: String,
    pub strategy: Strategy,
}

impl Resolution {
    fn rooted(image: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            image: image.into(),
            strip_prefix: "/".to_string(),
            strategy,
        }
    }
}

/// Resolver settings.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Serve only this image, ignoring path and host.
    pub standalone_image: Option<String>,
    /// Magic DNS suffix, e.g. `example.com`.
    pub magic_dns: Option<String>,
    /// Key of `<key>=<image>` TXT records.
    pub txt_key: String,
    /// Fallback image.
    pub default_image: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            standalone_image: None,
            magic_dns: None,
            txt_key: "containerbay".to_string(),
            default_image: "ghcr.io/containerbay/containerbay.io:latest".to_string(),
        }
    }
}

/// Maps requests to images.
pub struct Resolver {
    config: ResolverConfig,
    /// Normalized magic DNS suffix with a leading dot.
    dns_suffix: Option<String>,
    txt: Arc<dyn TxtLookup>,
}

impl Resolver {
    pub fn new(config: ResolverConfig, txt: Arc<dyn TxtLookup>) -> Self {
        let dns_suffix = config
            .magic_dns
            .as_deref()
            .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .map(|s| format!(".{s}"));

        Self {
            config,
            dns_suffix,
            txt,
        }
    }

    /// Resolve a request from its `Host` header and URL path.
    pub async fn resolve(&self, host: Option<&str>, path: &str) -> Resolution {
        if let Some(image) = &self.config.standalone_image {
            return Resolution::rooted(image.clone(), Strategy::Standalone);
        }

        if let Some(resolution) = resolve_path(path) {
            return resolution;
        }

        let host = host.map(strip_port).map(str::to_ascii_lowercase);
        if let Some(host) = host.as_deref().filter(|h| !h.is_empty()) {
            if let Some(suffix) = &self.dns_suffix {
                debug!(host = %host, suffix = %suffix, "Trying magic DNS");
                if let Some(image) = resolve_magic_dns(host, suffix) {
                    info!(host = %host, image = %image, "magicDNS resolved");
                    return Resolution::rooted(image, Strategy::MagicDns);
                }
            }

            match self.resolve_txt(host).await {
                Ok(Some(image)) => {
                    info!(host = %host, image = %image, "TXT record resolved");
                    return Resolution::rooted(image, Strategy::TxtRecord);
                }
                Ok(None) => debug!(host = %host, "No matching TXT record"),
                Err(e) => debug!(host = %host, error = %e, "TXT lookup failed"),
            }
        }

        Resolution::rooted(self.config.default_image.clone(), Strategy::Default)
    }

    async fn resolve_txt(&self, host: &str) -> Result<Option<String>, ResolveError> {
        debug!(host = %host, "Querying TXT records");
        let records = self.txt.lookup_txt(host).await?;
        debug!(host = %host, records = ?records, "TXT records found");
        Ok(select_txt_record(&records, &self.config.txt_key))
    }
}

/// `/<registry>/<org>/<container>/<rest>` -> `registry/org/container`.
pub fn resolve_path(path: &str) -> Option<Resolution> {
    let mut parts = path.strip_prefix('/')?.splitn(4, '/');
    let registry = parts.next().filter(|s| !s.is_empty())?;
    let org = parts.next().filter(|s| !s.is_empty())?;
    let container = parts.next().filter(|s| !s.is_empty())?;
    // The trailing slash (and whatever follows) must be present
    parts.next()?;

    let image = format!("{registry}/{org}/{container}");
    Some(Resolution {
        strip_prefix: format!("/{image}/"),
        image,
        strategy: Strategy::Path,
    })
}

/// `<registry...>.<org>.<container>.<tag><suffix>` -> `registry/org/container:tag`.
///
/// `suffix` carries its leading dot.
pub fn resolve_magic_dns(host: &str, suffix: &str) -> Option<String> {
    let labels = host.strip_suffix(suffix)?;
    let mut fields: Vec<&str> = labels.split('.').collect();
    if fields.len() < 4 {
        return None;
    }

    let tag = fields.pop()?;
    let container = fields.pop()?;
    let org = fields.pop()?;
    let registry = fields.join(".");

    Some(format!("{registry}/{org}/{container}:{tag}"))
}

/// First record whose first token is `<key>=<image>`.
fn select_txt_record(records: &[String], key: &str) -> Option<String> {
    records.iter().find_map(|record| {
        let token = record.split(' ').next()?;
        let (k, v) = token.split_once('=')?;
        (k == key && !v.is_empty()).then(|| v.to_string())
    })
}

/// Drop a `:port` from a `Host` header value.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split_once(']').map_or(host, |(addr, _)| addr);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
