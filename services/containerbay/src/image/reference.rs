//! Image reference parsing.
//!
//! Accepts the usual `[registry/]repository[:tag][@sha256:hex]` forms:
//! - `alpine` -> (docker.io, library/alpine, latest)
//! - `ghcr.io/org/site:v1` -> (ghcr.io, org/site, v1)
//! - `localhost:5000/site@sha256:...` -> (localhost:5000, site, digest)

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Registry used when a reference does not name one.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when a reference names neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

const MAX_TAG_LEN: usize = 128;

/// Errors from parsing an image reference.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("empty image reference")]
    Empty,

    #[error("invalid registry '{0}'")]
    InvalidRegistry(String),

    #[error("invalid repository '{0}'")]
    InvalidRepository(String),

    #[error("invalid tag '{0}'")]
    InvalidTag(String),

    #[error("invalid digest '{0}'")]
    InvalidDigest(String),
}

/// A parsed, validated image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference string.
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (name_part, digest) = match input.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest)?;
                (name, Some(digest.to_string()))
            }
            None => (input, None),
        };

        // A ':' after the last '/' starts the tag, earlier ones belong to a registry port.
        let (name_part, tag) = match name_part.rfind(':') {
            Some(idx) if !name_part[idx..].contains('/') => {
                let tag = &name_part[idx + 1..];
                validate_tag(tag)?;
                (&name_part[..idx], Some(tag.to_string()))
            }
            _ => (name_part, None),
        };

        let (registry, repository) = match name_part.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name_part.to_string()),
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{name_part}")),
        };

        validate_registry(&registry)?;
        validate_repository(&repository)?;

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry host (with optional port).
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Tag, defaulting to `latest`.
    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// Pinned digest, if any.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The manifest reference to ask the registry for: the digest when pinned, else the tag.
    pub fn manifest_reference(&self) -> &str {
        self.digest().unwrap_or_else(|| self.tag())
    }

    /// Same image pinned to `digest`.
    pub fn pinned(&self, digest: &str) -> Result<Self, ReferenceError> {
        validate_digest(digest)?;
        Ok(Self {
            digest: Some(digest.to_string()),
            ..self.clone()
        })
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match (&self.tag, &self.digest) {
            (Some(tag), _) => write!(f, ":{tag}")?,
            (None, None) => write!(f, ":{DEFAULT_TAG}")?,
            (None, Some(_)) => {}
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn validate_registry(registry: &str) -> Result<(), ReferenceError> {
    let (host, port) = match registry.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (registry, None),
    };

    let host_ok = !host.is_empty()
        && !host.starts_with(['.', '-'])
        && !host.ends_with(['.', '-'])
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    let port_ok = port.is_none_or(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));

    if host_ok && port_ok {
        Ok(())
    } else {
        Err(ReferenceError::InvalidRegistry(registry.to_string()))
    }
}

fn validate_repository(repository: &str) -> Result<(), ReferenceError> {
    if !repository.is_empty() && repository.split('/').all(is_path_component) {
        Ok(())
    } else {
        Err(ReferenceError::InvalidRepository(repository.to_string()))
    }
}

/// `[a-z0-9]+` runs joined by `.`, `_`, `__` or any number of `-`.
fn is_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    if bytes.is_empty() || !is_alnum(bytes[0]) || !is_alnum(bytes[bytes.len() - 1]) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if is_alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !is_alnum(bytes[i]) {
            i += 1;
        }
        let separator = &component[start..i];
        let valid = matches!(separator, "." | "_" | "__") || separator.bytes().all(|b| b == b'-');
        if !valid {
            return false;
        }
    }
    true
}

fn validate_tag(tag: &str) -> Result<(), ReferenceError> {
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if first_ok && rest_ok && tag.len() <= MAX_TAG_LEN {
        Ok(())
    } else {
        Err(ReferenceError::InvalidTag(tag.to_string()))
    }
}

fn validate_digest(digest: &str) -> Result<(), ReferenceError> {
    match digest.strip_prefix("sha256:") {
        Some(hex) if is_sha256_hex(hex) => Ok(()),
        _ => Err(ReferenceError::InvalidDigest(digest.to_string())),
    }
}

/// 64 lowercase hex characters.
pub(crate) fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
