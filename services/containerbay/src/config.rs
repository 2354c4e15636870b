//! Server configuration.
//!
//! Every option can come from the command line or from a `CONTAINERBAY_*`
//! environment variable. [`Cli::into_config`] turns the raw arguments into
//! the typed settings the components take.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use crate::cleanup::CleanupConfig;
use crate::image::{ImageReference, RegistryCredentials};
use crate::resolve::ResolverConfig;
use crate::scheduler::{QueuePolicy, SchedulerConfig};

/// containerbay - serve static websites straight out of container images
#[derive(Debug, Parser)]
#[command(name = "containerbay", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub options: ServerOptions,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve multiple images, picked by path or host name
    #[command(visible_alias = "r")]
    Run,

    /// Serve a single image for every request
    #[command(visible_alias = "s")]
    Standalone {
        /// Image to serve (e.g. ghcr.io/org/site:latest)
        image: String,
    },
}

#[derive(Debug, Clone, Args)]
pub struct ServerOptions {
    /// Listening address
    #[arg(long, global = true, env = "CONTAINERBAY_LISTENADDR", default_value = ":8080")]
    pub address: String,

    /// Magic DNS suffix (e.g. example.com)
    #[arg(long, global = true, env = "CONTAINERBAY_MAGICDNS")]
    pub dns: Option<String>,

    /// Key of `<key>=<image>` DNS TXT records
    #[arg(
        long,
        global = true,
        env = "CONTAINERBAY_TXTKEY",
        default_value = "containerbay"
    )]
    pub dns_txt_key: String,

    /// Image served when nothing else matches
    #[arg(
        long,
        global = true,
        env = "CONTAINERBAY_DEFAULTIMAGE",
        default_value = "ghcr.io/containerbay/containerbay.io:latest"
    )]
    pub default_image: String,

    /// Cache store directory
    #[arg(
        long,
        global = true,
        env = "CONTAINERBAY_CACHEDIR",
        default_value = "/tmp/containerbay"
    )]
    pub store: PathBuf,

    /// Maximum image size to serve (e.g. 500MB, 1GiB); unset for unlimited
    #[arg(long, global = true, env = "CONTAINERBAY_MAXSIZE", value_parser = parse_size)]
    pub max_size: Option<u64>,

    /// Cache cleanup interval (e.g. 10m, 2h); unset to disable
    #[arg(long, global = true, env = "CONTAINERBAY_CLEANUPINTERVAL", value_parser = parse_duration)]
    pub cleanup: Option<Duration>,

    /// Random deviation applied to each cleanup interval
    #[arg(
        long,
        global = true,
        env = "CONTAINERBAY_CLEANUPJITTER",
        value_parser = parse_duration,
        default_value = "10s"
    )]
    pub cleanup_jitter: Duration,

    /// Number of download workers
    #[arg(long, global = true, env = "CONTAINERBAY_WORKERS", default_value_t = 10)]
    pub workers: usize,

    /// Capacity of the download queue
    #[arg(long, global = true, env = "CONTAINERBAY_POOLSIZE", default_value_t = 0)]
    pub pool: usize,

    /// What to do with new downloads when the queue is full
    #[arg(
        long,
        global = true,
        env = "CONTAINERBAY_QUEUEPOLICY",
        value_enum,
        default_value_t = QueuePolicy::Block
    )]
    pub queue_policy: QueuePolicy,

    /// Registry username
    #[arg(long, global = true, env = "CONTAINERBAY_REGISTRY_USERNAME")]
    pub registry_username: Option<String>,

    /// Registry password
    #[arg(
        long,
        global = true,
        env = "CONTAINERBAY_REGISTRY_PASSWORD",
        hide_env_values = true
    )]
    pub registry_password: Option<String>,

    /// Registry bearer token
    #[arg(
        long,
        global = true,
        env = "CONTAINERBAY_REGISTRY_TOKEN",
        hide_env_values = true
    )]
    pub registry_token: Option<String>,

    /// Compress responses with gzip
    #[arg(long, global = true, env = "CONTAINERBAY_GZIP")]
    pub gzip: bool,

    /// Enable debug logging
    #[arg(long, global = true, env = "CONTAINERBAY_DEBUG")]
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "CONTAINERBAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Settings for a running server.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub store: PathBuf,
    /// Maximum total layer size in bytes, 0 for unlimited.
    pub max_size: u64,
    pub resolver: ResolverConfig,
    pub scheduler: SchedulerConfig,
    pub cleanup: CleanupConfig,
    pub credentials: RegistryCredentials,
    pub gzip: bool,
    pub log_level: String,
}

impl Cli {
    /// Validate the arguments and build the server settings.
    pub fn into_config(self) -> Result<Config> {
        let options = self.options;

        let standalone_image = match self.command {
            Command::Run => None,
            Command::Standalone { image } => {
                ImageReference::parse(&image)
                    .with_context(|| format!("Invalid standalone image '{image}'"))?;
                Some(image)
            }
        };

        let log_level = if options.debug {
            "debug".to_string()
        } else {
            options.log_level
        };

        Ok(Config {
            listen_addr: normalize_address(&options.address),
            store: options.store,
            max_size: options.max_size.unwrap_or(0),
            resolver: ResolverConfig {
                standalone_image,
                magic_dns: options.dns.filter(|s| !s.trim().is_empty()),
                txt_key: options.dns_txt_key,
                default_image: options.default_image,
            },
            scheduler: SchedulerConfig {
                workers: options.workers,
                queue_capacity: options.pool,
                policy: options.queue_policy,
            },
            cleanup: CleanupConfig {
                interval: options.cleanup.unwrap_or(Duration::ZERO),
                jitter: options.cleanup_jitter,
            },
            credentials: RegistryCredentials {
                username: options.registry_username,
                password: options.registry_password,
                token: options.registry_token,
            },
            gzip: options.gzip,
            log_level,
        })
    }
}

/// `:8080` listens on every interface.
fn normalize_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

/// Errors from parsing human-readable values.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid size '{0}'")]
    Size(String),

    #[error("invalid size unit '{unit}' in '{input}'")]
    SizeUnit { input: String, unit: String },

    #[error("invalid duration '{input}': {source}")]
    Duration {
        input: String,
        #[source]
        source: humantime::DurationError,
    },
}

/// Parse a human-readable byte size such as `500MB`, `1.5 GiB` or `1024`.
///
/// Decimal units (`kB`, `MB`, ...) are powers of 1000 and binary units
/// (`KiB`, `MiB`, ...) powers of 1024. Units are case-insensitive. An empty
/// string or `0` means unlimited and parses to 0.
pub fn parse_size(input: &str) -> Result<u64, ParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| ParseError::Size(input.to_string()))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "t" | "tb" => 1_000_000_000_000,
        "ki" | "kib" => 1 << 10,
        "mi" | "mib" => 1 << 20,
        "gi" | "gib" => 1 << 30,
        "ti" | "tib" => 1 << 40,
        unit => {
            return Err(ParseError::SizeUnit {
                input: input.to_string(),
                unit: unit.to_string(),
            })
        }
    };

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(ParseError::Size(input.to_string()));
    }
    Ok(bytes as u64)
}

/// Parse a human-readable duration such as `10m` or `2h 30m`.
///
/// An empty string or `0` parses to zero, which disables whatever it
/// configures.
pub fn parse_duration(input: &str) -> Result<Duration, ParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    humantime::parse_duration(trimmed).map_err(|source| ParseError::Duration {
        input: input.to_string(),
        source,
    })
}
