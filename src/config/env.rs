//! Environment variable and config file support for [`RuntimeConfig`].
//!
//! # Configuration Precedence
//!
//! Builders apply settings in call order. Started from a file, then given
//! `with_env_overrides`, then builder methods, precedence is (highest first):
//!
//! 1. **Programmatic**: values set via builder methods (`worker_threads(4)`)
//! 2. **Environment variables**: values from `PARCELRT_*` env vars
//! 3. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 4. **Defaults**: built-in defaults from [`RuntimeConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `PARCELRT_WORKER_THREADS` | `usize` | `worker_threads` |
//! | `PARCELRT_THREAD_STACK_SIZE` | `usize` | `thread_stack_size` |
//! | `PARCELRT_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `PARCELRT_REPLY_TIMEOUT_MS` | `u64` | `reply_timeout` |
//! | `PARCELRT_POLL_INTERVAL_US` | `u64` | `poll_interval` |
//! | `PARCELRT_MAX_FRAME_LENGTH` | `usize` | `max_frame_length` |
//! | `PARCELRT_FORWARD_TO_CONSOLE` | `bool` | `forward_to_console` |

use std::time::Duration;

use super::RuntimeConfig;
use crate::error::{Error, Result};

/// Environment variable name for worker thread count.
pub const ENV_WORKER_THREADS: &str = "PARCELRT_WORKER_THREADS";
/// Environment variable name for thread stack size.
pub const ENV_THREAD_STACK_SIZE: &str = "PARCELRT_THREAD_STACK_SIZE";
/// Environment variable name for thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "PARCELRT_THREAD_NAME_PREFIX";
/// Environment variable name for the reply timeout in milliseconds.
pub const ENV_REPLY_TIMEOUT_MS: &str = "PARCELRT_REPLY_TIMEOUT_MS";
/// Environment variable name for the idle poll interval in microseconds.
pub const ENV_POLL_INTERVAL_US: &str = "PARCELRT_POLL_INTERVAL_US";
/// Environment variable name for the maximum parcel frame length.
pub const ENV_MAX_FRAME_LENGTH: &str = "PARCELRT_MAX_FRAME_LENGTH";
/// Environment variable name for console forwarding of diagnostics.
pub const ENV_FORWARD_TO_CONSOLE: &str = "PARCELRT_FORWARD_TO_CONSOLE";

/// Apply environment variable overrides to a [`RuntimeConfig`].
///
/// Only variables that are set in the environment are applied.
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<()> {
    if let Some(val) = read_env(ENV_WORKER_THREADS) {
        config.worker_threads = parse_usize(ENV_WORKER_THREADS, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_STACK_SIZE) {
        config.thread_stack_size = parse_usize(ENV_THREAD_STACK_SIZE, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.thread_name_prefix = val;
    }
    if let Some(val) = read_env(ENV_REPLY_TIMEOUT_MS) {
        config.reply_timeout = Duration::from_millis(parse_u64(ENV_REPLY_TIMEOUT_MS, &val)?);
    }
    if let Some(val) = read_env(ENV_POLL_INTERVAL_US) {
        config.poll_interval = Duration::from_micros(parse_u64(ENV_POLL_INTERVAL_US, &val)?);
    }
    if let Some(val) = read_env(ENV_MAX_FRAME_LENGTH) {
        config.max_frame_length = parse_usize(ENV_MAX_FRAME_LENGTH, &val)?;
    }
    if let Some(val) = read_env(ENV_FORWARD_TO_CONSOLE) {
        config.forward_to_console = parse_bool(ENV_FORWARD_TO_CONSOLE, &val)?;
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var_name: &str, val: &str) -> Result<usize> {
    val.trim().parse::<usize>().map_err(|e| {
        Error::config(format!(
            "invalid value for {var_name}: expected unsigned integer, got {val:?} ({e})"
        ))
    })
}

fn parse_u64(var_name: &str, val: &str) -> Result<u64> {
    val.trim().parse::<u64>().map_err(|e| {
        Error::config(format!(
            "invalid value for {var_name}: expected u64, got {val:?} ({e})"
        ))
    })
}

fn parse_bool(var_name: &str, val: &str) -> Result<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!(
            "invalid value for {var_name}: expected bool (true/false/1/0/yes/no), got {val:?}"
        ))),
    }
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable runtime configuration.
///
/// ```toml
/// [pool]
/// worker_threads = 4
/// thread_stack_size = 2097152
/// thread_name_prefix = "myapp-worker"
/// poll_interval_us = 500
///
/// [dispatch]
/// reply_timeout_ms = 10000
/// forward_to_console = true
///
/// [transport]
/// max_frame_length = 1048576
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct RuntimeTomlConfig {
    /// Worker pool settings.
    #[serde(default)]
    pub pool: PoolToml,
    /// Dispatcher settings.
    #[serde(default)]
    pub dispatch: DispatchToml,
    /// Parcelport settings.
    #[serde(default)]
    pub transport: TransportToml,
}

/// Pool section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct PoolToml {
    /// Number of worker threads.
    pub worker_threads: Option<usize>,
    /// Stack size per worker thread in bytes.
    pub thread_stack_size: Option<usize>,
    /// Name prefix for worker threads.
    pub thread_name_prefix: Option<String>,
    /// Idle park timeout while pollers are registered, in microseconds.
    pub poll_interval_us: Option<u64>,
}

/// Dispatch section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct DispatchToml {
    /// Reply timeout in milliseconds.
    pub reply_timeout_ms: Option<u64>,
    /// Forward error-sink reports to the console locality.
    pub forward_to_console: Option<bool>,
}

/// Transport section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct TransportToml {
    /// Maximum parcel frame length in bytes.
    pub max_frame_length: Option<usize>,
}

/// Apply a parsed TOML config to a [`RuntimeConfig`].
///
/// Only fields that are `Some` in the TOML struct override the config.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(config: &mut RuntimeConfig, toml: &RuntimeTomlConfig) {
    if let Some(v) = toml.pool.worker_threads {
        config.worker_threads = v;
    }
    if let Some(v) = toml.pool.thread_stack_size {
        config.thread_stack_size = v;
    }
    if let Some(ref v) = toml.pool.thread_name_prefix {
        config.thread_name_prefix.clone_from(v);
    }
    if let Some(v) = toml.pool.poll_interval_us {
        config.poll_interval = Duration::from_micros(v);
    }
    if let Some(v) = toml.dispatch.reply_timeout_ms {
        config.reply_timeout = Duration::from_millis(v);
    }
    if let Some(v) = toml.dispatch.forward_to_console {
        config.forward_to_console = v;
    }
    if let Some(v) = toml.transport.max_frame_length {
        config.max_frame_length = v;
    }
}

/// Parse a TOML string into a [`RuntimeTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<RuntimeTomlConfig> {
    toml::from_str(toml_str)
        .map_err(|e| Error::config(format!("failed to parse TOML config: {e}")))
}

/// Read and parse a TOML file into a [`RuntimeTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<RuntimeTomlConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!(
            "failed to read config file {}: {e}",
            path.display()
        ))
    })?;
    parse_toml_str(&content)
}

// =========================================================================
// Tests
// =========================================================================
