//! Runtime configuration types.
//!
//! These types hold the concrete values that drive one locality's runtime. In
//! most cases you should use [`RuntimeBuilder`](crate::runtime::RuntimeBuilder)
//! rather than creating a [`RuntimeConfig`] directly.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `worker_threads` | available CPU parallelism |
//! | `thread_stack_size` | 2 MiB |
//! | `thread_name_prefix` | `"parcelrt-worker"` |
//! | `reply_timeout` | 30 s |
//! | `poll_interval` | 1 ms |
//! | `max_frame_length` | 8 MiB |
//! | `forward_to_console` | `false` |
//!
//! Values can be overridden from `PARCELRT_*` environment variables and,
//! with the `config-file` feature, from a TOML file; see [`env`].

pub mod env;

use std::sync::Arc;
use std::time::Duration;

/// Default number of seconds a remote call may wait for its reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);
/// Default park timeout for idle workers while pollers are registered.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Default maximum encoded parcel size.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;
const DEFAULT_THREAD_NAME_PREFIX: &str = "parcelrt-worker";

/// Runtime configuration.
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads (default: available parallelism).
    pub worker_threads: usize,
    /// Stack size per worker thread (default: 2MB).
    pub thread_stack_size: usize,
    /// Name prefix for worker threads.
    pub thread_name_prefix: String,
    /// How long a remote call waits for its reply before failing with
    /// `ReplyTimeout`.
    pub reply_timeout: Duration,
    /// Park timeout for idle workers while pollers are registered.
    pub poll_interval: Duration,
    /// Largest parcel frame accepted or produced by a parcelport.
    pub max_frame_length: usize,
    /// Forward every error-sink report to the console locality.
    pub forward_to_console: bool,
    /// Callback executed when a worker thread starts.
    pub on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Callback executed when a worker thread stops.
    pub on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl RuntimeConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.worker_threads == 0 {
            self.worker_threads = 1;
        }
        if self.thread_stack_size == 0 {
            self.thread_stack_size = DEFAULT_STACK_SIZE;
        }
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = DEFAULT_THREAD_NAME_PREFIX.to_string();
        }
        if self.reply_timeout.is_zero() {
            self.reply_timeout = DEFAULT_REPLY_TIMEOUT;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        if self.max_frame_length == 0 {
            self.max_frame_length = DEFAULT_MAX_FRAME_LENGTH;
        }
    }

    pub(crate) fn default_worker_threads() -> usize {
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .max(1)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: Self::default_worker_threads(),
            thread_stack_size: DEFAULT_STACK_SIZE,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            forward_to_console: false,
            on_thread_start: None,
            on_thread_stop: None,
        }
    }
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("worker_threads", &self.worker_threads)
            .field("thread_stack_size", &self.thread_stack_size)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("reply_timeout", &self.reply_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("max_frame_length", &self.max_frame_length)
            .field("forward_to_console", &self.forward_to_console)
            .finish_non_exhaustive()
    }
}
