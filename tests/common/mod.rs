#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use parcelrt::action::{Action, ActionContext, ActionRegistryBuilder};
use parcelrt::error::{Error, Result};
use parcelrt::error_sink::DiagnosticRecord;
use parcelrt::executor::PoolHandle;
use parcelrt::parcel::InProcessFabric;
use parcelrt::runtime::{Runtime, RuntimeBuilder};
use parcelrt::types::LocalityId;
use parking_lot::Mutex;
use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED5EED;

/// Upper bound for waits on work running on other threads.
pub const TEST_WAIT: Duration = Duration::from_secs(5);

const PROPTEST_SEED_ENV: &str = "PARCELRT_PROPTEST_SEED";

/// Build a ProptestConfig with deterministic seed support for CI.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    let mut config = ProptestConfig::with_cases(cases);
    if matches!(config.rng_seed, RngSeed::Random) {
        if let Some(seed) = read_proptest_seed() {
            config.rng_seed = RngSeed::Fixed(seed);
        }
    }
    config
}

fn read_proptest_seed() -> Option<u64> {
    if let Ok(value) = std::env::var(PROPTEST_SEED_ENV) {
        return value.parse::<u64>().ok();
    }
    // If CI is set and no explicit seed is provided, use a fixed seed.
    if std::env::var("CI").is_ok() {
        return Some(DEFAULT_PROPTEST_SEED);
    }
    None
}

/// Initialize test logging with trace-level output.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Spins until `cond` holds or [`TEST_WAIT`] elapses. Returns the final value
/// of `cond`.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TEST_WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Keeps resubmitting itself to `pool` until `stop` is set, so the queue
/// never drains.
pub fn keep_busy(pool: PoolHandle, stop: Arc<AtomicBool>) {
    if stop.load(Ordering::Acquire) {
        return;
    }
    let next = pool.clone();
    pool.spawn(move || keep_busy(next, stop));
}

/// Error-sink handler that records every diagnostic it sees.
#[derive(Clone, Default)]
pub struct SinkRecorder {
    records: Arc<Mutex<Vec<DiagnosticRecord>>>,
}

impl SinkRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler closure feeding this recorder.
    pub fn handler(&self) -> impl Fn(&DiagnosticRecord) + Send + Sync + 'static {
        let records = Arc::clone(&self.records);
        move |record: &DiagnosticRecord| records.lock().push(record.clone())
    }

    /// Snapshot of the recorded diagnostics.
    #[must_use]
    pub fn records(&self) -> Vec<DiagnosticRecord> {
        self.records.lock().clone()
    }

    /// Number of recorded diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}

/// `add(a, b)`, registered on every test locality.
pub struct Add;

impl Action for Add {
    const NAME: &'static str = "test::add";
    type Args = (i64, i64);
    type Output = i64;

    fn invoke(_ctx: &ActionContext, (a, b): (i64, i64)) -> Result<i64> {
        Ok(a + b)
    }
}

/// Always fails with a user error carrying the argument.
pub struct Fail;

impl Action for Fail {
    const NAME: &'static str = "test::fail";
    type Args = String;
    type Output = ();

    fn invoke(_ctx: &ActionContext, reason: String) -> Result<()> {
        Err(Error::user(reason))
    }
}

/// Registers [`Add`] and [`Fail`].
pub fn register_common(actions: &mut ActionRegistryBuilder) -> Result<()> {
    actions.register::<Add>()?;
    actions.register::<Fail>()?;
    Ok(())
}

/// Runtimes for several localities joined through one in-process fabric.
pub struct Cluster {
    /// The shared fabric, for fault injection.
    pub fabric: InProcessFabric,
    /// One runtime per locality, indexed by locality id.
    pub nodes: Vec<Runtime>,
    /// One sink recorder per locality.
    pub sinks: Vec<SinkRecorder>,
}

impl Cluster {
    /// Starts `n` localities (0..n) with the common actions plus whatever
    /// `extra` registers, all with the given reply timeout.
    pub fn start<F>(n: u32, reply_timeout: Duration, extra: F) -> Self
    where
        F: Fn(&mut ActionRegistryBuilder) -> Result<()>,
    {
        Self::start_with(n, extra, |builder| builder.reply_timeout(reply_timeout))
    }

    /// Like [`start`](Self::start) but lets the caller adjust each builder.
    pub fn start_with<F, C>(n: u32, extra: F, customize: C) -> Self
    where
        F: Fn(&mut ActionRegistryBuilder) -> Result<()>,
        C: Fn(RuntimeBuilder) -> RuntimeBuilder,
    {
        init_test_logging();
        let fabric = InProcessFabric::new();
        let mut nodes = Vec::new();
        let mut sinks = Vec::new();
        for raw in 0..n {
            let locality = LocalityId::new(raw);
            let sink = SinkRecorder::new();
            let port = fabric.join(locality).expect("join fabric");
            let builder = RuntimeBuilder::new(locality)
                .worker_threads(2)
                .error_handler(sink.handler())
                .parcelport(port)
                .actions(|actions| {
                    register_common(actions)?;
                    extra(actions)
                })
                .expect("register actions");
            nodes.push(customize(builder).build().expect("build runtime"));
            sinks.push(sink);
        }
        Self {
            fabric,
            nodes,
            sinks,
        }
    }

    /// Runtime of locality `raw`.
    #[must_use]
    pub fn node(&self, raw: u32) -> &Runtime {
        &self.nodes[raw as usize]
    }

    /// Sink recorder of locality `raw`.
    #[must_use]
    pub fn sink(&self, raw: u32) -> &SinkRecorder {
        &self.sinks[raw as usize]
    }

    /// Shuts every runtime down.
    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
