//! Runtime builder and handle.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::action::{
    Action, ActionContext, ActionRegistryBuilder, Dispatcher, Payload,
};
use crate::config::{env, RuntimeConfig};
use crate::error::{Error, Result};
use crate::error_sink::{register_console_sink, DiagnosticHandler, DiagnosticRecord, ErrorSink, HandlerId};
use crate::event::EventPoller;
use crate::executor::{PollerId, PoolHandle, SharedExecutor, ThreadPool, ThreadPoolOptions};
use crate::future::SharedFuture;
use crate::parcel::{ContinuationTarget, Parcelport};
use crate::tracing_compat::{debug, info, warn};
use crate::types::{ActionId, Gid, LocalityId};

/// How long shutdown waits for worker threads to exit.
const POOL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type PortFactory = Box<dyn FnOnce(&RuntimeConfig) -> Result<Arc<dyn Parcelport>> + Send>;

enum PortSource {
    Local,
    Ready(Arc<dyn Parcelport>),
    Factory(PortFactory),
}

/// Builder for one locality's runtime.
///
/// Every method consumes the builder and returns it, so configuration
/// chains. Action registrations that can collide return `Result<Self>`.
pub struct RuntimeBuilder {
    locality: LocalityId,
    config: RuntimeConfig,
    actions: ActionRegistryBuilder,
    port: PortSource,
    handlers: Vec<DiagnosticHandler>,
}

impl RuntimeBuilder {
    /// Create a builder for `locality` with default configuration.
    #[must_use]
    pub fn new(locality: LocalityId) -> Self {
        Self {
            locality,
            config: RuntimeConfig::default(),
            actions: ActionRegistryBuilder::new(),
            port: PortSource::Local,
            handlers: Vec::new(),
        }
    }

    /// Builder for the console locality.
    #[must_use]
    pub fn console() -> Self {
        Self::new(LocalityId::CONSOLE)
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of worker threads.
    #[must_use]
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config.worker_threads = n;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    /// Set how long a remote call waits for its reply.
    #[must_use]
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.reply_timeout = timeout;
        self
    }

    /// Set the idle worker park timeout while pollers are registered.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the largest parcel frame the parcelport factory should accept.
    #[must_use]
    pub fn max_frame_length(mut self, len: usize) -> Self {
        self.config.max_frame_length = len;
        self
    }

    /// Forward every error-sink report to the console locality.
    #[must_use]
    pub fn forward_to_console(mut self, forward: bool) -> Self {
        self.config.forward_to_console = forward;
        self
    }

    /// Register a callback to run when a worker thread starts.
    #[must_use]
    pub fn on_thread_start<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.config.on_thread_start = Some(Arc::new(f));
        self
    }

    /// Register a callback to run when a worker thread stops.
    #[must_use]
    pub fn on_thread_stop<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.config.on_thread_stop = Some(Arc::new(f));
        self
    }

    /// Apply `PARCELRT_*` environment variable overrides.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        env::apply_env_overrides(&mut self.config)?;
        Ok(self)
    }

    /// Create a builder for `locality` from a TOML configuration file.
    #[cfg(feature = "config-file")]
    pub fn from_toml(locality: LocalityId, path: impl AsRef<std::path::Path>) -> Result<Self> {
        let toml = env::parse_toml_file(path.as_ref())?;
        let mut builder = Self::new(locality);
        env::apply_toml_config(&mut builder.config, &toml);
        Ok(builder)
    }

    /// Create a builder for `locality` from a TOML string.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(locality: LocalityId, toml: &str) -> Result<Self> {
        let parsed = env::parse_toml_str(toml)?;
        let mut builder = Self::new(locality);
        env::apply_toml_config(&mut builder.config, &parsed);
        Ok(builder)
    }

    /// Register a typed action.
    pub fn register<A: Action>(mut self) -> Result<Self> {
        self.actions.register::<A>()?;
        Ok(self)
    }

    /// Register a synchronous closure as an action.
    pub fn register_fn<Args, Out, F>(mut self, id: impl Into<ActionId>, f: F) -> Result<Self>
    where
        Args: DeserializeOwned + Send + 'static,
        Out: Serialize + 'static,
        F: Fn(&ActionContext, Args) -> Result<Out> + Send + Sync + 'static,
    {
        self.actions.register_fn(id, f)?;
        Ok(self)
    }

    /// Register a future-returning closure as an action.
    pub fn register_async_fn<Args, Out, F>(mut self, id: impl Into<ActionId>, f: F) -> Result<Self>
    where
        Args: DeserializeOwned + Send + 'static,
        Out: Serialize + Clone + Send + Sync + 'static,
        F: Fn(&ActionContext, Args) -> SharedFuture<Out> + Send + Sync + 'static,
    {
        self.actions.register_async_fn(id, f)?;
        Ok(self)
    }

    /// Run arbitrary registrations against the underlying registry builder.
    pub fn actions<F>(mut self, f: F) -> Result<Self>
    where
        F: FnOnce(&mut ActionRegistryBuilder) -> Result<()>,
    {
        f(&mut self.actions)?;
        Ok(self)
    }

    /// Use `port` for remote traffic.
    #[must_use]
    pub fn parcelport(mut self, port: Arc<dyn Parcelport>) -> Self {
        self.port = PortSource::Ready(port);
        self
    }

    /// Create the parcelport during `build`, after the configuration is
    /// final.
    #[must_use]
    pub fn parcelport_with<P, F>(mut self, factory: F) -> Self
    where
        P: Parcelport + 'static,
        F: FnOnce(&RuntimeConfig) -> Result<Arc<P>> + Send + 'static,
    {
        self.port = PortSource::Factory(Box::new(move |config: &RuntimeConfig| {
            factory(config).map(|port| port as Arc<dyn Parcelport>)
        }));
        self
    }

    /// Register an error-sink handler installed before anything can fail.
    #[must_use]
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&DiagnosticRecord) + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Build the runtime.
    ///
    /// Initialization order: the registry is frozen, then the error sink,
    /// worker pool, dispatcher and parcelport come up, and finally the
    /// pollers are registered on the pool.
    pub fn build(self) -> Result<Runtime> {
        let Self {
            locality,
            mut config,
            mut actions,
            port,
            handlers,
        } = self;
        config.normalize();

        register_console_sink(&mut actions)?;
        let registry = Arc::new(actions.build());

        let sink = ErrorSink::new(locality);
        for handler in handlers {
            sink.register_shared(handler);
        }

        let pool = ThreadPool::new(ThreadPoolOptions::from_config(&config))?;
        let handle = pool.handle();

        let dispatcher = Dispatcher::new(
            locality,
            Arc::clone(&registry),
            handle.executor(),
            sink.clone(),
            config.reply_timeout,
        );

        let port = match port {
            PortSource::Local => None,
            PortSource::Ready(port) => Some(port),
            PortSource::Factory(factory) => Some(factory(&config)?),
        };
        if let Some(port) = &port {
            if port.locality() != locality {
                return Err(Error::config(format!(
                    "parcelport '{}' serves {} but the runtime is {locality}",
                    port.name(),
                    port.locality()
                )));
            }
            dispatcher.attach_parcelport(Arc::clone(port));
        }

        let events = EventPoller::with_error_sink(sink.clone());
        let pollers = vec![
            handle.register_poller(Arc::new(dispatcher.timeout_sweep())),
            handle.register_poller(Arc::new(events.clone())),
        ];

        if config.forward_to_console && locality != LocalityId::CONSOLE {
            sink.set_forwarder(Some(dispatcher.console_forwarder()));
        }

        info!(
            %locality,
            workers = config.worker_threads,
            actions = registry.len(),
            parcelport = port.as_ref().map_or("none", |p| p.name()),
            "runtime started"
        );

        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                locality,
                config,
                pool,
                dispatcher,
                sink,
                events,
                port,
                pollers: Mutex::new(pollers),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

impl fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("locality", &self.locality)
            .field("config", &self.config)
            .field("actions", &self.actions)
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

/// Runtime instance created from a [`RuntimeBuilder`].
///
/// Clones share one runtime; it shuts down when [`shutdown`](Self::shutdown)
/// is called or the last clone is dropped.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Locality this runtime serves.
    #[must_use]
    pub fn locality(&self) -> LocalityId {
        self.inner.locality
    }

    /// The normalized configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// The error sink.
    #[must_use]
    pub fn error_sink(&self) -> &ErrorSink {
        &self.inner.sink
    }

    /// The external event poller, driven by idle workers.
    #[must_use]
    pub fn events(&self) -> &EventPoller {
        &self.inner.events
    }

    /// Handle to the worker pool.
    #[must_use]
    pub fn pool(&self) -> PoolHandle {
        self.inner.pool.handle()
    }

    /// The worker pool as an executor for continuations.
    #[must_use]
    pub fn executor(&self) -> SharedExecutor {
        self.inner.pool.handle().executor()
    }

    /// The parcelport, if the runtime has one.
    #[must_use]
    pub fn parcelport(&self) -> Option<&Arc<dyn Parcelport>> {
        self.inner.port.as_ref()
    }

    /// Registers an error-sink handler.
    pub fn register_error_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&DiagnosticRecord) + Send + Sync + 'static,
    {
        self.inner.sink.register_handler(handler)
    }

    /// Invokes `A` at `destination`.
    pub fn invoke<A: Action>(&self, destination: impl Into<Gid>, args: A::Args) -> SharedFuture<A::Output> {
        self.inner.dispatcher.invoke::<A>(destination, args)
    }

    /// Invokes the action registered as `action`.
    pub fn invoke_by_id<Args, T>(
        &self,
        action: impl Into<ActionId>,
        destination: impl Into<Gid>,
        args: &Args,
    ) -> SharedFuture<T>
    where
        Args: Serialize + ?Sized,
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.inner.dispatcher.invoke_by_id(action, destination, args)
    }

    /// Invokes `action` with encoded arguments.
    pub fn invoke_raw(&self, action: &ActionId, arguments: Payload, destination: impl Into<Gid>) -> SharedFuture<Payload> {
        self.inner.dispatcher.invoke_raw(action, arguments, destination)
    }

    /// Invokes `A` at `destination`, delivering the result to `target`.
    pub fn invoke_with_continuation<A: Action>(
        &self,
        destination: impl Into<Gid>,
        args: A::Args,
        target: ContinuationTarget,
    ) -> Result<()> {
        self.inner
            .dispatcher
            .invoke_with_continuation::<A>(destination, args, target)
    }

    /// Runs `A` at `destination` without waiting for its result.
    pub fn apply<A: Action>(&self, destination: impl Into<Gid>, args: A::Args) -> Result<()> {
        self.inner.dispatcher.apply::<A>(destination, args)
    }

    /// Tears the runtime down: pollers are unregistered, outstanding calls
    /// fail with `Shutdown`, the parcelport closes and the pool stops.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Returns true once [`shutdown`](Self::shutdown) ran.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("locality", &self.inner.locality)
            .field("dispatcher", &self.inner.dispatcher)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

struct RuntimeInner {
    locality: LocalityId,
    config: RuntimeConfig,
    pool: ThreadPool,
    dispatcher: Dispatcher,
    sink: ErrorSink,
    events: EventPoller,
    port: Option<Arc<dyn Parcelport>>,
    pollers: Mutex<Vec<PollerId>>,
    closed: AtomicBool,
}

impl RuntimeInner {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(locality = %self.locality, "runtime shutting down");

        let handle = self.pool.handle();
        for id in self.pollers.lock().drain(..) {
            handle.unregister_poller(id);
        }
        let cancelled = self.events.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "pending events failed at shutdown");
        }

        self.sink.set_forwarder(None);
        self.dispatcher.shutdown();
        if let Some(port) = self.dispatcher.detach_parcelport() {
            port.shutdown();
        }

        if !self.pool.shutdown_and_wait(POOL_SHUTDOWN_TIMEOUT) {
            warn!(locality = %self.locality, "worker pool did not stop cleanly");
        }
        info!(locality = %self.locality, "runtime stopped");
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
