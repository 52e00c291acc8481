//! One locality's runtime: worker pool, dispatcher, error sink, event poller
//! and parcelport, started and stopped together.
//!
//! # Runtime Builder
//!
//! The runtime is configured with a fluent, move-based builder. Each method
//! consumes `self` and returns an updated builder; registrations that can
//! collide return `Result<Self>` so they chain with `?`.
//!
//! ## Single Locality
//!
//! ```
//! use parcelrt::runtime::RuntimeBuilder;
//! use parcelrt::types::LocalityId;
//!
//! # fn main() -> parcelrt::error::Result<()> {
//! let runtime = RuntimeBuilder::console()
//!     .worker_threads(2)
//!     .register_fn("demo::add", |_, (a, b): (i64, i64)| Ok(a + b))?
//!     .build()?;
//! let sum = runtime.invoke_by_id::<_, i64>("demo::add", LocalityId::CONSOLE, &(2, 3));
//! assert_eq!(sum.get()?, 5);
//! runtime.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Several Localities in One Process
//!
//! ```ignore
//! use parcelrt::parcel::InProcessFabric;
//!
//! let fabric = InProcessFabric::new();
//! let a = RuntimeBuilder::new(LocalityId::new(1))
//!     .parcelport(fabric.join(LocalityId::new(1))?)
//!     .build()?;
//! ```
//!
//! ## Config File + Environment Overrides
//!
//! ```ignore
//! // Requires the `config-file` feature.
//! let runtime = RuntimeBuilder::from_toml(LocalityId::new(1), "config/parcelrt.toml")?
//!     .with_env_overrides()?
//!     .build()?;
//! ```
//!
//! # Lifecycle
//!
//! `build` brings components up in dependency order: action registry (frozen
//! here, including the built-in console sink action), error sink, worker
//! pool, dispatcher, parcelport, then the reply-timeout and event pollers.
//! `shutdown` reverses it. Outstanding remote calls fail with
//! `ErrorKind::Shutdown`; nothing is left waiting.

mod builder;

pub use builder::{Runtime, RuntimeBuilder};
