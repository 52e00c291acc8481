//! Identifier types for runtime entities.
//!
//! These types provide type-safe identifiers for the entities the action layer
//! addresses: localities, global ids, actions, and in-flight invocations.
//! None of them interpret their payload beyond equality, ordering, and display;
//! a parcelport maps a [`LocalityId`] to an actual transport handle.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Localities
// ---------------------------------------------------------------------------

/// Identifier of one participating process (a *locality*).
///
/// Localities are addressable independently of the physical transport. The
/// locality with id `0` is the console: the process that owns user-facing
/// output and receives forwarded diagnostics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalityId(u32);

impl LocalityId {
    /// The console locality.
    pub const CONSOLE: Self = Self(0);

    /// Creates a locality id from its raw number.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw locality number.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns true if this is the console locality.
    #[must_use]
    pub const fn is_console(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for LocalityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalityId({})", self.0)
    }
}

impl fmt::Display for LocalityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "locality#{}", self.0)
    }
}

impl From<u32> for LocalityId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// A global id: the locality that hosts an object plus the object's number
/// within that locality.
///
/// Object `0` names the locality itself, which is the target for plain
/// (non-component) actions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gid {
    locality: LocalityId,
    object: u64,
}

impl Gid {
    /// Creates a global id.
    #[must_use]
    pub const fn new(locality: LocalityId, object: u64) -> Self {
        Self { locality, object }
    }

    /// The global id of a locality itself.
    #[must_use]
    pub const fn locality_root(locality: LocalityId) -> Self {
        Self {
            locality,
            object: 0,
        }
    }

    /// Returns the hosting locality.
    #[must_use]
    pub const fn locality(self) -> LocalityId {
        self.locality
    }

    /// Returns the object number within the hosting locality.
    #[must_use]
    pub const fn object(self) -> u64 {
        self.object
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({}:{:#x})", self.locality.0, self.object)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}:{:#x}}}", self.locality.0, self.object)
    }
}

impl From<LocalityId> for Gid {
    fn from(locality: LocalityId) -> Self {
        Self::locality_root(locality)
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Name of a registered action.
///
/// Action ids are plain string tokens, stable across restarts of one binary.
/// Every locality that runs the same binary registers the same ids, which is
/// what lets a parcel name its handler.
///
/// # Example
///
/// ```
/// use parcelrt::types::ActionId;
///
/// let id = ActionId::new("app::add");
/// assert_eq!(id.as_str(), "app::add");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(String);

impl ActionId {
    /// Creates an action id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the action id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ActionId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Matches a reply parcel to the outstanding invocation that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Allocates a new process-unique correlation id.
    #[must_use]
    pub fn next() -> Self {
        Self(CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates a correlation id from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw numeric identifier.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}
