//! Per-invocation context handed to action handlers.

use std::fmt;
use std::sync::Weak;

use super::dispatcher::{Dispatcher, DispatcherInner};
use crate::types::{Gid, LocalityId};

/// Where and on whose behalf an action runs.
///
/// Handlers can reach the local dispatcher through
/// [`dispatcher`](Self::dispatcher) to issue nested invocations.
#[derive(Clone)]
pub struct ActionContext {
    locality: LocalityId,
    target: Gid,
    source: LocalityId,
    dispatcher: Weak<DispatcherInner>,
}

impl ActionContext {
    pub(crate) fn new(
        locality: LocalityId,
        target: Gid,
        source: LocalityId,
        dispatcher: Weak<DispatcherInner>,
    ) -> Self {
        Self {
            locality,
            target,
            source,
            dispatcher,
        }
    }

    /// Locality executing the action.
    #[must_use]
    pub const fn locality(&self) -> LocalityId {
        self.locality
    }

    /// Object the invocation was addressed to.
    #[must_use]
    pub const fn target(&self) -> Gid {
        self.target
    }

    /// Locality that issued the invocation.
    #[must_use]
    pub const fn source(&self) -> LocalityId {
        self.source
    }

    /// Returns true if the invocation came from another locality.
    #[must_use]
    pub fn is_remote_call(&self) -> bool {
        self.source != self.locality
    }

    /// The dispatcher running this action, unless it has been dropped.
    #[must_use]
    pub fn dispatcher(&self) -> Option<Dispatcher> {
        self.dispatcher.upgrade().map(Dispatcher::from_inner)
    }
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("locality", &self.locality)
            .field("target", &self.target)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
