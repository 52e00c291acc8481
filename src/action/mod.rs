//! Actions: named, serializable units of work invocable on any locality.
//!
//! An action is registered under an [`ActionId`] before the runtime starts.
//! The [`Dispatcher`] then runs it locally or ships its encoded arguments to
//! the destination locality and resolves a future with the reply.
//!
//! ```
//! use parcelrt::action::{Action, ActionContext};
//! use parcelrt::error::Result;
//!
//! struct Add;
//!
//! impl Action for Add {
//!     const NAME: &'static str = "demo::add";
//!     type Args = (i64, i64);
//!     type Output = i64;
//!
//!     fn invoke(_ctx: &ActionContext, (a, b): (i64, i64)) -> Result<i64> {
//!         Ok(a + b)
//!     }
//! }
//! ```

mod codec;
mod context;
mod dispatcher;
mod registry;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use codec::Payload;
pub use context::ActionContext;
pub use dispatcher::{Dispatcher, ReplyTimeoutSweep};
pub use registry::{ActionDescriptor, ActionRegistry, ActionRegistryBuilder};

use crate::error::Result;
use crate::types::ActionId;

/// A statically typed action.
pub trait Action: Send + Sync + 'static {
    /// Registered name; must be identical on every locality.
    const NAME: &'static str;

    /// Whether a caller may transfer a continuation to this action.
    const ACCEPTS_CONTINUATION: bool = true;

    /// Argument tuple.
    type Args: Serialize + DeserializeOwned + Send + 'static;

    /// Result value.
    type Output: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Runs the action.
    fn invoke(ctx: &ActionContext, args: Self::Args) -> Result<Self::Output>;

    /// Returns the action id.
    #[must_use]
    fn id() -> ActionId {
        ActionId::new(Self::NAME)
    }
}
