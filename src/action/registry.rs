//! Registration of action handlers.
//!
//! Handlers are registered on an [`ActionRegistryBuilder`] and frozen into
//! an [`ActionRegistry`]. After `build` the registry never changes, so the
//! dispatcher reads it without taking a lock.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{Action, ActionContext, Payload};
use crate::error::{Error, ErrorKind, Result};
use crate::future::{make_error_future, make_ready_future, SharedFuture};
use crate::types::ActionId;

/// Type-erased handler: decodes its arguments, runs, and encodes the result.
pub(crate) type Handler =
    Arc<dyn Fn(ActionContext, Payload) -> SharedFuture<Payload> + Send + Sync>;

fn ready_or_failed(result: Result<Payload>) -> SharedFuture<Payload> {
    match result {
        Ok(payload) => make_ready_future(payload),
        Err(err) => make_error_future(err),
    }
}

/// A registered action.
#[derive(Clone)]
pub struct ActionDescriptor {
    id: ActionId,
    handler: Handler,
    arguments: &'static str,
    output: &'static str,
    accepts_continuation: bool,
}

impl ActionDescriptor {
    fn new<Args, Out>(id: ActionId, handler: Handler) -> Self {
        Self {
            id,
            handler,
            arguments: std::any::type_name::<Args>(),
            output: std::any::type_name::<Out>(),
            accepts_continuation: true,
        }
    }

    /// The action id.
    #[must_use]
    pub fn id(&self) -> &ActionId {
        &self.id
    }

    /// Type name of the argument tuple.
    #[must_use]
    pub fn argument_type(&self) -> &'static str {
        self.arguments
    }

    /// Type name of the result.
    #[must_use]
    pub fn output_type(&self) -> &'static str {
        self.output
    }

    /// Whether a caller may transfer a continuation to this action.
    #[must_use]
    pub fn accepts_continuation(&self) -> bool {
        self.accepts_continuation
    }

    /// Sets whether a caller may transfer a continuation to this action.
    pub fn set_accepts_continuation(&mut self, accepts: bool) -> &mut Self {
        self.accepts_continuation = accepts;
        self
    }

    pub(crate) fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("id", &self.id)
            .field("arguments", &self.arguments)
            .field("output", &self.output)
            .field("accepts_continuation", &self.accepts_continuation)
            .finish_non_exhaustive()
    }
}

/// Collects action registrations before the runtime starts.
#[derive(Default)]
pub struct ActionRegistryBuilder {
    actions: HashMap<ActionId, ActionDescriptor>,
}

impl ActionRegistryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, descriptor: ActionDescriptor) -> Result<&mut ActionDescriptor> {
        use std::collections::hash_map::Entry;
        match self.actions.entry(descriptor.id.clone()) {
            Entry::Occupied(_) => Err(Error::new(ErrorKind::ActionIdCollision)
                .with_message(format!("'{}' is already registered", descriptor.id))),
            Entry::Vacant(slot) => Ok(slot.insert(descriptor)),
        }
    }

    /// Registers a typed [`Action`].
    pub fn register<A: Action>(&mut self) -> Result<&mut ActionDescriptor> {
        let handler: Handler = Arc::new(|ctx: ActionContext, payload: Payload| {
            ready_or_failed(
                payload
                    .decode::<A::Args>()
                    .and_then(|args| A::invoke(&ctx, args))
                    .and_then(|out| Payload::encode(&out)),
            )
        });
        let mut descriptor = ActionDescriptor::new::<A::Args, A::Output>(A::id(), handler);
        descriptor.accepts_continuation = A::ACCEPTS_CONTINUATION;
        self.insert(descriptor)
    }

    /// Registers a synchronous closure.
    pub fn register_fn<Args, Out, F>(
        &mut self,
        id: impl Into<ActionId>,
        f: F,
    ) -> Result<&mut ActionDescriptor>
    where
        Args: DeserializeOwned + Send + 'static,
        Out: Serialize + 'static,
        F: Fn(&ActionContext, Args) -> Result<Out> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |ctx: ActionContext, payload: Payload| {
            ready_or_failed(
                payload
                    .decode::<Args>()
                    .and_then(|args| f(&ctx, args))
                    .and_then(|out| Payload::encode(&out)),
            )
        });
        self.insert(ActionDescriptor::new::<Args, Out>(id.into(), handler))
    }

    /// Registers a closure that returns a future.
    ///
    /// The reply is sent when the returned future resolves; the worker that
    /// ran the closure is free in the meantime.
    pub fn register_async_fn<Args, Out, F>(
        &mut self,
        id: impl Into<ActionId>,
        f: F,
    ) -> Result<&mut ActionDescriptor>
    where
        Args: DeserializeOwned + Send + 'static,
        Out: Serialize + Clone + Send + Sync + 'static,
        F: Fn(&ActionContext, Args) -> SharedFuture<Out> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |ctx: ActionContext, payload: Payload| {
            match payload.decode::<Args>() {
                Ok(args) => f(&ctx, args).and_then(|out| Payload::encode(&out)),
                Err(err) => make_error_future(err),
            }
        });
        self.insert(ActionDescriptor::new::<Args, Out>(id.into(), handler))
    }

    /// Registers a handler working on encoded payloads directly.
    pub fn register_raw<F>(&mut self, id: impl Into<ActionId>, f: F) -> Result<&mut ActionDescriptor>
    where
        F: Fn(&ActionContext, Payload) -> Result<Payload> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |ctx: ActionContext, payload: Payload| {
            ready_or_failed(f(&ctx, payload))
        });
        self.insert(ActionDescriptor::new::<Payload, Payload>(id.into(), handler))
    }

    /// Returns true if `id` is already registered.
    #[must_use]
    pub fn contains(&self, id: &ActionId) -> bool {
        self.actions.contains_key(id)
    }

    /// Freezes the registrations.
    #[must_use]
    pub fn build(self) -> ActionRegistry {
        ActionRegistry {
            actions: self.actions,
        }
    }
}

impl fmt::Debug for ActionRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistryBuilder")
            .field("actions", &self.actions.len())
            .finish()
    }
}

/// Immutable map from action id to descriptor.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    actions: HashMap<ActionId, ActionDescriptor>,
}

impl ActionRegistry {
    /// Looks up an action.
    #[must_use]
    pub fn get(&self, id: &ActionId) -> Option<&ActionDescriptor> {
        self.actions.get(id)
    }

    /// Returns true if `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &ActionId) -> bool {
        self.actions.contains_key(id)
    }

    /// Number of registered actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<&ActionId> {
        let mut ids: Vec<_> = self.actions.keys().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use crate::types::{Gid, LocalityId};
    use std::sync::Weak;

    struct Mul;

    impl Action for Mul {
        const NAME: &'static str = "test::mul";
        const ACCEPTS_CONTINUATION: bool = false;
        type Args = (u32, u32);
        type Output = u32;

        fn invoke(_ctx: &ActionContext, (a, b): (u32, u32)) -> Result<u32> {
            Ok(a * b)
        }
    }

    fn context() -> ActionContext {
        let here = LocalityId::new(1);
        ActionContext::new(here, Gid::locality_root(here), here, Weak::new())
    }

    fn call(registry: &ActionRegistry, id: &str, payload: Payload) -> Result<Payload> {
        let descriptor = registry.get(&ActionId::new(id)).expect("registered");
        (descriptor.handler())(context(), payload).get()
    }

    #[test]
    fn duplicate_registration_collides() {
        init_test_logging();
        let mut builder = ActionRegistryBuilder::new();
        builder.register::<Mul>().expect("first");
        let err = builder
            .register_fn("test::mul", |_, (): ()| Ok(()))
            .expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::ActionIdCollision);
        assert_eq!(err.kind().to_string(), "action id collision");
    }

    #[test]
    fn typed_and_closure_handlers_run() {
        init_test_logging();
        let mut builder = ActionRegistryBuilder::new();
        builder.register::<Mul>().expect("mul");
        builder
            .register_fn("test::add", |_, (a, b): (i32, i32)| Ok(a + b))
            .expect("add");
        builder
            .register_async_fn("test::later", |_, n: u8| make_ready_future(u16::from(n) * 2))
            .expect("later");
        let registry = builder.build();
        assert_eq!(registry.len(), 3);

        let out = call(&registry, "test::mul", Payload::encode(&(6u32, 7u32)).expect("args"));
        assert_eq!(out.expect("mul").decode::<u32>().expect("decode"), 42);
        let out = call(&registry, "test::add", Payload::encode(&(2, 3)).expect("args"));
        assert_eq!(out.expect("add").decode::<i32>().expect("decode"), 5);
        let out = call(&registry, "test::later", Payload::encode(&4u8).expect("args"));
        assert_eq!(out.expect("later").decode::<u16>().expect("decode"), 8);
    }

    #[test]
    fn bad_arguments_fail_the_handler_future() {
        init_test_logging();
        let mut builder = ActionRegistryBuilder::new();
        builder.register::<Mul>().expect("mul");
        let registry = builder.build();
        let err = call(&registry, "test::mul", Payload::encode(&"six").expect("args"))
            .expect_err("mismatch");
        assert_eq!(err.kind(), ErrorKind::ArgumentMismatch);
    }

    #[test]
    fn continuation_flag() {
        init_test_logging();
        let mut builder = ActionRegistryBuilder::new();
        builder.register::<Mul>().expect("mul");
        builder
            .register_fn("test::sink", |_, _: u32| Ok(()))
            .expect("sink")
            .set_accepts_continuation(false);
        builder
            .register_raw("test::raw", |_, payload| Ok(payload))
            .expect("raw");
        let registry = builder.build();
        assert!(!registry.get(&Mul::id()).expect("mul").accepts_continuation());
        assert!(!registry
            .get(&ActionId::new("test::sink"))
            .expect("sink")
            .accepts_continuation());
        assert!(registry
            .get(&ActionId::new("test::raw"))
            .expect("raw")
            .accepts_continuation());
        assert_eq!(
            registry.ids(),
            vec![
                &ActionId::new("test::mul"),
                &ActionId::new("test::raw"),
                &ActionId::new("test::sink")
            ]
        );
        assert_eq!(
            registry.get(&Mul::id()).expect("mul").argument_type(),
            "(u32, u32)"
        );
    }
}
