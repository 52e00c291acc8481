//! Core identifier types shared by every layer.

pub mod id;

pub use id::{ActionId, CorrelationId, Gid, LocalityId};
