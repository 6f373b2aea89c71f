//! Postfleet core - the distributed task-processing engine behind the
//! browser worker fleet.
//!
//! Three subsystems carry the real invariants:
//! - [`queue::PriorityQueue`]: durable, priority-ordered, at-least-once
//!   task handoff with a bounded retry ladder
//! - [`pool::InstancePool`]: capacity-bounded, per-account browser
//!   instances with session persistence and health reaping
//! - [`security::SignedTaskCodec`]: HMAC task signing, AEAD payload
//!   encryption and replay protection on the producer/worker boundary
//!
//! [`dispatcher::Dispatcher`] ties them into the worker main loop.

pub mod config;
pub mod dispatcher;
pub mod models;
pub mod pool;
pub mod queue;
pub mod security;

#[cfg(test)]
pub(crate) mod testkit;

pub use models::*;
