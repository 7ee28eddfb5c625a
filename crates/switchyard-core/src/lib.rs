//! Switchyard Core - Task types shared across the Switchyard task router.
//!
//! This crate provides:
//! - [`Task`] and its identifier, the unit of work routed to an AI backend
//! - [`TaskStatus`] for the task lifecycle
//! - [`TaskResult`] produced by an adapter and persisted by the host
//!
//! Plugins see these types as JSON arguments when task hooks fire, so every
//! type here serializes to a stable camelCase shape.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod task;

pub use task::{Task, TaskId, TaskResult, TaskStatus};
