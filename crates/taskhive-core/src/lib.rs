//! Core types and error definitions for the TaskHive dispatcher.
//!
//! This crate provides the foundational types shared across all TaskHive
//! crates: the unified error enum and the priority scale used by both the
//! task scheduler and the message router.
//!
//! # Main types
//!
//! - [`HiveError`] — Unified error enum for all TaskHive subsystems.
//! - [`HiveResult`] — Convenience alias for `Result<T, HiveError>`.
//! - [`Priority`] — Critical / High / Normal / Low urgency scale.
//! - [`TaskId`] — Identifier of a task in the coordinator arena.

/// Unified error type.
pub mod error;
/// Priority scale shared by tasks and messages.
pub mod priority;

pub use error::{HiveError, HiveResult};
pub use priority::Priority;

/// Identifier of a task. Tasks are keyed by id everywhere; components never
/// hand out references into another component's arena.
pub type TaskId = uuid::Uuid;
