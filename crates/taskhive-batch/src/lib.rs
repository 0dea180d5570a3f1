//! Batched access to external model endpoints.
//!
//! Concurrent callers submit prompts one at a time; a background loop
//! collects them into batches, sends identical prompts once, respects a
//! per-model rate limit and caches every answer.
//!
//! # Main types
//!
//! - [`BatchProcessor`] — Request queue, batching loop and response cache.
//! - [`ModelClient`] — Trait implemented by model transports.
//! - [`BatchedModelBackend`] — Task execution through the processor.

/// Execution backend running tasks as model prompts.
pub mod backend;
/// Bounded response cache.
pub mod cache;
/// Model transport trait and the command-line client.
pub mod client;
/// The batching loop.
pub mod processor;
/// Per-model token buckets.
pub mod rate_limit;

pub use backend::BatchedModelBackend;
pub use cache::{cache_key, ResponseCache};
pub use client::{CommandModelClient, ModelClient};
pub use processor::{BatchConfig, BatchProcessor, BatchStats};
pub use rate_limit::RateLimiter;
