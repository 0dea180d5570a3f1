//! Message routing for TaskHive notifications.
//!
//! Accepts messages from any sender, drops duplicates, orders them in a
//! four-level priority mailbox and load-balances delivery across
//! registered handlers, optionally in batches.
//!
//! # Main types
//!
//! - [`MessageRouter`] — Mailbox, workers and batch flusher behind one API.
//! - [`Message`] — A unit of traffic with priority and retry budget.
//! - [`MessageHandler`] — Trait implemented by notification transports.
//! - [`Route`] — Weighted handler targets for a recipient.
//! - [`Middleware`] — Veto-or-transform step run before enqueue.

/// Weighted routes and handler load balancing.
pub mod balancer;
/// Per-recipient batching buffers.
pub mod batcher;
/// Time-windowed duplicate detection.
pub mod dedup;
/// Handler trait and the logging handler.
pub mod handler;
/// Bounded priority mailbox.
pub mod mailbox;
/// The message type.
pub mod message;
/// Pre-enqueue middleware.
pub mod middleware;
/// The message router.
pub mod router;

pub use balancer::{LoadBalancer, Route, RouteTarget};
pub use batcher::{Batch, Batcher};
pub use dedup::DedupCache;
pub use handler::{LogHandler, MessageHandler};
pub use mailbox::Mailbox;
pub use message::{Message, DEFAULT_MAX_RETRIES};
pub use middleware::{FnMiddleware, Middleware, SenderBlocklist};
pub use router::{MessageRouter, RouterConfig, RouterMetrics, SendOutcome};
