//! Agent directory and routing for TaskHive.
//!
//! Tracks every worker agent's capability, load and performance history, and
//! picks the best agent for a task through pluggable selection strategies.
//!
//! # Main types
//!
//! - [`AgentDirectory`] — Registry of agents guarded by its own lock.
//! - [`AgentCapability`] — Per-agent record with suitability scoring.
//! - [`SelectionStrategy`] — Enum-dispatched strategy implementing [`AgentSelector`].
//! - [`AgentLedger`] — Persistent ledger the directory syncs from.

/// Per-agent capability records and suitability scoring.
pub mod capability;
/// The agent registry.
pub mod directory;
/// Persistent ledger abstraction.
pub mod ledger;
/// Agent selection strategies.
pub mod strategy;

pub use capability::{AgentCapability, AgentStatus, TaskRecord};
pub use directory::{AgentDirectory, AgentSummary, DirectoryConfig, DirectorySnapshot, SyncReport};
pub use ledger::{AgentLedger, LedgerAgent, StaticLedger};
pub use strategy::{
    AgentSelector, BestFit, LeastLoaded, PerformanceBased, RoundRobin, SelectionStrategy,
    StrategyKind, TaskRequirements,
};
