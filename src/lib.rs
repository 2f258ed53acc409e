//! # Farm Valuation SDK
//!
//! Aggregates yield-farm state from a Tezos farm contract and turns it into
//! per-farm TVL, APR and pending-reward estimates, kept fresh by a set of
//! independent refresh loops.
//!
//! ## Overview
//!
//! - **Classification**: recognise which AMM protocol issued a farm's staked token
//! - **Normalization**: read reserves and supply into one pool shape per protocol
//! - **Valuation**: TVL in tez and APR from the normalized pool and price index
//! - **Rewards**: MasterChef-style pending reward estimate for a connected wallet
//! - **Filtering**: tag and keyword predicates over the farm list
//!
//! ## Architecture
//!
//! ### Data Sources
//! Upstreams sit behind traits (`data_sources`) with HTTP implementations in
//! `adapters`. Snapshots of their responses are swapped in atomically (`cache`,
//! `price_index`).
//!
//! ### Farm Pipeline
//! `engine::FarmEngine` runs classification, normalization, valuation and the
//! reward estimate per farm, in that order, and writes results into the
//! versioned `farm_registry`.
//!
//! ### Scheduling
//! `scheduler::Scheduler` owns the stoppable refresh loops; `single_flight`
//! collapses concurrent refreshes of the same key.

// Core Types
/// Farm, token and estimate types
pub mod types;
/// Protocol variants and the normalized pool token
pub mod pools;
/// Error taxonomy
pub mod errors;

// Data Sources
/// Traits for every upstream collaborator
pub mod data_sources;
/// HTTP implementations of the data source traits
pub mod adapters;
/// Atomically replaced upstream snapshots
pub mod cache;
/// Token price index
pub mod price_index;
/// Token metadata resolution with placeholders and overrides
pub mod token_metadata;

// Farm Pipeline
/// Staked-token protocol detection
pub mod protocol_classifier;
/// Protocol-specific pool reading
pub mod normalization;
/// TVL and APR
pub mod valuation;
/// Reward accrual
pub mod rewards;
/// Configured exclusions, errant flags and badges
pub mod curation;
/// Visibility predicates
pub mod filters;
/// Versioned farm records
pub mod farm_registry;

// Orchestration
/// Per-key request collapsing
pub mod single_flight;
/// Periodic refresh loops
pub mod scheduler;
/// Engine facade
pub mod engine;

// Infrastructure
/// Metrics and observability
pub mod metrics;
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use engine::{Collaborators, FarmEngine};
pub use errors::{FarmError, FarmResult};
pub use filters::{FilterSet, FilterTag};
pub use settings::Settings;
pub use types::{Estimate, Farm, TokenKey};
