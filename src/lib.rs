//! Atomic flash-loan arbitrage engine.
//!
//! A plan borrows an asset with a flash loan, routes it through a closed chain
//! of swaps across heterogeneous venues, repays principal plus premium and
//! keeps the remainder. Either every step happens or none does.
//!
//! ```text
//! borrow 1,000 X ──► X→Y (constant product) ──► Y→X (constant product)
//!                                                   │
//!   repay 1,000.5 X ◄───────────────────────────────┘ 1,006.26 X
//!   profit 5.76 X to the beneficiary
//! ```
//!
//! Two engine implementations exist side by side. The optimized engine only
//! receives live traffic after a differential parity run against the reference
//! engine, and then only a growing share of it under a rollout controller
//! watching success rates and cost distributions.
//!
//! # Modules
//!
//! - [`venue`]: Constant-product, concentrated-liquidity and stable-invariant venues
//! - [`plan`]: Validated arbitrage plans
//! - [`ledger`]: World state, atomic units and flash-loan providers
//! - [`engine`]: Reference and optimized execution engines
//! - [`parity`]: Differential verification corpus and harness
//! - [`monitor`]: Rolling cost percentiles and anomaly detection
//! - [`rollout`]: Progressive traffic ladder with rollback
//! - [`control`]: Background control loop and record logs
//! - [`service`]: Plan submission
//! - [`api`]: HTTP API for plans, rollout, costs and metrics
//! - [`config`]: Configuration loading from environment
//! - [`metrics`]: Prometheus metric names and helpers
//! - [`error`]: Unified error types
//! - [`utils`]: Utility functions

pub mod api;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod monitor;
pub mod parity;
pub mod plan;
pub mod rollout;
pub mod service;
pub mod utils;
pub mod venue;

pub use config::Config;
pub use engine::{ExecutionEngine, ExecutionResult, FailureReason, ImplementationTag};
pub use error::{Error, Result};
pub use plan::ArbitragePlan;
pub use rollout::RolloutState;
pub use service::ExecutionService;
