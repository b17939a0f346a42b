//! Arbitrage plans: the immutable closed-loop path submitted for execution.

pub mod types;

pub use types::{ArbitragePlan, PlanBuilder, PlanId, PlanSpec, SwapStep, MAX_CHAIN_LENGTH};
