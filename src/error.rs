//! Unified error types for the execution engine and its control plane.

use thiserror::Error;

use crate::parity::DivergenceField;
use crate::venue::{AccountId, Amount, AssetId, VenueId};

/// Unified error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading error.
    #[error("configuration error: {0}")]
    Config(#[from] envy::Error),

    /// Plan construction error.
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    /// Venue error outside of an atomic unit.
    #[error("venue error: {0}")]
    Venue(#[from] VenueError),

    /// Ledger bookkeeping error outside of an atomic unit.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Persistence error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Rollout controller error.
    #[error("rollout error: {0}")]
    Rollout(#[from] RolloutError),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejections raised while constructing an arbitrage plan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A plan needs at least one swap step.
    #[error("plan has no swap steps")]
    EmptyPath,

    /// The path exceeds the supported chain length.
    #[error("plan has {len} steps, maximum is {max}")]
    ChainTooLong {
        /// Number of steps supplied.
        len: usize,
        /// Supported maximum.
        max: usize,
    },

    /// The first step does not spend the borrowed asset.
    #[error("step 0 spends {token_in}, expected borrowed asset {borrowed}")]
    OpenStart {
        /// Borrowed asset.
        borrowed: AssetId,
        /// Input token of step 0.
        token_in: AssetId,
    },

    /// The final step does not return the borrowed asset.
    #[error("final step returns {token_out}, expected borrowed asset {borrowed}")]
    OpenEnd {
        /// Borrowed asset.
        borrowed: AssetId,
        /// Output token of the final step.
        token_out: AssetId,
    },

    /// Consecutive steps do not chain.
    #[error("step {step} outputs {token_out} but step {next} spends {token_in}")]
    BrokenChain {
        /// Index of the producing step.
        step: usize,
        /// Index of the consuming step.
        next: usize,
        /// Output of the producing step.
        token_out: AssetId,
        /// Input of the consuming step.
        token_in: AssetId,
    },

    /// A step swaps a token for itself.
    #[error("step {step} swaps {token} for itself")]
    DegenerateStep {
        /// Offending step index.
        step: usize,
        /// The token on both sides.
        token: AssetId,
    },
}

/// Venue-level failures reported by the adapter layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VenueError {
    /// Zero input amount.
    #[error("input amount must be positive")]
    ZeroAmount,

    /// The venue does not trade the requested pair.
    #[error("venue does not trade {token_in} -> {token_out}")]
    UnknownPair {
        /// Requested input token.
        token_in: AssetId,
        /// Requested output token.
        token_out: AssetId,
    },

    /// Not enough liquidity to fill the swap.
    #[error("insufficient liquidity")]
    InsufficientLiquidity,

    /// An intermediate or final value does not fit.
    #[error("arithmetic overflow")]
    ArithmeticOverflow,

    /// The stableswap solver did not converge.
    #[error("invariant solver did not converge")]
    InvariantDiverged,

    /// Realized output is below the caller's floor.
    #[error("slippage exceeded: out {amount_out} < min {min_amount_out}")]
    SlippageExceeded {
        /// Caller's floor.
        min_amount_out: Amount,
        /// Output the venue would deliver.
        amount_out: Amount,
    },

    /// Venue parameters are inconsistent.
    #[error("invalid venue state: {0}")]
    InvalidState(String),
}

/// Balance and venue bookkeeping failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Debit exceeds the available balance.
    #[error("account {account} holds {available} of {asset}, needs {required}")]
    InsufficientBalance {
        /// Debited account.
        account: AccountId,
        /// Asset debited.
        asset: AssetId,
        /// Amount requested.
        required: Amount,
        /// Amount held.
        available: Amount,
    },

    /// Credit would overflow the balance.
    #[error("balance overflow for {account} in {asset}")]
    BalanceOverflow {
        /// Credited account.
        account: AccountId,
        /// Asset credited.
        asset: AssetId,
    },

    /// Venue is not registered.
    #[error("unknown venue {0}")]
    UnknownVenue(VenueId),

    /// Venue id registered twice.
    #[error("venue {0} already registered")]
    DuplicateVenue(VenueId),

    /// A venue slot is keyed under a different id than the venue reports.
    #[error("venue slot {key} holds venue {id}")]
    VenueIdMismatch {
        /// Slot key.
        key: VenueId,
        /// Id reported by the venue.
        id: VenueId,
    },

    /// The venue rejected the operation.
    #[error("venue {venue}: {source}")]
    Venue {
        /// Venue involved.
        venue: VenueId,
        /// Venue-level failure.
        #[source]
        source: VenueError,
    },
}

/// Append-only log and state file errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("io error on {path}: {source}")]
    Io {
        /// File involved.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Record (de)serialization failure.
    #[error("record encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Rollout controller errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RolloutError {
    /// The optimized build has not passed the parity gate.
    #[error("parity gate failed: {divergences} divergences, {mismatches} class mismatches")]
    ParityGateFailed {
        /// Divergences found.
        divergences: usize,
        /// Expected-class mismatches found.
        mismatches: usize,
    },

    /// The rollout is already serving traffic.
    #[error("rollout already active at {traffic_percentage}%")]
    AlreadyActive {
        /// Current traffic share.
        traffic_percentage: u8,
    },

    /// A live divergence rolled the optimized engine back and has not been
    /// cleared by an operator.
    #[error("rollback after live divergence in {case_id} ({field}) is not cleared")]
    UnresolvedDivergence {
        /// Case or plan that diverged.
        case_id: String,
        /// Observable that differed.
        field: DivergenceField,
    },

    /// The ladder is malformed.
    #[error("invalid rollout ladder: {0}")]
    InvalidLadder(String),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
