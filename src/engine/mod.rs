//! Atomic cross-venue execution engine.
//!
//! An engine borrows the plan's principal from a [`LoanProvider`], walks the
//! swap chain inside the provider's callback, validates the profit floor,
//! repays the loan and pays the beneficiary. Any failure along the way reverts
//! the whole unit. Two implementations exist:
//!
//! - [`ReferenceEngine`]: shadow-copies the ledger, quotes every hop before
//!   executing it and re-validates the path at runtime.
//! - [`OptimizedEngine`]: resolves the route once and executes in place under
//!   an undo journal.
//!
//! Both must be observationally identical apart from `cost_consumed`.

pub mod meter;
pub mod optimized;
pub mod reference;
pub mod result;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use meter::{CostOp, Meter};
pub use optimized::OptimizedEngine;
pub use reference::ReferenceEngine;
pub use result::{ExecutionResult, FailureClass, FailureReason, ImplementationTag};

use crate::error::{LedgerError, VenueError};
use crate::ledger::{Ledger, LoanCallback, LoanProvider, VenueSlot};
use crate::plan::{ArbitragePlan, PlanId, SwapStep};
use crate::venue::{AccountId, Amount, Venue, VenueId};

/// Identity and ownership of an engine deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default profit beneficiary.
    pub owner: AccountId,
    /// Account that holds borrowed funds; checked on every loan callback.
    pub engine_id: AccountId,
}

/// Lifecycle of one atomic unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Not started.
    Idle,
    /// Loan requested, waiting for the callback.
    Borrowing,
    /// Executing the given step.
    Swapping(usize),
    /// Checking the profit floor.
    Validating,
    /// Returning principal and premium.
    Repaying,
    /// Every effect retained.
    Committed,
    /// Every effect discarded.
    RevertedAll,
}

/// An implementation of the execution engine.
pub trait ExecutionEngine: Send + Sync {
    /// Implementation tag reported on results.
    fn tag(&self) -> ImplementationTag;

    /// Execute `plan` against `ledger` as one atomic unit.
    fn run(
        &self,
        plan: &ArbitragePlan,
        ledger: &mut Ledger,
        provider: &dyn LoanProvider,
        config: &EngineConfig,
    ) -> ExecutionResult;
}

/// Callback guard: the callback must come from the expected lender, for the
/// expected plan, on behalf of this engine, while the unit is borrowing.
pub(crate) fn authorize(
    phase: Phase,
    callback: &LoanCallback,
    config: &EngineConfig,
    lender: AccountId,
    plan_id: PlanId,
) -> Result<(), FailureReason> {
    let authorized = phase == Phase::Borrowing
        && callback.initiator == config.engine_id
        && callback.lender == lender
        && callback.params == plan_id;
    if authorized {
        Ok(())
    } else {
        Err(FailureReason::UnauthorizedCallback {
            initiator: callback.initiator,
            lender: callback.lender,
        })
    }
}

/// Preflight checks for one step against its venue slot.
pub(crate) fn check_step(
    index: usize,
    step: &SwapStep,
    slot: Option<&VenueSlot>,
    plan: &ArbitragePlan,
) -> Result<(), FailureReason> {
    let venue = step.venue_id;
    let failure = |detail: String| FailureReason::VenueCallFailure {
        step: index,
        venue,
        detail,
    };

    let slot = slot.ok_or_else(|| failure("venue not registered".into()))?;
    if slot.state.kind() != step.protocol_kind {
        return Err(failure(format!(
            "venue is {}, step expects {}",
            slot.state.kind(),
            step.protocol_kind
        )));
    }
    if let Some(fee) = step.fee_tier {
        if fee != slot.state.fee_pips() {
            return Err(failure(format!(
                "venue fee is {} pips, step expects {fee}",
                slot.state.fee_pips()
            )));
        }
    }
    if let Some(observed) = plan.observed_version(&venue) {
        if observed != slot.version {
            return Err(FailureReason::StaleQuote {
                step: index,
                venue,
                observed_version: observed,
                current_version: slot.version,
            });
        }
    }
    Ok(())
}

/// Reject plans whose deadline block has passed.
pub(crate) fn check_deadline(plan: &ArbitragePlan, block: u64) -> Result<(), FailureReason> {
    match plan.deadline_block() {
        Some(deadline) if deadline < block => Err(FailureReason::DeadlineExpired {
            deadline_block: deadline,
            current_block: block,
        }),
        _ => Ok(()),
    }
}

/// Map a ledger error raised while executing a hop.
pub(crate) fn hop_failure(step: usize, venue: VenueId, err: LedgerError) -> FailureReason {
    match err {
        LedgerError::Venue {
            source:
                VenueError::SlippageExceeded {
                    min_amount_out,
                    amount_out,
                },
            ..
        } => FailureReason::SlippageExceeded {
            step,
            venue,
            min_amount_out,
            amount_out,
        },
        other => FailureReason::VenueCallFailure {
            step,
            venue,
            detail: other.to_string(),
        },
    }
}

/// Profit left after repaying `owed`, if it clears `floor`.
pub(crate) fn check_profit(
    final_amount: Amount,
    owed: Amount,
    floor: Amount,
) -> Result<Amount, FailureReason> {
    match final_amount.checked_sub(owed) {
        Some(profit) if profit >= floor => Ok(profit),
        Some(profit) => Err(FailureReason::InsufficientProfit {
            realized: to_signed(profit),
            required: floor,
        }),
        None => Err(FailureReason::InsufficientProfit {
            realized: -to_signed(owed - final_amount),
            required: floor,
        }),
    }
}

/// Clamp an amount into the signed profit domain.
pub(crate) fn to_signed(amount: Amount) -> i128 {
    i128::try_from(amount).unwrap_or(i128::MAX)
}

/// Build the result for a finished unit and log its outcome.
pub(crate) fn conclude(
    plan: &ArbitragePlan,
    tag: ImplementationTag,
    outcome: Result<Amount, FailureReason>,
    meter: &Meter,
) -> ExecutionResult {
    match outcome {
        Ok(profit) => {
            info!(
                plan_id = %plan.id(),
                implementation = %tag,
                profit = %profit,
                cost = meter.consumed(),
                "Unit committed"
            );
            ExecutionResult::committed(plan.id(), tag, to_signed(profit), meter.consumed())
        }
        Err(reason) => {
            warn!(
                plan_id = %plan.id(),
                implementation = %tag,
                reason = %reason.class(),
                cost = meter.consumed(),
                "Unit reverted"
            );
            ExecutionResult::reverted(plan.id(), tag, reason, meter.consumed())
        }
    }
}
