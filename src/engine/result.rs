//! Execution outcomes.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::plan::PlanId;
use crate::venue::{AccountId, Amount, AssetId, VenueId};

/// Which engine implementation produced a result.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ImplementationTag {
    /// Snapshot-based, fully audited engine.
    Reference,
    /// Journal-based, cost-optimized engine.
    Optimized,
}

/// Why a unit was reverted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Realized profit fell below the plan's floor.
    InsufficientProfit {
        /// Profit the loop would have realized.
        realized: i128,
        /// Floor that applied.
        required: Amount,
    },
    /// A hop delivered less than its `min_amount_out`.
    SlippageExceeded {
        /// Step index.
        step: usize,
        /// Venue of the step.
        venue: VenueId,
        /// Floor set by the plan.
        min_amount_out: Amount,
        /// Output the venue would have delivered.
        amount_out: Amount,
    },
    /// A venue could not be called or rejected the swap.
    VenueCallFailure {
        /// Step index.
        step: usize,
        /// Venue of the step.
        venue: VenueId,
        /// Underlying cause.
        detail: String,
    },
    /// The venue moved since the plan was quoted.
    StaleQuote {
        /// Step index.
        step: usize,
        /// Venue of the step.
        venue: VenueId,
        /// Version the plan was quoted against.
        observed_version: u64,
        /// Version found at execution.
        current_version: u64,
    },
    /// The plan's deadline block has passed.
    DeadlineExpired {
        /// Last block the plan accepted.
        deadline_block: u64,
        /// Block at execution.
        current_block: u64,
    },
    /// The provider cannot lend the requested principal.
    LoanUnavailable {
        /// Asset requested.
        asset: AssetId,
        /// Principal requested.
        requested: Amount,
        /// Provider liquidity.
        available: Amount,
    },
    /// The provider was not made whole.
    LoanRepaymentFailure {
        /// Principal plus premium.
        owed: Amount,
        /// Amount actually returned.
        repaid: Amount,
    },
    /// A loan callback failed the initiator or phase guard.
    UnauthorizedCallback {
        /// Initiator named in the callback.
        initiator: AccountId,
        /// Lender named in the callback.
        lender: AccountId,
    },
    /// Paying out the profit failed.
    SettlementFailure {
        /// Underlying cause.
        detail: String,
    },
    /// The plan was already consumed.
    DuplicatePlan,
}

impl FailureReason {
    /// Coarse class used for parity comparison and metric labels.
    pub fn class(&self) -> FailureClass {
        match self {
            FailureReason::InsufficientProfit { .. } => FailureClass::InsufficientProfit,
            FailureReason::SlippageExceeded { .. } => FailureClass::SlippageExceeded,
            FailureReason::VenueCallFailure { .. } => FailureClass::VenueCallFailure,
            FailureReason::StaleQuote { .. } | FailureReason::DeadlineExpired { .. } => {
                FailureClass::StaleQuote
            }
            FailureReason::LoanUnavailable { .. } => FailureClass::LoanUnavailable,
            FailureReason::LoanRepaymentFailure { .. } => FailureClass::LoanRepaymentFailure,
            FailureReason::UnauthorizedCallback { .. } => FailureClass::UnauthorizedCallback,
            FailureReason::SettlementFailure { .. } => FailureClass::SettlementFailure,
            FailureReason::DuplicatePlan => FailureClass::DuplicatePlan,
        }
    }
}

/// Fieldless failure taxonomy.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureClass {
    /// See [`FailureReason::InsufficientProfit`].
    InsufficientProfit,
    /// See [`FailureReason::SlippageExceeded`].
    SlippageExceeded,
    /// See [`FailureReason::VenueCallFailure`].
    VenueCallFailure,
    /// Stale venue version or expired deadline.
    StaleQuote,
    /// See [`FailureReason::LoanUnavailable`].
    LoanUnavailable,
    /// See [`FailureReason::LoanRepaymentFailure`].
    LoanRepaymentFailure,
    /// See [`FailureReason::UnauthorizedCallback`].
    UnauthorizedCallback,
    /// See [`FailureReason::SettlementFailure`].
    SettlementFailure,
    /// See [`FailureReason::DuplicatePlan`].
    DuplicatePlan,
}

/// Outcome of one attempted plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Plan executed.
    pub plan_id: PlanId,
    /// Engine implementation used.
    pub implementation_tag: ImplementationTag,
    /// Whether the unit committed.
    pub success: bool,
    /// Profit paid to the beneficiary; zero when reverted.
    pub realized_profit: i128,
    /// Metered cost units.
    pub cost_consumed: u64,
    /// Present exactly when `success` is false.
    pub failure_reason: Option<FailureReason>,
}

impl ExecutionResult {
    /// Committed result.
    pub fn committed(
        plan_id: PlanId,
        implementation_tag: ImplementationTag,
        realized_profit: i128,
        cost_consumed: u64,
    ) -> Self {
        Self {
            plan_id,
            implementation_tag,
            success: true,
            realized_profit,
            cost_consumed,
            failure_reason: None,
        }
    }

    /// Reverted result.
    pub fn reverted(
        plan_id: PlanId,
        implementation_tag: ImplementationTag,
        reason: FailureReason,
        cost_consumed: u64,
    ) -> Self {
        Self {
            plan_id,
            implementation_tag,
            success: false,
            realized_profit: 0,
            cost_consumed,
            failure_reason: Some(reason),
        }
    }

    /// Class of the failure, if any.
    pub fn failure_class(&self) -> Option<FailureClass> {
        self.failure_reason.as_ref().map(FailureReason::class)
    }
}
