//! Reference engine.
//!
//! Favors auditability over cost: the unit runs against a full copy of the
//! ledger, every hop is quoted before it is executed and the two must agree,
//! the swap chain is re-validated once borrowed funds are in hand, and profit
//! is measured from the engine's balance rather than from the hop outputs.

use tracing::{debug, instrument};

use super::{
    authorize, check_deadline, check_profit, check_step, conclude, hop_failure, CostOp,
    EngineConfig, ExecutionEngine, ExecutionResult, FailureReason, ImplementationTag, Meter,
    Phase,
};
use crate::ledger::{AtomicUnit, FlashBorrower, Ledger, LoanCallback, LoanProvider, LoanRequest};
use crate::plan::ArbitragePlan;
use crate::venue::{AccountId, Amount};

/// Snapshot-based engine used as the behavioral baseline.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceEngine;

impl ExecutionEngine for ReferenceEngine {
    fn tag(&self) -> ImplementationTag {
        ImplementationTag::Reference
    }

    #[instrument(skip_all, fields(plan_id = %plan.id(), implementation = "reference"))]
    fn run(
        &self,
        plan: &ArbitragePlan,
        ledger: &mut Ledger,
        provider: &dyn LoanProvider,
        config: &EngineConfig,
    ) -> ExecutionResult {
        let mut meter = Meter::new();
        meter.charge(CostOp::CallBase);
        meter.charge_n(CostOp::SnapshotEntry, ledger.entry_count());

        let mut unit = AtomicUnit::shadow(ledger);
        let outcome = execute(plan, &mut unit, provider, config, &mut meter);
        match outcome {
            Ok(_) => unit.commit(),
            Err(_) => unit.rollback(),
        }

        conclude(plan, self.tag(), outcome, &meter)
    }
}

fn execute(
    plan: &ArbitragePlan,
    unit: &mut AtomicUnit<'_>,
    provider: &dyn LoanProvider,
    config: &EngineConfig,
    meter: &mut Meter,
) -> Result<Amount, FailureReason> {
    // Preflight every hop before borrowing
    for (index, step) in plan.steps().iter().enumerate() {
        meter.charge(CostOp::VenueLookup);
        check_step(index, step, unit.venue(&step.venue_id), plan)?;
    }
    check_deadline(plan, unit.block())?;

    let request = LoanRequest {
        asset: plan.borrowed_asset(),
        principal: plan.borrow_amount(),
        initiator: config.engine_id,
    };
    meter.charge(CostOp::LoanCall);

    let mut borrower = Borrower {
        plan,
        config,
        lender: provider.account(),
        beneficiary: plan.beneficiary().unwrap_or(config.owner),
        phase: Phase::Idle,
        meter,
        profit: None,
    };
    borrower.enter(Phase::Borrowing);

    let loan = provider.flash_loan(unit, &request, plan.id(), &mut borrower);
    match loan {
        Ok(_) => {
            borrower.enter(Phase::Committed);
            borrower.profit.ok_or_else(|| FailureReason::SettlementFailure {
                detail: "loan completed without invoking the callback".into(),
            })
        }
        Err(reason) => {
            borrower.enter(Phase::RevertedAll);
            Err(reason)
        }
    }
}

struct Borrower<'a> {
    plan: &'a ArbitragePlan,
    config: &'a EngineConfig,
    lender: AccountId,
    beneficiary: AccountId,
    phase: Phase,
    meter: &'a mut Meter,
    profit: Option<Amount>,
}

impl Borrower<'_> {
    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "Phase transition");
        self.phase = phase;
    }
}

impl FlashBorrower for Borrower<'_> {
    fn account(&self) -> AccountId {
        self.config.engine_id
    }

    fn on_flash_loan(
        &mut self,
        unit: &mut AtomicUnit<'_>,
        callback: &LoanCallback,
    ) -> Result<(), FailureReason> {
        self.meter.charge(CostOp::Callback);
        authorize(
            self.phase,
            callback,
            self.config,
            self.lender,
            self.plan.id(),
        )?;

        let engine = self.config.engine_id;
        let asset = callback.asset;
        let steps = self.plan.steps();

        // Re-validate the chain against the asset actually lent
        self.meter.charge_n(CostOp::PathCheck, steps.len());
        ArbitragePlan::validate_path(asset, steps).map_err(|err| {
            FailureReason::VenueCallFailure {
                step: 0,
                venue: steps[0].venue_id,
                detail: err.to_string(),
            }
        })?;

        self.meter.charge(CostOp::BalanceRead);
        let opening = unit
            .balance_of(engine, asset)
            .saturating_sub(callback.principal);

        let mut amount = callback.principal;
        for (index, step) in steps.iter().enumerate() {
            self.enter(Phase::Swapping(index));
            let venue = step.venue_id;
            let fail = |err| hop_failure(index, venue, err);

            self.meter.charge(CostOp::Quote(step.protocol_kind));
            let quoted = unit
                .quote(venue, step.token_in, step.token_out, amount)
                .map_err(fail)?;

            self.meter.charge(CostOp::BalanceWrite);
            unit.debit(engine, step.token_in, amount).map_err(fail)?;

            self.meter.charge(CostOp::Swap(step.protocol_kind));
            let receipt = unit
                .swap(
                    venue,
                    step.token_in,
                    step.token_out,
                    amount,
                    step.min_amount_out,
                )
                .map_err(fail)?;
            self.meter
                .charge_n(CostOp::TickCrossed, receipt.ticks_crossed as usize);

            if receipt != quoted {
                return Err(FailureReason::VenueCallFailure {
                    step: index,
                    venue,
                    detail: format!(
                        "executed {} but quoted {}",
                        receipt.amount_out, quoted.amount_out
                    ),
                });
            }

            self.meter.charge(CostOp::BalanceWrite);
            unit.credit(engine, step.token_out, receipt.amount_out)
                .map_err(fail)?;
            debug!(
                step = index,
                %venue,
                amount_in = %amount,
                amount_out = %receipt.amount_out,
                "Hop executed"
            );
            amount = receipt.amount_out;
        }

        self.enter(Phase::Validating);
        self.meter.charge(CostOp::BalanceRead);
        self.meter.charge(CostOp::Validation);
        let final_balance = unit.balance_of(engine, asset).saturating_sub(opening);
        let owed = callback
            .owed()
            .ok_or(FailureReason::LoanRepaymentFailure {
                owed: Amount::MAX,
                repaid: 0,
            })?;
        let profit = check_profit(final_balance, owed, self.plan.profit_floor())?;

        self.enter(Phase::Repaying);
        self.meter.charge_n(CostOp::BalanceWrite, 2);
        unit.transfer(engine, callback.lender, asset, owed)
            .map_err(|_| FailureReason::LoanRepaymentFailure { owed, repaid: 0 })?;

        self.meter.charge_n(CostOp::BalanceWrite, 2);
        unit.transfer(engine, self.beneficiary, asset, profit)
            .map_err(|err| FailureReason::SettlementFailure {
                detail: err.to_string(),
            })?;

        self.profit = Some(profit);
        Ok(())
    }
}
