//! Cost-optimized engine.
//!
//! Resolves the route once during preflight, executes hops in place without
//! quoting, tracks the running amount instead of re-reading balances, and
//! relies on the unit's undo journal for rollback.

use smallvec::SmallVec;
use tracing::{debug, instrument};

use super::{
    authorize, check_deadline, check_profit, check_step, conclude, hop_failure, CostOp,
    EngineConfig, ExecutionEngine, ExecutionResult, FailureReason, ImplementationTag, Meter,
    Phase,
};
use crate::ledger::{AtomicUnit, FlashBorrower, Ledger, LoanCallback, LoanProvider, LoanRequest};
use crate::plan::ArbitragePlan;
use crate::venue::{AccountId, Amount, AssetId, ProtocolKind, VenueId};

/// Journal-based engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimizedEngine;

/// A preflighted hop.
#[derive(Debug, Clone, Copy)]
struct Hop {
    venue: VenueId,
    kind: ProtocolKind,
    token_in: AssetId,
    token_out: AssetId,
    min_amount_out: Amount,
}

type Route = SmallVec<[Hop; 4]>;

impl ExecutionEngine for OptimizedEngine {
    fn tag(&self) -> ImplementationTag {
        ImplementationTag::Optimized
    }

    #[instrument(skip_all, fields(plan_id = %plan.id(), implementation = "optimized"))]
    fn run(
        &self,
        plan: &ArbitragePlan,
        ledger: &mut Ledger,
        provider: &dyn LoanProvider,
        config: &EngineConfig,
    ) -> ExecutionResult {
        let mut meter = Meter::new();
        meter.charge(CostOp::CallBase);

        let mut unit = AtomicUnit::journaled(ledger);
        let outcome = execute(plan, &mut unit, provider, config, &mut meter);
        meter.charge_n(CostOp::JournalEntry, unit.journal_len());
        match outcome {
            Ok(_) => unit.commit(),
            Err(_) => unit.rollback(),
        }

        conclude(plan, self.tag(), outcome, &meter)
    }
}

fn resolve_route(
    plan: &ArbitragePlan,
    unit: &AtomicUnit<'_>,
    meter: &mut Meter,
) -> Result<Route, FailureReason> {
    let mut route = Route::with_capacity(plan.steps().len());
    for (index, step) in plan.steps().iter().enumerate() {
        meter.charge(CostOp::VenueLookup);
        check_step(index, step, unit.venue(&step.venue_id), plan)?;
        route.push(Hop {
            venue: step.venue_id,
            kind: step.protocol_kind,
            token_in: step.token_in,
            token_out: step.token_out,
            min_amount_out: step.min_amount_out,
        });
    }
    check_deadline(plan, unit.block())?;
    Ok(route)
}

fn execute(
    plan: &ArbitragePlan,
    unit: &mut AtomicUnit<'_>,
    provider: &dyn LoanProvider,
    config: &EngineConfig,
    meter: &mut Meter,
) -> Result<Amount, FailureReason> {
    let route = resolve_route(plan, unit, meter)?;

    let request = LoanRequest {
        asset: plan.borrowed_asset(),
        principal: plan.borrow_amount(),
        initiator: config.engine_id,
    };
    meter.charge(CostOp::LoanCall);

    let mut borrower = Borrower {
        plan,
        route,
        config,
        lender: provider.account(),
        beneficiary: plan.beneficiary().unwrap_or(config.owner),
        phase: Phase::Borrowing,
        meter,
        profit: None,
    };

    let loan = provider.flash_loan(unit, &request, plan.id(), &mut borrower);
    borrower.phase = if loan.is_ok() {
        Phase::Committed
    } else {
        Phase::RevertedAll
    };
    debug!(phase = ?borrower.phase, "Unit finished");
    loan?;
    borrower
        .profit
        .ok_or_else(|| FailureReason::SettlementFailure {
            detail: "loan completed without invoking the callback".into(),
        })
}

struct Borrower<'a> {
    plan: &'a ArbitragePlan,
    route: Route,
    config: &'a EngineConfig,
    lender: AccountId,
    beneficiary: AccountId,
    phase: Phase,
    meter: &'a mut Meter,
    profit: Option<Amount>,
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
        let mut amount = callback.principal;
        for (index, hop) in self.route.iter().enumerate() {
            self.phase = Phase::Swapping(index);
            let fail = |err| hop_failure(index, hop.venue, err);

            self.meter.charge(CostOp::BalanceWrite);
            unit.debit(engine, hop.token_in, amount).map_err(fail)?;

            self.meter.charge(CostOp::Swap(hop.kind));
            let receipt = unit
                .swap(
                    hop.venue,
                    hop.token_in,
                    hop.token_out,
                    amount,
                    hop.min_amount_out,
                )
                .map_err(fail)?;
            self.meter
                .charge_n(CostOp::TickCrossed, receipt.ticks_crossed as usize);

            self.meter.charge(CostOp::BalanceWrite);
            unit.credit(engine, hop.token_out, receipt.amount_out)
                .map_err(fail)?;
            amount = receipt.amount_out;
        }
        debug!(final_amount = %amount, hops = self.route.len(), "Route executed");

        self.phase = Phase::Validating;
        self.meter.charge(CostOp::Validation);
        let owed = callback
            .owed()
            .ok_or(FailureReason::LoanRepaymentFailure {
                owed: Amount::MAX,
                repaid: 0,
            })?;
        let profit = check_profit(amount, owed, self.plan.profit_floor())?;

        self.phase = Phase::Repaying;
        self.meter.charge_n(CostOp::BalanceWrite, 2);
        unit.transfer(engine, callback.lender, callback.asset, owed)
            .map_err(|_| FailureReason::LoanRepaymentFailure { owed, repaid: 0 })?;

        self.meter.charge_n(CostOp::BalanceWrite, 2);
        unit.transfer(engine, self.beneficiary, callback.asset, profit)
            .map_err(|err| FailureReason::SettlementFailure {
                detail: err.to_string(),
            })?;

        self.profit = Some(profit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FailureClass, ReferenceEngine};
    use crate::ledger::PoolLoanProvider;
    use crate::parity::corpus::{two_hop_scenario, Scenario, ENGINE, OWNER, PROVIDER, X};
    use alloy_primitives::Address;
    use pretty_assertions::assert_eq;

    fn run(engine: &dyn ExecutionEngine, scenario: &mut Scenario) -> ExecutionResult {
        engine.run(
            &scenario.plan,
            &mut scenario.ledger,
            &scenario.provider,
            &scenario.engine,
        )
    }

    #[test]
    fn profitable_loop_matches_reference_at_lower_cost() {
        let mut optimized = two_hop_scenario(2_000_000);
        let mut reference = two_hop_scenario(2_000_000);

        let fast = run(&OptimizedEngine, &mut optimized);
        let slow = run(&ReferenceEngine, &mut reference);

        assert!(fast.success);
        assert_eq!(fast.realized_profit, slow.realized_profit);
        assert_eq!(optimized.ledger, reference.ledger);
        assert!(fast.cost_consumed < slow.cost_consumed);
        assert_eq!(optimized.ledger.balance_of(OWNER, X), 5_755_012);
    }

    #[test]
    fn insufficient_profit_rolls_back_the_journal() {
        let mut scenario = two_hop_scenario(10_000_000);
        let before = scenario.ledger.clone();

        let result = run(&OptimizedEngine, &mut scenario);
        assert_eq!(result.failure_class(), Some(FailureClass::InsufficientProfit));
        assert_eq!(scenario.ledger, before);
    }

    #[test]
    fn explicit_beneficiary_receives_profit() {
        let mut scenario = two_hop_scenario(0);
        let beneficiary = Address::repeat_byte(0xbe);
        scenario.plan = crate::plan::ArbitragePlan::builder(X, scenario.plan.borrow_amount())
            .step(scenario.plan.steps()[0].clone())
            .step(scenario.plan.steps()[1].clone())
            .beneficiary(beneficiary)
            .build()
            .unwrap();

        let result = run(&OptimizedEngine, &mut scenario);
        assert!(result.success);
        assert_eq!(scenario.ledger.balance_of(beneficiary, X), 5_755_012);
        assert_eq!(scenario.ledger.balance_of(OWNER, X), 0);
    }

    /// Skips the transfer and calls back with a chosen initiator, possibly twice.
    struct RogueProvider {
        inner: PoolLoanProvider,
        initiator: Option<AccountId>,
        reenter: bool,
    }

    impl LoanProvider for RogueProvider {
        fn account(&self) -> AccountId {
            self.inner.account
        }

        fn premium(&self, principal: Amount) -> Option<Amount> {
            self.inner.premium(principal)
        }

        fn flash_loan(
            &self,
            unit: &mut AtomicUnit<'_>,
            request: &LoanRequest,
            params: crate::plan::PlanId,
            borrower: &mut dyn FlashBorrower,
        ) -> Result<crate::ledger::LoanReceipt, FailureReason> {
            let callback = LoanCallback {
                lender: self.inner.account,
                asset: request.asset,
                principal: request.principal,
                premium: 0,
                initiator: self.initiator.unwrap_or(request.initiator),
                params,
            };
            if self.reenter {
                borrower.on_flash_loan(unit, &callback)?;
            }
            borrower.on_flash_loan(unit, &callback)?;
            Ok(crate::ledger::LoanReceipt {
                principal: request.principal,
                premium: 0,
            })
        }
    }

    #[test]
    fn callback_from_foreign_initiator_is_rejected() {
        let mut scenario = two_hop_scenario(0);
        let before = scenario.ledger.clone();
        let provider = RogueProvider {
            inner: PoolLoanProvider::new(PROVIDER, 5),
            initiator: Some(Address::repeat_byte(0x66)),
            reenter: false,
        };

        let engines: [&dyn ExecutionEngine; 2] = [&OptimizedEngine, &ReferenceEngine];
        for engine in engines {
            let result = engine.run(
                &scenario.plan,
                &mut scenario.ledger,
                &provider,
                &scenario.engine,
            );
            assert_eq!(
                result.failure_class(),
                Some(FailureClass::UnauthorizedCallback)
            );
            assert_eq!(scenario.ledger, before);
        }
    }

    #[test]
    fn reentrant_callback_is_rejected() {
        let mut scenario = two_hop_scenario(0);
        scenario.ledger.credit(ENGINE, X, 1_000_000_000).unwrap();
        let before = scenario.ledger.clone();
        let provider = RogueProvider {
            inner: PoolLoanProvider::new(PROVIDER, 5),
            initiator: None,
            reenter: true,
        };

        let result = run_with(&OptimizedEngine, &mut scenario, &provider);
        assert_eq!(
            result.failure_class(),
            Some(FailureClass::UnauthorizedCallback)
        );
        assert_eq!(scenario.ledger, before);
    }

    fn run_with(
        engine: &dyn ExecutionEngine,
        scenario: &mut Scenario,
        provider: &dyn LoanProvider,
    ) -> ExecutionResult {
        engine.run(&scenario.plan, &mut scenario.ledger, provider, &scenario.engine)
    }
}
