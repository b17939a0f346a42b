//! Plan submission.
//!
//! The service owns the live ledger and both engine implementations. Each
//! submitted plan is consumed at most once, routed to an implementation by the
//! current rollout snapshot, executed as one atomic unit under the ledger lock,
//! and reported to the control loop. Optimized executions can be shadowed by
//! the reference engine on a copy of the pre-state; any difference is reported
//! as a live parity divergence.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::control::{ControlEvent, ControlHandle};
use crate::engine::{
    EngineConfig, ExecutionEngine, ExecutionResult, FailureReason, ImplementationTag,
    OptimizedEngine, ReferenceEngine,
};
use crate::ledger::{Ledger, LoanProvider};
use crate::metrics;
use crate::monitor::SeriesSummary;
use crate::parity::{compare_outcomes, ParityDivergence};
use crate::plan::{ArbitragePlan, PlanId};
use crate::rollout::{choose_implementation, RolloutState};

/// Executes submitted plans against the live ledger.
pub struct ExecutionService {
    engine: EngineConfig,
    ledger: Mutex<Ledger>,
    provider: Arc<dyn LoanProvider>,
    reference: Arc<dyn ExecutionEngine>,
    optimized: Arc<dyn ExecutionEngine>,
    control: ControlHandle,
    rng: Mutex<StdRng>,
    consumed: DashMap<PlanId, Option<u64>>,
    shadow_verify: bool,
}

/// Outcome of [`ExecutionService::advance_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUpdate {
    /// Block the live ledger is at.
    pub block: u64,
    /// Consumed plan ids forgotten because their deadline passed.
    pub pruned: usize,
}

impl ExecutionService {
    /// Create a service over `ledger` with the stock engines.
    pub fn new(
        engine: EngineConfig,
        ledger: Ledger,
        provider: Arc<dyn LoanProvider>,
        control: ControlHandle,
    ) -> Self {
        Self {
            engine,
            ledger: Mutex::new(ledger),
            provider,
            reference: Arc::new(ReferenceEngine),
            optimized: Arc::new(OptimizedEngine),
            control,
            rng: Mutex::new(StdRng::from_entropy()),
            consumed: DashMap::new(),
            shadow_verify: true,
        }
    }

    /// Replace the engine implementations.
    pub fn with_engines(
        mut self,
        reference: Arc<dyn ExecutionEngine>,
        optimized: Arc<dyn ExecutionEngine>,
    ) -> Self {
        self.reference = reference;
        self.optimized = optimized;
        self
    }

    /// Shadow every optimized execution with the reference engine. On by default.
    pub fn with_shadow_verify(mut self, enabled: bool) -> Self {
        self.shadow_verify = enabled;
        self
    }

    /// Seed the traffic selector.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Execute a plan. At most one execution per plan id.
    ///
    /// Ids of plans with a deadline are kept until the ledger passes it;
    /// ids of plans without one are kept for the life of the service.
    #[instrument(skip(self, plan), fields(plan_id = %plan.id()))]
    pub fn submit_plan(&self, plan: &ArbitragePlan) -> ExecutionResult {
        let plan_id = plan.id();
        if self.consumed.insert(plan_id, plan.deadline_block()).is_some() {
            metrics::inc_duplicate_plans();
            warn!("Duplicate plan rejected");
            return ExecutionResult::reverted(
                plan_id,
                ImplementationTag::Reference,
                FailureReason::DuplicatePlan,
                0,
            );
        }

        let rollout = self.control.rollout_state();
        let tag = choose_implementation(&rollout, &mut *lock(&self.rng));

        let _timer = metrics::timer_execution();
        let (result, divergences) = {
            let mut ledger = lock(&self.ledger);
            self.execute(tag, plan, &mut ledger)
        };

        metrics::record_execution(&result);
        info!(
            implementation = %result.implementation_tag,
            success = result.success,
            realized_profit = %result.realized_profit,
            cost = result.cost_consumed,
            traffic_percentage = rollout.traffic_percentage,
            "Plan executed"
        );

        self.control.emit(ControlEvent::Executed {
            result: result.clone(),
            scenario_tag: plan.scenario_tag(),
            recorded_at: OffsetDateTime::now_utc(),
        });
        for divergence in divergences {
            self.control.emit(ControlEvent::Divergence(divergence));
        }
        result
    }

    fn execute(
        &self,
        tag: ImplementationTag,
        plan: &ArbitragePlan,
        ledger: &mut Ledger,
    ) -> (ExecutionResult, Vec<ParityDivergence>) {
        let provider = self.provider.as_ref();
        match tag {
            ImplementationTag::Reference => (
                self.reference.run(plan, ledger, provider, &self.engine),
                Vec::new(),
            ),
            ImplementationTag::Optimized if !self.shadow_verify => (
                self.optimized.run(plan, ledger, provider, &self.engine),
                Vec::new(),
            ),
            ImplementationTag::Optimized => {
                let before = ledger.clone();
                let mut shadow = before.clone();
                let baseline = self.reference.run(plan, &mut shadow, provider, &self.engine);
                let result = self.optimized.run(plan, ledger, provider, &self.engine);
                let divergences = compare_outcomes(
                    &plan.id().to_string(),
                    &before,
                    (&baseline, &shadow),
                    (&result, &*ledger),
                );
                (result, divergences)
            }
        }
    }

    /// Move the live ledger forward to `block` and forget consumed plans
    /// whose deadline is now behind it. Lower blocks are ignored.
    ///
    /// A forgotten plan can be resubmitted, but the block never moves back,
    /// so it fails its deadline check without touching state.
    pub fn advance_block(&self, block: u64) -> BlockUpdate {
        let current = {
            let mut ledger = lock(&self.ledger);
            if block > ledger.block() {
                ledger.set_block(block);
            }
            ledger.block()
        };

        let mut pruned = 0;
        self.consumed.retain(|_, deadline| {
            let live = deadline.map_or(true, |deadline| deadline >= current);
            if !live {
                pruned += 1;
            }
            live
        });
        debug!(block = current, pruned, remaining = self.consumed.len(), "Block advanced");
        BlockUpdate {
            block: current,
            pruned,
        }
    }

    /// Number of plan ids currently held for duplicate detection.
    pub fn consumed_plans(&self) -> usize {
        self.consumed.len()
    }

    /// Forward an externally observed divergence to the control loop.
    pub fn report_divergence(&self, divergence: ParityDivergence) {
        self.control.emit(ControlEvent::Divergence(divergence));
    }

    /// Latest rollout snapshot.
    pub fn rollout_state(&self) -> RolloutState {
        self.control.rollout_state()
    }

    /// Latest cost summaries.
    pub fn cost_summaries(&self) -> Vec<SeriesSummary> {
        self.control.cost_summaries()
    }

    /// Copy of the live ledger.
    pub fn ledger_snapshot(&self) -> Ledger {
        lock(&self.ledger).clone()
    }

    /// Engine identity in use.
    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }
}

/// Units roll back on unwind, so a poisoned lock still guards consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlLoop;
    use crate::monitor::{CostMonitor, CostMonitorConfig};
    use crate::parity::corpus::{two_hop_scenario, OWNER, POOL_XY, POOL_YX, UNIT, X, Y};
    use crate::plan::SwapStep;
    use crate::venue::ProtocolKind;
    use crate::parity::{DivergenceField, ParityReport};
    use crate::rollout::{RolloutConfig, RolloutController};
    use crate::venue::AccountId;
    use pretty_assertions::assert_eq;

    fn service(ladder: Vec<u8>) -> (ExecutionService, ControlLoop, ArbitragePlan) {
        let scenario = two_hop_scenario(2 * UNIT);
        let config = RolloutConfig {
            ladder,
            ..Default::default()
        };
        let mut controller =
            RolloutController::new(config, OffsetDateTime::UNIX_EPOCH).unwrap();
        let report = ParityReport {
            cases_run: 1,
            cases_passed: 1,
            ..Default::default()
        };
        controller
            .approve(&report, OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        let (control, handle) = ControlLoop::new(
            CostMonitor::new(CostMonitorConfig::default()),
            controller,
            None,
            64,
        );
        let service = ExecutionService::new(
            scenario.engine,
            scenario.ledger,
            Arc::new(scenario.provider),
            handle,
        )
        .with_seed(1);
        (service, control, scenario.plan)
    }

    fn balance(service: &ExecutionService, account: AccountId) -> u128 {
        service.ledger_snapshot().balance_of(account, X)
    }

    #[test]
    fn full_traffic_routes_to_optimized() {
        let (service, _control, plan) = service(vec![100]);
        let result = service.submit_plan(&plan);

        assert!(result.success);
        assert_eq!(result.implementation_tag, ImplementationTag::Optimized);
        assert_eq!(result.realized_profit, 5_755_012);
        assert_eq!(balance(&service, OWNER), 5_755_012);
    }

    #[test]
    fn plans_execute_at_most_once() {
        let (service, _control, plan) = service(vec![100]);
        assert!(service.submit_plan(&plan).success);

        let duplicate = service.submit_plan(&plan);
        assert!(!duplicate.success);
        assert_eq!(duplicate.failure_reason, Some(FailureReason::DuplicatePlan));
        assert_eq!(duplicate.cost_consumed, 0);
        assert_eq!(balance(&service, OWNER), 5_755_012);
    }

    #[test]
    fn results_reach_the_control_loop() {
        let (service, mut control, plan) = service(vec![100]);
        service.submit_plan(&plan);

        let events: Vec<_> = std::iter::from_fn(|| control.try_next_event()).collect();
        assert_eq!(events.len(), 1);
        control.process_batch(events, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(service.cost_summaries().len(), 1);
    }

    /// Optimized engine that reports one unit of phantom profit.
    struct Inflating;

    impl ExecutionEngine for Inflating {
        fn tag(&self) -> ImplementationTag {
            ImplementationTag::Optimized
        }

        fn run(
            &self,
            plan: &ArbitragePlan,
            ledger: &mut Ledger,
            provider: &dyn LoanProvider,
            config: &EngineConfig,
        ) -> ExecutionResult {
            let mut result = OptimizedEngine.run(plan, ledger, provider, config);
            result.realized_profit += 1;
            result
        }
    }

    #[test]
    fn shadow_verification_reports_divergence() {
        let (service, mut control, plan) = service(vec![100]);
        let service = service
            .with_engines(Arc::new(ReferenceEngine), Arc::new(Inflating))
            .with_shadow_verify(true);
        service.submit_plan(&plan);

        let mut divergences = Vec::new();
        while let Some(event) = control.try_next_event() {
            if let ControlEvent::Divergence(divergence) = event {
                divergences.push(divergence.field);
            }
        }
        assert_eq!(divergences, vec![DivergenceField::RealizedProfit]);
    }

    #[test]
    fn shadow_verification_is_on_by_default() {
        let (service, _control, _plan) = service(vec![100]);
        assert!(service.shadow_verify);
    }

    fn plan_with_deadline(nonce: u64, deadline: Option<u64>) -> ArbitragePlan {
        let mut builder = ArbitragePlan::builder(X, 10 * UNIT)
            .step(SwapStep::new(POOL_XY, ProtocolKind::ConstantProduct, X, Y))
            .step(SwapStep::new(POOL_YX, ProtocolKind::ConstantProduct, Y, X))
            .nonce(nonce);
        if let Some(deadline) = deadline {
            builder = builder.deadline_block(deadline);
        }
        builder.build().unwrap()
    }

    #[test]
    fn advancing_the_block_prunes_expired_plan_ids() {
        let (service, _control, _plan) = service(vec![100]);
        let expiring = plan_with_deadline(1, Some(5));
        let later = plan_with_deadline(2, Some(50));
        let open_ended = plan_with_deadline(3, None);
        for plan in [&expiring, &later, &open_ended] {
            assert!(service.submit_plan(plan).success);
        }
        assert_eq!(service.consumed_plans(), 3);

        assert_eq!(
            service.advance_block(6),
            BlockUpdate {
                block: 6,
                pruned: 1
            }
        );
        assert_eq!(service.consumed_plans(), 2);
        assert_eq!(service.ledger_snapshot().block(), 6);

        // The forgotten plan still cannot run again
        let replay = service.submit_plan(&expiring);
        assert!(!replay.success);
        assert!(matches!(
            replay.failure_reason,
            Some(FailureReason::DeadlineExpired { .. })
        ));

        let duplicate = service.submit_plan(&later);
        assert_eq!(duplicate.failure_reason, Some(FailureReason::DuplicatePlan));
    }

    #[test]
    fn block_never_moves_back() {
        let (service, _control, _plan) = service(vec![100]);
        service.advance_block(10);
        assert_eq!(
            service.advance_block(3),
            BlockUpdate {
                block: 10,
                pruned: 0
            }
        );
    }
}
