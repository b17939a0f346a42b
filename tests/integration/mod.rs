//! Integration tests for the flashloop engine.
//!
//! These exercise the full path: parity gate, rollout approval, plan
//! submission through the execution service, and the control loop feeding
//! the cost monitor and rollout controller. Everything runs against
//! in-memory fixture venues.

use std::sync::Arc;
use std::time::Duration;

use flashloop::control::{ControlEvent, ControlLoop, RecordStore};
use flashloop::engine::{
    EngineConfig, ExecutionEngine, ExecutionResult, FailureClass, ImplementationTag,
    OptimizedEngine, ReferenceEngine,
};
use flashloop::error::RolloutError;
use flashloop::ledger::{Ledger, LoanProvider};
use flashloop::monitor::{CostMonitor, CostMonitorConfig};
use flashloop::parity::corpus::{
    two_hop_scenario, Scenario, OWNER, POOL_XY, POOL_YX, UNIT, X, Y,
};
use flashloop::parity::{
    standard_corpus, verify_optimized, DivergenceField, ParityDivergence, ParityReport,
};
use flashloop::plan::{ArbitragePlan, SwapStep};
use flashloop::rollout::{RollbackReason, RolloutConfig, RolloutController, RolloutStatus};
use flashloop::service::ExecutionService;
use flashloop::venue::ProtocolKind;
use rust_decimal_macros::dec;
use time::OffsetDateTime;

fn small_plan(nonce: u64) -> ArbitragePlan {
    ArbitragePlan::builder(X, 10 * UNIT)
        .step(SwapStep::new(POOL_XY, ProtocolKind::ConstantProduct, X, Y))
        .step(SwapStep::new(POOL_YX, ProtocolKind::ConstantProduct, Y, X))
        .nonce(nonce)
        .build()
        .unwrap()
}

fn approved_controller(config: RolloutConfig) -> RolloutController {
    let mut controller = RolloutController::new(config, OffsetDateTime::now_utc()).unwrap();
    let report = verify_optimized(&standard_corpus(11, 16));
    assert!(report.passed(), "{:?}", report.divergences);
    controller.approve(&report, OffsetDateTime::now_utc()).unwrap();
    controller
}

fn wire(
    scenario: Scenario,
    controller: RolloutController,
    store: Option<RecordStore>,
) -> (ExecutionService, ControlLoop) {
    let (control, handle) = ControlLoop::new(
        CostMonitor::new(CostMonitorConfig::default()),
        controller,
        store,
        256,
    );
    let service = ExecutionService::new(
        scenario.engine,
        scenario.ledger,
        Arc::new(scenario.provider),
        handle,
    );
    (service, control)
}

fn drain(control: &mut ControlLoop) -> Vec<ControlEvent> {
    std::iter::from_fn(|| control.try_next_event()).collect()
}

/// The standard corpus passes and the report survives a JSON round trip.
#[test]
fn test_parity_gate_passes() {
    let report = verify_optimized(&standard_corpus(0xfeed, 128));
    assert!(report.passed(), "{:?}", report.divergences);
    assert_eq!(report.cases_run, 12 + 128);
    assert!(report.optimized_cost_total() < report.reference_cost_total());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parity_report.json");
    report.write_json(&path).unwrap();
    let raw = std::fs::read_to_string(&path).unwrap();
    let decoded: ParityReport = serde_json::from_str(&raw).unwrap();
    assert_eq!(decoded, report);
}

/// Healthy optimized traffic climbs the ladder; a divergence drops it to zero.
#[test]
fn test_rollout_climbs_then_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let store = RecordStore::open(dir.path()).unwrap();
    let config = RolloutConfig {
        ladder: vec![50, 100],
        required_successes_per_step: 5,
        min_dwell: time::Duration::ZERO,
        observation_window: 20,
        min_observations: 5,
        rollback_threshold: dec!(0.8),
    };
    let controller = approved_controller(config.clone());
    let (service, mut control) = wire(two_hop_scenario(0), controller, Some(store.clone()));
    let service = service.with_seed(42).with_shadow_verify(true);

    let mut total_profit = 0i128;
    for nonce in 0..30 {
        let result = service.submit_plan(&small_plan(nonce));
        assert!(result.success, "{:?}", result.failure_reason);
        total_profit += result.realized_profit;

        let events = drain(&mut control);
        assert!(events
            .iter()
            .all(|event| matches!(event, ControlEvent::Executed { .. })));
        control.process_batch(events, OffsetDateTime::now_utc());
    }

    let state = service.rollout_state();
    assert_eq!(state.traffic_percentage, 100);
    assert_eq!(state.status, RolloutStatus::Holding);
    assert_eq!(
        service.ledger_snapshot().balance_of(OWNER, X),
        u128::try_from(total_profit).unwrap()
    );

    service.report_divergence(ParityDivergence {
        case_id: "external".into(),
        field: DivergenceField::FinalVenues,
        implementation: None,
        reference: "a".into(),
        candidate: "b".into(),
    });
    let events = drain(&mut control);
    control.process_batch(events, OffsetDateTime::now_utc());

    let state = service.rollout_state();
    assert_eq!(state.traffic_percentage, 0);
    assert_eq!(state.status, RolloutStatus::RolledBack);
    assert_eq!(store.load_rollout_state().unwrap(), Some(state));
    assert_eq!(store.execution_records().unwrap().len(), 30);

    // Everything goes to the reference engine until re-approval
    let result = service.submit_plan(&small_plan(1_000));
    assert_eq!(result.implementation_tag, ImplementationTag::Reference);

    // A restart with a passing corpus does not re-approve until cleared
    let persisted = store.load_rollout_state().unwrap().unwrap();
    let mut restarted = RolloutController::restore(config, persisted).unwrap();
    let report = verify_optimized(&standard_corpus(11, 16));
    let now = OffsetDateTime::now_utc();
    assert!(matches!(
        restarted.approve(&report, now),
        Err(RolloutError::UnresolvedDivergence { .. })
    ));
    assert!(restarted.clear_rollback(now).is_some());
    assert_eq!(restarted.approve(&report, now).unwrap().traffic_percentage, 50);
}

/// A reverted plan leaves the live ledger untouched.
#[test]
fn test_reverted_plan_is_atomic() {
    let scenario = two_hop_scenario(10 * UNIT);
    let plan = scenario.plan.clone();
    let controller = RolloutController::new(RolloutConfig::default(), OffsetDateTime::now_utc())
        .unwrap();
    let (service, _control) = wire(scenario, controller, None);
    let before = service.ledger_snapshot();

    let result = service.submit_plan(&plan);
    assert!(!result.success);
    assert_eq!(result.realized_profit, 0);
    assert_eq!(result.failure_class(), Some(FailureClass::InsufficientProfit));
    assert_eq!(service.ledger_snapshot(), before);
}

/// Optimized engine that keeps one extra unit of X for the owner.
struct Skimming;

impl ExecutionEngine for Skimming {
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
        if result.success && ledger.credit(OWNER, X, 1).is_ok() {
            result.realized_profit += 1;
        }
        result
    }
}

/// The background loop rolls back as soon as shadow verification disagrees.
#[tokio::test]
async fn test_control_loop_rolls_back_on_live_divergence() {
    let controller = approved_controller(RolloutConfig {
        ladder: vec![100],
        ..Default::default()
    });
    let (service, control) = wire(two_hop_scenario(0), controller, None);
    let service = Arc::new(
        service
            .with_engines(Arc::new(ReferenceEngine), Arc::new(Skimming))
            .with_shadow_verify(true),
    );

    let mut rollout = service.rollout_state();
    assert_eq!(rollout.traffic_percentage, 100);

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(control.run(async {
        let _ = stop_rx.await;
    }));

    let submitter = Arc::clone(&service);
    let result = tokio::task::spawn_blocking(move || submitter.submit_plan(&small_plan(0)))
        .await
        .unwrap();
    assert_eq!(result.implementation_tag, ImplementationTag::Optimized);

    for _ in 0..100 {
        rollout = service.rollout_state();
        if rollout.status == RolloutStatus::RolledBack {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(rollout.traffic_percentage, 0);
    assert!(matches!(
        rollout.last_rollback,
        Some(RollbackReason::ParityDivergence { .. })
    ));

    stop_tx.send(()).unwrap();
    let control = task.await.unwrap();
    assert_eq!(control.dropped(), 0);
}
