//! Background control loop.
//!
//! Execution results and live parity divergences arrive as [`ControlEvent`]s on
//! a bounded broadcast channel. The loop drains whatever is queued into one
//! evaluation cycle: samples go to the [`CostMonitor`], the resulting signals go
//! to the [`RolloutController`], and fresh snapshots are published on watch
//! channels. Producers never block; when the channel is full the oldest events
//! are overwritten and counted as dropped.

pub mod store;

use std::future::Future;

use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub use store::{ExecutionRecord, RecordStore};

use crate::engine::ExecutionResult;
use crate::metrics;
use crate::monitor::{CostMonitor, GasSample, SeriesSummary};
use crate::parity::ParityDivergence;
use crate::rollout::{RolloutController, RolloutSignal, RolloutState, Transition};

/// Input to the control loop.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// A plan finished executing.
    Executed {
        /// The result.
        result: ExecutionResult,
        /// Scenario of the plan.
        scenario_tag: String,
        /// When the result was produced.
        recorded_at: OffsetDateTime,
    },
    /// A divergence observed outside the parity gate.
    Divergence(ParityDivergence),
}

/// Producer side of the control loop plus its published snapshots.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    events: broadcast::Sender<ControlEvent>,
    rollout: watch::Receiver<RolloutState>,
    costs: watch::Receiver<Vec<SeriesSummary>>,
}

impl ControlHandle {
    /// Queue an event. Never blocks.
    pub fn emit(&self, event: ControlEvent) {
        if self.events.send(event).is_err() {
            debug!("Control loop is not running, event discarded");
        }
    }

    /// Latest rollout snapshot.
    pub fn rollout_state(&self) -> RolloutState {
        self.rollout.borrow().clone()
    }

    /// Subscribe to rollout snapshots.
    pub fn subscribe_rollout(&self) -> watch::Receiver<RolloutState> {
        self.rollout.clone()
    }

    /// Latest cost summaries.
    pub fn cost_summaries(&self) -> Vec<SeriesSummary> {
        self.costs.borrow().clone()
    }
}

/// Consumer side: owns the monitor and the controller.
pub struct ControlLoop {
    monitor: CostMonitor,
    controller: RolloutController,
    store: Option<RecordStore>,
    events: broadcast::Receiver<ControlEvent>,
    rollout_tx: watch::Sender<RolloutState>,
    costs_tx: watch::Sender<Vec<SeriesSummary>>,
    dropped: u64,
}

impl ControlLoop {
    /// Build a loop and its handle. `capacity` bounds the event queue.
    pub fn new(
        monitor: CostMonitor,
        controller: RolloutController,
        store: Option<RecordStore>,
        capacity: usize,
    ) -> (Self, ControlHandle) {
        let (events_tx, events) = broadcast::channel(capacity.max(1));
        let (rollout_tx, rollout) = watch::channel(controller.state().clone());
        let (costs_tx, costs) = watch::channel(monitor.summaries());
        metrics::set_rollout_traffic(controller.state().traffic_percentage);

        let handle = ControlHandle {
            events: events_tx,
            rollout,
            costs,
        };
        let control = Self {
            monitor,
            controller,
            store,
            events,
            rollout_tx,
            costs_tx,
            dropped: 0,
        };
        (control, handle)
    }

    /// Events overwritten before the loop could read them.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Current rollout snapshot.
    pub fn rollout_state(&self) -> &RolloutState {
        self.controller.state()
    }

    /// Run one evaluation cycle over `events`.
    pub fn process_batch(
        &mut self,
        events: Vec<ControlEvent>,
        now: OffsetDateTime,
    ) -> Vec<Transition> {
        let before = self.controller.state().clone();
        let mut signals = Vec::with_capacity(events.len());

        for event in events {
            match event {
                ControlEvent::Executed {
                    result,
                    scenario_tag,
                    recorded_at,
                } => {
                    let sample = GasSample::from_result(&result, scenario_tag.clone(), recorded_at);
                    for anomaly in self.monitor.record(&sample) {
                        warn!(
                            scenario = %anomaly.scenario_tag,
                            implementation = %anomaly.implementation_tag,
                            severity = %anomaly.severity,
                            kind = ?anomaly.kind,
                            "Cost anomaly"
                        );
                        metrics::inc_cost_anomaly(anomaly.severity);
                        signals.push(RolloutSignal::CostAnomaly(anomaly));
                    }
                    self.persist(&sample, scenario_tag, &result);
                    signals.push(RolloutSignal::Execution(result));
                }
                ControlEvent::Divergence(divergence) => {
                    warn!(
                        case = %divergence.case_id,
                        field = %divergence.field,
                        "Live parity divergence"
                    );
                    metrics::inc_parity_divergence(divergence.field);
                    signals.push(RolloutSignal::ParityDivergence(divergence));
                }
            }
        }

        let transitions = self.controller.evaluate(&signals, now);
        for transition in &transitions {
            metrics::inc_rollout_transition(transition);
        }

        let state = self.controller.state().clone();
        if state != before {
            metrics::set_rollout_traffic(state.traffic_percentage);
            if let Some(store) = &self.store {
                if let Err(err) = store.write_rollout_state(&state) {
                    warn!(error = %err, "Failed to persist rollout state");
                }
            }
        }
        self.rollout_tx.send_replace(state);
        self.costs_tx.send_replace(self.monitor.summaries());
        transitions
    }

    /// Consume events until `shutdown` resolves or every producer is gone.
    pub async fn run<F>(mut self, shutdown: F) -> Self
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            traffic_percentage = self.controller.state().traffic_percentage,
            "Control loop started"
        );

        loop {
            let first = tokio::select! {
                _ = &mut shutdown => break,
                event = self.events.recv() => event,
            };
            let mut batch = match first {
                Ok(event) => vec![event],
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.record_lag(n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            // Drain whatever is already queued
            while let Some(event) = self.try_next_event() {
                batch.push(event);
            }

            debug!(events = batch.len(), "Evaluating control batch");
            self.process_batch(batch, OffsetDateTime::now_utc());
        }

        info!(dropped = self.dropped, "Control loop stopped");
        self
    }

    /// Next queued event without waiting, skipping over dropped ones.
    pub fn try_next_event(&mut self) -> Option<ControlEvent> {
        loop {
            match self.events.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(_) => return None,
            }
        }
    }

    fn record_lag(&mut self, n: u64) {
        self.dropped += n;
        metrics::inc_control_events_dropped(n);
        warn!(skipped = n, "Control loop lagged, oldest events dropped");
    }

    fn persist(&self, sample: &GasSample, scenario_tag: String, result: &ExecutionResult) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.append_gas_sample(sample) {
            warn!(error = %err, "Failed to append gas sample");
        }
        let record = ExecutionRecord {
            recorded_at: sample.recorded_at,
            scenario_tag,
            result: result.clone(),
        };
        if let Err(err) = store.append_execution(&record) {
            warn!(error = %err, "Failed to append execution record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FailureReason, ImplementationTag};
    use crate::monitor::CostMonitorConfig;
    use crate::parity::{DivergenceField, ParityReport};
    use crate::rollout::{RolloutConfig, RolloutStatus};
    use alloy_primitives::B256;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn t0() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH
    }

    fn approved_controller() -> RolloutController {
        let config = RolloutConfig {
            required_successes_per_step: 2,
            min_dwell: time::Duration::ZERO,
            observation_window: 10,
            min_observations: 5,
            rollback_threshold: dec!(0.8),
            ..Default::default()
        };
        let mut controller = RolloutController::new(config, t0()).unwrap();
        let report = ParityReport {
            cases_run: 1,
            cases_passed: 1,
            ..Default::default()
        };
        controller.approve(&report, t0()).unwrap();
        controller
    }

    fn executed(success: bool) -> ControlEvent {
        let result = if success {
            ExecutionResult::committed(B256::ZERO, ImplementationTag::Optimized, 5, 100)
        } else {
            ExecutionResult::reverted(
                B256::ZERO,
                ImplementationTag::Optimized,
                FailureReason::SettlementFailure {
                    detail: "test".into(),
                },
                100,
            )
        };
        ControlEvent::Executed {
            result,
            scenario_tag: "s".into(),
            recorded_at: t0(),
        }
    }

    fn control(capacity: usize, store: Option<RecordStore>) -> (ControlLoop, ControlHandle) {
        ControlLoop::new(
            CostMonitor::new(CostMonitorConfig::default()),
            approved_controller(),
            store,
            capacity,
        )
    }

    #[test]
    fn batch_advances_and_publishes() {
        let (mut control, handle) = control(16, None);
        let transitions = control.process_batch(vec![executed(true), executed(true)], t0());

        assert_eq!(transitions, vec![Transition::Advanced { from: 1, to: 5 }]);
        assert_eq!(handle.rollout_state().traffic_percentage, 5);
        assert_eq!(handle.cost_summaries()[0].samples, 2);
    }

    #[test]
    fn divergence_rolls_back_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        let (mut control, handle) = control(16, Some(store.clone()));

        let divergence = ControlEvent::Divergence(ParityDivergence {
            case_id: "live".into(),
            field: DivergenceField::FinalBalances,
            implementation: None,
            reference: "a".into(),
            candidate: "b".into(),
        });
        control.process_batch(vec![executed(true), divergence], t0());

        let state = handle.rollout_state();
        assert_eq!(state.status, RolloutStatus::RolledBack);
        assert_eq!(store.load_rollout_state().unwrap(), Some(state));
        assert_eq!(store.gas_samples().unwrap().len(), 1);
        assert_eq!(store.execution_records().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_drains_queued_events_and_counts_drops() {
        let (control, handle) = control(4, None);

        // Overflow the queue before the loop starts
        for _ in 0..6 {
            handle.emit(executed(false));
        }
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(control.run(async {
            let _ = stop_rx.await;
        }));

        let mut rollout = handle.subscribe_rollout();
        tokio::time::timeout(std::time::Duration::from_secs(5), rollout.changed())
            .await
            .unwrap()
            .unwrap();
        stop_tx.send(()).unwrap();
        let control = task.await.unwrap();

        assert_eq!(control.dropped(), 2);
        assert_eq!(handle.cost_summaries()[0].samples, 4);
    }
}
