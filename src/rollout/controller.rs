//! Rollout state machine.

use std::collections::VecDeque;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use super::{RollbackReason, RolloutConfig, RolloutSignal, RolloutState, RolloutStatus};
use crate::engine::ImplementationTag;
use crate::error::RolloutError;
use crate::monitor::Severity;
use crate::parity::ParityReport;

/// State change produced by an evaluation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Moved up one rung.
    Advanced {
        /// Previous traffic share.
        from: u8,
        /// New traffic share.
        to: u8,
    },
    /// Dropped to 0%.
    RolledBack {
        /// Traffic share before the rollback.
        from: u8,
        /// What triggered it.
        reason: RollbackReason,
    },
}

/// Single writer of [`RolloutState`].
#[derive(Debug)]
pub struct RolloutController {
    config: RolloutConfig,
    state: RolloutState,
    window: VecDeque<bool>,
}

impl RolloutController {
    /// Start at 0%, holding for approval.
    pub fn new(config: RolloutConfig, now: OffsetDateTime) -> Result<Self, RolloutError> {
        Self::restore(config, RolloutState::initial(now))
    }

    /// Resume from a persisted state.
    ///
    /// A state whose traffic share is not on the configured ladder snaps down
    /// to the highest rung below it, or to 0% if there is none.
    pub fn restore(config: RolloutConfig, mut state: RolloutState) -> Result<Self, RolloutError> {
        config.validate()?;

        if state.is_active() {
            let rung = config
                .ladder
                .iter()
                .rposition(|pct| *pct <= state.traffic_percentage);
            match rung {
                Some(rung) if config.ladder[rung] == state.traffic_percentage => {
                    state.rung = Some(rung);
                }
                Some(rung) => {
                    warn!(
                        persisted = state.traffic_percentage,
                        restored = config.ladder[rung],
                        "Persisted traffic share is not a rung"
                    );
                    state.traffic_percentage = config.ladder[rung];
                    state.rung = Some(rung);
                    state.consecutive_successes = 0;
                }
                None => {
                    warn!(
                        persisted = state.traffic_percentage,
                        "Persisted traffic share is below the first rung"
                    );
                    state.traffic_percentage = 0;
                    state.rung = None;
                    state.status = RolloutStatus::Holding;
                    state.consecutive_successes = 0;
                }
            }
            if state.rung == Some(config.ladder.len() - 1) {
                state.status = RolloutStatus::Holding;
            }
        } else {
            state.rung = None;
        }

        Ok(Self {
            config,
            state,
            window: VecDeque::new(),
        })
    }

    /// Current snapshot.
    pub fn state(&self) -> &RolloutState {
        &self.state
    }

    /// Configuration in force.
    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    /// Optimized outcomes in the observation window.
    pub fn observations(&self) -> usize {
        self.window.len()
    }

    /// Windowed optimized success rate, once enough outcomes are in.
    pub fn windowed_success_rate(&self) -> Option<Decimal> {
        if self.window.is_empty() || self.window.len() < self.config.min_observations {
            return None;
        }
        let successes = self.window.iter().filter(|ok| **ok).count();
        Some(Decimal::from(successes) / Decimal::from(self.window.len()))
    }

    /// Put the optimized engine on the first rung.
    ///
    /// Requires a passing parity report and an inactive rollout; after a
    /// rollback this is the only way back up. A rollback caused by a live
    /// divergence blocks approval until [`clear_rollback`](Self::clear_rollback).
    pub fn approve(
        &mut self,
        report: &ParityReport,
        now: OffsetDateTime,
    ) -> Result<&RolloutState, RolloutError> {
        if !report.passed() {
            return Err(RolloutError::ParityGateFailed {
                divergences: report.divergences.len(),
                mismatches: report.class_mismatches.len(),
            });
        }
        if self.state.is_active() {
            return Err(RolloutError::AlreadyActive {
                traffic_percentage: self.state.traffic_percentage,
            });
        }
        if let Some(RollbackReason::ParityDivergence { case_id, field }) = &self.state.last_rollback
        {
            return Err(RolloutError::UnresolvedDivergence {
                case_id: case_id.clone(),
                field: *field,
            });
        }

        let rung = 0;
        self.state.rung = Some(rung);
        self.state.traffic_percentage = self.config.ladder[rung];
        self.state.status = if self.config.ladder.len() == 1 {
            RolloutStatus::Holding
        } else {
            RolloutStatus::Advancing
        };
        self.state.consecutive_successes = 0;
        self.state.dwell_start_time = now;
        self.window.clear();

        info!(
            traffic_percentage = self.state.traffic_percentage,
            cases = report.cases_run,
            "Rollout approved"
        );
        Ok(&self.state)
    }

    /// Operator acknowledgement of the last rollback. Only valid while
    /// inactive; returns the cleared reason.
    pub fn clear_rollback(&mut self, now: OffsetDateTime) -> Option<RollbackReason> {
        if self.state.is_active() {
            return None;
        }
        let reason = self.state.last_rollback.take()?;
        self.state.status = RolloutStatus::Holding;
        self.state.dwell_start_time = now;
        warn!(reason = ?reason, "Rollback cleared by operator");
        Some(reason)
    }

    /// Drop to 0% outside an evaluation cycle. No-op when inactive.
    pub fn halt(&mut self, reason: RollbackReason, now: OffsetDateTime) -> Option<Transition> {
        if !self.state.is_active() {
            return None;
        }
        Some(self.roll_back(reason, now))
    }

    /// Apply one batch of signals in order.
    ///
    /// Divergences and critical anomalies anywhere in the batch roll back
    /// before any result is counted. Otherwise each optimized result is
    /// observed in turn: every `required_successes_per_step` consecutive
    /// successes earn one rung, and a windowed success rate under threshold
    /// rolls back at the point it occurs.
    pub fn evaluate(&mut self, signals: &[RolloutSignal], now: OffsetDateTime) -> Vec<Transition> {
        if !self.state.is_active() {
            return Vec::new();
        }
        if let Some(reason) = signals.iter().find_map(rollback_reason) {
            return vec![self.roll_back(reason, now)];
        }

        let mut transitions = Vec::new();
        for signal in signals {
            let RolloutSignal::Execution(result) = signal else {
                continue;
            };
            if result.implementation_tag != ImplementationTag::Optimized {
                continue;
            }
            self.observe(result.success);

            if let Some(rate) = self.windowed_success_rate() {
                if rate < self.config.rollback_threshold {
                    let reason = RollbackReason::SuccessRate {
                        success_rate: rate,
                        threshold: self.config.rollback_threshold,
                    };
                    transitions.push(self.roll_back(reason, now));
                    return transitions;
                }
            }
            if result.success {
                transitions.extend(self.try_advance(now));
            }
        }

        // Dwell may have elapsed since the streak was met
        transitions.extend(self.try_advance(now));
        transitions
    }

    fn observe(&mut self, success: bool) {
        self.window.push_back(success);
        while self.window.len() > self.config.observation_window {
            self.window.pop_front();
        }
        if success {
            self.state.consecutive_successes = self.state.consecutive_successes.saturating_add(1);
        } else {
            self.state.consecutive_successes = 0;
        }
    }

    fn roll_back(&mut self, reason: RollbackReason, now: OffsetDateTime) -> Transition {
        let from = self.state.traffic_percentage;
        self.state.traffic_percentage = 0;
        self.state.rung = None;
        self.state.status = RolloutStatus::RolledBack;
        self.state.consecutive_successes = 0;
        self.state.dwell_start_time = now;
        self.state.last_rollback = Some(reason.clone());
        self.window.clear();

        warn!(from, reason = ?reason, "Rollout rolled back");
        Transition::RolledBack { from, reason }
    }

    fn try_advance(&mut self, now: OffsetDateTime) -> Option<Transition> {
        if self.state.status != RolloutStatus::Advancing {
            return None;
        }
        let rung = self.state.rung?;
        let next = rung + 1;
        let to = *self.config.ladder.get(next)?;

        // Check streak and dwell
        if self.state.consecutive_successes < self.config.required_successes_per_step {
            return None;
        }
        if now - self.state.dwell_start_time < self.config.min_dwell {
            return None;
        }

        let from = self.state.traffic_percentage;
        self.state.rung = Some(next);
        self.state.traffic_percentage = to;
        self.state.consecutive_successes = 0;
        self.state.dwell_start_time = now;
        if next + 1 == self.config.ladder.len() {
            self.state.status = RolloutStatus::Holding;
        }

        info!(from, to, status = %self.state.status, "Rollout advanced");
        Some(Transition::Advanced { from, to })
    }
}

fn rollback_reason(signal: &RolloutSignal) -> Option<RollbackReason> {
    match signal {
        RolloutSignal::Execution(_) => None,
        RolloutSignal::ParityDivergence(divergence) => Some(RollbackReason::ParityDivergence {
            case_id: divergence.case_id.clone(),
            field: divergence.field,
        }),
        RolloutSignal::CostAnomaly(anomaly) => (anomaly.implementation_tag
            == ImplementationTag::Optimized
            && anomaly.severity == Severity::Critical)
            .then(|| RollbackReason::CostAnomaly {
                scenario_tag: anomaly.scenario_tag.clone(),
                kind: anomaly.kind.clone(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExecutionResult, FailureReason};
    use crate::monitor::{AnomalyKind, CostAnomaly};
    use crate::parity::{DivergenceField, ParityDivergence};
    use alloy_primitives::B256;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use time::Duration;

    fn t0() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH
    }

    fn config() -> RolloutConfig {
        RolloutConfig {
            ladder: vec![1, 5, 10, 25, 50, 100],
            required_successes_per_step: 3,
            min_dwell: Duration::seconds(60),
            observation_window: 10,
            min_observations: 4,
            rollback_threshold: dec!(0.75),
        }
    }

    fn passing_report() -> ParityReport {
        ParityReport {
            cases_run: 1,
            cases_passed: 1,
            ..Default::default()
        }
    }

    fn optimized(success: bool) -> RolloutSignal {
        result(ImplementationTag::Optimized, success)
    }

    fn result(tag: ImplementationTag, success: bool) -> RolloutSignal {
        RolloutSignal::Execution(if success {
            ExecutionResult::committed(B256::ZERO, tag, 10, 100)
        } else {
            ExecutionResult::reverted(
                B256::ZERO,
                tag,
                FailureReason::InsufficientProfit {
                    realized: -1,
                    required: 1,
                },
                100,
            )
        })
    }

    fn approved() -> RolloutController {
        let mut controller = RolloutController::new(config(), t0()).unwrap();
        controller.approve(&passing_report(), t0()).unwrap();
        controller
    }

    fn critical(tag: ImplementationTag) -> RolloutSignal {
        RolloutSignal::CostAnomaly(CostAnomaly {
            scenario_tag: "s".into(),
            implementation_tag: tag,
            severity: Severity::Critical,
            kind: AnomalyKind::CostSpike {
                cost: 1_000,
                trailing_p99: 100,
                ratio: dec!(10),
            },
        })
    }

    #[test]
    fn starts_inactive_and_ignores_signals() {
        let mut controller = RolloutController::new(config(), t0()).unwrap();
        assert_eq!(controller.state(), &RolloutState::initial(t0()));
        assert!(controller.evaluate(&[optimized(false)], t0()).is_empty());
        assert_eq!(controller.observations(), 0);
    }

    #[test]
    fn approval_requires_a_passing_report() {
        let mut controller = RolloutController::new(config(), t0()).unwrap();
        assert_eq!(
            controller.approve(&ParityReport::default(), t0()),
            Err(RolloutError::ParityGateFailed {
                divergences: 0,
                mismatches: 0,
            })
        );

        let state = controller.approve(&passing_report(), t0()).unwrap();
        assert_eq!(state.traffic_percentage, 1);
        assert_eq!(state.status, RolloutStatus::Advancing);

        assert_eq!(
            controller.approve(&passing_report(), t0()),
            Err(RolloutError::AlreadyActive {
                traffic_percentage: 1
            })
        );
    }

    #[test]
    fn advances_one_rung_after_streak_and_dwell() {
        let mut controller = approved();
        let streak = [optimized(true), optimized(true), optimized(true)];

        // Streak met, dwell not
        assert!(controller.evaluate(&streak, t0() + Duration::seconds(30)).is_empty());
        assert_eq!(controller.state().consecutive_successes, 3);

        let later = t0() + Duration::seconds(60);
        assert_eq!(controller.evaluate(&[], later),
            vec![Transition::Advanced { from: 1, to: 5 }]
        );
        assert_eq!(controller.state().consecutive_successes, 0);
        assert_eq!(controller.state().dwell_start_time, later);
        assert_eq!(controller.state().rung, Some(1));
    }

    #[test]
    fn failure_resets_the_streak() {
        let mut controller = approved();
        let now = t0() + Duration::hours(1);
        let signals = [
            optimized(true),
            optimized(true),
            optimized(false),
            optimized(true),
            optimized(true),
        ];
        assert!(controller.evaluate(&signals, now).is_empty());
        assert_eq!(controller.state().consecutive_successes, 2);
    }

    #[test]
    fn reference_results_do_not_count() {
        let mut controller = approved();
        let now = t0() + Duration::hours(1);
        let signals = vec![result(ImplementationTag::Reference, false); 10];
        assert!(controller.evaluate(&signals, now).is_empty());
        assert_eq!(controller.observations(), 0);
        assert_eq!(controller.state().traffic_percentage, 1);
    }

    #[test]
    fn climbs_the_whole_ladder_then_holds() {
        let mut controller = approved();
        let mut now = t0();
        let mut seen = vec![controller.state().traffic_percentage];
        for _ in 0..10 {
            now += Duration::seconds(60);
            let signals = [optimized(true), optimized(true), optimized(true)];
            for transition in controller.evaluate(&signals, now) {
                if let Transition::Advanced { to, .. } = transition {
                    seen.push(to);
                }
            }
        }
        assert_eq!(seen, vec![1, 5, 10, 25, 50, 100]);
        assert_eq!(controller.state().status, RolloutStatus::Holding);
    }

    #[test]
    fn divergence_rolls_back_even_when_advancing() {
        let mut controller = approved();
        let signals = [
            optimized(true),
            optimized(true),
            optimized(true),
            RolloutSignal::ParityDivergence(ParityDivergence {
                case_id: "live".into(),
                field: DivergenceField::RealizedProfit,
                implementation: None,
                reference: "1".into(),
                candidate: "2".into(),
            }),
        ];

        let transitions = controller.evaluate(&signals, t0() + Duration::hours(1));
        assert_eq!(
            transitions,
            vec![Transition::RolledBack {
                from: 1,
                reason: RollbackReason::ParityDivergence {
                    case_id: "live".into(),
                    field: DivergenceField::RealizedProfit,
                },
            }]
        );
        let state = controller.state();
        assert_eq!(state.traffic_percentage, 0);
        assert_eq!(state.status, RolloutStatus::RolledBack);
        assert_eq!(state.rung, None);
    }

    #[test]
    fn only_critical_optimized_anomalies_roll_back() {
        let mut controller = approved();
        let now = t0();
        assert!(controller.evaluate(&[critical(ImplementationTag::Reference)], now).is_empty());

        let mut warning = critical(ImplementationTag::Optimized);
        if let RolloutSignal::CostAnomaly(anomaly) = &mut warning {
            anomaly.severity = Severity::Warning;
        }
        assert!(controller.evaluate(&[warning], now).is_empty());

        assert!(matches!(
            controller.evaluate(&[critical(ImplementationTag::Optimized)], now).as_slice(),
            [Transition::RolledBack {
                reason: RollbackReason::CostAnomaly { .. },
                ..
            }]
        ));
    }

    #[test]
    fn windowed_success_rate_triggers_rollback() {
        let mut controller = approved();
        let now = t0();

        // Three outcomes are below min_observations
        let few = [optimized(false), optimized(true), optimized(true)];
        assert!(controller.evaluate(&few, now).is_empty());

        // 3/5 = 0.6 < 0.75
        let more = [optimized(true), optimized(false)];
        assert_eq!(controller.evaluate(&more, now),
            vec![Transition::RolledBack {
                from: 1,
                reason: RollbackReason::SuccessRate {
                    success_rate: dec!(0.6),
                    threshold: dec!(0.75),
                },
            }]
        );
    }

    #[test]
    fn rollback_requires_reapproval() {
        let mut controller = approved();
        controller.evaluate(&[critical(ImplementationTag::Optimized)], t0());
        assert!(!controller.state().is_active());

        assert!(controller.evaluate(&[optimized(true)], t0()).is_empty());
        controller.approve(&passing_report(), t0()).unwrap();
        assert_eq!(controller.state().traffic_percentage, 1);
        assert!(controller.state().last_rollback.is_some());
    }

    #[test]
    fn halt_only_affects_active_rollouts() {
        let reason = RollbackReason::ParityGateFailed {
            divergences: 1,
            mismatches: 0,
        };
        let mut idle = RolloutController::new(config(), t0()).unwrap();
        assert_eq!(idle.halt(reason.clone(), t0()), None);

        let mut controller = approved();
        assert_eq!(
            controller.halt(reason.clone(), t0()),
            Some(Transition::RolledBack { from: 1, reason })
        );
        assert_eq!(controller.state().status, RolloutStatus::RolledBack);
    }

    #[test]
    fn restore_snaps_to_the_ladder() {
        let state = RolloutState {
            traffic_percentage: 30,
            consecutive_successes: 7,
            status: RolloutStatus::Advancing,
            rung: Some(9),
            ..RolloutState::initial(t0())
        };
        let controller = RolloutController::restore(config(), state).unwrap();
        assert_eq!(controller.state().traffic_percentage, 25);
        assert_eq!(controller.state().rung, Some(3));
        assert_eq!(controller.state().consecutive_successes, 0);

        let top = RolloutState {
            traffic_percentage: 100,
            status: RolloutStatus::Advancing,
            ..RolloutState::initial(t0())
        };
        let controller = RolloutController::restore(config(), top).unwrap();
        assert_eq!(controller.state().rung, Some(5));
        assert_eq!(controller.state().status, RolloutStatus::Holding);
    }

    fn no_dwell() -> RolloutController {
        let config = RolloutConfig {
            min_dwell: Duration::ZERO,
            ..config()
        };
        let mut controller = RolloutController::new(config, t0()).unwrap();
        controller.approve(&passing_report(), t0()).unwrap();
        controller
    }

    #[test]
    fn batched_successes_earn_one_rung_each() {
        let mut controller = no_dwell();
        let transitions = controller.evaluate(&vec![optimized(true); 6], t0());

        assert_eq!(
            transitions,
            vec![
                Transition::Advanced { from: 1, to: 5 },
                Transition::Advanced { from: 5, to: 10 },
            ]
        );
        assert_eq!(controller.state().traffic_percentage, 10);
        assert_eq!(controller.state().consecutive_successes, 0);
    }

    #[test]
    fn earned_rung_survives_a_later_failure_in_the_batch() {
        let mut controller = no_dwell();
        let signals = [
            optimized(true),
            optimized(true),
            optimized(true),
            optimized(false),
            optimized(true),
        ];

        assert_eq!(
            controller.evaluate(&signals, t0()),
            vec![Transition::Advanced { from: 1, to: 5 }]
        );
        assert_eq!(controller.state().traffic_percentage, 5);
        assert_eq!(controller.state().consecutive_successes, 1);
    }

    #[test]
    fn divergence_anywhere_in_the_batch_beats_earned_rungs() {
        let mut controller = no_dwell();
        let mut signals = vec![optimized(true); 6];
        signals.push(RolloutSignal::ParityDivergence(ParityDivergence {
            case_id: "late".into(),
            field: DivergenceField::FinalBalances,
            implementation: None,
            reference: "1".into(),
            candidate: "2".into(),
        }));

        let transitions = controller.evaluate(&signals, t0());
        assert!(matches!(
            transitions.as_slice(),
            [Transition::RolledBack { from: 1, .. }]
        ));
        assert_eq!(controller.state().traffic_percentage, 0);
    }

    fn diverged_state() -> RolloutState {
        RolloutState {
            status: RolloutStatus::RolledBack,
            last_rollback: Some(RollbackReason::ParityDivergence {
                case_id: "live-plan".into(),
                field: DivergenceField::RealizedProfit,
            }),
            ..RolloutState::initial(t0())
        }
    }

    #[test]
    fn restored_divergence_blocks_reapproval() {
        let mut controller = RolloutController::restore(config(), diverged_state()).unwrap();

        assert_eq!(
            controller.approve(&passing_report(), t0()),
            Err(RolloutError::UnresolvedDivergence {
                case_id: "live-plan".into(),
                field: DivergenceField::RealizedProfit,
            })
        );
        assert_eq!(controller.state().traffic_percentage, 0);
    }

    #[test]
    fn cleared_divergence_allows_reapproval() {
        let mut controller = RolloutController::restore(config(), diverged_state()).unwrap();
        let later = t0() + Duration::minutes(10);

        assert!(matches!(
            controller.clear_rollback(later),
            Some(RollbackReason::ParityDivergence { .. })
        ));
        assert_eq!(controller.state().status, RolloutStatus::Holding);
        assert_eq!(controller.clear_rollback(later), None);

        let state = controller.approve(&passing_report(), later).unwrap();
        assert_eq!(state.traffic_percentage, 1);
    }

    #[test]
    fn clear_rollback_is_refused_while_active() {
        let mut controller = approved();
        assert_eq!(controller.clear_rollback(t0()), None);
        assert_eq!(controller.state().traffic_percentage, 1);
    }
}
