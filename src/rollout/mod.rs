//! Progressive rollout of the optimized engine.
//!
//! Traffic moves up a fixed ladder of percentages one rung at a time and only
//! after enough consecutive optimized successes and a minimum dwell on the
//! current rung. Any parity divergence, critical cost anomaly on the optimized
//! engine, or a windowed success rate under threshold drops traffic to 0%
//! immediately.

pub mod controller;
pub mod selector;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use time::{Duration, OffsetDateTime};

pub use controller::{RolloutController, Transition};
pub use selector::choose_implementation;

use crate::engine::ExecutionResult;
use crate::error::RolloutError;
use crate::monitor::{AnomalyKind, CostAnomaly};
use crate::parity::{DivergenceField, ParityDivergence};

/// Rollout tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutConfig {
    /// Traffic percentages, strictly increasing within 1..=100.
    pub ladder: Vec<u8>,
    /// Consecutive optimized successes needed to advance.
    pub required_successes_per_step: u32,
    /// Minimum time on a rung before advancing.
    pub min_dwell: Duration,
    /// Optimized outcomes kept for the windowed success rate.
    pub observation_window: usize,
    /// Outcomes required before the windowed rate is judged.
    pub min_observations: usize,
    /// Windowed success rate below which the rollout is rolled back.
    pub rollback_threshold: Decimal,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            ladder: vec![1, 5, 10, 25, 50, 100],
            required_successes_per_step: 50,
            min_dwell: Duration::minutes(5),
            observation_window: 100,
            min_observations: 20,
            rollback_threshold: dec!(0.90),
        }
    }
}

impl RolloutConfig {
    /// Check ladder shape and window parameters.
    pub fn validate(&self) -> Result<(), RolloutError> {
        let Some(first) = self.ladder.first() else {
            return Err(RolloutError::InvalidLadder("ladder is empty".into()));
        };
        if *first == 0 {
            return Err(RolloutError::InvalidLadder("rungs must be at least 1%".into()));
        }
        if let Some(pair) = self.ladder.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(RolloutError::InvalidLadder(format!(
                "rungs must strictly increase, found {} then {}",
                pair[0], pair[1]
            )));
        }
        if self.ladder.iter().any(|rung| *rung > 100) {
            return Err(RolloutError::InvalidLadder("rungs must be at most 100%".into()));
        }
        if self.observation_window == 0 || self.min_observations > self.observation_window {
            return Err(RolloutError::InvalidLadder(format!(
                "min_observations {} must fit a non-empty window of {}",
                self.min_observations, self.observation_window
            )));
        }
        if self.rollback_threshold < Decimal::ZERO || self.rollback_threshold > Decimal::ONE {
            return Err(RolloutError::InvalidLadder(format!(
                "rollback threshold {} is outside 0..=1",
                self.rollback_threshold
            )));
        }
        if self.min_dwell.is_negative() {
            return Err(RolloutError::InvalidLadder("min_dwell is negative".into()));
        }
        Ok(())
    }
}

/// Where the rollout stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RolloutStatus {
    /// Climbing the ladder.
    Advancing,
    /// Not moving: awaiting approval, or at the top rung.
    Holding,
    /// Dropped to 0% and awaiting re-approval.
    RolledBack,
}

/// Why a rollout was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    /// Reference and optimized engines disagreed.
    ParityDivergence {
        /// Case or plan that diverged.
        case_id: String,
        /// Observable that differed.
        field: DivergenceField,
    },
    /// Critical cost anomaly on the optimized engine.
    CostAnomaly {
        /// Scenario of the anomalous series.
        scenario_tag: String,
        /// Anomaly details.
        kind: AnomalyKind,
    },
    /// A parity run at startup did not pass.
    ParityGateFailed {
        /// Divergences found.
        divergences: usize,
        /// Expected-class mismatches found.
        mismatches: usize,
    },
    /// Windowed optimized success rate under threshold.
    SuccessRate {
        /// Observed rate.
        success_rate: Decimal,
        /// Configured threshold.
        threshold: Decimal,
    },
}

/// Snapshot of the rollout. Written only by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutState {
    /// Share of opportunities routed to the optimized engine.
    pub traffic_percentage: u8,
    /// Optimized successes since the last failure or rung change.
    pub consecutive_successes: u32,
    /// When the current rung (or state) was entered.
    #[serde(with = "time::serde::rfc3339")]
    pub dwell_start_time: OffsetDateTime,
    /// Current status.
    pub status: RolloutStatus,
    /// Index of the current rung, if serving traffic.
    #[serde(default)]
    pub rung: Option<usize>,
    /// Most recent rollback.
    #[serde(default)]
    pub last_rollback: Option<RollbackReason>,
}

impl RolloutState {
    /// 0% traffic, holding for approval.
    pub fn initial(now: OffsetDateTime) -> Self {
        Self {
            traffic_percentage: 0,
            consecutive_successes: 0,
            dwell_start_time: now,
            status: RolloutStatus::Holding,
            rung: None,
            last_rollback: None,
        }
    }

    /// True while the optimized engine receives traffic.
    pub fn is_active(&self) -> bool {
        self.traffic_percentage > 0
    }
}

/// Input to one evaluation cycle.
#[derive(Debug, Clone)]
pub enum RolloutSignal {
    /// A finished execution.
    Execution(ExecutionResult),
    /// A parity divergence observed outside the gate.
    ParityDivergence(ParityDivergence),
    /// A cost anomaly from the monitor.
    CostAnomaly(CostAnomaly),
}
