//! Cost distribution monitor.
//!
//! Keeps a bounded window of cost samples and outcomes per
//! `(scenario_tag, implementation_tag)` series, exposes p50/p90/p95/p99 over
//! the window, and flags two kinds of anomaly: a sample far above the trailing
//! p99, and a success rate that has dropped below threshold. Anomalies are
//! advisory; they never touch an execution that already finished.

use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use time::OffsetDateTime;

use tracing::debug;

use crate::engine::{ExecutionResult, ImplementationTag};

/// Monitor tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostMonitorConfig {
    /// Cost samples retained per series; the oldest is dropped first.
    pub window_size: usize,
    /// History required before cost spikes are judged.
    pub min_samples: usize,
    /// Sample/p99 ratio above which a spike is a warning.
    pub anomaly_multiplier: Decimal,
    /// Sample/p99 ratio above which a spike is critical.
    pub critical_multiplier: Decimal,
    /// Outcomes considered for the success rate.
    pub success_window: usize,
    /// Success rate below which the series is critical.
    pub success_rate_threshold: Decimal,
    /// Series tracked at once; the least recently updated is evicted first.
    pub max_series: usize,
}

impl Default for CostMonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 1_000,
            min_samples: 30,
            anomaly_multiplier: dec!(1.5),
            critical_multiplier: dec!(3.0),
            success_window: 50,
            success_rate_threshold: dec!(0.5),
            max_series: 256,
        }
    }
}

/// One cost observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasSample {
    /// Scenario grouping key.
    pub scenario_tag: String,
    /// Engine implementation.
    pub implementation_tag: ImplementationTag,
    /// Metered cost.
    pub cost_consumed: u64,
    /// Whether the unit committed.
    pub success: bool,
    /// When the sample was taken.
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl GasSample {
    /// Sample for a finished execution.
    pub fn from_result(
        result: &ExecutionResult,
        scenario_tag: impl Into<String>,
        recorded_at: OffsetDateTime,
    ) -> Self {
        Self {
            scenario_tag: scenario_tag.into(),
            implementation_tag: result.implementation_tag,
            cost_consumed: result.cost_consumed,
            success: result.success,
            recorded_at,
        }
    }
}

/// Cost percentiles of one series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostPercentiles {
    /// Median.
    pub p50: u64,
    /// 90th percentile.
    pub p90: u64,
    /// 95th percentile.
    pub p95: u64,
    /// 99th percentile.
    pub p99: u64,
}

impl CostPercentiles {
    fn from_sorted(sorted: &[u64]) -> Option<Self> {
        if sorted.is_empty() {
            return None;
        }
        Some(Self {
            p50: percentile(sorted, 500),
            p90: percentile(sorted, 900),
            p95: percentile(sorted, 950),
            p99: percentile(sorted, 990),
        })
    }
}

/// Nearest-rank percentile of a sorted, non-empty slice; `per_mille` is the
/// rank in thousandths.
fn percentile(sorted: &[u64], per_mille: usize) -> u64 {
    let index = ((sorted.len() - 1) * per_mille + 500) / 1_000;
    sorted[index.min(sorted.len() - 1)]
}

/// Anomaly severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    /// Worth surfacing to operators.
    Warning,
    /// Grounds for rollback.
    Critical,
}

/// What made a sample anomalous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Cost far above the trailing p99.
    CostSpike {
        /// Sample cost.
        cost: u64,
        /// Trailing p99 before the sample.
        trailing_p99: u64,
        /// `cost / trailing_p99`.
        ratio: Decimal,
    },
    /// Windowed success rate under threshold.
    SuccessRateDrop {
        /// Observed rate.
        success_rate: Decimal,
        /// Configured threshold.
        threshold: Decimal,
    },
}

/// An anomaly on one series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostAnomaly {
    /// Scenario of the series.
    pub scenario_tag: String,
    /// Implementation of the series.
    pub implementation_tag: ImplementationTag,
    /// Severity.
    pub severity: Severity,
    /// Details.
    pub kind: AnomalyKind,
}

/// Per-series statistics for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesSummary {
    /// Scenario of the series.
    pub scenario_tag: String,
    /// Implementation of the series.
    pub implementation_tag: ImplementationTag,
    /// Cost samples in the window.
    pub samples: usize,
    /// Percentiles over the window.
    pub percentiles: Option<CostPercentiles>,
    /// Success rate over the outcome window.
    pub success_rate: Option<Decimal>,
}

#[derive(Debug, Default)]
struct Series {
    costs: VecDeque<u64>,
    outcomes: VecDeque<bool>,
    last_seen: u64,
}

impl Series {
    fn sorted_costs(&self) -> Vec<u64> {
        let mut sorted: Vec<u64> = self.costs.iter().copied().collect();
        sorted.sort_unstable();
        sorted
    }

    fn success_rate(&self) -> Option<Decimal> {
        if self.outcomes.is_empty() {
            return None;
        }
        let successes = self.outcomes.iter().filter(|ok| **ok).count();
        Some(Decimal::from(successes) / Decimal::from(self.outcomes.len()))
    }
}

/// Rolling cost statistics per scenario and implementation.
///
/// Scenario tags come from plans, so the number of series is capped by
/// `max_series`.
#[derive(Debug)]
pub struct CostMonitor {
    config: CostMonitorConfig,
    series: BTreeMap<SeriesKey, Series>,
    recorded: u64,
}

type SeriesKey = (String, ImplementationTag);

impl CostMonitor {
    /// Create an empty monitor.
    pub fn new(config: CostMonitorConfig) -> Self {
        Self {
            config,
            series: BTreeMap::new(),
            recorded: 0,
        }
    }

    /// Record a sample and return any anomalies it raises.
    pub fn record(&mut self, sample: &GasSample) -> Vec<CostAnomaly> {
        let key = (sample.scenario_tag.clone(), sample.implementation_tag);
        if !self.series.contains_key(&key) {
            self.make_room();
        }
        self.recorded += 1;

        let config = &self.config;
        let series = self.series.entry(key).or_default();
        series.last_seen = self.recorded;
        let mut anomalies = Vec::new();
        let anomaly = |severity, kind| CostAnomaly {
            scenario_tag: sample.scenario_tag.clone(),
            implementation_tag: sample.implementation_tag,
            severity,
            kind,
        };

        // Judge against history that excludes the sample itself
        if series.costs.len() >= config.min_samples.max(1) {
            let sorted = series.sorted_costs();
            let trailing_p99 = percentile(&sorted, 990);
            if trailing_p99 > 0 {
                let ratio = Decimal::from(sample.cost_consumed) / Decimal::from(trailing_p99);
                let severity = if ratio > config.critical_multiplier {
                    Some(Severity::Critical)
                } else if ratio > config.anomaly_multiplier {
                    Some(Severity::Warning)
                } else {
                    None
                };
                if let Some(severity) = severity {
                    anomalies.push(anomaly(
                        severity,
                        AnomalyKind::CostSpike {
                            cost: sample.cost_consumed,
                            trailing_p99,
                            ratio,
                        },
                    ));
                }
            }
        }

        series.costs.push_back(sample.cost_consumed);
        while series.costs.len() > config.window_size.max(1) {
            series.costs.pop_front();
        }
        series.outcomes.push_back(sample.success);
        while series.outcomes.len() > config.success_window.max(1) {
            series.outcomes.pop_front();
        }

        if series.outcomes.len() >= config.success_window {
            if let Some(rate) = series.success_rate() {
                if rate < config.success_rate_threshold {
                    anomalies.push(anomaly(
                        Severity::Critical,
                        AnomalyKind::SuccessRateDrop {
                            success_rate: rate,
                            threshold: config.success_rate_threshold,
                        },
                    ));
                }
            }
        }

        anomalies
    }

    fn make_room(&mut self) {
        while self.series.len() >= self.config.max_series.max(1) {
            let Some(stale) = self
                .series
                .iter()
                .min_by_key(|(_, series)| series.last_seen)
                .map(|(key, _)| key.clone())
            else {
                return;
            };
            debug!(scenario = %stale.0, implementation = %stale.1, "Evicting cost series");
            self.series.remove(&stale);
        }
    }

    /// Number of tracked series.
    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Percentiles of one series.
    pub fn percentiles(
        &self,
        scenario_tag: &str,
        implementation_tag: ImplementationTag,
    ) -> Option<CostPercentiles> {
        let series = self
            .series
            .get(&(scenario_tag.to_string(), implementation_tag))?;
        CostPercentiles::from_sorted(&series.sorted_costs())
    }

    /// Summaries of every series, ordered by scenario then implementation.
    pub fn summaries(&self) -> Vec<SeriesSummary> {
        self.series
            .iter()
            .map(|((scenario_tag, implementation_tag), series)| SeriesSummary {
                scenario_tag: scenario_tag.clone(),
                implementation_tag: *implementation_tag,
                samples: series.costs.len(),
                percentiles: CostPercentiles::from_sorted(&series.sorted_costs()),
                success_rate: series.success_rate(),
            })
            .collect()
    }
}
