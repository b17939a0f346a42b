//! Application configuration loaded from environment variables.

use alloy_primitives::Address;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::engine::EngineConfig;
use crate::ledger::PoolLoanProvider;
use crate::monitor::CostMonitorConfig;
use crate::rollout::RolloutConfig;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // === Engine Identity ===
    /// Default profit beneficiary.
    pub engine_owner: Address,

    /// Account that receives borrowed funds.
    pub engine_account: Address,

    // === Loan Provider ===
    /// Account holding the provider's liquidity.
    pub loan_provider_account: Address,

    /// Flash-loan premium in basis points.
    #[serde(default = "default_premium_bps")]
    pub loan_premium_bps: u32,

    // === World State & Persistence ===
    /// JSON ledger loaded at startup.
    #[serde(default = "default_world_state_path")]
    pub world_state_path: String,

    /// Directory for record logs and rollout state.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    // === Rollout ===
    /// Traffic ladder, comma separated (e.g. 1,5,10,25,50,100).
    #[serde(default = "default_ladder")]
    pub rollout_ladder: Vec<u8>,

    /// Consecutive optimized successes required per rung.
    #[serde(default = "default_required_successes")]
    pub required_successes_per_step: u32,

    /// Minimum seconds on a rung before advancing.
    #[serde(default = "default_min_dwell_secs")]
    pub min_dwell_secs: u64,

    /// Optimized outcomes in the rollback window.
    #[serde(default = "default_observation_window")]
    pub observation_window: usize,

    /// Outcomes required before the rollback window is judged.
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,

    /// Windowed success rate below which traffic drops to 0%.
    #[serde(default = "default_rollback_threshold")]
    pub rollback_threshold: Decimal,

    // === Cost Monitor ===
    /// Cost samples kept per series.
    #[serde(default = "default_cost_window")]
    pub cost_window: usize,

    /// History required before spikes are judged.
    #[serde(default = "default_cost_min_samples")]
    pub cost_min_samples: usize,

    /// Warning multiplier over trailing p99.
    #[serde(default = "default_anomaly_multiplier")]
    pub anomaly_multiplier: Decimal,

    /// Critical multiplier over trailing p99.
    #[serde(default = "default_critical_multiplier")]
    pub critical_multiplier: Decimal,

    /// Outcomes in the monitor's success-rate window.
    #[serde(default = "default_success_window")]
    pub success_window: usize,

    /// Monitor success rate below which a series is critical.
    #[serde(default = "default_success_rate_threshold")]
    pub success_rate_threshold: Decimal,

    /// Cost series tracked at once.
    #[serde(default = "default_cost_max_series")]
    pub cost_max_series: usize,

    // === Control Loop ===
    /// Capacity of the control event queue.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Shadow optimized executions with the reference engine.
    #[serde(default = "default_true")]
    pub shadow_verify: bool,

    // === Parity Gate ===
    /// Seeded fuzz cases added to the boundary corpus.
    #[serde(default = "default_parity_fuzz_cases")]
    pub parity_fuzz_cases: usize,

    /// Seed for fuzz case generation.
    #[serde(default = "default_parity_seed")]
    pub parity_seed: u64,

    /// Extra JSON corpus file.
    #[serde(default)]
    pub parity_corpus_path: Option<String>,

    // === Server Configuration ===
    /// HTTP server port for API and metrics endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub rust_log: String,

    /// Enable verbose logging.
    #[serde(default)]
    pub verbose: bool,
}

fn default_premium_bps() -> u32 {
    5 // 0.05%
}

fn default_world_state_path() -> String {
    "data/world.json".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_ladder() -> Vec<u8> {
    vec![1, 5, 10, 25, 50, 100]
}

fn default_required_successes() -> u32 {
    50
}

fn default_min_dwell_secs() -> u64 {
    300
}

fn default_observation_window() -> usize {
    100
}

fn default_min_observations() -> usize {
    20
}

fn default_rollback_threshold() -> Decimal {
    Decimal::new(90, 2) // 0.90
}

fn default_cost_window() -> usize {
    1_000
}

fn default_cost_min_samples() -> usize {
    30
}

fn default_anomaly_multiplier() -> Decimal {
    Decimal::new(15, 1) // 1.5
}

fn default_critical_multiplier() -> Decimal {
    Decimal::new(3, 0)
}

fn default_success_window() -> usize {
    50
}

fn default_cost_max_series() -> usize {
    256
}

fn default_success_rate_threshold() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_event_queue_capacity() -> usize {
    1_024
}

fn default_true() -> bool {
    true
}

fn default_parity_fuzz_cases() -> usize {
    256
}

fn default_parity_seed() -> u64 {
    0x5eed
}

fn default_port() -> u16 {
    8080
}

/// Filter used for verbose logging.
pub const VERBOSE_LOG_FILTER: &str = "flashloop=debug,info";

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from environment, reading .env file first.
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Check if the configuration is valid.
    pub fn validate(&self) -> Result<(), String> {
        if self.engine_account == Address::ZERO {
            return Err("ENGINE_ACCOUNT must not be the zero address".to_string());
        }

        if self.engine_account == self.loan_provider_account {
            return Err("ENGINE_ACCOUNT and LOAN_PROVIDER_ACCOUNT must differ".to_string());
        }

        if self.loan_premium_bps > 10_000 {
            return Err("LOAN_PREMIUM_BPS must be at most 10000".to_string());
        }

        if self.event_queue_capacity == 0 {
            return Err("EVENT_QUEUE_CAPACITY must be positive".to_string());
        }

        if self.anomaly_multiplier <= Decimal::ONE
            || self.critical_multiplier < self.anomaly_multiplier
        {
            return Err(
                "ANOMALY_MULTIPLIER must exceed 1 and CRITICAL_MULTIPLIER must not be below it"
                    .to_string(),
            );
        }

        if self.success_rate_threshold < Decimal::ZERO || self.success_rate_threshold > Decimal::ONE
        {
            return Err("SUCCESS_RATE_THRESHOLD must be within 0..=1".to_string());
        }

        self.rollout_config()
            .validate()
            .map_err(|err| err.to_string())?;

        Ok(())
    }

    /// Engine identity.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            owner: self.engine_owner,
            engine_id: self.engine_account,
        }
    }

    /// Loan provider terms.
    pub fn loan_provider(&self) -> PoolLoanProvider {
        PoolLoanProvider::new(self.loan_provider_account, self.loan_premium_bps)
    }

    /// Rollout controller settings.
    pub fn rollout_config(&self) -> RolloutConfig {
        RolloutConfig {
            ladder: self.rollout_ladder.clone(),
            required_successes_per_step: self.required_successes_per_step,
            min_dwell: time::Duration::seconds(
                i64::try_from(self.min_dwell_secs).unwrap_or(i64::MAX),
            ),
            observation_window: self.observation_window,
            min_observations: self.min_observations,
            rollback_threshold: self.rollback_threshold,
        }
    }

    /// Tracing filter directive: `VERBOSE` wins over `RUST_LOG`.
    pub fn log_filter(&self) -> &str {
        if self.verbose {
            VERBOSE_LOG_FILTER
        } else {
            &self.rust_log
        }
    }

    /// Cost monitor settings.
    pub fn monitor_config(&self) -> CostMonitorConfig {
        CostMonitorConfig {
            window_size: self.cost_window,
            min_samples: self.cost_min_samples,
            anomaly_multiplier: self.anomaly_multiplier,
            critical_multiplier: self.critical_multiplier,
            success_window: self.success_window,
            success_rate_threshold: self.success_rate_threshold,
            max_series: self.cost_max_series,
        }
    }
}
