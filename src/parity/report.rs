//! Parity run summary.

use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::verifier::{ClassMismatch, ParityDivergence};
use crate::error::Result;

/// Cost of one case on both implementations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseCost {
    /// Case identifier.
    pub case_id: String,
    /// Reference engine cost.
    pub reference: u64,
    /// Optimized engine cost.
    pub optimized: u64,
}

/// Structured outcome of a parity run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParityReport {
    /// Cases executed.
    pub cases_run: usize,
    /// Cases with no divergence and no class mismatch.
    pub cases_passed: usize,
    /// Every divergence found.
    pub divergences: Vec<ParityDivergence>,
    /// Every expected-class miss.
    pub class_mismatches: Vec<ClassMismatch>,
    /// Per-case costs.
    pub costs: Vec<CaseCost>,
}

impl ParityReport {
    /// True when at least one case ran and nothing diverged.
    pub fn passed(&self) -> bool {
        self.cases_run > 0 && self.divergences.is_empty() && self.class_mismatches.is_empty()
    }

    /// Total reference cost.
    pub fn reference_cost_total(&self) -> u64 {
        self.costs.iter().map(|cost| cost.reference).sum()
    }

    /// Total optimized cost.
    pub fn optimized_cost_total(&self) -> u64 {
        self.costs.iter().map(|cost| cost.optimized).sum()
    }

    /// Fraction of reference cost saved by the optimized engine.
    pub fn cost_savings(&self) -> Option<Decimal> {
        let reference = self.reference_cost_total();
        if reference == 0 {
            return None;
        }
        let optimized = Decimal::from(self.optimized_cost_total());
        Some(Decimal::ONE - optimized / Decimal::from(reference))
    }

    /// Write the report as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
