//! Differential parity verification.
//!
//! The verifier runs a reference and a candidate engine over the same corpus
//! against byte-identical state and compares success, realized profit, final
//! balances, final venue states and failure class. Any difference is a
//! release blocker for the candidate; a passing [`ParityReport`] is what the
//! rollout controller requires before the optimized engine sees live traffic.

pub mod corpus;
pub mod report;
pub mod verifier;

pub use corpus::{boundary_cases, fuzz_cases, load_corpus, ExpectedClass, ParityCase, Scenario};
pub use report::{CaseCost, ParityReport};
pub use verifier::{
    compare_outcomes, CaseOutcome, ClassMismatch, DivergenceField, ParityDivergence, ParityVerifier,
};

use crate::engine::{OptimizedEngine, ReferenceEngine};

/// Boundary cases followed by `fuzz_count` seeded fuzz cases.
pub fn standard_corpus(seed: u64, fuzz_count: usize) -> Vec<ParityCase> {
    let mut cases = boundary_cases();
    cases.extend(fuzz_cases(seed, fuzz_count));
    cases
}

/// Verify the optimized engine against the reference engine.
pub fn verify_optimized(cases: &[ParityCase]) -> ParityReport {
    ParityVerifier::new(&ReferenceEngine, &OptimizedEngine).run(cases)
}
