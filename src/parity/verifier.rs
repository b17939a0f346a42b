//! Differential execution of two engine implementations.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use tracing::{info, instrument, warn};

use super::corpus::{ExpectedClass, ParityCase};
use super::report::{CaseCost, ParityReport};
use crate::engine::{ExecutionEngine, ExecutionResult, ImplementationTag};
use crate::ledger::Ledger;

/// Observable compared between the two implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DivergenceField {
    /// Commit/revert outcome.
    Success,
    /// Profit paid out.
    RealizedProfit,
    /// Account balances after the run.
    FinalBalances,
    /// Venue states and versions after the run.
    FinalVenues,
    /// Class of the failure reason.
    FailureReasonClass,
    /// A reverted run left state behind.
    Atomicity,
}

/// One observed difference. Always a release blocker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParityDivergence {
    /// Case that diverged.
    pub case_id: String,
    /// What differed.
    pub field: DivergenceField,
    /// Implementation at fault, for single-implementation checks.
    #[serde(default)]
    pub implementation: Option<ImplementationTag>,
    /// Reference-side value.
    pub reference: String,
    /// Candidate-side value.
    pub candidate: String,
}

/// A case whose outcome did not land in its expected class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMismatch {
    /// Case identifier.
    pub case_id: String,
    /// Expected class.
    pub expected: ExpectedClass,
    /// Class produced by the reference engine.
    pub reference: ExpectedClass,
    /// Class produced by the candidate engine.
    pub candidate: ExpectedClass,
}

/// Results of one case on both engines.
#[derive(Debug, Clone)]
pub struct CaseOutcome {
    /// Case identifier.
    pub case_id: String,
    /// Reference result.
    pub reference: ExecutionResult,
    /// Candidate result.
    pub candidate: ExecutionResult,
    /// Differences found.
    pub divergences: Vec<ParityDivergence>,
    /// Expected-class miss, if any.
    pub class_mismatch: Option<ClassMismatch>,
}

/// Runs a reference and a candidate engine side by side.
pub struct ParityVerifier<'a> {
    reference: &'a dyn ExecutionEngine,
    candidate: &'a dyn ExecutionEngine,
}

impl<'a> ParityVerifier<'a> {
    /// Compare `candidate` against `reference`.
    pub fn new(reference: &'a dyn ExecutionEngine, candidate: &'a dyn ExecutionEngine) -> Self {
        Self {
            reference,
            candidate,
        }
    }

    /// Run both engines on one case against identical copies of its state.
    #[instrument(skip(self, case), fields(case = %case.id))]
    pub fn verify_case(&self, case: &ParityCase) -> CaseOutcome {
        let scenario = &case.scenario;
        let mut reference_ledger = scenario.ledger.clone();
        let mut candidate_ledger = scenario.ledger.clone();

        let reference = self.reference.run(
            &scenario.plan,
            &mut reference_ledger,
            &scenario.provider,
            &scenario.engine,
        );
        let candidate = self.candidate.run(
            &scenario.plan,
            &mut candidate_ledger,
            &scenario.provider,
            &scenario.engine,
        );

        let divergences = compare_outcomes(
            &case.id,
            &scenario.ledger,
            (&reference, &reference_ledger),
            (&candidate, &candidate_ledger),
        );

        let class_mismatch = case.expected_class.and_then(|expected| {
            let reference = ExpectedClass::of(&reference);
            let candidate = ExpectedClass::of(&candidate);
            (reference != expected || candidate != expected).then(|| ClassMismatch {
                case_id: case.id.clone(),
                expected,
                reference,
                candidate,
            })
        });

        if !divergences.is_empty() {
            warn!(count = divergences.len(), "Parity divergence");
        }

        CaseOutcome {
            case_id: case.id.clone(),
            reference,
            candidate,
            divergences,
            class_mismatch,
        }
    }

    /// Run a whole corpus and summarize.
    pub fn run(&self, cases: &[ParityCase]) -> ParityReport {
        let mut report = ParityReport::default();
        for case in cases {
            let outcome = self.verify_case(case);
            report.cases_run += 1;
            if outcome.divergences.is_empty() && outcome.class_mismatch.is_none() {
                report.cases_passed += 1;
            }
            report.costs.push(CaseCost {
                case_id: outcome.case_id,
                reference: outcome.reference.cost_consumed,
                optimized: outcome.candidate.cost_consumed,
            });
            report.divergences.extend(outcome.divergences);
            report.class_mismatches.extend(outcome.class_mismatch);
        }

        info!(
            cases = report.cases_run,
            passed = report.cases_passed,
            divergences = report.divergences.len(),
            class_mismatches = report.class_mismatches.len(),
            "Parity run finished"
        );
        report
    }
}

/// Compare two runs of the same plan that started from `before`.
///
/// Each side is the result together with the ledger it left behind.
pub fn compare_outcomes(
    case_id: &str,
    before: &Ledger,
    reference: (&ExecutionResult, &Ledger),
    candidate: (&ExecutionResult, &Ledger),
) -> Vec<ParityDivergence> {
    let (reference, reference_ledger) = reference;
    let (candidate, candidate_ledger) = candidate;

    let mut divergences = Vec::new();
    let mut diverge = |field, reference: String, candidate: String| {
        divergences.push(ParityDivergence {
            case_id: case_id.to_string(),
            field,
            implementation: None,
            reference,
            candidate,
        });
    };

    if reference.success != candidate.success {
        diverge(
            DivergenceField::Success,
            reference.success.to_string(),
            candidate.success.to_string(),
        );
    }
    if reference.realized_profit != candidate.realized_profit {
        diverge(
            DivergenceField::RealizedProfit,
            reference.realized_profit.to_string(),
            candidate.realized_profit.to_string(),
        );
    }
    if reference.failure_class() != candidate.failure_class() {
        diverge(
            DivergenceField::FailureReasonClass,
            format!("{:?}", reference.failure_class()),
            format!("{:?}", candidate.failure_class()),
        );
    }
    if reference_ledger.balances() != candidate_ledger.balances() {
        diverge(
            DivergenceField::FinalBalances,
            render(reference_ledger.balances()),
            render(candidate_ledger.balances()),
        );
    }
    if reference_ledger.venues() != candidate_ledger.venues() {
        diverge(
            DivergenceField::FinalVenues,
            render(reference_ledger.venues()),
            render(candidate_ledger.venues()),
        );
    }

    for (result, after) in [(reference, reference_ledger), (candidate, candidate_ledger)] {
        if let Some(divergence) = atomicity(case_id, result, before, after) {
            divergences.push(divergence);
        }
    }
    divergences
}

/// A reverted run must leave the ledger exactly as it found it.
fn atomicity(
    case_id: &str,
    result: &ExecutionResult,
    before: &Ledger,
    after: &Ledger,
) -> Option<ParityDivergence> {
    if result.success || before == after {
        return None;
    }
    Some(ParityDivergence {
        case_id: case_id.to_string(),
        field: DivergenceField::Atomicity,
        implementation: Some(result.implementation_tag),
        reference: render(before),
        candidate: render(after),
    })
}

fn render<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|err| format!("<unrenderable: {err}>"))
}
