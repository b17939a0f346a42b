//! Arbitrage plan types and construction-time path validation.

use std::collections::BTreeMap;

use alloy_primitives::{keccak256, B256};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::PlanError;
use crate::venue::{AccountId, Amount, AssetId, ProtocolKind, VenueId};

/// Longest swap chain a plan may contain.
pub const MAX_CHAIN_LENGTH: usize = 8;

/// Content hash identifying a plan.
pub type PlanId = B256;

/// One hop of the arbitrage loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapStep {
    /// Venue executing the hop.
    pub venue_id: VenueId,
    /// AMM family the detector quoted against.
    pub protocol_kind: ProtocolKind,
    /// Token spent.
    pub token_in: AssetId,
    /// Token received.
    pub token_out: AssetId,
    /// Expected venue fee in pips, if pinned.
    #[serde(default)]
    pub fee_tier: Option<u32>,
    /// Slippage floor for this hop.
    #[serde(default)]
    pub min_amount_out: Amount,
}

impl SwapStep {
    /// Create a step with no fee pin and no slippage floor.
    pub fn new(
        venue_id: VenueId,
        protocol_kind: ProtocolKind,
        token_in: AssetId,
        token_out: AssetId,
    ) -> Self {
        Self {
            venue_id,
            protocol_kind,
            token_in,
            token_out,
            fee_tier: None,
            min_amount_out: 0,
        }
    }

    /// Pin the venue fee.
    pub fn with_fee_tier(mut self, fee_pips: u32) -> Self {
        self.fee_tier = Some(fee_pips);
        self
    }

    /// Set the slippage floor.
    pub fn with_min_amount_out(mut self, min_amount_out: Amount) -> Self {
        self.min_amount_out = min_amount_out;
        self
    }
}

/// Wire form of a plan. Only turns into an [`ArbitragePlan`] through
/// validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    /// Asset borrowed and returned.
    pub borrowed_asset: AssetId,
    /// Principal to borrow.
    pub borrow_amount: Amount,
    /// Minimum profit to commit.
    #[serde(default)]
    pub min_profit: Amount,
    /// Ordered swap chain.
    pub steps: Vec<SwapStep>,
    /// Distinguishes otherwise identical plans.
    #[serde(default)]
    pub nonce: u64,
    /// Profit recipient; the engine owner when absent.
    #[serde(default)]
    pub beneficiary: Option<AccountId>,
    /// Grouping key for cost statistics.
    #[serde(default)]
    pub scenario_tag: Option<String>,
    /// Venue versions the plan was quoted against.
    #[serde(default)]
    pub observed_versions: BTreeMap<VenueId, u64>,
    /// Last block at which the plan may run.
    #[serde(default)]
    pub deadline_block: Option<u64>,
}

/// Validated, immutable closed-loop arbitrage plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PlanSpec", into = "PlanSpec")]
pub struct ArbitragePlan {
    id: PlanId,
    borrowed_asset: AssetId,
    borrow_amount: Amount,
    min_profit: Amount,
    steps: SmallVec<[SwapStep; 4]>,
    nonce: u64,
    beneficiary: Option<AccountId>,
    scenario_tag: Option<String>,
    observed_versions: BTreeMap<VenueId, u64>,
    deadline_block: Option<u64>,
}

impl ArbitragePlan {
    /// Start building a plan that borrows `borrow_amount` of `borrowed_asset`.
    pub fn builder(borrowed_asset: AssetId, borrow_amount: Amount) -> PlanBuilder {
        PlanBuilder {
            spec: PlanSpec {
                borrowed_asset,
                borrow_amount,
                min_profit: 0,
                steps: Vec::new(),
                nonce: 0,
                beneficiary: None,
                scenario_tag: None,
                observed_versions: BTreeMap::new(),
                deadline_block: None,
            },
        }
    }

    /// Plan identifier.
    pub fn id(&self) -> PlanId {
        self.id
    }

    /// Asset borrowed and returned.
    pub fn borrowed_asset(&self) -> AssetId {
        self.borrowed_asset
    }

    /// Principal to borrow.
    pub fn borrow_amount(&self) -> Amount {
        self.borrow_amount
    }

    /// Minimum profit requested by the detector.
    pub fn min_profit(&self) -> Amount {
        self.min_profit
    }

    /// Profit floor actually enforced: committed units are strictly profitable.
    pub fn profit_floor(&self) -> Amount {
        self.min_profit.max(1)
    }

    /// Ordered swap chain.
    pub fn steps(&self) -> &[SwapStep] {
        &self.steps
    }

    /// Explicit beneficiary, if any.
    pub fn beneficiary(&self) -> Option<AccountId> {
        self.beneficiary
    }

    /// Venue version the plan was quoted against.
    pub fn observed_version(&self, venue: &VenueId) -> Option<u64> {
        self.observed_versions.get(venue).copied()
    }

    /// Last block at which the plan may run.
    pub fn deadline_block(&self) -> Option<u64> {
        self.deadline_block
    }

    /// Cost-statistics key: explicit tag or the protocol kinds along the path.
    pub fn scenario_tag(&self) -> String {
        match &self.scenario_tag {
            Some(tag) => tag.clone(),
            None => self
                .steps
                .iter()
                .map(|step| step.protocol_kind.to_string())
                .collect::<Vec<_>>()
                .join(">"),
        }
    }

    /// Check the closed-loop and chaining invariants of a path.
    pub fn validate_path(borrowed_asset: AssetId, steps: &[SwapStep]) -> Result<(), PlanError> {
        let first = steps.first().ok_or(PlanError::EmptyPath)?;
        if steps.len() > MAX_CHAIN_LENGTH {
            return Err(PlanError::ChainTooLong {
                len: steps.len(),
                max: MAX_CHAIN_LENGTH,
            });
        }
        if first.token_in != borrowed_asset {
            return Err(PlanError::OpenStart {
                borrowed: borrowed_asset,
                token_in: first.token_in,
            });
        }
        for (index, step) in steps.iter().enumerate() {
            if step.token_in == step.token_out {
                return Err(PlanError::DegenerateStep {
                    step: index,
                    token: step.token_in,
                });
            }
        }
        for (index, pair) in steps.windows(2).enumerate() {
            if pair[0].token_out != pair[1].token_in {
                return Err(PlanError::BrokenChain {
                    step: index,
                    next: index + 1,
                    token_out: pair[0].token_out,
                    token_in: pair[1].token_in,
                });
            }
        }
        let last = steps.last().unwrap_or(first);
        if last.token_out != borrowed_asset {
            return Err(PlanError::OpenEnd {
                borrowed: borrowed_asset,
                token_out: last.token_out,
            });
        }
        Ok(())
    }
}

impl TryFrom<PlanSpec> for ArbitragePlan {
    type Error = PlanError;

    fn try_from(spec: PlanSpec) -> Result<Self, Self::Error> {
        ArbitragePlan::validate_path(spec.borrowed_asset, &spec.steps)?;
        let id = canonical_id(&spec);
        Ok(Self {
            id,
            borrowed_asset: spec.borrowed_asset,
            borrow_amount: spec.borrow_amount,
            min_profit: spec.min_profit,
            steps: SmallVec::from_vec(spec.steps),
            nonce: spec.nonce,
            beneficiary: spec.beneficiary,
            scenario_tag: spec.scenario_tag,
            observed_versions: spec.observed_versions,
            deadline_block: spec.deadline_block,
        })
    }
}

impl From<ArbitragePlan> for PlanSpec {
    fn from(plan: ArbitragePlan) -> Self {
        PlanSpec {
            borrowed_asset: plan.borrowed_asset,
            borrow_amount: plan.borrow_amount,
            min_profit: plan.min_profit,
            steps: plan.steps.into_vec(),
            nonce: plan.nonce,
            beneficiary: plan.beneficiary,
            scenario_tag: plan.scenario_tag,
            observed_versions: plan.observed_versions,
            deadline_block: plan.deadline_block,
        }
    }
}

/// Keccak-256 over a fixed field encoding of the plan.
fn canonical_id(spec: &PlanSpec) -> PlanId {
    let mut bytes = Vec::with_capacity(128 + spec.steps.len() * 96);
    bytes.extend_from_slice(spec.borrowed_asset.as_slice());
    bytes.extend_from_slice(&spec.borrow_amount.to_be_bytes());
    bytes.extend_from_slice(&spec.min_profit.to_be_bytes());
    bytes.extend_from_slice(&spec.nonce.to_be_bytes());

    match spec.beneficiary {
        Some(account) => {
            bytes.push(1);
            bytes.extend_from_slice(account.as_slice());
        }
        None => bytes.push(0),
    }
    match spec.deadline_block {
        Some(block) => {
            bytes.push(1);
            bytes.extend_from_slice(&block.to_be_bytes());
        }
        None => bytes.push(0),
    }
    match &spec.scenario_tag {
        Some(tag) => {
            bytes.push(1);
            bytes.extend_from_slice(&(tag.len() as u64).to_be_bytes());
            bytes.extend_from_slice(tag.as_bytes());
        }
        None => bytes.push(0),
    }

    bytes.extend_from_slice(&(spec.steps.len() as u64).to_be_bytes());
    for step in &spec.steps {
        bytes.extend_from_slice(step.venue_id.as_slice());
        bytes.push(step.protocol_kind as u8);
        bytes.extend_from_slice(step.token_in.as_slice());
        bytes.extend_from_slice(step.token_out.as_slice());
        match step.fee_tier {
            Some(fee) => {
                bytes.push(1);
                bytes.extend_from_slice(&fee.to_be_bytes());
            }
            None => bytes.push(0),
        }
        bytes.extend_from_slice(&step.min_amount_out.to_be_bytes());
    }

    bytes.extend_from_slice(&(spec.observed_versions.len() as u64).to_be_bytes());
    for (venue, version) in &spec.observed_versions {
        bytes.extend_from_slice(venue.as_slice());
        bytes.extend_from_slice(&version.to_be_bytes());
    }

    keccak256(&bytes)
}

/// Incremental plan construction.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    spec: PlanSpec,
}

impl PlanBuilder {
    /// Append a swap step.
    pub fn step(mut self, step: SwapStep) -> Self {
        self.spec.steps.push(step);
        self
    }

    /// Minimum profit required to commit.
    pub fn min_profit(mut self, min_profit: Amount) -> Self {
        self.spec.min_profit = min_profit;
        self
    }

    /// Nonce distinguishing repeated plans.
    pub fn nonce(mut self, nonce: u64) -> Self {
        self.spec.nonce = nonce;
        self
    }

    /// Profit recipient.
    pub fn beneficiary(mut self, beneficiary: AccountId) -> Self {
        self.spec.beneficiary = Some(beneficiary);
        self
    }

    /// Cost-statistics key.
    pub fn scenario_tag(mut self, tag: impl Into<String>) -> Self {
        self.spec.scenario_tag = Some(tag.into());
        self
    }

    /// Record the venue version the plan was quoted against.
    pub fn observed_version(mut self, venue: VenueId, version: u64) -> Self {
        self.spec.observed_versions.insert(venue, version);
        self
    }

    /// Last block at which the plan may run.
    pub fn deadline_block(mut self, block: u64) -> Self {
        self.spec.deadline_block = Some(block);
        self
    }

    /// Validate and freeze the plan.
    pub fn build(self) -> Result<ArbitragePlan, PlanError> {
        ArbitragePlan::try_from(self.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;
    use pretty_assertions::assert_eq;

    fn x() -> AssetId {
        Address::repeat_byte(0x11)
    }

    fn y() -> AssetId {
        Address::repeat_byte(0x22)
    }

    fn z() -> AssetId {
        Address::repeat_byte(0x33)
    }

    fn cp(venue: u8, token_in: AssetId, token_out: AssetId) -> SwapStep {
        SwapStep::new(
            Address::repeat_byte(venue),
            ProtocolKind::ConstantProduct,
            token_in,
            token_out,
        )
    }

    #[test]
    fn accepts_closed_two_hop_loop() {
        let plan = ArbitragePlan::builder(x(), 1_000)
            .step(cp(0xa1, x(), y()))
            .step(cp(0xa2, y(), x()))
            .min_profit(2)
            .build()
            .unwrap();

        assert_eq!(plan.steps().len(), 2);
        assert_eq!(plan.scenario_tag(), "constant_product>constant_product");
        assert_eq!(plan.profit_floor(), 2);
    }

    #[test]
    fn rejects_empty_path() {
        let err = ArbitragePlan::builder(x(), 1_000).build().unwrap_err();
        assert_eq!(err, PlanError::EmptyPath);
    }

    #[test]
    fn rejects_path_not_starting_at_borrowed_asset() {
        let err = ArbitragePlan::builder(x(), 1_000)
            .step(cp(0xa1, y(), x()))
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::OpenStart { .. }));
    }

    #[test]
    fn rejects_open_loop() {
        let err = ArbitragePlan::builder(x(), 1_000)
            .step(cp(0xa1, x(), y()))
            .step(cp(0xa2, y(), z()))
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::OpenEnd { .. }));
    }

    #[test]
    fn rejects_broken_chain() {
        let err = ArbitragePlan::builder(x(), 1_000)
            .step(cp(0xa1, x(), y()))
            .step(cp(0xa2, z(), x()))
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::BrokenChain { step: 0, next: 1, .. }));
    }

    #[test]
    fn rejects_degenerate_step() {
        let err = ArbitragePlan::builder(x(), 1_000)
            .step(cp(0xa1, x(), x()))
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::DegenerateStep { step: 0, .. }));
    }

    #[test]
    fn rejects_overlong_chain() {
        let mut builder = ArbitragePlan::builder(x(), 1_000);
        for hop in 0..=MAX_CHAIN_LENGTH / 2 {
            builder = builder
                .step(cp(hop as u8, x(), y()))
                .step(cp(hop as u8, y(), x()));
        }
        let err = builder.build().unwrap_err();
        assert!(matches!(err, PlanError::ChainTooLong { .. }));
    }

    #[test]
    fn id_depends_on_nonce_and_is_stable() {
        let make = |nonce| {
            ArbitragePlan::builder(x(), 1_000)
                .step(cp(0xa1, x(), y()))
                .step(cp(0xa2, y(), x()))
                .nonce(nonce)
                .build()
                .unwrap()
        };
        assert_eq!(make(1).id(), make(1).id());
        assert_ne!(make(1).id(), make(2).id());
    }

    #[test]
    fn deserialization_goes_through_validation() {
        let plan = ArbitragePlan::builder(x(), 1_000)
            .step(cp(0xa1, x(), y()))
            .step(cp(0xa2, y(), x()))
            .scenario_tag("cp-loop")
            .observed_version(Address::repeat_byte(0xa1), 3)
            .build()
            .unwrap();

        let json = serde_json::to_string(&plan).unwrap();
        let decoded: ArbitragePlan = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, plan);

        let mut spec: PlanSpec = serde_json::from_str(&json).unwrap();
        spec.steps.pop();
        let broken = serde_json::to_string(&spec).unwrap();
        assert!(serde_json::from_str::<ArbitragePlan>(&broken).is_err());
    }

    #[test]
    fn profit_floor_is_at_least_one_unit() {
        let plan = ArbitragePlan::builder(x(), 1_000)
            .step(cp(0xa1, x(), y()))
            .step(cp(0xa2, y(), x()))
            .build()
            .unwrap();
        assert_eq!(plan.min_profit(), 0);
        assert_eq!(plan.profit_floor(), 1);
    }
}
