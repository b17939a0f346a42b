//! Parity scenarios: hand-written boundary cases and seeded fuzz cases.

use std::path::Path;

use alloy_primitives::Address;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::engine::{EngineConfig, ExecutionResult, FailureClass};
use crate::error::Result;
use crate::ledger::{Ledger, PoolLoanProvider};
use crate::plan::{ArbitragePlan, PlanBuilder, SwapStep, MAX_CHAIN_LENGTH};
use crate::venue::{
    Amount, AssetId, ConcentratedPool, ConstantProductPool, LiquidityRange, ProtocolKind,
    StablePool, Venue, VenueId, VenueState,
};

/// One whole token at six decimals.
pub const UNIT: Amount = 1_000_000;

/// Borrowed asset of every built-in scenario.
pub const X: AssetId = Address::repeat_byte(0x11);
/// Intermediate asset.
pub const Y: AssetId = Address::repeat_byte(0x22);
/// Intermediate asset.
pub const Z: AssetId = Address::repeat_byte(0x33);
/// Intermediate asset.
pub const W: AssetId = Address::repeat_byte(0x44);

/// Engine account used by built-in scenarios.
pub const ENGINE: Address = Address::repeat_byte(0xe0);
/// Engine owner and default beneficiary.
pub const OWNER: Address = Address::repeat_byte(0x0e);
/// Loan provider account.
pub const PROVIDER: Address = Address::repeat_byte(0x70);

/// Constant-product X/Y pool.
pub const POOL_XY: VenueId = Address::repeat_byte(0xa1);
/// Constant-product Y/X pool priced slightly richer in X.
pub const POOL_YX: VenueId = Address::repeat_byte(0xa2);

const PROVIDER_LIQUIDITY: Amount = 1_000_000 * UNIT;
const PREMIUM_BPS: u32 = 5;
const Q64: u128 = 1 << 64;

/// Everything an engine run needs, byte-identical for both implementations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Mocked world state.
    pub ledger: Ledger,
    /// Plan under test.
    pub plan: ArbitragePlan,
    /// Loan terms.
    pub provider: PoolLoanProvider,
    /// Engine identity.
    pub engine: EngineConfig,
}

/// Outcome class a case is expected to land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedClass {
    /// Commits with profit.
    Profitable,
    /// Reverts on the profit floor.
    Unprofitable,
    /// Reverts for any other reason.
    Reverts,
}

impl ExpectedClass {
    /// Class a result actually landed in.
    pub fn of(result: &ExecutionResult) -> Self {
        match result.failure_class() {
            None => ExpectedClass::Profitable,
            Some(FailureClass::InsufficientProfit) => ExpectedClass::Unprofitable,
            Some(_) => ExpectedClass::Reverts,
        }
    }
}

/// A named scenario with an optional expected class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParityCase {
    /// Case identifier.
    pub id: String,
    /// Inputs.
    pub scenario: Scenario,
    /// Expected outcome class; fuzz cases leave it open.
    #[serde(default)]
    pub expected_class: Option<ExpectedClass>,
}

impl ParityCase {
    fn boundary(id: &str, scenario: Scenario, expected: ExpectedClass) -> Self {
        Self {
            id: id.to_string(),
            scenario,
            expected_class: Some(expected),
        }
    }
}

/// Load a JSON array of cases.
pub fn load_corpus(path: impl AsRef<Path>) -> Result<Vec<ParityCase>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        owner: OWNER,
        engine_id: ENGINE,
    }
}

fn cp_pool(id: VenueId, token0: AssetId, token1: AssetId, r0: Amount, r1: Amount) -> VenueState {
    ConstantProductPool {
        id,
        token0,
        token1,
        reserve0: r0,
        reserve1: r1,
        fee_pips: 3_000,
    }
    .into()
}

fn cp_step(venue: VenueId, token_in: AssetId, token_out: AssetId) -> SwapStep {
    SwapStep::new(venue, ProtocolKind::ConstantProduct, token_in, token_out)
}

fn funded_ledger(venues: impl IntoIterator<Item = VenueState>) -> Ledger {
    let mut ledger = Ledger::new();
    for venue in venues {
        ledger
            .insert_venue(venue)
            .expect("fixture venue ids are distinct");
    }
    ledger
        .credit(PROVIDER, X, PROVIDER_LIQUIDITY)
        .expect("empty ledger accepts provider liquidity");
    ledger
}

fn two_hop_builder(borrow_amount: Amount) -> PlanBuilder {
    ArbitragePlan::builder(X, borrow_amount)
        .step(cp_step(POOL_XY, X, Y))
        .step(cp_step(POOL_YX, Y, X))
}

fn two_hop_ledger() -> Ledger {
    funded_ledger([
        cp_pool(POOL_XY, X, Y, 50_000 * UNIT, 51_080 * UNIT),
        cp_pool(POOL_YX, Y, X, 50_000 * UNIT, 51_540 * UNIT),
    ])
}

fn scenario(ledger: Ledger, builder: PlanBuilder) -> Scenario {
    let plan = builder.build().expect("fixture plans close on the borrowed asset");
    Scenario {
        ledger,
        plan,
        provider: PoolLoanProvider::new(PROVIDER, PREMIUM_BPS),
        engine: engine_config(),
    }
}

/// Borrow 1,000 X at 5 bps, swap X→Y→X across two constant-product pools.
///
/// The loop returns 1,006.255012 X against 1,000.5 owed: 5.755012 X profit.
pub fn two_hop_scenario(min_profit: Amount) -> Scenario {
    scenario(
        two_hop_ledger(),
        two_hop_builder(1_000 * UNIT).min_profit(min_profit),
    )
}

fn single_venue_loop() -> Scenario {
    scenario(
        funded_ledger([cp_pool(POOL_XY, X, Y, 50_000 * UNIT, 51_080 * UNIT)]),
        ArbitragePlan::builder(X, 1_000 * UNIT)
            .step(cp_step(POOL_XY, X, Y))
            .step(cp_step(POOL_XY, Y, X)),
    )
}

fn longest_chain() -> Scenario {
    let mut venues = Vec::with_capacity(MAX_CHAIN_LENGTH);
    let mut builder = ArbitragePlan::builder(X, 1_000 * UNIT).min_profit(2 * UNIT);
    for hop in 0..MAX_CHAIN_LENGTH / 2 {
        let out = venue_address(hop as u16 * 2);
        let back = venue_address(hop as u16 * 2 + 1);
        venues.push(cp_pool(out, X, Y, 50_000 * UNIT, 51_080 * UNIT));
        venues.push(cp_pool(back, Y, X, 50_000 * UNIT, 51_540 * UNIT));
        builder = builder.step(cp_step(out, X, Y)).step(cp_step(back, Y, X));
    }
    scenario(funded_ledger(venues), builder)
}

fn mixed_protocol_loop() -> Scenario {
    let stable = venue_address(0x100);
    let concentrated = venue_address(0x101);
    let exit = venue_address(0x102);
    let ledger = funded_ledger([
        cp_pool(POOL_XY, X, Y, 50_000 * UNIT, 51_080 * UNIT),
        StablePool {
            id: stable,
            token0: Y,
            token1: Z,
            balance0: 1_000_000 * UNIT,
            balance1: 1_000_000 * UNIT,
            amp: 100,
            fee_pips: 400,
        }
        .into(),
        ConcentratedPool {
            id: concentrated,
            token0: Z,
            token1: W,
            sqrt_price_x64: Q64,
            fee_pips: 3_000,
            ranges: vec![
                LiquidityRange {
                    lower_sqrt_price_x64: Q64 / 10 * 9,
                    upper_sqrt_price_x64: Q64,
                    liquidity: 1_000_000_000_000,
                },
                LiquidityRange {
                    lower_sqrt_price_x64: Q64,
                    upper_sqrt_price_x64: Q64 / 10 * 11,
                    liquidity: 1_000_000_000_000,
                },
            ],
        }
        .into(),
        cp_pool(exit, W, X, 50_000 * UNIT, 52_500 * UNIT),
    ]);
    scenario(
        ledger,
        ArbitragePlan::builder(X, 1_000 * UNIT)
            .min_profit(2 * UNIT)
            .step(cp_step(POOL_XY, X, Y))
            .step(SwapStep::new(stable, ProtocolKind::StableInvariant, Y, Z))
            .step(SwapStep::new(
                concentrated,
                ProtocolKind::ConcentratedLiquidity,
                Z,
                W,
            ))
            .step(cp_step(exit, W, X)),
    )
}

/// Hand-written boundary cases.
pub fn boundary_cases() -> Vec<ParityCase> {
    use ExpectedClass::*;

    let mut thin_provider = two_hop_scenario(0);
    thin_provider.ledger = two_hop_ledger();
    thin_provider
        .ledger
        .debit(PROVIDER, X, PROVIDER_LIQUIDITY - 999 * UNIT)
        .expect("provider is funded with PROVIDER_LIQUIDITY");

    let mut max_borrow = scenario(two_hop_ledger(), two_hop_builder(Amount::MAX));
    max_borrow
        .ledger
        .credit(PROVIDER, X, Amount::MAX - PROVIDER_LIQUIDITY)
        .expect("topping up to Amount::MAX cannot overflow");

    let mut expired = scenario(two_hop_ledger(), two_hop_builder(1_000 * UNIT).deadline_block(99));
    expired.ledger.set_block(100);

    vec![
        ParityCase::boundary("profitable-two-hop", two_hop_scenario(2 * UNIT), Profitable),
        ParityCase::boundary("unprofitable-two-hop", two_hop_scenario(10 * UNIT), Unprofitable),
        ParityCase::boundary(
            "zero-borrow",
            scenario(two_hop_ledger(), two_hop_builder(0)),
            Reverts,
        ),
        ParityCase::boundary("max-borrow", max_borrow, Reverts),
        ParityCase::boundary("single-venue-loop", single_venue_loop(), Unprofitable),
        ParityCase::boundary("longest-chain", longest_chain(), Profitable),
        ParityCase::boundary(
            "stale-quote",
            scenario(
                two_hop_ledger(),
                two_hop_builder(1_000 * UNIT).observed_version(POOL_YX, 1),
            ),
            Reverts,
        ),
        ParityCase::boundary(
            "slippage-floor",
            scenario(
                two_hop_ledger(),
                ArbitragePlan::builder(X, 1_000 * UNIT)
                    .step(cp_step(POOL_XY, X, Y))
                    .step(cp_step(POOL_YX, Y, X).with_min_amount_out(1_007 * UNIT)),
            ),
            Reverts,
        ),
        ParityCase::boundary(
            "fee-tier-mismatch",
            scenario(
                two_hop_ledger(),
                ArbitragePlan::builder(X, 1_000 * UNIT)
                    .step(cp_step(POOL_XY, X, Y).with_fee_tier(500))
                    .step(cp_step(POOL_YX, Y, X)),
            ),
            Reverts,
        ),
        ParityCase::boundary("expired-deadline", expired, Reverts),
        ParityCase::boundary("mixed-protocol-loop", mixed_protocol_loop(), Profitable),
        ParityCase::boundary("insufficient-loan-liquidity", thin_provider, Reverts),
    ]
}

/// Deterministic venue address for generated scenarios.
pub fn venue_address(n: u16) -> VenueId {
    let mut bytes = [0u8; 20];
    bytes[0] = 0xfa;
    bytes[18..].copy_from_slice(&n.to_be_bytes());
    Address::from(bytes)
}

const FEE_TIERS: [u32; 4] = [100, 500, 3_000, 10_000];
const FUZZ_ASSETS: [AssetId; 4] = [X, Y, Z, W];

/// `count` reproducible random cases from `seed`.
pub fn fuzz_cases(seed: u64, count: usize) -> Vec<ParityCase> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|n| fuzz_case(&mut rng, seed, n)).collect()
}

fn fuzz_case(rng: &mut StdRng, seed: u64, n: usize) -> ParityCase {
    let hops = rng.gen_range(2..=5usize);

    // Asset loop X -> ... -> X with no self-swaps
    let mut path = vec![X];
    for i in 1..hops {
        let prev = path[i - 1];
        let choices: Vec<AssetId> = FUZZ_ASSETS
            .iter()
            .copied()
            .filter(|asset| *asset != prev && !(i == hops - 1 && *asset == X))
            .collect();
        path.push(choices[rng.gen_range(0..choices.len())]);
    }
    path.push(X);

    let mut ledger = Ledger::new();
    let mut steps = Vec::with_capacity(hops);
    for hop in 0..hops {
        let id = venue_address(hop as u16);
        let (token_in, token_out) = (path[hop], path[hop + 1]);
        let (token0, token1) = if rng.gen_bool(0.5) {
            (token_in, token_out)
        } else {
            (token_out, token_in)
        };
        let venue = fuzz_venue(rng, id, token0, token1);
        let mut step = SwapStep::new(id, venue.kind(), token_in, token_out);
        if rng.gen_bool(0.1) {
            step = step.with_min_amount_out(rng.gen_range(0..=2_000u128) * UNIT);
        }
        if rng.gen_bool(0.1) {
            step = step.with_fee_tier(FEE_TIERS[rng.gen_range(0..FEE_TIERS.len())]);
        }
        ledger
            .insert_venue(venue)
            .expect("generated venue ids are distinct per hop");
        steps.push(step);
    }

    let borrow_amount = match rng.gen_range(0..20u8) {
        0 => 0,
        1 => Amount::MAX / 2,
        _ => rng.gen_range(1..=20_000u128) * UNIT / 10,
    };
    let liquidity = if rng.gen_bool(0.1) {
        borrow_amount / 2
    } else {
        PROVIDER_LIQUIDITY
    };
    ledger
        .credit(PROVIDER, X, liquidity)
        .expect("provider starts with no balance");

    let mut builder = ArbitragePlan::builder(X, borrow_amount)
        .min_profit(rng.gen_range(0..=20u128) * UNIT / 2)
        .nonce(n as u64);
    for step in steps {
        builder = builder.step(step);
    }
    if rng.gen_bool(0.1) {
        builder = builder.observed_version(venue_address(0), rng.gen_range(0..2));
    }
    if rng.gen_bool(0.05) {
        ledger.set_block(10);
        builder = builder.deadline_block(rng.gen_range(8..=12));
    }

    let premium_bps = [0, 5, 9, 30][rng.gen_range(0..4)];
    let plan = builder
        .build()
        .expect("generated paths start and end at X without self-swaps");

    ParityCase {
        id: format!("fuzz-{seed}-{n}"),
        scenario: Scenario {
            ledger,
            plan,
            provider: PoolLoanProvider::new(PROVIDER, premium_bps),
            engine: engine_config(),
        },
        expected_class: None,
    }
}

fn fuzz_venue(rng: &mut StdRng, id: VenueId, token0: AssetId, token1: AssetId) -> VenueState {
    let depth = rng.gen_range(1_000..=1_000_000u128) * UNIT;
    let skewed = depth / 1_000 * rng.gen_range(900..=1_100u128);
    match rng.gen_range(0..4u8) {
        0 => StablePool {
            id,
            token0,
            token1,
            balance0: depth,
            balance1: skewed,
            amp: [10, 100, 1_000][rng.gen_range(0..3)],
            fee_pips: [100, 400][rng.gen_range(0..2)],
        }
        .into(),
        1 => {
            let liquidity = |rng: &mut StdRng| {
                if rng.gen_bool(0.2) {
                    0
                } else {
                    rng.gen_range(1_000_000_000..=10_000_000_000_000u128)
                }
            };
            let bounds = [Q64 / 10 * 8, Q64 / 10 * 9, Q64 / 10 * 11, Q64 / 10 * 12];
            ConcentratedPool {
                id,
                token0,
                token1,
                sqrt_price_x64: Q64 / 100 * rng.gen_range(95..=105u128),
                fee_pips: FEE_TIERS[rng.gen_range(0..FEE_TIERS.len())],
                ranges: bounds
                    .windows(2)
                    .map(|pair| LiquidityRange {
                        lower_sqrt_price_x64: pair[0],
                        upper_sqrt_price_x64: pair[1],
                        liquidity: liquidity(rng),
                    })
                    .collect(),
            }
            .into()
        }
        _ => ConstantProductPool {
            id,
            token0,
            token1,
            reserve0: depth,
            reserve1: skewed,
            fee_pips: FEE_TIERS[rng.gen_range(0..FEE_TIERS.len())],
        }
        .into(),
    }
}
