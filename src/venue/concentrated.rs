//! Concentrated-liquidity pools.
//!
//! Liquidity is provided over contiguous price ranges whose boundaries are the
//! pool's initialized ticks. A swap walks the ranges in the direction of
//! travel, computing one swap step per range: the input needed to reach the
//! next boundary, or the partial price move when the remaining input runs out.
//! Fees are charged on the input consumed inside each range.
//!
//! Prices are stored as `sqrt(price)` in Q64.64 where `price = token1 / token0`.

use alloy_primitives::aliases::U512;
use serde::{Deserialize, Serialize};

use super::math::{
    check_fee, div_ceil, mul_div, mul_div_ceil, narrow, q64, wide, FEE_DENOMINATOR, Q64_SHIFT,
};
use super::types::{Amount, AssetId, Direction, ProtocolKind, SwapReceipt, VenueId};
use super::Venue;
use crate::error::VenueError;

/// Liquidity available between two adjacent ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityRange {
    /// Lower boundary, `sqrt(price)` in Q64.64.
    pub lower_sqrt_price_x64: u128,
    /// Upper boundary, `sqrt(price)` in Q64.64.
    pub upper_sqrt_price_x64: u128,
    /// Active liquidity inside the range.
    pub liquidity: u128,
}

/// Two-token concentrated-liquidity pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcentratedPool {
    /// Venue identifier.
    pub id: VenueId,
    /// First token (price denominator).
    pub token0: AssetId,
    /// Second token (price numerator).
    pub token1: AssetId,
    /// Current `sqrt(price)` in Q64.64.
    pub sqrt_price_x64: u128,
    /// Swap fee in pips.
    pub fee_pips: u32,
    /// Contiguous ranges sorted by price.
    pub ranges: Vec<LiquidityRange>,
}

/// Result of a single in-range swap step.
#[derive(Debug, Clone, Copy)]
struct SwapStepOutcome {
    sqrt_price_next: U512,
    amount_in: U512,
    amount_out: U512,
    fee: U512,
}

/// Simulated full swap.
#[derive(Debug, Clone, Copy)]
struct Simulation {
    receipt: SwapReceipt,
    sqrt_price_after: u128,
}

impl ConcentratedPool {
    /// Check that ranges are ordered, contiguous and contain the current price.
    pub fn validate(&self) -> Result<(), VenueError> {
        check_fee(self.fee_pips)?;
        let first = self
            .ranges
            .first()
            .ok_or_else(|| VenueError::InvalidState("pool has no liquidity ranges".into()))?;
        let last = self.ranges.last().unwrap_or(first);

        for range in &self.ranges {
            if range.lower_sqrt_price_x64 == 0
                || range.lower_sqrt_price_x64 >= range.upper_sqrt_price_x64
            {
                return Err(VenueError::InvalidState(format!(
                    "range [{}, {}] is empty or unbounded",
                    range.lower_sqrt_price_x64, range.upper_sqrt_price_x64
                )));
            }
        }
        for pair in self.ranges.windows(2) {
            if pair[0].upper_sqrt_price_x64 != pair[1].lower_sqrt_price_x64 {
                return Err(VenueError::InvalidState(
                    "liquidity ranges are not contiguous".into(),
                ));
            }
        }
        if self.sqrt_price_x64 < first.lower_sqrt_price_x64
            || self.sqrt_price_x64 > last.upper_sqrt_price_x64
        {
            return Err(VenueError::InvalidState(
                "current price lies outside the liquidity ranges".into(),
            ));
        }
        Ok(())
    }

    fn direction(&self, token_in: AssetId, token_out: AssetId) -> Result<Direction, VenueError> {
        Direction::resolve(self.token0, self.token1, token_in, token_out)
            .ok_or(VenueError::UnknownPair { token_in, token_out })
    }

    /// Range traversed when leaving `sqrt_price` in `direction`.
    ///
    /// Moving down, a price sitting exactly on a boundary belongs to the range
    /// below it; moving up, to the range above it.
    fn active_range(&self, sqrt_price: u128, direction: Direction) -> Option<&LiquidityRange> {
        self.ranges.iter().find(|range| match direction {
            Direction::ZeroForOne => {
                range.lower_sqrt_price_x64 < sqrt_price && sqrt_price <= range.upper_sqrt_price_x64
            }
            Direction::OneForZero => {
                range.lower_sqrt_price_x64 <= sqrt_price && sqrt_price < range.upper_sqrt_price_x64
            }
        })
    }

    fn simulate(&self, direction: Direction, amount_in: Amount) -> Result<Simulation, VenueError> {
        if amount_in == 0 {
            return Err(VenueError::ZeroAmount);
        }
        self.validate()?;

        let mut remaining = wide(amount_in);
        let mut amount_out = U512::ZERO;
        let mut sqrt_price = self.sqrt_price_x64;
        let mut ticks_crossed = 0u32;

        while !remaining.is_zero() {
            let range = self
                .active_range(sqrt_price, direction)
                .ok_or(VenueError::InsufficientLiquidity)?;
            let target = match direction {
                Direction::ZeroForOne => range.lower_sqrt_price_x64,
                Direction::OneForZero => range.upper_sqrt_price_x64,
            };

            let step = compute_swap_step(
                wide(sqrt_price),
                wide(target),
                wide(range.liquidity),
                remaining,
                self.fee_pips,
                direction,
            )?;

            let consumed = step.amount_in + step.fee;
            remaining = remaining
                .checked_sub(consumed)
                .ok_or(VenueError::ArithmeticOverflow)?;
            amount_out = amount_out
                .checked_add(step.amount_out)
                .ok_or(VenueError::ArithmeticOverflow)?;
            sqrt_price = narrow(step.sqrt_price_next)?;

            if step.sqrt_price_next == wide(target) {
                ticks_crossed += 1;
            }
        }

        Ok(Simulation {
            receipt: SwapReceipt {
                amount_out: narrow(amount_out)?,
                ticks_crossed,
            },
            sqrt_price_after: sqrt_price,
        })
    }
}

/// One swap step inside a single liquidity range.
fn compute_swap_step(
    sqrt_current: U512,
    sqrt_target: U512,
    liquidity: U512,
    remaining: U512,
    fee_pips: u32,
    direction: Direction,
) -> Result<SwapStepOutcome, VenueError> {
    let fee_denominator = wide(Amount::from(FEE_DENOMINATOR));
    let fee_complement = wide(Amount::from(FEE_DENOMINATOR - fee_pips));
    let remaining_less_fee = mul_div(remaining, fee_complement, fee_denominator)?;

    let amount_in_to_target = match direction {
        Direction::ZeroForOne => amount0_delta(sqrt_target, sqrt_current, liquidity, true)?,
        Direction::OneForZero => amount1_delta(sqrt_current, sqrt_target, liquidity, true)?,
    };

    let reaches_target = remaining_less_fee >= amount_in_to_target;
    let sqrt_price_next = if reaches_target {
        sqrt_target
    } else {
        match direction {
            Direction::ZeroForOne => {
                next_sqrt_price_from_amount0(sqrt_current, liquidity, remaining_less_fee)?
            }
            Direction::OneForZero => {
                next_sqrt_price_from_amount1(sqrt_current, liquidity, remaining_less_fee)?
            }
        }
    };

    let (amount_in, amount_out) = match direction {
        Direction::ZeroForOne => (
            if reaches_target {
                amount_in_to_target
            } else {
                amount0_delta(sqrt_price_next, sqrt_current, liquidity, true)?
            },
            amount1_delta(sqrt_price_next, sqrt_current, liquidity, false)?,
        ),
        Direction::OneForZero => (
            if reaches_target {
                amount_in_to_target
            } else {
                amount1_delta(sqrt_current, sqrt_price_next, liquidity, true)?
            },
            amount0_delta(sqrt_current, sqrt_price_next, liquidity, false)?,
        ),
    };

    let fee = if reaches_target {
        mul_div_ceil(amount_in, wide(Amount::from(fee_pips)), fee_complement)?
    } else {
        // A partial fill consumes the whole remainder; the excess over the
        // priced input is the fee.
        remaining
            .checked_sub(amount_in)
            .ok_or(VenueError::ArithmeticOverflow)?
    };

    Ok(SwapStepOutcome {
        sqrt_price_next,
        amount_in,
        amount_out,
        fee,
    })
}

/// token0 needed to move between `sqrt_lower` and `sqrt_upper`:
/// `L * 2^64 * (upper - lower) / (upper * lower)`.
fn amount0_delta(
    sqrt_lower: U512,
    sqrt_upper: U512,
    liquidity: U512,
    round_up: bool,
) -> Result<U512, VenueError> {
    if sqrt_lower.is_zero() || sqrt_lower > sqrt_upper {
        return Err(VenueError::InvalidState("sqrt price bounds out of order".into()));
    }
    let numerator = liquidity << Q64_SHIFT;
    let diff = sqrt_upper - sqrt_lower;
    if round_up {
        let partial = mul_div_ceil(numerator, diff, sqrt_upper)?;
        div_ceil(partial, sqrt_lower)
    } else {
        let partial = mul_div(numerator, diff, sqrt_upper)?;
        Ok(partial / sqrt_lower)
    }
}

/// token1 needed to move between `sqrt_lower` and `sqrt_upper`:
/// `L * (upper - lower) / 2^64`.
fn amount1_delta(
    sqrt_lower: U512,
    sqrt_upper: U512,
    liquidity: U512,
    round_up: bool,
) -> Result<U512, VenueError> {
    if sqrt_lower > sqrt_upper {
        return Err(VenueError::InvalidState("sqrt price bounds out of order".into()));
    }
    let diff = sqrt_upper - sqrt_lower;
    if round_up {
        mul_div_ceil(liquidity, diff, q64())
    } else {
        mul_div(liquidity, diff, q64())
    }
}

/// Price after adding `amount` of token0, rounded up so the pool never
/// over-delivers: `L * 2^64 * P / (L * 2^64 + amount * P)`.
fn next_sqrt_price_from_amount0(
    sqrt_price: U512,
    liquidity: U512,
    amount: U512,
) -> Result<U512, VenueError> {
    if amount.is_zero() {
        return Ok(sqrt_price);
    }
    let numerator = liquidity << Q64_SHIFT;
    let product = amount
        .checked_mul(sqrt_price)
        .ok_or(VenueError::ArithmeticOverflow)?;
    let denominator = numerator
        .checked_add(product)
        .ok_or(VenueError::ArithmeticOverflow)?;
    mul_div_ceil(numerator, sqrt_price, denominator)
}

/// Price after adding `amount` of token1, rounded down:
/// `P + amount * 2^64 / L`.
fn next_sqrt_price_from_amount1(
    sqrt_price: U512,
    liquidity: U512,
    amount: U512,
) -> Result<U512, VenueError> {
    if liquidity.is_zero() {
        return Err(VenueError::InsufficientLiquidity);
    }
    let delta = mul_div(amount, q64(), liquidity)?;
    sqrt_price
        .checked_add(delta)
        .ok_or(VenueError::ArithmeticOverflow)
}

impl Venue for ConcentratedPool {
    fn id(&self) -> VenueId {
        self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::ConcentratedLiquidity
    }

    fn fee_pips(&self) -> u32 {
        self.fee_pips
    }

    fn quote(
        &self,
        token_in: AssetId,
        token_out: AssetId,
        amount_in: Amount,
    ) -> Result<SwapReceipt, VenueError> {
        let direction = self.direction(token_in, token_out)?;
        self.simulate(direction, amount_in).map(|sim| sim.receipt)
    }

    fn execute(
        &mut self,
        token_in: AssetId,
        token_out: AssetId,
        amount_in: Amount,
        min_amount_out: Amount,
    ) -> Result<SwapReceipt, VenueError> {
        let direction = self.direction(token_in, token_out)?;
        let sim = self.simulate(direction, amount_in)?;
        if sim.receipt.amount_out < min_amount_out {
            return Err(VenueError::SlippageExceeded {
                min_amount_out,
                amount_out: sim.receipt.amount_out,
            });
        }
        self.sqrt_price_x64 = sim.sqrt_price_after;
        Ok(sim.receipt)
    }
}
