//! Two-coin StableSwap pools.
//!
//! The invariant `A·n^n·Σx + D = A·D·n^n + D^(n+1) / (n^n·Πx)` behaves like a
//! constant-sum curve near balance and degrades to constant-product away
//! from it. Both `D` and the post-trade balance are solved by Newton
//! iteration in widened integer arithmetic.

use alloy_primitives::aliases::U512;
use serde::{Deserialize, Serialize};

use super::math::{check_fee, mul_div, narrow, wide, FEE_DENOMINATOR};
use super::types::{Amount, AssetId, Direction, ProtocolKind, SwapReceipt, VenueId};
use super::Venue;
use crate::error::VenueError;

const N_COINS: u64 = 2;
const MAX_ITERATIONS: usize = 255;

/// Two-token stable-invariant pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StablePool {
    /// Venue identifier.
    pub id: VenueId,
    /// First token.
    pub token0: AssetId,
    /// Second token.
    pub token1: AssetId,
    /// Balance of `token0` (normalized precision).
    pub balance0: Amount,
    /// Balance of `token1` (normalized precision).
    pub balance1: Amount,
    /// Amplification coefficient `A·n^(n-1)`.
    pub amp: u64,
    /// Fee on output, in pips.
    pub fee_pips: u32,
}

impl StablePool {
    fn direction(&self, token_in: AssetId, token_out: AssetId) -> Result<Direction, VenueError> {
        Direction::resolve(self.token0, self.token1, token_in, token_out)
            .ok_or(VenueError::UnknownPair { token_in, token_out })
    }

    fn balances(&self, direction: Direction) -> (Amount, Amount) {
        match direction {
            Direction::ZeroForOne => (self.balance0, self.balance1),
            Direction::OneForZero => (self.balance1, self.balance0),
        }
    }

    /// Output and the new (in, out) balances for a swap.
    fn simulate(
        &self,
        direction: Direction,
        amount_in: Amount,
    ) -> Result<(Amount, Amount, Amount), VenueError> {
        if amount_in == 0 {
            return Err(VenueError::ZeroAmount);
        }
        if self.amp == 0 {
            return Err(VenueError::InvalidState("amplification must be positive".into()));
        }
        check_fee(self.fee_pips)?;

        let (balance_in, balance_out) = self.balances(direction);
        if balance_in == 0 || balance_out == 0 {
            return Err(VenueError::InsufficientLiquidity);
        }

        let d = invariant_d(wide(balance_in), wide(balance_out), self.amp)?;
        let new_in = wide(balance_in) + wide(amount_in);
        let y = solve_y(new_in, d, self.amp)?;

        // One unit is withheld to absorb solver rounding.
        let dy = wide(balance_out)
            .checked_sub(y)
            .and_then(|v| v.checked_sub(U512::from(1u8)))
            .ok_or(VenueError::InsufficientLiquidity)?;
        let fee = mul_div(
            dy,
            wide(Amount::from(self.fee_pips)),
            wide(Amount::from(FEE_DENOMINATOR)),
        )?;
        let amount_out = narrow(dy - fee)?;

        let new_in = narrow(new_in)?;
        let new_out = balance_out
            .checked_sub(amount_out)
            .ok_or(VenueError::InsufficientLiquidity)?;
        Ok((amount_out, new_in, new_out))
    }
}

/// Solve the invariant `D` for balances `x0`, `x1`.
fn invariant_d(x0: U512, x1: U512, amp: u64) -> Result<U512, VenueError> {
    let n = U512::from(N_COINS);
    let sum = x0 + x1;
    if sum.is_zero() {
        return Ok(U512::ZERO);
    }
    let ann = U512::from(amp) * n;
    let one = U512::from(1u8);

    let mut d = sum;
    for _ in 0..MAX_ITERATIONS {
        let mut d_p = d;
        d_p = mul_div(d_p, d, x0 * n)?;
        d_p = mul_div(d_p, d, x1 * n)?;
        let previous = d;

        let numerator = (ann * sum + d_p * n) * d;
        let denominator = (ann - one) * d + (n + one) * d_p;
        d = numerator
            .checked_div(denominator)
            .ok_or(VenueError::InvariantDiverged)?;

        if abs_diff(d, previous) <= one {
            return Ok(d);
        }
    }
    Err(VenueError::InvariantDiverged)
}

/// Solve the balance of the output coin given the new input balance `x`.
fn solve_y(x: U512, d: U512, amp: u64) -> Result<U512, VenueError> {
    let n = U512::from(N_COINS);
    let one = U512::from(1u8);
    let ann = U512::from(amp) * n;

    let mut c = mul_div(d, d, x * n)?;
    c = mul_div(c, d, ann * n)?;
    let b = x + d / ann;

    let mut y = d;
    for _ in 0..MAX_ITERATIONS {
        let previous = y;
        let denominator = (U512::from(2u8) * y + b)
            .checked_sub(d)
            .ok_or(VenueError::InvariantDiverged)?;
        y = (y * y + c)
            .checked_div(denominator)
            .ok_or(VenueError::InvariantDiverged)?;
        if abs_diff(y, previous) <= one {
            return Ok(y);
        }
    }
    Err(VenueError::InvariantDiverged)
}

fn abs_diff(a: U512, b: U512) -> U512 {
    if a > b {
        a - b
    } else {
        b - a
    }
}

impl Venue for StablePool {
    fn id(&self) -> VenueId {
        self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::StableInvariant
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
        self.simulate(direction, amount_in)
            .map(|(out, _, _)| SwapReceipt::flat(out))
    }

    fn execute(
        &mut self,
        token_in: AssetId,
        token_out: AssetId,
        amount_in: Amount,
        min_amount_out: Amount,
    ) -> Result<SwapReceipt, VenueError> {
        let direction = self.direction(token_in, token_out)?;
        let (amount_out, new_in, new_out) = self.simulate(direction, amount_in)?;
        if amount_out < min_amount_out {
            return Err(VenueError::SlippageExceeded {
                min_amount_out,
                amount_out,
            });
        }
        match direction {
            Direction::ZeroForOne => {
                self.balance0 = new_in;
                self.balance1 = new_out;
            }
            Direction::OneForZero => {
                self.balance1 = new_in;
                self.balance0 = new_out;
            }
        }
        Ok(SwapReceipt::flat(amount_out))
    }
}
