//! Constant-product (`x * y = k`) pools.

use serde::{Deserialize, Serialize};

use super::math::{check_fee, mul_div, narrow, wide, FEE_DENOMINATOR};
use super::types::{Amount, AssetId, Direction, ProtocolKind, SwapReceipt, VenueId};
use super::Venue;
use crate::error::VenueError;

/// Two-token constant-product pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantProductPool {
    /// Venue identifier.
    pub id: VenueId,
    /// First token.
    pub token0: AssetId,
    /// Second token.
    pub token1: AssetId,
    /// Reserve of `token0`.
    pub reserve0: Amount,
    /// Reserve of `token1`.
    pub reserve1: Amount,
    /// Swap fee in pips.
    pub fee_pips: u32,
}

impl ConstantProductPool {
    fn direction(&self, token_in: AssetId, token_out: AssetId) -> Result<Direction, VenueError> {
        Direction::resolve(self.token0, self.token1, token_in, token_out)
            .ok_or(VenueError::UnknownPair { token_in, token_out })
    }

    fn reserves(&self, direction: Direction) -> (Amount, Amount) {
        match direction {
            Direction::ZeroForOne => (self.reserve0, self.reserve1),
            Direction::OneForZero => (self.reserve1, self.reserve0),
        }
    }
}

/// Output of a constant-product swap, floored in favor of the pool.
///
/// `out = in * (1 - fee) * reserve_out / (reserve_in + in * (1 - fee))`
pub fn amount_out(
    amount_in: Amount,
    reserve_in: Amount,
    reserve_out: Amount,
    fee_pips: u32,
) -> Result<Amount, VenueError> {
    if amount_in == 0 {
        return Err(VenueError::ZeroAmount);
    }
    if reserve_in == 0 || reserve_out == 0 {
        return Err(VenueError::InsufficientLiquidity);
    }
    check_fee(fee_pips)?;

    let denominator_scale = wide(Amount::from(FEE_DENOMINATOR));
    let in_with_fee = wide(amount_in) * wide(Amount::from(FEE_DENOMINATOR - fee_pips));
    let denominator = wide(reserve_in) * denominator_scale + in_with_fee;
    narrow(mul_div(in_with_fee, wide(reserve_out), denominator)?)
}

impl Venue for ConstantProductPool {
    fn id(&self) -> VenueId {
        self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::ConstantProduct
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
        let (reserve_in, reserve_out) = self.reserves(direction);
        amount_out(amount_in, reserve_in, reserve_out, self.fee_pips).map(SwapReceipt::flat)
    }

    fn execute(
        &mut self,
        token_in: AssetId,
        token_out: AssetId,
        amount_in: Amount,
        min_amount_out: Amount,
    ) -> Result<SwapReceipt, VenueError> {
        let direction = self.direction(token_in, token_out)?;
        let (reserve_in, reserve_out) = self.reserves(direction);
        let out = amount_out(amount_in, reserve_in, reserve_out, self.fee_pips)?;
        if out < min_amount_out {
            return Err(VenueError::SlippageExceeded {
                min_amount_out,
                amount_out: out,
            });
        }

        let new_in = reserve_in
            .checked_add(amount_in)
            .ok_or(VenueError::ArithmeticOverflow)?;
        let new_out = reserve_out
            .checked_sub(out)
            .ok_or(VenueError::InsufficientLiquidity)?;

        match direction {
            Direction::ZeroForOne => {
                self.reserve0 = new_in;
                self.reserve1 = new_out;
            }
            Direction::OneForZero => {
                self.reserve1 = new_in;
                self.reserve0 = new_out;
            }
        }

        Ok(SwapReceipt::flat(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    const UNIT: Amount = 1_000_000;

    fn pool() -> ConstantProductPool {
        ConstantProductPool {
            id: Address::repeat_byte(0xa1),
            token0: Address::repeat_byte(0x11),
            token1: Address::repeat_byte(0x22),
            reserve0: 50_000 * UNIT,
            reserve1: 51_080 * UNIT,
            fee_pips: 3_000,
        }
    }

    #[test]
    fn amount_out_matches_reference_values() {
        // 1_000 in at 0.30% fee against 50_000 / 51_080.
        let out = amount_out(1_000 * UNIT, 50_000 * UNIT, 51_080 * UNIT, 3_000).unwrap();
        assert_eq!(out, 998_622_664);
    }

    #[test]
    fn amount_out_floors_in_favor_of_pool() {
        // 997 * 10 / (100 + 997/1000 ...) has a fractional part that must be dropped.
        let out = amount_out(10, 100, 100, 3_000).unwrap();
        assert_eq!(out, 9);
    }

    #[test]
    fn zero_input_is_rejected() {
        assert_eq!(amount_out(0, 10, 10, 3_000), Err(VenueError::ZeroAmount));
    }

    #[test]
    fn empty_reserves_are_rejected() {
        assert_eq!(
            amount_out(10, 0, 10, 3_000),
            Err(VenueError::InsufficientLiquidity)
        );
    }

    #[test]
    fn quote_does_not_mutate_and_matches_execute() {
        let mut pool = pool();
        let before = pool.clone();
        let quoted = pool
            .quote(pool.token0, pool.token1, 1_000 * UNIT)
            .unwrap();
        assert_eq!(pool, before);

        let executed = pool
            .execute(pool.token0, pool.token1, 1_000 * UNIT, 0)
            .unwrap();
        assert_eq!(quoted, executed);
        assert_eq!(pool.reserve0, 51_000 * UNIT);
        assert_eq!(pool.reserve1, 51_080 * UNIT - executed.amount_out);
    }

    #[test]
    fn slippage_floor_leaves_reserves_untouched() {
        let mut pool = pool();
        let before = pool.clone();
        let err = pool
            .execute(pool.token0, pool.token1, 1_000 * UNIT, 999 * UNIT)
            .unwrap_err();
        assert!(matches!(err, VenueError::SlippageExceeded { .. }));
        assert_eq!(pool, before);
    }

    #[test]
    fn reverse_direction_uses_swapped_reserves() {
        let pool = pool();
        let forward = pool.quote(pool.token0, pool.token1, UNIT).unwrap();
        let reverse = pool.quote(pool.token1, pool.token0, UNIT).unwrap();
        assert!(forward.amount_out > reverse.amount_out);
    }

    #[test]
    fn unknown_pair_is_rejected() {
        let pool = pool();
        let stranger = Address::repeat_byte(0x99);
        assert!(matches!(
            pool.quote(pool.token0, stranger, UNIT),
            Err(VenueError::UnknownPair { .. })
        ));
    }

    #[test]
    fn reserve_overflow_is_reported() {
        let mut pool = pool();
        let err = pool
            .execute(pool.token0, pool.token1, Amount::MAX, 0)
            .unwrap_err();
        assert_eq!(err, VenueError::ArithmeticOverflow);
    }
}
