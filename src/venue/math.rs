//! Widened integer helpers shared by the AMM implementations.
//!
//! Every intermediate product is carried in 512 bits so that
//! `u128 * u128 * u128` never wraps; only the final narrowing back to
//! [`Amount`] can fail.

use alloy_primitives::aliases::U512;

use super::types::Amount;
use crate::error::VenueError;

/// Fee denominator: fees are expressed in pips (parts per million).
pub const FEE_DENOMINATOR: u32 = 1_000_000;

/// Q64.64 fixed-point resolution used for concentrated-liquidity prices.
pub const Q64_SHIFT: usize = 64;

/// Widen an amount into the 512-bit working type.
#[inline]
pub fn wide(value: Amount) -> U512 {
    U512::from(value)
}

/// Narrow a 512-bit value back to an amount.
#[inline]
pub fn narrow(value: U512) -> Result<Amount, VenueError> {
    Amount::try_from(value).map_err(|_| VenueError::ArithmeticOverflow)
}

/// `2^64` in the working type.
#[inline]
pub fn q64() -> U512 {
    U512::from(1u8) << Q64_SHIFT
}

/// `a * b / denominator`, rounded down.
pub fn mul_div(a: U512, b: U512, denominator: U512) -> Result<U512, VenueError> {
    let product = a.checked_mul(b).ok_or(VenueError::ArithmeticOverflow)?;
    product
        .checked_div(denominator)
        .ok_or(VenueError::ArithmeticOverflow)
}

/// `a * b / denominator`, rounded up.
pub fn mul_div_ceil(a: U512, b: U512, denominator: U512) -> Result<U512, VenueError> {
    let product = a.checked_mul(b).ok_or(VenueError::ArithmeticOverflow)?;
    div_ceil(product, denominator)
}

/// `numerator / denominator`, rounded up.
pub fn div_ceil(numerator: U512, denominator: U512) -> Result<U512, VenueError> {
    if denominator.is_zero() {
        return Err(VenueError::ArithmeticOverflow);
    }
    let quotient = numerator / denominator;
    if (numerator % denominator).is_zero() {
        Ok(quotient)
    } else {
        Ok(quotient + U512::from(1u8))
    }
}

/// Validate a fee expressed in pips.
pub fn check_fee(fee_pips: u32) -> Result<(), VenueError> {
    if fee_pips >= FEE_DENOMINATOR {
        return Err(VenueError::InvalidState(format!(
            "fee {fee_pips} pips must be below {FEE_DENOMINATOR}"
        )));
    }
    Ok(())
}
