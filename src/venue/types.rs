//! Identifiers and value types shared across the adapter layer.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Token contract identifier.
pub type AssetId = Address;

/// Holder of balances (engine, loan provider, beneficiary).
pub type AccountId = Address;

/// Liquidity venue identifier.
pub type VenueId = Address;

/// Token amount in native base units.
pub type Amount = u128;

/// AMM family implemented by a venue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProtocolKind {
    /// `x * y = k` pools.
    ConstantProduct,
    /// Range-bound liquidity walked tick by tick.
    ConcentratedLiquidity,
    /// StableSwap invariant pools.
    StableInvariant,
}

/// Outcome of a venue swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapReceipt {
    /// Output amount delivered to the caller.
    pub amount_out: Amount,
    /// Liquidity boundaries crossed while filling (concentrated liquidity only).
    pub ticks_crossed: u32,
}

impl SwapReceipt {
    /// Receipt for venues without tick boundaries.
    pub fn flat(amount_out: Amount) -> Self {
        Self {
            amount_out,
            ticks_crossed: 0,
        }
    }
}

/// Orientation of a swap against a two-token venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// token0 in, token1 out.
    ZeroForOne,
    /// token1 in, token0 out.
    OneForZero,
}

impl Direction {
    /// Resolve the direction for a token pair, if the venue trades it.
    pub fn resolve(
        token0: AssetId,
        token1: AssetId,
        token_in: AssetId,
        token_out: AssetId,
    ) -> Option<Self> {
        if token_in == token0 && token_out == token1 {
            Some(Direction::ZeroForOne)
        } else if token_in == token1 && token_out == token0 {
            Some(Direction::OneForZero)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn protocol_kind_round_trips_through_strings() {
        assert_eq!(ProtocolKind::StableInvariant.to_string(), "stable_invariant");
        assert_eq!(
            ProtocolKind::from_str("concentrated_liquidity").unwrap(),
            ProtocolKind::ConcentratedLiquidity
        );
    }

    #[test]
    fn direction_requires_a_traded_pair() {
        let a = Address::repeat_byte(0x01);
        let b = Address::repeat_byte(0x02);
        let c = Address::repeat_byte(0x03);

        assert_eq!(Direction::resolve(a, b, a, b), Some(Direction::ZeroForOne));
        assert_eq!(Direction::resolve(a, b, b, a), Some(Direction::OneForZero));
        assert_eq!(Direction::resolve(a, b, a, c), None);
        assert_eq!(Direction::resolve(a, b, a, a), None);
    }
}
