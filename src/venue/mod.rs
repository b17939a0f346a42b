//! Protocol adapter layer.
//!
//! Every AMM family implements the same [`Venue`] capability. The execution
//! engines only ever talk to [`VenueState`], the tagged union over the
//! families, so protocol identity is resolved once when a venue is loaded and
//! never branched on by the engine.

pub mod concentrated;
pub mod constant_product;
pub mod math;
pub mod stable;
pub mod types;

use serde::{Deserialize, Serialize};

pub use concentrated::{ConcentratedPool, LiquidityRange};
pub use constant_product::ConstantProductPool;
pub use stable::StablePool;
pub use types::{AccountId, Amount, AssetId, Direction, ProtocolKind, SwapReceipt, VenueId};

use crate::error::VenueError;

/// Quote/execute capability shared by every liquidity venue.
pub trait Venue {
    /// Venue identifier.
    fn id(&self) -> VenueId;

    /// AMM family.
    fn kind(&self) -> ProtocolKind;

    /// Swap fee in pips.
    fn fee_pips(&self) -> u32;

    /// Read-only output for `amount_in`; a pure function of venue state.
    fn quote(
        &self,
        token_in: AssetId,
        token_out: AssetId,
        amount_in: Amount,
    ) -> Result<SwapReceipt, VenueError>;

    /// Perform the swap. Fails without mutating anything when the output
    /// would fall below `min_amount_out`.
    fn execute(
        &mut self,
        token_in: AssetId,
        token_out: AssetId,
        amount_in: Amount,
        min_amount_out: Amount,
    ) -> Result<SwapReceipt, VenueError>;
}

/// Any supported venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueState {
    /// Constant-product pool.
    ConstantProduct(ConstantProductPool),
    /// Concentrated-liquidity pool.
    ConcentratedLiquidity(ConcentratedPool),
    /// Stable-invariant pool.
    StableInvariant(StablePool),
}

impl VenueState {
    fn as_venue(&self) -> &dyn Venue {
        match self {
            VenueState::ConstantProduct(pool) => pool,
            VenueState::ConcentratedLiquidity(pool) => pool,
            VenueState::StableInvariant(pool) => pool,
        }
    }

    fn as_venue_mut(&mut self) -> &mut dyn Venue {
        match self {
            VenueState::ConstantProduct(pool) => pool,
            VenueState::ConcentratedLiquidity(pool) => pool,
            VenueState::StableInvariant(pool) => pool,
        }
    }
}

impl Venue for VenueState {
    fn id(&self) -> VenueId {
        self.as_venue().id()
    }

    fn kind(&self) -> ProtocolKind {
        self.as_venue().kind()
    }

    fn fee_pips(&self) -> u32 {
        self.as_venue().fee_pips()
    }

    fn quote(
        &self,
        token_in: AssetId,
        token_out: AssetId,
        amount_in: Amount,
    ) -> Result<SwapReceipt, VenueError> {
        self.as_venue().quote(token_in, token_out, amount_in)
    }

    fn execute(
        &mut self,
        token_in: AssetId,
        token_out: AssetId,
        amount_in: Amount,
        min_amount_out: Amount,
    ) -> Result<SwapReceipt, VenueError> {
        self.as_venue_mut()
            .execute(token_in, token_out, amount_in, min_amount_out)
    }
}

impl From<ConstantProductPool> for VenueState {
    fn from(pool: ConstantProductPool) -> Self {
        VenueState::ConstantProduct(pool)
    }
}

impl From<ConcentratedPool> for VenueState {
    fn from(pool: ConcentratedPool) -> Self {
        VenueState::ConcentratedLiquidity(pool)
    }
}

impl From<StablePool> for VenueState {
    fn from(pool: StablePool) -> Self {
        VenueState::StableInvariant(pool)
    }
}
