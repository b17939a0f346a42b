//! Deterministic resource-cost metering.
//!
//! Costs are abstract units in the spirit of EVM gas: every chargeable
//! operation has a fixed price, so the same run on the same ledger always
//! consumes the same amount.

use crate::venue::ProtocolKind;

/// Chargeable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostOp {
    /// Fixed cost of entering the engine.
    CallBase,
    /// Venue slot lookup and preflight checks for one step.
    VenueLookup,
    /// Issuing the loan request.
    LoanCall,
    /// Entering the loan callback.
    Callback,
    /// Re-checking one link of the swap chain.
    PathCheck,
    /// Read-only quote.
    Quote(ProtocolKind),
    /// State-changing swap.
    Swap(ProtocolKind),
    /// One liquidity boundary crossed during a swap.
    TickCrossed,
    /// Balance read.
    BalanceRead,
    /// Balance write.
    BalanceWrite,
    /// One ledger entry copied into a snapshot.
    SnapshotEntry,
    /// One undo record kept in a journal.
    JournalEntry,
    /// Profit validation.
    Validation,
}

impl CostOp {
    /// Price of the operation in cost units.
    pub const fn units(self) -> u64 {
        match self {
            CostOp::CallBase => 21_000,
            CostOp::VenueLookup => 2_100,
            CostOp::LoanCall => 2_600,
            CostOp::Callback => 700,
            CostOp::PathCheck => 200,
            CostOp::Quote(ProtocolKind::ConstantProduct) => 5_000,
            CostOp::Quote(ProtocolKind::ConcentratedLiquidity) => 15_000,
            CostOp::Quote(ProtocolKind::StableInvariant) => 20_000,
            CostOp::Swap(ProtocolKind::ConstantProduct) => 30_000,
            CostOp::Swap(ProtocolKind::ConcentratedLiquidity) => 60_000,
            CostOp::Swap(ProtocolKind::StableInvariant) => 45_000,
            CostOp::TickCrossed => 12_000,
            CostOp::BalanceRead => 800,
            CostOp::BalanceWrite => 5_000,
            CostOp::SnapshotEntry => 2_100,
            CostOp::JournalEntry => 300,
            CostOp::Validation => 400,
        }
    }
}

/// Running cost total for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Meter {
    consumed: u64,
}

impl Meter {
    /// Fresh meter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge one operation.
    pub fn charge(&mut self, op: CostOp) {
        self.consumed = self.consumed.saturating_add(op.units());
    }

    /// Charge `count` repetitions of an operation.
    pub fn charge_n(&mut self, op: CostOp, count: usize) {
        let count = u64::try_from(count).unwrap_or(u64::MAX);
        self.consumed = self
            .consumed
            .saturating_add(op.units().saturating_mul(count));
    }

    /// Units consumed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}
