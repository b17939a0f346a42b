//! Flash-loan provider contract.
//!
//! The provider lends inside the caller's atomic unit, hands control to the
//! borrower through a synchronous callback and then checks that it was made
//! whole. Repayment is the borrower's job; the provider only verifies it.

use alloy_primitives::aliases::U512;
use serde::{Deserialize, Serialize};

use super::AtomicUnit;
use crate::engine::FailureReason;
use crate::plan::PlanId;
use crate::venue::math::{mul_div_ceil, narrow, wide};
use crate::venue::{AccountId, Amount, AssetId};

/// Premium denominator: premiums are quoted in basis points.
pub const BPS_DENOMINATOR: u32 = 10_000;

/// Borrow request issued by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoanRequest {
    /// Asset to borrow.
    pub asset: AssetId,
    /// Amount to borrow.
    pub principal: Amount,
    /// Identity of the engine that issued the request.
    pub initiator: AccountId,
}

/// Data handed to the borrower during the loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoanCallback {
    /// Provider account that lent the funds.
    pub lender: AccountId,
    /// Borrowed asset.
    pub asset: AssetId,
    /// Borrowed amount.
    pub principal: Amount,
    /// Fee owed on top of the principal.
    pub premium: Amount,
    /// Identity that issued the request.
    pub initiator: AccountId,
    /// Opaque parameters: the plan being executed.
    pub params: PlanId,
}

impl LoanCallback {
    /// Total owed back to the provider.
    pub fn owed(&self) -> Option<Amount> {
        self.principal.checked_add(self.premium)
    }
}

/// Terms of a completed loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanReceipt {
    /// Amount lent.
    pub principal: Amount,
    /// Premium collected.
    pub premium: Amount,
}

/// Receives control while a loan is outstanding.
pub trait FlashBorrower {
    /// Account the principal is paid into.
    fn account(&self) -> AccountId;

    /// Use the funds and repay `principal + premium` before returning.
    fn on_flash_loan(
        &mut self,
        unit: &mut AtomicUnit<'_>,
        callback: &LoanCallback,
    ) -> Result<(), FailureReason>;
}

/// Lends assets for the duration of one atomic unit.
pub trait LoanProvider: Send + Sync {
    /// Account holding the provider's liquidity.
    fn account(&self) -> AccountId;

    /// Premium charged on `principal`, if representable.
    fn premium(&self, principal: Amount) -> Option<Amount>;

    /// Lend, call back into `borrower`, and verify repayment.
    fn flash_loan(
        &self,
        unit: &mut AtomicUnit<'_>,
        request: &LoanRequest,
        params: PlanId,
        borrower: &mut dyn FlashBorrower,
    ) -> Result<LoanReceipt, FailureReason>;
}

/// Provider whose liquidity is its own ledger balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolLoanProvider {
    /// Liquidity account.
    pub account: AccountId,
    /// Premium in basis points.
    pub premium_bps: u32,
}

impl PoolLoanProvider {
    /// Create a provider.
    pub fn new(account: AccountId, premium_bps: u32) -> Self {
        Self {
            account,
            premium_bps,
        }
    }
}

impl LoanProvider for PoolLoanProvider {
    fn account(&self) -> AccountId {
        self.account
    }

    fn premium(&self, principal: Amount) -> Option<Amount> {
        let premium = mul_div_ceil(
            wide(principal),
            wide(Amount::from(self.premium_bps)),
            U512::from(BPS_DENOMINATOR),
        )
        .ok()?;
        narrow(premium).ok()
    }

    fn flash_loan(
        &self,
        unit: &mut AtomicUnit<'_>,
        request: &LoanRequest,
        params: PlanId,
        borrower: &mut dyn FlashBorrower,
    ) -> Result<LoanReceipt, FailureReason> {
        let available = unit.balance_of(self.account, request.asset);
        let unavailable = || FailureReason::LoanUnavailable {
            asset: request.asset,
            requested: request.principal,
            available,
        };
        if request.principal > available {
            return Err(unavailable());
        }
        let premium = self.premium(request.principal).ok_or_else(unavailable)?;
        let required = available.checked_add(premium).ok_or_else(unavailable)?;
        request.principal.checked_add(premium).ok_or_else(unavailable)?;

        unit.transfer(
            self.account,
            borrower.account(),
            request.asset,
            request.principal,
        )
        .map_err(|_| unavailable())?;

        let callback = LoanCallback {
            lender: self.account,
            asset: request.asset,
            principal: request.principal,
            premium,
            initiator: request.initiator,
            params,
        };
        borrower.on_flash_loan(unit, &callback)?;

        let after = unit.balance_of(self.account, request.asset);
        if after < required {
            let lent_out = available - request.principal;
            return Err(FailureReason::LoanRepaymentFailure {
                owed: request.principal + premium,
                repaid: after.saturating_sub(lent_out),
            });
        }

        Ok(LoanReceipt {
            principal: request.principal,
            premium,
        })
    }
}
