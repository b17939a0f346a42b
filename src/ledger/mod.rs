//! The atomic execution environment.
//!
//! A [`Ledger`] holds account balances, versioned venue slots and the current
//! block height. Engines never touch it directly: every mutation during a run
//! goes through an [`AtomicUnit`], which either commits all of it or none.

pub mod loan;
pub mod unit;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use loan::{
    FlashBorrower, LoanCallback, LoanProvider, LoanReceipt, LoanRequest, PoolLoanProvider,
    BPS_DENOMINATOR,
};
pub use unit::AtomicUnit;

use crate::error::{LedgerError, Result};
use crate::venue::{AccountId, Amount, AssetId, ConcentratedPool, Venue, VenueId, VenueState};

/// A venue together with its state version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueSlot {
    /// Bumped on every successful swap.
    #[serde(default)]
    pub version: u64,
    /// Venue state.
    pub state: VenueState,
}

/// Balances, venues and block height.
///
/// Zero balances are never stored, so two ledgers holding the same value
/// compare equal regardless of how they got there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default)]
    block: u64,
    #[serde(default)]
    balances: BTreeMap<AccountId, BTreeMap<AssetId, Amount>>,
    #[serde(default)]
    venues: BTreeMap<VenueId, VenueSlot>,
}

impl Ledger {
    /// Empty ledger at block 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a world-state file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let ledger: Ledger = serde_json::from_str(&raw)?;
        ledger.validate()?;
        Ok(ledger)
    }

    /// Check that every slot is keyed by its venue's id and that every venue
    /// is internally consistent.
    pub fn validate(&self) -> std::result::Result<(), LedgerError> {
        for (key, slot) in &self.venues {
            let id = slot.state.id();
            if *key != id {
                return Err(LedgerError::VenueIdMismatch { key: *key, id });
            }
            if let VenueState::ConcentratedLiquidity(pool) = &slot.state {
                check_concentrated(pool)?;
            }
        }
        Ok(())
    }

    /// Current block height.
    pub fn block(&self) -> u64 {
        self.block
    }

    /// Set the block height.
    pub fn set_block(&mut self, block: u64) {
        self.block = block;
    }

    /// Balance of `asset` held by `account`.
    pub fn balance_of(&self, account: AccountId, asset: AssetId) -> Amount {
        self.balances
            .get(&account)
            .and_then(|assets| assets.get(&asset))
            .copied()
            .unwrap_or(0)
    }

    /// All non-zero balances.
    pub fn balances(&self) -> &BTreeMap<AccountId, BTreeMap<AssetId, Amount>> {
        &self.balances
    }

    /// Add `amount` to a balance.
    pub fn credit(
        &mut self,
        account: AccountId,
        asset: AssetId,
        amount: Amount,
    ) -> std::result::Result<(), LedgerError> {
        let current = self.balance_of(account, asset);
        let next = current
            .checked_add(amount)
            .ok_or(LedgerError::BalanceOverflow { account, asset })?;
        self.write_balance(account, asset, next);
        Ok(())
    }

    /// Remove `amount` from a balance.
    pub fn debit(
        &mut self,
        account: AccountId,
        asset: AssetId,
        amount: Amount,
    ) -> std::result::Result<(), LedgerError> {
        let available = self.balance_of(account, asset);
        let next = available
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientBalance {
                account,
                asset,
                required: amount,
                available,
            })?;
        self.write_balance(account, asset, next);
        Ok(())
    }

    /// Register a venue at version 0.
    pub fn insert_venue(
        &mut self,
        state: impl Into<VenueState>,
    ) -> std::result::Result<(), LedgerError> {
        let state = state.into();
        let id = state.id();
        if self.venues.contains_key(&id) {
            return Err(LedgerError::DuplicateVenue(id));
        }
        if let VenueState::ConcentratedLiquidity(pool) = &state {
            check_concentrated(pool)?;
        }
        self.venues.insert(id, VenueSlot { version: 0, state });
        Ok(())
    }

    /// Venue slot by id.
    pub fn venue(&self, id: &VenueId) -> Option<&VenueSlot> {
        self.venues.get(id)
    }

    /// All venue slots.
    pub fn venues(&self) -> &BTreeMap<VenueId, VenueSlot> {
        &self.venues
    }

    /// Number of stored entries (balances plus venues).
    pub fn entry_count(&self) -> usize {
        self.balances.values().map(BTreeMap::len).sum::<usize>() + self.venues.len()
    }

    pub(crate) fn venue_mut(&mut self, id: &VenueId) -> Option<&mut VenueSlot> {
        self.venues.get_mut(id)
    }

    pub(crate) fn replace_venue(&mut self, id: VenueId, slot: VenueSlot) {
        self.venues.insert(id, slot);
    }

    /// Overwrite a balance, returning the previously stored value.
    pub(crate) fn write_balance(
        &mut self,
        account: AccountId,
        asset: AssetId,
        amount: Amount,
    ) -> Option<Amount> {
        if amount == 0 {
            let assets = self.balances.get_mut(&account)?;
            let previous = assets.remove(&asset);
            if assets.is_empty() {
                self.balances.remove(&account);
            }
            previous
        } else {
            self.balances
                .entry(account)
                .or_default()
                .insert(asset, amount)
        }
    }
}

fn check_concentrated(pool: &ConcentratedPool) -> std::result::Result<(), LedgerError> {
    pool.validate().map_err(|source| LedgerError::Venue {
        venue: pool.id,
        source,
    })
}
