//! All-or-nothing mutation scopes over a [`Ledger`].

use super::{Ledger, VenueSlot};
use crate::error::LedgerError;
use crate::venue::{AccountId, Amount, AssetId, SwapReceipt, Venue, VenueId};

#[derive(Debug)]
enum JournalEntry {
    Balance {
        account: AccountId,
        asset: AssetId,
        previous: Amount,
    },
    Venue {
        id: VenueId,
        previous: VenueSlot,
    },
}

#[derive(Debug)]
enum Mode<'a> {
    /// Work on a private copy; commit replaces the target wholesale.
    Shadow {
        target: &'a mut Ledger,
        working: Box<Ledger>,
    },
    /// Work in place; rollback replays the undo journal in reverse.
    Journaled {
        target: &'a mut Ledger,
        journal: Vec<JournalEntry>,
    },
}

/// A scope in which ledger writes either all land or none do.
///
/// A unit dropped without [`AtomicUnit::commit`] is rolled back.
#[derive(Debug)]
pub struct AtomicUnit<'a> {
    mode: Mode<'a>,
    finished: bool,
}

impl<'a> AtomicUnit<'a> {
    /// Open a unit that operates on a full copy of `ledger`.
    pub fn shadow(ledger: &'a mut Ledger) -> Self {
        let working = Box::new(ledger.clone());
        Self {
            mode: Mode::Shadow {
                target: ledger,
                working,
            },
            finished: false,
        }
    }

    /// Open a unit that writes through to `ledger` and journals undo entries.
    pub fn journaled(ledger: &'a mut Ledger) -> Self {
        Self {
            mode: Mode::Journaled {
                target: ledger,
                journal: Vec::new(),
            },
            finished: false,
        }
    }

    /// Ledger as seen from inside the unit.
    pub fn state(&self) -> &Ledger {
        match &self.mode {
            Mode::Shadow { working, .. } => working,
            Mode::Journaled { target, .. } => target,
        }
    }

    fn state_mut(&mut self) -> &mut Ledger {
        match &mut self.mode {
            Mode::Shadow { working, .. } => working,
            Mode::Journaled { target, .. } => target,
        }
    }

    fn is_journaled(&self) -> bool {
        matches!(self.mode, Mode::Journaled { .. })
    }

    fn record(&mut self, entry: JournalEntry) {
        if let Mode::Journaled { journal, .. } = &mut self.mode {
            journal.push(entry);
        }
    }

    /// Undo entries recorded so far (always zero for shadow units).
    pub fn journal_len(&self) -> usize {
        match &self.mode {
            Mode::Shadow { .. } => 0,
            Mode::Journaled { journal, .. } => journal.len(),
        }
    }

    /// Current block height.
    pub fn block(&self) -> u64 {
        self.state().block()
    }

    /// Balance of `asset` held by `account`.
    pub fn balance_of(&self, account: AccountId, asset: AssetId) -> Amount {
        self.state().balance_of(account, asset)
    }

    /// Add to a balance.
    pub fn credit(
        &mut self,
        account: AccountId,
        asset: AssetId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        let previous = self.balance_of(account, asset);
        self.state_mut().credit(account, asset, amount)?;
        self.record(JournalEntry::Balance {
            account,
            asset,
            previous,
        });
        Ok(())
    }

    /// Remove from a balance.
    pub fn debit(
        &mut self,
        account: AccountId,
        asset: AssetId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        let previous = self.balance_of(account, asset);
        self.state_mut().debit(account, asset, amount)?;
        self.record(JournalEntry::Balance {
            account,
            asset,
            previous,
        });
        Ok(())
    }

    /// Move `amount` of `asset` between accounts.
    pub fn transfer(
        &mut self,
        from: AccountId,
        to: AccountId,
        asset: AssetId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        self.debit(from, asset, amount)?;
        self.credit(to, asset, amount)
    }

    /// Venue slot by id.
    pub fn venue(&self, id: &VenueId) -> Option<&VenueSlot> {
        self.state().venue(id)
    }

    /// Read-only quote against a venue.
    pub fn quote(
        &self,
        venue: VenueId,
        token_in: AssetId,
        token_out: AssetId,
        amount_in: Amount,
    ) -> Result<SwapReceipt, LedgerError> {
        let slot = self.venue(&venue).ok_or(LedgerError::UnknownVenue(venue))?;
        slot.state
            .quote(token_in, token_out, amount_in)
            .map_err(|source| LedgerError::Venue { venue, source })
    }

    /// Execute a swap against a venue and bump its version.
    pub fn swap(
        &mut self,
        venue: VenueId,
        token_in: AssetId,
        token_out: AssetId,
        amount_in: Amount,
        min_amount_out: Amount,
    ) -> Result<SwapReceipt, LedgerError> {
        let journaling = self.is_journaled();
        let slot = self
            .state_mut()
            .venue_mut(&venue)
            .ok_or(LedgerError::UnknownVenue(venue))?;
        let previous = journaling.then(|| slot.clone());

        let receipt = slot
            .state
            .execute(token_in, token_out, amount_in, min_amount_out)
            .map_err(|source| LedgerError::Venue { venue, source })?;
        slot.version += 1;

        if let Some(previous) = previous {
            self.record(JournalEntry::Venue {
                id: venue,
                previous,
            });
        }
        Ok(receipt)
    }

    /// Make every write of this unit permanent.
    pub fn commit(mut self) {
        if let Mode::Shadow { target, working } = &mut self.mode {
            **target = std::mem::take(&mut **working);
        }
        self.finished = true;
    }

    /// Discard every write of this unit.
    pub fn rollback(mut self) {
        self.undo();
        self.finished = true;
    }

    fn undo(&mut self) {
        if let Mode::Journaled { target, journal } = &mut self.mode {
            while let Some(entry) = journal.pop() {
                match entry {
                    JournalEntry::Balance {
                        account,
                        asset,
                        previous,
                    } => {
                        target.write_balance(account, asset, previous);
                    }
                    JournalEntry::Venue { id, previous } => target.replace_venue(id, previous),
                }
            }
        }
    }
}

impl Drop for AtomicUnit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.undo();
        }
    }
}
