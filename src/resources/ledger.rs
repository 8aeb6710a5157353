use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::debug;

use crate::Amount;
use crate::model::{AccountKey, Bank, Party};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("account {0} is already registered")]
    AlreadyRegistered(AccountKey),

    #[error("account {0} is not registered")]
    UnknownAccount(AccountKey),
}

#[derive(Debug, Default)]
struct Accounts {
    /// Registered usernames per bank
    members: HashMap<Bank, HashSet<String>>,
    balances: HashMap<AccountKey, Amount>,
}

/// In-memory balance store keyed by [`AccountKey`].
///
/// Every method takes the single internal lock and releases it before
/// returning.
#[derive(Debug, Default)]
pub struct Ledger {
    accounts: Mutex<Accounts>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn accounts(&self) -> MutexGuard<'_, Accounts> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `party` with its opening balance.
    pub fn register(&self, party: &Party) -> Result<(), LedgerError> {
        let key = party.key();
        let mut accounts = self.accounts();
        if accounts.balances.contains_key(&key) {
            return Err(LedgerError::AlreadyRegistered(key));
        }
        accounts
            .members
            .entry(party.bank)
            .or_default()
            .insert(party.username.clone());
        accounts.balances.insert(key.clone(), party.amount);
        debug!(key = %key, balance = %party.amount, "account registered");
        Ok(())
    }

    pub fn exists(&self, party: &Party) -> bool {
        self.accounts()
            .members
            .get(&party.bank)
            .is_some_and(|members| members.contains(&party.username))
    }

    pub fn balance(&self, key: &AccountKey) -> Result<Amount, LedgerError> {
        self.accounts()
            .balances
            .get(key)
            .copied()
            .ok_or_else(|| LedgerError::UnknownAccount(key.clone()))
    }

    /// Add `delta` (negative to debit) to the balance of `key`.
    ///
    /// Callers check existence first; a missing key is a programming error.
    pub fn adjust(&self, key: &AccountKey, delta: Amount) -> Result<(), LedgerError> {
        let mut accounts = self.accounts();
        let balance = accounts
            .balances
            .get_mut(key)
            .ok_or_else(|| LedgerError::UnknownAccount(key.clone()))?;
        *balance += delta;
        Ok(())
    }

    /// All balances, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<AccountKey, Amount> {
        self.accounts()
            .balances
            .iter()
            .map(|(key, amount)| (key.clone(), *amount))
            .collect()
    }

    /// Sum of all balances.
    pub fn total(&self) -> Amount {
        self.accounts().balances.values().copied().sum()
    }
}
