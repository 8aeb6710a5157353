//! Core domain types for the transfer saga.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::Amount;

/// Bank holding an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
pub enum Bank {
    BankA,
    BankB,
    BankC,
}

impl Bank {
    pub const ALL: [Bank; 3] = [Bank::BankA, Bank::BankB, Bank::BankC];

    pub fn as_str(self) -> &'static str {
        match self {
            Bank::BankA => "BankA",
            Bank::BankB => "BankB",
            Bank::BankC => "BankC",
        }
    }
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown bank '{0}'")]
pub struct UnknownBank(pub String);

impl FromStr for Bank {
    type Err = UnknownBank;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bank::ALL
            .into_iter()
            .find(|bank| bank.as_str() == s)
            .ok_or_else(|| UnknownBank(s.to_string()))
    }
}

/// Identity of an account: `username-bank`.
///
/// Ledger balances and locks are keyed by this, never by a [`Party`] value,
/// so two distinct `Party` values naming the same account share one lock.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountKey(String);

impl AccountKey {
    pub fn new(username: &str, bank: Bank) -> Self {
        AccountKey(format!("{username}-{bank}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered (or to-be-registered) account holder.
///
/// `amount` is the opening balance used at registration; afterwards the
/// ledger is the only source of truth for the balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    pub username: String,
    pub bank: Bank,
    pub amount: Amount,
}

impl Party {
    pub fn new(username: impl Into<String>, bank: Bank, amount: Amount) -> Self {
        Self {
            username: username.into(),
            bank,
            amount,
        }
    }

    pub fn key(&self) -> AccountKey {
        AccountKey::new(&self.username, self.bank)
    }
}

/// Input of one saga run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub amount: Amount,
    pub sender: Party,
    pub receiver: Party,
}

impl TransferRequest {
    pub fn new(amount: Amount, sender: Party, receiver: Party) -> Self {
        Self {
            amount,
            sender,
            receiver,
        }
    }
}
