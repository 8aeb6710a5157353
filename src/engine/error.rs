//! Error types for saga steps and workers.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

use crate::Amount;
use crate::engine::record::Outcome;
use crate::model::AccountKey;
use crate::resources::LedgerError;

/// Which side of the transfer an error concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

/// Failure of a step body or a compensator.
///
/// Anticipated conditions become outcomes on the record; `Ledger` and
/// `Abandoned` are the unexpected ones.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("transfer amount must be positive, got {0}")]
    NonPositiveAmount(Amount),

    #[error("{0} {1} is not registered")]
    NotRegistered(Role, AccountKey),

    #[error("idempotency violation: {0} account {1} is already locked")]
    AlreadyLocked(Role, AccountKey),

    #[error("idempotency violation: lock on {0} account {1} is not held")]
    LockNotHeld(Role, AccountKey),

    #[error("insufficient funds: receiver {key} holds {available}, transfer needs {requested}")]
    InsufficientFunds {
        key: AccountKey,
        available: Amount,
        requested: Amount,
    },

    #[error("escalated: quota still exhausted after {0} retries")]
    QuotaExhausted(u32),

    #[error("abandoned by the coordinator before the mutation ran")]
    Abandoned,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl StepError {
    /// Outcome recorded for this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            StepError::QuotaExhausted(_) => Outcome::Escalate,
            _ => Outcome::Fail,
        }
    }

    pub fn is_unexpected(&self) -> bool {
        matches!(self, StepError::Ledger(_) | StepError::Abandoned)
    }
}

/// Failure to get a result back from a worker pool.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker pool '{0}' is closed")]
    Closed(&'static str),

    #[error("worker in pool '{0}' panicked: {1}")]
    Panicked(&'static str, #[source] JoinError),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}
