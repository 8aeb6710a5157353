//! Identifier generation for transactions and quota tokens.

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Length of a generated transaction id.
pub const TRANSACTION_ID_LEN: usize = 15;

/// Source of opaque identifiers.
///
/// Only uniqueness in practice is required; no ordering.
pub trait IdGenerator: Send + Sync {
    fn generate_key(&self, len: usize) -> String;

    fn generate_transaction_id(&self) -> String {
        self.generate_key(TRANSACTION_ID_LEN)
    }
}

/// Random alphanumeric identifiers (`[A-Za-z0-9]`).
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn generate_key(&self, len: usize) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }
}
