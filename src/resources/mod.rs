//! Shared resources touched by saga steps.
//!
//! Each resource is internally synchronized with one mutex that is taken and
//! released inside a single method call, so steps never hold a lock across
//! an `.await`.

use std::sync::Arc;

mod ledger;
mod locks;
mod quota;

pub use ledger::{Ledger, LedgerError};
pub use locks::LockRegistry;
pub use quota::{QuotaPool, TOKEN_LEN};

use crate::config::SagaConfig;
use crate::ids::IdGenerator;

/// Handles to the process-wide resources, injected into the engine.
///
/// Cloning shares the same underlying resources.
#[derive(Debug, Clone)]
pub struct Resources {
    pub ledger: Arc<Ledger>,
    pub locks: Arc<LockRegistry>,
    pub quota: Arc<QuotaPool>,
}

impl Resources {
    pub fn new(ledger: Ledger, locks: LockRegistry, quota: QuotaPool) -> Self {
        Self {
            ledger: Arc::new(ledger),
            locks: Arc::new(locks),
            quota: Arc::new(quota),
        }
    }

    /// Empty ledger and lock registry, quota pool sized from `config`.
    pub fn from_config(config: &SagaConfig, ids: Arc<dyn IdGenerator>) -> Self {
        Self::new(
            Ledger::new(),
            LockRegistry::new(),
            QuotaPool::new(config.quota_capacity, config.initial_quota_tokens, ids),
        )
    }
}
