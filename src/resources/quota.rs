use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::ids::IdGenerator;

/// Length of a quota token.
pub const TOKEN_LEN: usize = 10;

/// Bounded pool of single-use transfer tokens.
///
/// A token is drained by [`QuotaPool::take_token`] and only comes back
/// through replenishment ([`QuotaPool::add_token`] or the refill task).
pub struct QuotaPool {
    tokens: Mutex<BTreeSet<String>>,
    capacity: usize,
    ids: Arc<dyn IdGenerator>,
}

impl QuotaPool {
    /// Create a pool holding `initial` fresh tokens (at most `capacity`).
    pub fn new(capacity: usize, initial: usize, ids: Arc<dyn IdGenerator>) -> Self {
        let pool = Self {
            tokens: Mutex::new(BTreeSet::new()),
            capacity,
            ids,
        };
        for _ in 0..initial.min(capacity) {
            pool.add_token();
        }
        pool
    }

    fn tokens(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_token(&self) -> bool {
        !self.tokens().is_empty()
    }

    /// Drain the first token in order, if any.
    pub fn take_token(&self) -> Option<String> {
        self.tokens().pop_first()
    }

    /// Add one fresh token; `false` when the pool is already full.
    pub fn add_token(&self) -> bool {
        let mut tokens = self.tokens();
        if tokens.len() >= self.capacity {
            return false;
        }
        // a collision just leaves the pool one token short
        tokens.insert(self.ids.generate_key(TOKEN_LEN))
    }

    pub fn len(&self) -> usize {
        self.tokens().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add one token every `interval` until the pool is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_refill(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        debug!(?interval, "quota refill started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if pool.add_token() {
                    trace!(available = pool.len(), "quota token added");
                }
            }
        })
    }
}

impl std::fmt::Debug for QuotaPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaPool")
            .field("available", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
