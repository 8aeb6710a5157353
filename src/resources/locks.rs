use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::model::AccountKey;

/// Account keys currently locked, each with the transaction holding it.
///
/// Locking never blocks: a held key makes [`LockRegistry::lock`] return
/// `false`, and the caller decides what that means. Only the holder can
/// release a lock.
#[derive(Debug, Default)]
pub struct LockRegistry {
    held: Mutex<HashMap<AccountKey, String>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn held_keys(&self) -> MutexGuard<'_, HashMap<AccountKey, String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock on `key` for `owner`; `false` if it was already held,
    /// even by `owner`.
    pub fn lock(&self, key: &AccountKey, owner: &str) -> bool {
        let mut held = self.held_keys();
        if held.contains_key(key) {
            return false;
        }
        held.insert(key.clone(), owner.to_string());
        true
    }

    /// Release the lock on `key`; `false` unless `owner` held it.
    pub fn unlock(&self, key: &AccountKey, owner: &str) -> bool {
        let mut held = self.held_keys();
        if held.get(key).is_some_and(|holder| holder == owner) {
            held.remove(key);
            true
        } else {
            false
        }
    }

    pub fn is_locked(&self, key: &AccountKey) -> bool {
        self.held_keys().contains_key(key)
    }

    pub fn is_held_by(&self, key: &AccountKey, owner: &str) -> bool {
        self.held_keys()
            .get(key)
            .is_some_and(|holder| holder == owner)
    }

    pub fn holder(&self, key: &AccountKey) -> Option<String> {
        self.held_keys().get(key).cloned()
    }

    /// Currently held keys, sorted.
    pub fn held(&self) -> Vec<AccountKey> {
        let mut keys: Vec<_> = self.held_keys().keys().cloned().collect();
        keys.sort();
        keys
    }
}
