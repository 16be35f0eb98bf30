//! Per-item refresh locks with non-blocking acquisition.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use kibble_core::RefreshKind;
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefreshKey {
    pub kind: RefreshKind,
    pub id: i64,
}

impl RefreshKey {
    pub fn facts(id: i64) -> Self {
        Self {
            kind: RefreshKind::Facts,
            id,
        }
    }

    pub fn news(id: i64) -> Self {
        Self {
            kind: RefreshKind::News,
            id,
        }
    }
}

impl fmt::Display for RefreshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Held for the duration of one refresh; dropping it releases the key.
#[derive(Debug)]
pub struct RefreshGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Lazily created lock per key. The outer map lock is only held while looking
/// up or inserting an entry, never while a refresh runs.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<RefreshKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` immediately when another refresh holds the key.
    pub fn try_acquire(&self, key: RefreshKey) -> Option<RefreshGuard> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key).or_default().clone()
        };
        lock.try_lock_owned().ok().map(|guard| RefreshGuard { _guard: guard })
    }

    pub fn is_locked(&self, key: RefreshKey) -> bool {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.get(&key).map(|lock| lock.try_lock().is_err()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let locks = KeyedLocks::new();
        let guard = locks.try_acquire(RefreshKey::facts(1)).expect("first acquire");
        assert!(locks.try_acquire(RefreshKey::facts(1)).is_none());
        assert!(locks.is_locked(RefreshKey::facts(1)));
        drop(guard);
        assert!(locks.try_acquire(RefreshKey::facts(1)).is_some());
    }

    #[test]
    fn kinds_and_ids_are_independent() {
        let locks = KeyedLocks::new();
        let _facts = locks.try_acquire(RefreshKey::facts(1)).expect("facts");
        assert!(locks.try_acquire(RefreshKey::news(1)).is_some());
        assert!(locks.try_acquire(RefreshKey::facts(2)).is_some());
        assert!(!locks.is_locked(RefreshKey::news(7)));
    }

    #[test]
    fn keys_render_kind_and_id() {
        assert_eq!(RefreshKey::news(4).to_string(), "news:4");
    }
}
