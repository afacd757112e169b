use std::{collections::HashMap, hash::Hash, sync::RwLock};

use crate::{error::SmallError, utils::HandyRwLock};

pub type SmallResult = Result<(), SmallError>;

/// A `HashMap` wrapped in a `RwLock`, safe to share between threads.
///
/// Values are handed out as clones, so `V` is normally an `Arc` of the
/// real payload.
pub struct ConcurrentHashMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> ConcurrentHashMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.rl().get(key).cloned()
    }

    /// Return the value for `key`, inserting the one built by `f` if the
    /// key is vacant. The write lock is held while `f` runs, so at most
    /// one builder executes per vacant key.
    pub fn get_or_insert<F>(&self, key: &K, f: F) -> Result<V, SmallError>
    where
        F: FnOnce(&K) -> Result<V, SmallError>,
    {
        if let Some(v) = self.get(key) {
            return Ok(v);
        }

        let mut inner = self.inner.wl();
        if let Some(v) = inner.get(key) {
            return Ok(v.clone());
        }

        let v = f(key)?;
        inner.insert(key.clone(), v.clone());
        Ok(v)
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.wl().insert(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.wl().remove(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.rl().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.rl().len()
    }

    pub fn clear(&self) {
        self.inner.wl().clear();
    }
}
