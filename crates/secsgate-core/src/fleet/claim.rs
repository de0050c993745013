use std::hash::Hash;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Exclusive hold on one key of a claims map.
///
/// Acquiring goes through `DashMap::entry`, so of two racing attempts on
/// the same key exactly one wins. The claim is released on drop unless
/// [`Claim::keep`] was called.
pub(crate) struct Claim<'a, K: Eq + Hash + Clone> {
    map: &'a DashMap<K, ()>,
    key: K,
    armed: bool,
}

impl<'a, K: Eq + Hash + Clone> Claim<'a, K> {
    pub(crate) fn acquire(map: &'a DashMap<K, ()>, key: K) -> Option<Self> {
        match map.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self {
                    map,
                    key,
                    armed: true,
                })
            }
        }
    }

    /// Leave the key claimed after this guard is dropped.
    pub(crate) fn keep(&mut self) {
        self.armed = false;
    }
}

impl<K: Eq + Hash + Clone> Drop for Claim<'_, K> {
    fn drop(&mut self) {
        if self.armed {
            self.map.remove(&self.key);
        }
    }
}
