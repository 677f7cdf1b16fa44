//! Sharded dialog registry.
//!
//! Routes incoming messages to live dialogs under high concurrency.
//! The key space is partitioned over N shards (N a power of two) so a
//! single-dialog operation only ever touches one shard lock. Whole-map
//! operations acquire the shard locks in ascending order and release
//! them in descending order; user callbacks never run under a shard
//! lock.

use crate::dialog::key::{DialogKey, EarlyKey};
use parking_lot::RwLock;
use std::collections::HashMap;

pub(crate) const DEFAULT_SHARD_COUNT: usize = 32;

struct Shard<V> {
    dialogs: RwLock<HashMap<DialogKey, V>>,
    /// `(call_id, local_tag)` → full key, for dialogs whose remote tag
    /// is not known yet (and, after completion, for late responses that
    /// still lack the tag)
    early: RwLock<HashMap<EarlyKey, DialogKey>>,
    /// `(call_id, from_tag)` → full key of the UAS dialog created by
    /// that INVITE; retransmissions carry no To-tag and must still
    /// reach the dialog instead of spawning a twin
    invites: RwLock<HashMap<EarlyKey, DialogKey>>,
}

impl<V> Default for Shard<V> {
    fn default() -> Self {
        Self {
            dialogs: RwLock::new(HashMap::new()),
            early: RwLock::new(HashMap::new()),
            invites: RwLock::new(HashMap::new()),
        }
    }
}

pub(crate) struct Registry<V> {
    shards: Box<[Shard<V>]>,
    mask: u64,
}

impl<V: Clone> Registry<V> {
    pub(crate) fn new(shard_count: usize) -> Self {
        assert!(shard_count.is_power_of_two());

        Self {
            shards: (0..shard_count).map(|_| Shard::default()).collect(),
            mask: shard_count as u64 - 1,
        }
    }

    fn shard_for(&self, key: &DialogKey) -> &Shard<V> {
        let hash = fnv1a(&[
            key.call_id.as_bytes(),
            key.local_tag.as_bytes(),
            key.remote_tag.as_deref().map(str::as_bytes).unwrap_or(b""),
        ]);

        &self.shards[(hash & self.mask) as usize]
    }

    fn shard_for_early(&self, key: &EarlyKey) -> &Shard<V> {
        let hash = fnv1a(&[key.0.as_bytes(), key.1.as_bytes()]);

        &self.shards[(hash & self.mask) as usize]
    }

    /// Insert a dialog under `key`. Returns false (without inserting)
    /// when the key is already taken.
    pub(crate) fn insert(&self, key: DialogKey, value: V) -> bool {
        let shard = self.shard_for(&key);
        let mut dialogs = shard.dialogs.write();

        if dialogs.contains_key(&key) {
            return false;
        }

        dialogs.insert(key.clone(), value);
        drop(dialogs);

        self.shard_for_early(&key.early())
            .early
            .write()
            .insert(key.early(), key);

        true
    }

    pub(crate) fn lookup(&self, key: &DialogKey) -> Option<V> {
        self.shard_for(key).dialogs.read().get(key).cloned()
    }

    /// Recover an early dialog from `(call_id, local_tag)` alone
    pub(crate) fn lookup_early(&self, key: &EarlyKey) -> Option<V> {
        let full_key = self.shard_for_early(key).early.read().get(key).cloned()?;

        self.lookup(&full_key)
    }

    /// Move a dialog from its early key to the completed key once the
    /// remote tag is known. The early index is re-pointed, not removed:
    /// retransmitted untagged responses must still route.
    pub(crate) fn complete_key(&self, old: &DialogKey, new: DialogKey) -> bool {
        let Some(value) = self.shard_for(old).dialogs.write().remove(old) else {
            return false;
        };

        self.shard_for(&new).dialogs.write().insert(new.clone(), value);

        self.shard_for_early(&new.early())
            .early
            .write()
            .insert(new.early(), new);

        true
    }

    /// Remember which UAS dialog an initial INVITE created
    pub(crate) fn index_incoming_invite(&self, peer: EarlyKey, key: DialogKey) {
        self.shard_for_early(&peer)
            .invites
            .write()
            .insert(peer, key);
    }

    /// Route a To-tag-less INVITE to the dialog its first transmission
    /// created, if any
    pub(crate) fn lookup_incoming_invite(&self, peer: &EarlyKey) -> Option<V> {
        let key = self
            .shard_for_early(peer)
            .invites
            .read()
            .get(peer)
            .cloned()?;

        self.lookup(&key)
    }

    /// Returns true when `key` was present
    pub(crate) fn remove(&self, key: &DialogKey) -> bool {
        let removed = self.shard_for(key).dialogs.write().remove(key).is_some();

        if removed {
            let early_key = key.early();
            let shard = self.shard_for_early(&early_key);
            let mut early = shard.early.write();

            // only drop the index entry if it still points at us
            if early.get(&early_key) == Some(key) {
                early.remove(&early_key);
            }

            drop(early);

            if let Some(remote_tag) = &key.remote_tag {
                let peer = (key.call_id.clone(), remote_tag.clone());
                let shard = self.shard_for_early(&peer);
                let mut invites = shard.invites.write();

                if invites.get(&peer) == Some(key) {
                    invites.remove(&peer);
                }
            }
        }

        removed
    }

    /// Number of live dialogs.
    ///
    /// Takes all shard locks in ascending order, releases descending.
    pub(crate) fn count(&self) -> usize {
        let mut guards = Vec::with_capacity(self.shards.len());

        for shard in &self.shards {
            guards.push(shard.dialogs.read());
        }

        let count = guards.iter().map(|g| g.len()).sum();

        while let Some(guard) = guards.pop() {
            drop(guard);
        }

        count
    }

    /// Invoke `f` for every live dialog.
    ///
    /// Entries are copied out under the read locks first; `f` runs with
    /// no shard lock held.
    pub(crate) fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&DialogKey, &V),
    {
        let mut entries = Vec::new();

        {
            let mut guards = Vec::with_capacity(self.shards.len());

            for shard in &self.shards {
                guards.push(shard.dialogs.read());
            }

            for guard in &guards {
                entries.extend(guard.iter().map(|(k, v)| (k.clone(), v.clone())));
            }

            while let Some(guard) = guards.pop() {
                drop(guard);
            }
        }

        for (key, value) in &entries {
            f(key, value);
        }
    }

    /// Remove everything, returning the drained entries so the caller
    /// can tear them down outside the locks
    pub(crate) fn clear(&self) -> Vec<(DialogKey, V)> {
        let mut entries = Vec::new();

        let mut guards = Vec::with_capacity(self.shards.len() * 2);

        for shard in &self.shards {
            let mut dialogs = shard.dialogs.write();
            entries.extend(dialogs.drain());
            guards.push(dialogs);
        }

        for shard in &self.shards {
            shard.early.write().clear();
            shard.invites.write().clear();
        }

        while let Some(guard) = guards.pop() {
            drop(guard);
        }

        entries
    }

    /// Per-shard dialog counts, exposed through the stack metrics
    pub(crate) fn shard_counts(&self) -> Vec<usize> {
        self.shards
            .iter()
            .map(|shard| shard.dialogs.read().len())
            .collect()
    }
}

fn fnv1a(parts: &[&[u8]]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;

    for part in parts {
        for &byte in *part {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(PRIME);
        }

        // separator so ("ab", "c") and ("a", "bc") differ
        hash ^= 0xff;
        hash = hash.wrapping_mul(PRIME);
    }

    hash
}
