use std::{
    collections::{HashMap, hash_map::DefaultHasher, hash_map::Entry},
    hash::{Hash, Hasher},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use ccp_shim_common::ConnectionState;

pub const TABLE_SHARDS: usize = 64;

/// Outcome of an admission attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Admission {
    Inserted,
    AlreadyPresent,
    AtCapacity,
}

/// Flow key to control state, capped at `max_flows` rows.
///
/// Insert-if-absent is atomic per key (the key's shard lock is held across
/// the check and the insert). The flow counter is not: the capacity check
/// reads it before taking the shard lock, so concurrent admissions of
/// different keys can overshoot by the number of racing callers.
pub struct ConnectionTable {
    shards: Vec<Mutex<HashMap<u64, ConnectionState>>>,
    flows: AtomicUsize,
    max_flows: usize,
}

impl ConnectionTable {
    pub fn new(max_flows: usize) -> Self {
        let per_shard = max_flows.div_ceil(TABLE_SHARDS);
        let mut shards = Vec::with_capacity(TABLE_SHARDS);
        for _ in 0..TABLE_SHARDS {
            shards.push(Mutex::new(HashMap::with_capacity(per_shard)));
        }
        Self {
            shards,
            flows: AtomicUsize::new(0),
            max_flows,
        }
    }

    fn shard_index(&self, key: u64) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len().max(1)
    }

    fn shard(&self, key: u64) -> MutexGuard<'_, HashMap<u64, ConnectionState>> {
        let idx = self.shard_index(key);
        self.shards[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn admit(&self, key: u64, state: ConnectionState) -> Admission {
        if self.flows.load(Ordering::Relaxed) >= self.max_flows {
            return Admission::AtCapacity;
        }
        let mut guard = self.shard(key);
        match guard.entry(key) {
            Entry::Occupied(_) => Admission::AlreadyPresent,
            Entry::Vacant(slot) => {
                slot.insert(state);
                self.flows.fetch_add(1, Ordering::Relaxed);
                Admission::Inserted
            }
        }
    }

    pub fn lookup(&self, key: u64) -> Option<ConnectionState> {
        self.shard(key).get(&key).copied()
    }

    /// Returns whether a row was removed; a miss is not an error.
    pub fn remove(&self, key: u64) -> bool {
        let removed = self.shard(key).remove(&key).is_some();
        if removed {
            let _ = self
                .flows
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    Some(n.saturating_sub(1))
                });
        }
        removed
    }

    /// Mutates an existing row in place. Never creates one.
    pub fn update(&self, key: u64, f: impl FnOnce(&mut ConnectionState)) -> bool {
        match self.shard(key).get_mut(&key) {
            Some(state) => {
                f(state);
                true
            }
            None => false,
        }
    }

    /// Best-effort count of admitted flows.
    pub fn len(&self) -> usize {
        self.flows.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_flows(&self) -> usize {
        self.max_flows
    }

    /// Copies every row out, one shard lock at a time, sorted by key.
    pub fn snapshot(&self) -> Vec<(u64, ConnectionState)> {
        let mut rows = Vec::with_capacity(self.len());
        for shard in &self.shards {
            let guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            rows.extend(guard.iter().map(|(key, state)| (*key, *state)));
        }
        rows.sort_unstable_by_key(|(key, _)| *key);
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    fn state(cwnd: u32) -> ConnectionState {
        ConnectionState {
            cwnd,
            ..ConnectionState::default()
        }
    }

    #[test]
    fn admit_is_insert_if_absent() {
        let table = ConnectionTable::new(4);
        assert_eq!(table.admit(7, state(100)), Admission::Inserted);
        assert_eq!(table.admit(7, state(999)), Admission::AlreadyPresent);
        assert_eq!(table.lookup(7), Some(state(100)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn admit_stops_at_capacity() {
        let table = ConnectionTable::new(2);
        assert_eq!(table.admit(1, state(1)), Admission::Inserted);
        assert_eq!(table.admit(2, state(2)), Admission::Inserted);
        assert_eq!(table.admit(3, state(3)), Admission::AtCapacity);
        assert_eq!(table.lookup(3), None);
        assert_eq!(table.len(), 2);

        assert!(table.remove(1));
        assert_eq!(table.admit(3, state(3)), Admission::Inserted);
    }

    #[test]
    fn remove_is_idempotent() {
        let table = ConnectionTable::new(4);
        table.admit(5, state(10));
        assert!(table.remove(5));
        assert!(!table.remove(5));
        assert!(!table.remove(6));
        assert_eq!(table.len(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn update_never_creates_rows() {
        let table = ConnectionTable::new(4);
        assert!(!table.update(9, |s| s.cwnd = 1));
        assert_eq!(table.lookup(9), None);

        table.admit(9, state(10));
        assert!(table.update(9, |s| s.pacing_rate = 12_500));
        assert_eq!(table.lookup(9).map(|s| s.pacing_rate), Some(12_500));
    }

    #[test]
    fn snapshot_is_sorted_by_key() {
        let table = ConnectionTable::new(16);
        for key in [42u64, 3, 17] {
            table.admit(key, state(key as u32));
        }
        let keys: Vec<u64> = table.snapshot().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![3, 17, 42]);
    }

    #[test]
    fn concurrent_admits_of_one_key_insert_once() {
        let table = Arc::new(ConnectionTable::new(16));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = table.clone();
                thread::spawn(move || table.admit(77, state(i)))
            })
            .collect();
        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|a| *a == Admission::Inserted)
            .count();
        assert_eq!(inserted, 1);
        assert_eq!(table.len(), 1);
    }
}
