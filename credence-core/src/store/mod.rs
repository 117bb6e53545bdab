//! ## credence-core::store
//! **Persistence contract of the tracker**
//!
//! The tracker only needs a small ordered key-value interface. Anything that
//! can implement [`KeyValueStore`] (an embedded database, a remote service)
//! can back it; [`MemoryStore`] is the in-process implementation used by the
//! CLI simulation and the tests.

mod record;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::StoreError;
use crate::node_id::NodeId;

pub use record::{BalanceRecord, DecayOffsets};

/// Key of the decay offsets record. Shorter than a node id, so it never
/// collides with a balance record and node scans skip it.
const DECAY_OFFSETS_KEY: &[u8] = b"credence:decay";

/// Ordered key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    fn put(&self, key: &[u8], value: Bytes) -> Result<(), StoreError>;

    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Entries with `start <= key < stop` (unbounded when `stop` is `None`)
    /// in key order, at most `limit` of them.
    fn scan(
        &self,
        start: &[u8],
        stop: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Bytes, Bytes)>, StoreError>;
}

/// `BTreeMap` backed store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Bytes) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn scan(
        &self,
        start: &[u8],
        stop: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        if stop.is_some_and(|stop| stop <= start) {
            return Ok(Vec::new());
        }
        let upper = stop.map_or(Bound::Unbounded, Bound::Excluded);
        let entries = self.entries.read();
        Ok(entries
            .range::<[u8], _>((Bound::Included(start), upper))
            .take(limit)
            .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone()))
            .collect())
    }
}

/// Typed view over a [`KeyValueStore`].
#[derive(Clone)]
pub struct BalanceDb {
    store: Arc<dyn KeyValueStore>,
}

impl BalanceDb {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn load(&self, id: &NodeId) -> Result<Option<BalanceRecord>, StoreError> {
        self.store
            .get(id.as_bytes())?
            .map(|raw| BalanceRecord::decode(&raw))
            .transpose()
    }

    pub fn save(&self, id: &NodeId, record: &BalanceRecord) -> Result<(), StoreError> {
        self.store.put(id.as_bytes(), record.encode())
    }

    pub fn remove(&self, id: &NodeId) -> Result<(), StoreError> {
        self.store.delete(id.as_bytes())
    }

    pub fn load_offsets(&self) -> Result<Option<DecayOffsets>, StoreError> {
        self.store
            .get(DECAY_OFFSETS_KEY)?
            .map(|raw| DecayOffsets::decode(&raw))
            .transpose()
    }

    pub fn save_offsets(&self, offsets: &DecayOffsets) -> Result<(), StoreError> {
        self.store.put(DECAY_OFFSETS_KEY, offsets.encode())
    }

    /// Ids in `[start, stop)` whose persisted positive balance is non-zero,
    /// in id order, at most `max` of them.
    pub fn positive_ids(
        &self,
        start: &NodeId,
        stop: Option<&NodeId>,
        max: usize,
    ) -> Result<Vec<NodeId>, StoreError> {
        let mut ids = Vec::new();
        let mut cursor = start.as_bytes().to_vec();
        while ids.len() < max {
            let batch = self.store.scan(&cursor, stop.map(|s| &s.as_bytes()[..]), max)?;
            let Some((last_key, _)) = batch.last() else {
                break;
            };
            // Resume strictly after the last key seen.
            let mut next = last_key.to_vec();
            next.push(0);
            let exhausted = batch.len() < max;

            for (key, value) in &batch {
                let Some(id) = NodeId::from_slice(key) else {
                    continue;
                };
                match BalanceRecord::decode(value) {
                    Ok(record) if !record.pos.is_zero() => ids.push(id),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(node = %id, error = %err, "Skipping corrupt balance record"),
                }
                if ids.len() == max {
                    break;
                }
            }
            if exhausted {
                break;
            }
            cursor = next;
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decay::ExpiredValue;

    fn record(pos: u64, neg: u64) -> BalanceRecord {
        BalanceRecord {
            pos: ExpiredValue { base: pos, exp: 0 },
            neg: ExpiredValue { base: neg, exp: 0 },
            ..BalanceRecord::default()
        }
    }

    #[test]
    fn scan_respects_bounds_and_limit() {
        let store = MemoryStore::new();
        for key in [b"a", b"b", b"c", b"d"] {
            store.put(key, Bytes::from_static(b"v")).unwrap();
        }
        let keys: Vec<_> = store
            .scan(b"b", Some(&b"d"[..]), 10)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]);
        assert_eq!(store.scan(b"a", None, 3).unwrap().len(), 3);
    }

    #[test]
    fn missing_record_loads_as_none() {
        let db = BalanceDb::new(Arc::new(MemoryStore::new()));
        assert_eq!(db.load(&NodeId::from_index(1)), Ok(None));
    }

    #[test]
    fn records_and_offsets_round_trip() {
        let db = BalanceDb::new(Arc::new(MemoryStore::new()));
        let id = NodeId::from_index(3);
        db.save(&id, &record(10, 20)).unwrap();
        assert_eq!(db.load(&id), Ok(Some(record(10, 20))));
        db.remove(&id).unwrap();
        assert_eq!(db.load(&id), Ok(None));

        let offsets = DecayOffsets {
            pos: crate::decay::Fixed64(11),
            neg: crate::decay::Fixed64(12),
        };
        db.save_offsets(&offsets).unwrap();
        assert_eq!(db.load_offsets(), Ok(Some(offsets)));
    }

    #[test]
    fn positive_ids_skip_debt_only_and_foreign_keys() {
        let store = Arc::new(MemoryStore::new());
        let db = BalanceDb::new(store.clone());
        db.save_offsets(&DecayOffsets::default()).unwrap();
        for i in 0..10u64 {
            let pos = if i % 2 == 0 { 100 } else { 0 };
            db.save(&NodeId::from_index(i), &record(pos, 5)).unwrap();
        }
        let all = db.positive_ids(&NodeId::default(), None, 100).unwrap();
        assert_eq!(
            all,
            [0, 2, 4, 6, 8].map(NodeId::from_index).to_vec()
        );

        let first_two = db.positive_ids(&NodeId::default(), None, 2).unwrap();
        assert_eq!(first_two, vec![NodeId::from_index(0), NodeId::from_index(2)]);

        let bounded = db
            .positive_ids(&NodeId::from_index(3), Some(&NodeId::from_index(8)), 100)
            .unwrap();
        assert_eq!(bounded, vec![NodeId::from_index(4), NodeId::from_index(6)]);
    }
}
