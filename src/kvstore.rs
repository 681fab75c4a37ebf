//! The underlying persistent store contract.
//!
//! The engine drives whatever row store the embedder provides through the
//! [`KVStore`] trait: transactional writes keyed by row id, point reads,
//! vbucket state snapshots, and a handful of capability flags. The crate
//! ships [`MemoryKVStore`], an in-process implementation used by the test
//! suite; it honors the full contract including staged transactions and
//! injectable failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::item::{Item, QueuedItem};
use crate::vbucket::VBucketState;

/// Capabilities reported by a store implementation.
#[derive(Clone, Copy, Debug)]
pub struct StorageProperties {
    pub max_concurrency: usize,
    pub max_readers: usize,
    pub max_writers: usize,
    pub efficient_vb_load: bool,
    pub efficient_vb_deletion: bool,
    pub persisted_deletions: bool,
}

impl Default for StorageProperties {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            max_readers: 9,
            max_writers: 1,
            efficient_vb_load: true,
            efficient_vb_deletion: true,
            persisted_deletions: true,
        }
    }
}

/// Result of a point read.
#[derive(Debug)]
pub struct GetValue {
    pub item: Option<Item>,
    pub status: Result<()>,
}

impl GetValue {
    pub fn hit(item: Item) -> Self {
        Self {
            item: Some(item),
            status: Ok(()),
        }
    }

    pub fn miss() -> Self {
        Self {
            item: None,
            status: Err(Error::KeyNotFound),
        }
    }
}

/// Persisted per-vbucket state row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VBucketSnapshot {
    pub state: VBucketState,
    pub checkpoint_id: u64,
}

/// The persistence backend contract.
///
/// `set` returns `(result, assigned_row_id)`: result 1 on success with a
/// positive row id when the write was an insert, 0 when no row changed, and
/// negative on failure. `del` returns 1 when a row was removed, 0 when it
/// did not exist, and -1 on failure. `commit` is retryable; the engine
/// retries it until it reports success.
pub trait KVStore: Send + Sync {
    fn begin(&self) -> bool;
    fn commit(&self) -> bool;
    fn rollback(&self);

    fn set(&self, item: &Item) -> (i32, i64);
    fn del(&self, item: &Item, row_id: i64) -> i32;
    fn get(&self, key: &[u8], row_id: i64, vbucket: u16) -> GetValue;

    fn snapshot_vbuckets(&self, map: &HashMap<u16, VBucketSnapshot>) -> bool;
    fn list_persisted_vbuckets(&self) -> HashMap<u16, VBucketSnapshot>;
    fn snapshot_stats(&self, map: &HashMap<String, String>) -> bool;
    fn get_persisted_stats(&self) -> HashMap<String, String>;

    fn reset(&self);
    fn del_vbucket(&self, vbucket: u16) -> bool;

    /// Reorders a flush batch for write locality.
    fn optimize_writes(&self, items: &mut Vec<QueuedItem>);

    fn properties(&self) -> StorageProperties;
}

enum StagedOp {
    Set { item: Item, row_id: i64 },
    Del { row_id: i64 },
}

#[derive(Default)]
struct MemoryInner {
    rows: HashMap<i64, Item>,
    index: HashMap<(u16, Vec<u8>), i64>,
    staged: Vec<StagedOp>,
    in_txn: bool,
    vbucket_states: HashMap<u16, VBucketSnapshot>,
    stats: HashMap<String, String>,
}

/// An in-process row store. Rows are keyed by an allocated row id; writes
/// stage inside a transaction and apply on commit, so a failed commit can
/// be retried without losing the batch.
pub struct MemoryKVStore {
    inner: Mutex<MemoryInner>,
    next_row_id: AtomicU64,
    properties: StorageProperties,
    fail_commits: AtomicU64,
    fail_sets: AtomicU64,
}

impl MemoryKVStore {
    pub fn new() -> Self {
        Self::with_properties(StorageProperties::default())
    }

    pub fn with_properties(properties: StorageProperties) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            next_row_id: AtomicU64::new(1),
            properties,
            fail_commits: AtomicU64::new(0),
            fail_sets: AtomicU64::new(0),
        }
    }

    /// Makes the next `n` commits report failure (the staged batch is kept
    /// so a retry succeeds).
    pub fn fail_next_commits(&self, n: u64) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` sets report failure.
    pub fn fail_next_sets(&self, n: u64) {
        self.fail_sets.store(n, Ordering::SeqCst);
    }

    pub fn num_rows(&self) -> usize {
        self.inner.lock().unwrap().rows.len()
    }

    /// Committed row for a key, if any. Test support.
    pub fn committed_row(&self, vbucket: u16, key: &[u8]) -> Option<Item> {
        let inner = self.inner.lock().unwrap();
        let row_id = inner.index.get(&(vbucket, key.to_vec()))?;
        inner.rows.get(row_id).cloned()
    }

    fn take_failure(counter: &AtomicU64) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryKVStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KVStore for MemoryKVStore {
    fn begin(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.in_txn = true;
        true
    }

    fn commit(&self) -> bool {
        if Self::take_failure(&self.fail_commits) {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        let staged = std::mem::take(&mut inner.staged);
        for op in staged {
            match op {
                StagedOp::Set { mut item, row_id } => {
                    item.row_id = row_id;
                    inner
                        .index
                        .insert((item.vbucket, item.key.clone()), row_id);
                    inner.rows.insert(row_id, item);
                }
                StagedOp::Del { row_id } => {
                    if let Some(item) = inner.rows.remove(&row_id) {
                        inner.index.remove(&(item.vbucket, item.key));
                    }
                }
            }
        }
        inner.in_txn = false;
        true
    }

    fn rollback(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.staged.clear();
        inner.in_txn = false;
    }

    fn set(&self, item: &Item) -> (i32, i64) {
        if Self::take_failure(&self.fail_sets) {
            return (-1, 0);
        }
        let mut inner = self.inner.lock().unwrap();
        if item.row_id > 0 {
            // Update by row id; no row means no update.
            if !inner.rows.contains_key(&item.row_id) {
                return (0, 0);
            }
            inner.staged.push(StagedOp::Set {
                item: item.clone(),
                row_id: item.row_id,
            });
            (1, 0)
        } else {
            let row_id = self.next_row_id.fetch_add(1, Ordering::SeqCst) as i64;
            inner.staged.push(StagedOp::Set {
                item: item.clone(),
                row_id,
            });
            (1, row_id)
        }
    }

    fn del(&self, _item: &Item, row_id: i64) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        if row_id <= 0 {
            return 0;
        }
        let existed = inner.rows.contains_key(&row_id);
        inner.staged.push(StagedOp::Del { row_id });
        if existed {
            1
        } else {
            0
        }
    }

    fn get(&self, key: &[u8], row_id: i64, vbucket: u16) -> GetValue {
        let inner = self.inner.lock().unwrap();
        let row = if row_id > 0 {
            inner.rows.get(&row_id)
        } else {
            inner
                .index
                .get(&(vbucket, key.to_vec()))
                .and_then(|id| inner.rows.get(id))
        };
        match row {
            Some(item) => GetValue::hit(item.clone()),
            None => GetValue::miss(),
        }
    }

    fn snapshot_vbuckets(&self, map: &HashMap<u16, VBucketSnapshot>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.vbucket_states = map.clone();
        true
    }

    fn list_persisted_vbuckets(&self) -> HashMap<u16, VBucketSnapshot> {
        self.inner.lock().unwrap().vbucket_states.clone()
    }

    fn snapshot_stats(&self, map: &HashMap<String, String>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.stats = map.clone();
        true
    }

    fn get_persisted_stats(&self) -> HashMap<String, String> {
        self.inner.lock().unwrap().stats.clone()
    }

    fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.rows.clear();
        inner.index.clear();
        inner.staged.clear();
    }

    fn del_vbucket(&self, vbucket: u16) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let row_ids: Vec<i64> = inner
            .rows
            .iter()
            .filter(|(_, item)| item.vbucket == vbucket)
            .map(|(id, _)| *id)
            .collect();
        for id in row_ids {
            if let Some(item) = inner.rows.remove(&id) {
                inner.index.remove(&(item.vbucket, item.key));
            }
        }
        true
    }

    fn optimize_writes(&self, items: &mut Vec<QueuedItem>) {
        // Group inserts first, then updates in row id order.
        items.sort_by(|a, b| {
            (a.vbucket, a.row_id, a.key.as_slice()).cmp(&(b.vbucket, b.row_id, b.key.as_slice()))
        });
    }

    fn properties(&self) -> StorageProperties {
        self.properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &[u8], value: &[u8], vb: u16) -> Item {
        Item::new(key.to_vec(), value.to_vec(), vb)
    }

    #[test]
    fn test_insert_assigns_row_id_and_commits() {
        let kv = MemoryKVStore::new();
        assert!(kv.begin());
        let (rv, row_id) = kv.set(&item(b"a", b"v", 0));
        assert_eq!(rv, 1);
        assert!(row_id > 0);

        // Not visible until commit.
        assert!(kv.get(b"a", row_id, 0).item.is_none());
        assert!(kv.commit());

        let gv = kv.get(b"a", row_id, 0);
        let fetched = gv.item.expect("committed row");
        assert_eq!(fetched.value.as_deref(), Some(&b"v"[..]));
        assert_eq!(fetched.row_id, row_id);
    }

    #[test]
    fn test_update_by_row_id() {
        let kv = MemoryKVStore::new();
        kv.begin();
        let (_, row_id) = kv.set(&item(b"a", b"v1", 0));
        kv.commit();

        kv.begin();
        let mut upd = item(b"a", b"v2", 0);
        upd.row_id = row_id;
        assert_eq!(kv.set(&upd), (1, 0));
        kv.commit();

        assert_eq!(
            kv.get(b"a", row_id, 0).item.unwrap().value.as_deref(),
            Some(&b"v2"[..])
        );
    }

    #[test]
    fn test_update_missing_row_reports_zero() {
        let kv = MemoryKVStore::new();
        kv.begin();
        let mut upd = item(b"a", b"v", 0);
        upd.row_id = 9999;
        assert_eq!(kv.set(&upd), (0, 0));
    }

    #[test]
    fn test_delete_row() {
        let kv = MemoryKVStore::new();
        kv.begin();
        let (_, row_id) = kv.set(&item(b"a", b"v", 0));
        kv.commit();

        kv.begin();
        assert_eq!(kv.del(&item(b"a", b"", 0), row_id), 1);
        kv.commit();
        assert!(kv.get(b"a", row_id, 0).item.is_none());

        kv.begin();
        assert_eq!(kv.del(&item(b"a", b"", 0), row_id), 0);
        assert_eq!(kv.del(&item(b"a", b"", 0), -1), 0);
    }

    #[test]
    fn test_commit_failure_keeps_staged_batch() {
        let kv = MemoryKVStore::new();
        kv.fail_next_commits(1);
        kv.begin();
        let (_, row_id) = kv.set(&item(b"a", b"v", 0));
        assert!(!kv.commit());
        // Retry succeeds with the batch intact.
        assert!(kv.commit());
        assert!(kv.get(b"a", row_id, 0).item.is_some());
    }

    #[test]
    fn test_del_vbucket_removes_only_that_vbucket() {
        let kv = MemoryKVStore::new();
        kv.begin();
        kv.set(&item(b"a", b"v", 0));
        kv.set(&item(b"b", b"v", 1));
        kv.commit();

        assert!(kv.del_vbucket(0));
        assert_eq!(kv.num_rows(), 1);
        assert!(kv.get(b"b", -1, 1).item.is_some());
    }

    #[test]
    fn test_vbucket_snapshot_round_trip() {
        let kv = MemoryKVStore::new();
        let mut map = HashMap::new();
        map.insert(
            3u16,
            VBucketSnapshot {
                state: VBucketState::Active,
                checkpoint_id: 7,
            },
        );
        assert!(kv.snapshot_vbuckets(&map));
        assert_eq!(kv.list_persisted_vbuckets(), map);
    }

    #[test]
    fn test_optimize_writes_orders_by_row_id() {
        use crate::item::Operation;
        let kv = MemoryKVStore::new();
        let mut items = vec![
            QueuedItem::new(b"c".to_vec(), 0, Operation::Set, 30, 1),
            QueuedItem::new(b"a".to_vec(), 0, Operation::Set, -1, 1),
            QueuedItem::new(b"b".to_vec(), 0, Operation::Set, 10, 1),
        ];
        kv.optimize_writes(&mut items);
        assert_eq!(items[0].key, b"a");
        assert_eq!(items[1].key, b"b");
        assert_eq!(items[2].key, b"c");
    }
}
