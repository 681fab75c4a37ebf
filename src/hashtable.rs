//! Sharded-lock hash table of stored values.
//!
//! Each vbucket owns one [`HashTable`]. Entries live in per-shard
//! `HashMap`s, each behind its own mutex; all mutating operations lock only
//! the shard the key hashes to, so unrelated keys never contend. The shard
//! vector itself sits behind a `RwLock` that is write-locked only by the
//! resizer task.
//!
//! Callers operate through [`HashTable::with_bucket`], which runs a closure
//! with the shard locked. The closure receives a [`Bucket`] exposing the
//! find/set/add/delete family; this mirrors a lock-then-operate discipline
//! without ever letting a reference to a stored value escape the lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::item::{current_time, next_cas, Item, ItemMeta, Operation, UNPERSISTED_ROW_ID};
use crate::stats::MemBudget;

/// Seconds a temporary (meta-fetch placeholder) item lives before the
/// expiry pager reaps it.
pub const TEMP_ITEM_TTL: u32 = 5;

/// Fixed accounting overhead charged per stored value.
const STORED_VALUE_OVERHEAD: usize = 80;

/// Shard counts the resizer steps through.
const SHARD_SIZES: [usize; 7] = [193, 769, 3079, 12289, 49157, 196_613, 786_433];

/// Outcome of a mutating hash table operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationType {
    WasClean,
    WasDirty,
    NotFound,
    InvalidCas,
    IsLocked,
    InvalidVbucket,
    NoMem,
}

/// Outcome of an add.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddType {
    Success,
    Exists,
    UnDel,
    NoMem,
}

/// An in-memory stored value: item metadata plus lifecycle state. The value
/// blob may be absent (non-resident) while the metadata stays cached.
#[derive(Debug)]
pub struct StoredValue {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub flags: u32,
    pub exptime: u32,
    pub cas: u64,
    pub seqno: u64,
    pub row_id: i64,
    /// When the value was last dirtied, wall-clock seconds.
    pub dirtied_at: u32,
    /// When the value was queued for persistence.
    pub queued_at: u32,
    /// Lock expiry, wall-clock seconds; 0 means unlocked.
    pub locked_until: u32,
    pub dirty: bool,
    pub deleted: bool,
    /// Placeholder for an in-flight metadata fetch.
    pub temp: bool,
    /// The metadata fetch confirmed the key does not exist on disk.
    pub nonexistent: bool,
    /// A row-id assignment is in flight for this value.
    pub pending_id: bool,
    /// Touched since the last access scan or pager pass.
    pub referenced: bool,
}

impl StoredValue {
    fn from_item(item: &Item, dirty: bool) -> Self {
        Self {
            key: item.key.clone(),
            value: item.value.clone(),
            flags: item.flags,
            exptime: item.exptime,
            cas: item.cas,
            seqno: item.seqno,
            row_id: item.row_id,
            dirtied_at: if dirty { current_time() } else { 0 },
            queued_at: 0,
            locked_until: 0,
            dirty,
            deleted: false,
            temp: false,
            nonexistent: false,
            pending_id: false,
            referenced: false,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_expired(&self, now: u32) -> bool {
        self.exptime != 0 && self.exptime <= now
    }

    pub fn is_locked(&self, now: u32) -> bool {
        self.locked_until != 0 && self.locked_until > now
    }

    pub fn lock(&mut self, until: u32) {
        self.locked_until = until;
    }

    pub fn unlock(&mut self) {
        self.locked_until = 0;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.dirtied_at = current_time();
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
        self.pending_id = false;
    }

    /// Restores the dirty state after a failed persistence attempt, keeping
    /// the original dirtied timestamp so age-based flushing is unaffected.
    pub fn re_dirty(&mut self, dirtied_at: u32) {
        self.dirty = true;
        self.dirtied_at = dirtied_at;
        self.pending_id = false;
    }

    /// Seconds since this value was dirtied.
    pub fn data_age(&self, now: u32) -> u32 {
        now.saturating_sub(self.dirtied_at)
    }

    pub fn touch(&mut self) {
        self.referenced = true;
    }

    fn mem_size(&self) -> usize {
        STORED_VALUE_OVERHEAD + self.key.len() + self.value.as_ref().map_or(0, |v| v.len())
    }

    /// Drops the value payload, keeping metadata. Only clean, resident,
    /// non-temp values are ejectable.
    pub fn eject(&mut self, mem: &MemBudget) -> bool {
        if self.dirty || self.temp || self.deleted || !self.is_resident() {
            return false;
        }
        if let Some(v) = self.value.take() {
            mem.release(v.len());
        }
        self.referenced = false;
        true
    }

    /// Re-installs a fetched value on a non-resident entry. The cached
    /// metadata wins over the fetched copy; only entries that never carried
    /// metadata (log-warmed placeholders, cas 0) take it from the fetch.
    pub fn restore_value(&mut self, item: &Item, mem: &MemBudget) {
        if self.is_resident() {
            return;
        }
        if let Some(v) = &item.value {
            mem.try_reserve(v.len());
            self.value = Some(v.clone());
        }
        if self.cas == 0 {
            self.cas = item.cas;
            self.seqno = item.seqno;
            self.flags = item.flags;
            self.exptime = item.exptime;
        }
        self.referenced = true;
    }

    /// Completes a metadata fetch against a temp item. `meta: None` records
    /// that the key does not exist on disk.
    pub fn restore_meta(&mut self, meta: Option<(&ItemMeta, i64)>) {
        match meta {
            Some((m, row_id)) => {
                self.cas = m.cas;
                self.seqno = m.seqno;
                self.flags = m.flags;
                self.exptime = m.exptime;
                self.row_id = row_id;
                self.nonexistent = false;
            }
            None => {
                self.nonexistent = true;
            }
        }
    }

    pub fn to_item(&self, vbucket: u16) -> Item {
        Item {
            key: self.key.clone(),
            value: self.value.clone(),
            flags: self.flags,
            exptime: self.exptime,
            cas: self.cas,
            seqno: self.seqno,
            row_id: self.row_id,
            vbucket,
        }
    }
}

/// Visitor over stored values; shards are visited one at a time so a slow
/// visitor never blocks unrelated keys.
pub trait HashTableVisitor {
    fn visit(&mut self, sv: &mut StoredValue);
}

type Shard = Mutex<HashMap<Vec<u8>, StoredValue>>;

pub struct HashTable {
    shards: RwLock<Vec<Shard>>,
    mem: Arc<MemBudget>,
    num_items: AtomicUsize,
    num_entries: AtomicUsize,
    active: AtomicBool,
}

impl HashTable {
    pub fn new(num_shards: usize, mem: Arc<MemBudget>) -> Self {
        let num_shards = num_shards.max(1);
        let mut shards = Vec::with_capacity(num_shards);
        for _ in 0..num_shards {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self {
            shards: RwLock::new(shards),
            mem,
            num_items: AtomicUsize::new(0),
            num_entries: AtomicUsize::new(0),
            active: AtomicBool::new(true),
        }
    }

    fn shard_index(key: &[u8], num_shards: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % num_shards as u64) as usize
    }

    /// Live (non-deleted, non-temp) item count.
    pub fn num_items(&self) -> usize {
        self.num_items.load(Ordering::Relaxed)
    }

    /// Total entry count including tombstones and temp placeholders.
    pub fn num_entries(&self) -> usize {
        self.num_entries.load(Ordering::Relaxed)
    }

    pub fn num_shards(&self) -> usize {
        self.shards.read().unwrap().len()
    }

    pub fn mem(&self) -> &Arc<MemBudget> {
        &self.mem
    }

    /// Runs `f` with the key's shard locked.
    pub fn with_bucket<R>(&self, key: &[u8], f: impl FnOnce(&mut Bucket) -> R) -> R {
        let shards = self.shards.read().unwrap();
        let idx = Self::shard_index(key, shards.len());
        let mut guard = shards[idx].lock().unwrap();
        let mut bucket = Bucket {
            ht: self,
            map: &mut *guard,
        };
        f(&mut bucket)
    }

    /// Visits every stored value, one shard lock at a time.
    pub fn visit(&self, visitor: &mut dyn HashTableVisitor) {
        let shards = self.shards.read().unwrap();
        for shard in shards.iter() {
            let mut map = shard.lock().unwrap();
            for sv in map.values_mut() {
                visitor.visit(sv);
            }
        }
    }

    /// Removes everything and releases the accounted memory.
    pub fn clear(&self) {
        let shards = self.shards.read().unwrap();
        for shard in shards.iter() {
            let mut map = shard.lock().unwrap();
            for sv in map.values() {
                self.mem.release(sv.mem_size());
            }
            map.clear();
        }
        self.num_items.store(0, Ordering::Relaxed);
        self.num_entries.store(0, Ordering::Relaxed);
    }

    /// Marks the table dead; subsequent mutations return `InvalidVbucket`.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Grows the shard vector when the average chain gets long. Upward only.
    pub fn resize_if_needed(&self, max_items_per_shard: usize) -> bool {
        let entries = self.num_entries();
        let current = self.num_shards();
        if max_items_per_shard == 0 || entries / current.max(1) < max_items_per_shard {
            return false;
        }
        let target = SHARD_SIZES
            .iter()
            .copied()
            .find(|s| *s > current && entries / s < max_items_per_shard);
        let Some(target) = target else {
            return false;
        };

        let mut shards = self.shards.write().unwrap();
        let mut new_shards: Vec<Shard> = Vec::with_capacity(target);
        for _ in 0..target {
            new_shards.push(Mutex::new(HashMap::new()));
        }
        for shard in shards.iter() {
            let mut map = shard.lock().unwrap();
            for (key, sv) in map.drain() {
                let idx = Self::shard_index(&key, target);
                new_shards[idx].get_mut().unwrap().insert(key, sv);
            }
        }
        *shards = new_shards;
        tracing::info!(shards = target, entries, "hash table resized");
        true
    }
}

/// Result of a soft delete, carrying what the caller needs to enqueue the
/// tombstone.
#[derive(Debug)]
pub struct SoftDeleteResult {
    pub mutation: MutationType,
    pub row_id: i64,
    pub seqno: u64,
}

/// A locked shard view. All operations run under the shard mutex held by
/// [`HashTable::with_bucket`].
pub struct Bucket<'a, 'b> {
    ht: &'a HashTable,
    map: &'b mut HashMap<Vec<u8>, StoredValue>,
}

impl Bucket<'_, '_> {
    /// Looks up a stored value. Tombstones are only surfaced when
    /// `want_deleted` is set; `track_ref` records the access for the pager
    /// and access scanner.
    pub fn find(
        &mut self,
        key: &[u8],
        want_deleted: bool,
        track_ref: bool,
    ) -> Option<&mut StoredValue> {
        let sv = self.map.get_mut(key)?;
        if sv.deleted && !want_deleted {
            return None;
        }
        if track_ref && !sv.deleted {
            sv.referenced = true;
        }
        Some(sv)
    }

    /// Stores an item. `req_cas == 0` is an unconditional store; a non-zero
    /// cas must match the live value. Returns the mutation outcome and the
    /// row id the caller should queue with.
    ///
    /// A plain store of a new key returns `NotFound` with the entry
    /// installed; the caller distinguishes cas stores (miss) from plain
    /// stores (success, queue it).
    pub fn set(
        &mut self,
        item: &Item,
        req_cas: u64,
        allow_existing: bool,
        has_meta: bool,
        track_ref: bool,
    ) -> (MutationType, i64) {
        if !self.ht.is_active() {
            return (MutationType::InvalidVbucket, UNPERSISTED_ROW_ID);
        }
        let now = current_time();
        match self.map.get_mut(&item.key) {
            Some(v) if v.deleted || v.temp => {
                if req_cas != 0 {
                    return (MutationType::NotFound, UNPERSISTED_ROW_ID);
                }
                let was_dirty = v.dirty;
                if !Self::apply_value(v, item, has_meta, &self.ht.mem) {
                    return (MutationType::NoMem, v.row_id);
                }
                v.deleted = false;
                v.temp = false;
                v.nonexistent = false;
                self.ht.num_items.fetch_add(1, Ordering::Relaxed);
                let mt = if was_dirty {
                    MutationType::WasDirty
                } else {
                    MutationType::WasClean
                };
                (mt, v.row_id)
            }
            Some(v) => {
                if v.is_locked(now) {
                    if req_cas != v.cas {
                        return (MutationType::IsLocked, v.row_id);
                    }
                    // A store with the lock holder's cas releases the lock.
                    v.unlock();
                } else if req_cas != 0 && req_cas != v.cas {
                    return (MutationType::InvalidCas, v.row_id);
                }
                if !allow_existing {
                    return (MutationType::InvalidCas, v.row_id);
                }
                let was_dirty = v.dirty;
                if !Self::apply_value(v, item, has_meta, &self.ht.mem) {
                    return (MutationType::NoMem, v.row_id);
                }
                if track_ref {
                    v.referenced = true;
                }
                let mt = if was_dirty {
                    MutationType::WasDirty
                } else {
                    MutationType::WasClean
                };
                (mt, v.row_id)
            }
            None => {
                if req_cas != 0 {
                    return (MutationType::NotFound, UNPERSISTED_ROW_ID);
                }
                let mut sv = StoredValue::from_item(item, true);
                if !has_meta {
                    sv.cas = next_cas();
                    sv.seqno = item.seqno.max(1);
                }
                if !self.ht.mem.try_reserve(sv.mem_size()) {
                    return (MutationType::NoMem, UNPERSISTED_ROW_ID);
                }
                let row_id = sv.row_id;
                self.map.insert(item.key.clone(), sv);
                self.ht.num_items.fetch_add(1, Ordering::Relaxed);
                self.ht.num_entries.fetch_add(1, Ordering::Relaxed);
                (MutationType::NotFound, row_id)
            }
        }
    }

    /// Stamps `item`'s payload and metadata onto an existing entry,
    /// adjusting the memory accounting for the size delta.
    fn apply_value(v: &mut StoredValue, item: &Item, has_meta: bool, mem: &MemBudget) -> bool {
        let old_len = v.value.as_ref().map_or(0, |b| b.len());
        let new_len = item.value_len();
        if new_len > old_len && !mem.try_reserve(new_len - old_len) {
            return false;
        }
        if new_len < old_len {
            mem.release(old_len - new_len);
        }
        v.value = item.value.clone();
        v.flags = item.flags;
        v.exptime = item.exptime;
        if has_meta {
            v.cas = item.cas;
            v.seqno = item.seqno;
        } else {
            v.seqno += 1;
            v.cas = next_cas();
        }
        v.mark_dirty();
        true
    }

    /// Adds an item only if no live value exists for the key.
    pub fn add(&mut self, item: &Item) -> AddType {
        let now = current_time();
        match self.map.get_mut(&item.key) {
            Some(v) if !v.deleted && !v.temp && !v.is_expired(now) => AddType::Exists,
            Some(v) => {
                let was_temp = v.temp;
                if !Self::apply_value(v, item, false, &self.ht.mem) {
                    return AddType::NoMem;
                }
                v.deleted = false;
                v.temp = false;
                v.nonexistent = false;
                self.ht.num_items.fetch_add(1, Ordering::Relaxed);
                if was_temp {
                    AddType::Success
                } else {
                    AddType::UnDel
                }
            }
            None => {
                let mut sv = StoredValue::from_item(item, true);
                sv.cas = next_cas();
                sv.seqno = item.seqno.max(1);
                if !self.ht.mem.try_reserve(sv.mem_size()) {
                    return AddType::NoMem;
                }
                self.map.insert(item.key.clone(), sv);
                self.ht.num_items.fetch_add(1, Ordering::Relaxed);
                self.ht.num_entries.fetch_add(1, Ordering::Relaxed);
                AddType::Success
            }
        }
    }

    /// Marks a value deleted in memory, leaving a tombstone for the flusher.
    /// `meta` stamps replicated metadata onto the tombstone.
    pub fn soft_delete(
        &mut self,
        key: &[u8],
        req_cas: u64,
        meta: Option<&ItemMeta>,
    ) -> SoftDeleteResult {
        let now = current_time();
        let not_found = SoftDeleteResult {
            mutation: MutationType::NotFound,
            row_id: UNPERSISTED_ROW_ID,
            seqno: 0,
        };
        let Some(v) = self.map.get_mut(key) else {
            return not_found;
        };
        if v.is_locked(now) {
            return SoftDeleteResult {
                mutation: MutationType::IsLocked,
                row_id: v.row_id,
                seqno: v.seqno,
            };
        }
        if req_cas != 0 && req_cas != v.cas {
            return SoftDeleteResult {
                mutation: MutationType::InvalidCas,
                row_id: v.row_id,
                seqno: v.seqno,
            };
        }
        let was_dirty = v.dirty;
        let was_live = !v.deleted && !v.temp;
        if let Some(value) = v.value.take() {
            self.ht.mem.release(value.len());
        }
        v.deleted = true;
        v.mark_dirty();
        match meta {
            Some(m) => {
                v.cas = m.cas;
                v.seqno = m.seqno;
                v.flags = m.flags;
                v.exptime = m.exptime;
            }
            None => {
                v.seqno += 1;
                v.cas = next_cas();
            }
        }
        if was_live {
            self.ht.num_items.fetch_sub(1, Ordering::Relaxed);
        }
        SoftDeleteResult {
            mutation: if was_dirty {
                MutationType::WasDirty
            } else {
                MutationType::WasClean
            },
            row_id: v.row_id,
            seqno: v.seqno,
        }
    }

    /// Hard-removes an entry. Returns false if the key was absent.
    pub fn del(&mut self, key: &[u8]) -> bool {
        match self.map.remove(key) {
            Some(sv) => {
                self.ht.mem.release(sv.mem_size());
                self.ht.num_entries.fetch_sub(1, Ordering::Relaxed);
                if !sv.deleted && !sv.temp {
                    self.ht.num_items.fetch_sub(1, Ordering::Relaxed);
                }
                true
            }
            None => false,
        }
    }

    /// Installs a temp deleted placeholder used to deduplicate concurrent
    /// metadata fetches. It expires after [`TEMP_ITEM_TTL`].
    pub fn add_temp_deleted_item(&mut self, key: &[u8]) -> AddType {
        if self.map.contains_key(key) {
            return AddType::Exists;
        }
        let sv = StoredValue {
            key: key.to_vec(),
            value: None,
            flags: 0,
            exptime: current_time() + TEMP_ITEM_TTL,
            cas: next_cas(),
            seqno: 0,
            row_id: UNPERSISTED_ROW_ID,
            dirtied_at: 0,
            queued_at: 0,
            locked_until: 0,
            dirty: false,
            deleted: true,
            temp: true,
            nonexistent: false,
            pending_id: false,
            referenced: false,
        };
        if !self.ht.mem.try_reserve(sv.mem_size()) {
            return AddType::NoMem;
        }
        self.map.insert(key.to_vec(), sv);
        self.ht.num_entries.fetch_add(1, Ordering::Relaxed);
        AddType::Success
    }

    /// Re-installs an item during restore. Returns false when the key is
    /// already live (restore never clobbers newer data).
    pub fn restore_item(&mut self, item: &Item, op: Operation) -> bool {
        if let Some(v) = self.map.get(&item.key) {
            if !v.deleted {
                return false;
            }
        }
        match op {
            Operation::Del => {
                let mut sv = StoredValue::from_item(item, true);
                sv.value = None;
                sv.deleted = true;
                if !self.ht.mem.try_reserve(sv.mem_size()) {
                    return false;
                }
                self.map.insert(item.key.clone(), sv);
                self.ht.num_entries.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => {
                let sv = StoredValue::from_item(item, true);
                if !self.ht.mem.try_reserve(sv.mem_size()) {
                    return false;
                }
                self.map.insert(item.key.clone(), sv);
                self.ht.num_items.fetch_add(1, Ordering::Relaxed);
                self.ht.num_entries.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Warmup insert of a persisted row. `partial` loads metadata only (the
    /// entry starts non-resident). Returns `NotFound` when the key was newly
    /// installed, `NoMem` when the budget refused it, and the dirty state of
    /// the pre-existing entry otherwise.
    pub fn insert(&mut self, item: &Item, partial: bool) -> MutationType {
        match self.map.get_mut(&item.key) {
            Some(v) => {
                if v.row_id == UNPERSISTED_ROW_ID {
                    v.row_id = item.row_id;
                }
                if v.dirty {
                    MutationType::WasDirty
                } else {
                    MutationType::WasClean
                }
            }
            None => {
                let mut sv = StoredValue::from_item(item, false);
                if partial {
                    sv.value = None;
                }
                if !self.ht.mem.try_reserve(sv.mem_size()) {
                    return MutationType::NoMem;
                }
                self.map.insert(item.key.clone(), sv);
                self.ht.num_items.fetch_add(1, Ordering::Relaxed);
                self.ht.num_entries.fetch_add(1, Ordering::Relaxed);
                MutationType::NotFound
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> HashTable {
        HashTable::new(7, MemBudget::new(0))
    }

    fn item(key: &[u8], value: &[u8]) -> Item {
        Item::new(key.to_vec(), value.to_vec(), 0)
    }

    #[test]
    fn test_set_new_key_returns_not_found_and_inserts() {
        let ht = table();
        let (mt, row_id) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"v"), 0, true, false, true));
        assert_eq!(mt, MutationType::NotFound);
        assert_eq!(row_id, UNPERSISTED_ROW_ID);
        assert_eq!(ht.num_items(), 1);

        ht.with_bucket(b"a", |b| {
            let v = b.find(b"a", false, false).expect("inserted");
            assert!(v.dirty);
            assert_eq!(v.value.as_deref(), Some(&b"v"[..]));
        });
    }

    #[test]
    fn test_cas_set_on_missing_key() {
        let ht = table();
        let (mt, _) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"v"), 17, true, false, true));
        assert_eq!(mt, MutationType::NotFound);
        // A cas store must not install the entry.
        assert_eq!(ht.num_items(), 0);
    }

    #[test]
    fn test_cas_mismatch_and_match() {
        let ht = table();
        ht.with_bucket(b"a", |b| b.set(&item(b"a", b"v1"), 0, true, false, true));
        let cas = ht.with_bucket(b"a", |b| b.find(b"a", false, false).unwrap().cas);

        let (mt, _) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"v2"), cas + 1, true, false, true));
        assert_eq!(mt, MutationType::InvalidCas);

        let (mt, _) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"v2"), cas, true, false, true));
        assert_eq!(mt, MutationType::WasDirty);
    }

    #[test]
    fn test_set_on_locked_entry() {
        let ht = table();
        ht.with_bucket(b"a", |b| b.set(&item(b"a", b"v1"), 0, true, false, true));
        let cas = ht.with_bucket(b"a", |b| {
            let v = b.find(b"a", false, false).unwrap();
            v.lock(current_time() + 30);
            v.cas
        });

        let (mt, _) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"v2"), 0, true, false, true));
        assert_eq!(mt, MutationType::IsLocked);

        // The lock holder's cas releases the lock.
        let (mt, _) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"v2"), cas, true, false, true));
        assert_eq!(mt, MutationType::WasDirty);
        ht.with_bucket(b"a", |b| {
            assert!(!b.find(b"a", false, false).unwrap().is_locked(current_time()));
        });
    }

    #[test]
    fn test_add_exists_and_undelete() {
        let ht = table();
        assert_eq!(ht.with_bucket(b"a", |b| b.add(&item(b"a", b"v"))), AddType::Success);
        assert_eq!(ht.with_bucket(b"a", |b| b.add(&item(b"a", b"v"))), AddType::Exists);

        let res = ht.with_bucket(b"a", |b| b.soft_delete(b"a", 0, None));
        assert_eq!(res.mutation, MutationType::WasDirty);
        assert_eq!(ht.num_items(), 0);

        assert_eq!(ht.with_bucket(b"a", |b| b.add(&item(b"a", b"v2"))), AddType::UnDel);
        assert_eq!(ht.num_items(), 1);
    }

    #[test]
    fn test_soft_delete_leaves_tombstone() {
        let ht = table();
        ht.with_bucket(b"a", |b| b.set(&item(b"a", b"v"), 0, true, false, true));
        let res = ht.with_bucket(b"a", |b| b.soft_delete(b"a", 0, None));
        assert_eq!(res.mutation, MutationType::WasDirty);

        ht.with_bucket(b"a", |b| {
            assert!(b.find(b"a", false, false).is_none());
            let v = b.find(b"a", true, false).expect("tombstone");
            assert!(v.deleted);
            assert!(v.dirty);
            assert!(v.value.is_none());
        });
    }

    #[test]
    fn test_soft_delete_cas_mismatch() {
        let ht = table();
        ht.with_bucket(b"a", |b| b.set(&item(b"a", b"v"), 0, true, false, true));
        let res = ht.with_bucket(b"a", |b| b.soft_delete(b"a", 12345, None));
        assert_eq!(res.mutation, MutationType::InvalidCas);
    }

    #[test]
    fn test_eject_requires_clean() {
        let mem = MemBudget::new(0);
        let ht = HashTable::new(7, mem.clone());
        ht.with_bucket(b"a", |b| b.set(&item(b"a", b"value"), 0, true, false, true));

        ht.with_bucket(b"a", |b| {
            let v = b.find(b"a", false, false).unwrap();
            assert!(!v.eject(&mem), "dirty values must not eject");
            v.mark_clean();
            assert!(v.eject(&mem));
            assert!(!v.is_resident());
            assert!(!v.eject(&mem), "already ejected");
        });
    }

    #[test]
    fn test_mem_accounting_on_clear() {
        let mem = MemBudget::new(0);
        let ht = HashTable::new(7, mem.clone());
        ht.with_bucket(b"a", |b| b.set(&item(b"a", b"hello"), 0, true, false, true));
        ht.with_bucket(b"b", |b| b.set(&item(b"b", b"world"), 0, true, false, true));
        assert!(mem.used() > 0);
        ht.clear();
        assert_eq!(mem.used(), 0);
        assert_eq!(ht.num_items(), 0);
    }

    #[test]
    fn test_nomem_on_budget() {
        let mem = MemBudget::new(100);
        let ht = HashTable::new(7, mem);
        let big = Item::new(b"k".to_vec(), vec![0u8; 200], 0);
        let (mt, _) = ht.with_bucket(b"k", |b| b.set(&big, 0, true, false, true));
        assert_eq!(mt, MutationType::NoMem);
    }

    #[test]
    fn test_temp_deleted_item() {
        let ht = table();
        assert_eq!(
            ht.with_bucket(b"a", |b| b.add_temp_deleted_item(b"a")),
            AddType::Success
        );
        assert_eq!(
            ht.with_bucket(b"a", |b| b.add_temp_deleted_item(b"a")),
            AddType::Exists
        );
        ht.with_bucket(b"a", |b| {
            let v = b.find(b"a", true, false).unwrap();
            assert!(v.temp && v.deleted && !v.is_resident());
            assert!(v.exptime > 0);
        });
        // A temp item is not a live item.
        assert_eq!(ht.num_items(), 0);
    }

    #[test]
    fn test_insert_partial_is_non_resident() {
        let ht = table();
        let mut itm = item(b"a", b"v");
        itm.row_id = 9;
        assert_eq!(ht.with_bucket(b"a", |b| b.insert(&itm, true)), MutationType::NotFound);
        ht.with_bucket(b"a", |b| {
            let v = b.find(b"a", false, false).unwrap();
            assert!(!v.is_resident());
            assert!(!v.dirty);
            assert_eq!(v.row_id, 9);
        });
    }

    #[test]
    fn test_resize_grows_and_keeps_entries() {
        let ht = HashTable::new(3, MemBudget::new(0));
        // SHARD_SIZES starts at 193, so force growth with a tiny threshold.
        for i in 0..30u32 {
            let key = format!("key{i}").into_bytes();
            ht.with_bucket(&key, |b| {
                b.set(&Item::new(key.clone(), b"v".to_vec(), 0), 0, true, false, true)
            });
        }
        assert!(ht.resize_if_needed(1));
        assert!(ht.num_shards() > 3);
        for i in 0..30u32 {
            let key = format!("key{i}").into_bytes();
            ht.with_bucket(&key, |b| {
                assert!(b.find(&key, false, false).is_some());
            });
        }
    }

    #[test]
    fn test_deactivated_table_rejects_sets() {
        let ht = table();
        ht.deactivate();
        let (mt, _) = ht.with_bucket(b"a", |b| b.set(&item(b"a", b"v"), 0, true, false, true));
        assert_eq!(mt, MutationType::InvalidVbucket);
    }

    #[test]
    fn test_visit_sees_all_entries() {
        let ht = table();
        for i in 0..10u32 {
            let key = format!("k{i}").into_bytes();
            ht.with_bucket(&key, |b| {
                b.set(&Item::new(key.clone(), b"v".to_vec(), 0), 0, true, false, true)
            });
        }
        struct Counter(usize);
        impl HashTableVisitor for Counter {
            fn visit(&mut self, _sv: &mut StoredValue) {
                self.0 += 1;
            }
        }
        let mut c = Counter(0);
        ht.visit(&mut c);
        assert_eq!(c.0, 10);
    }
}
