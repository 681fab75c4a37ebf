use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// An opaque per-request token owned by the protocol front-end. The engine
/// never interprets it; it only hands it back through
/// [`EngineCallback::notify_io_complete`](crate::store::EngineCallback).
pub type Cookie = u64;

/// Wall clock in whole seconds since the epoch. All expiry and age
/// bookkeeping in the engine runs on this clock.
pub fn current_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

static CAS_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Produces a fresh, process-unique cas value.
pub fn next_cas() -> u64 {
    let base = (current_time() as u64) << 32;
    base | (CAS_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xffff_ffff)
}

/// Row id value for an item that has never been inserted on disk. The next
/// persistence of such an item is an insert, after which the assigned row id
/// is stamped back into the stored value.
pub const UNPERSISTED_ROW_ID: i64 = -1;

/// Replicated item metadata, carried by the *_with_meta operations.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemMeta {
    pub cas: u64,
    pub seqno: u64,
    pub flags: u32,
    pub exptime: u32,
}

/// A wire-level item record.
///
/// `value: None` means the record carries metadata only, which is how
/// tombstones and partial (metadata) fetches travel.
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub flags: u32,
    /// Expiry in seconds since the epoch; 0 means never.
    pub exptime: u32,
    pub cas: u64,
    pub seqno: u64,
    pub row_id: i64,
    pub vbucket: u16,
}

impl Item {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, vbucket: u16) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            flags: 0,
            exptime: 0,
            cas: 0,
            seqno: 1,
            row_id: UNPERSISTED_ROW_ID,
            vbucket,
        }
    }

    /// A metadata-only item, as produced by warmup and partial fetches.
    pub fn meta_only(key: impl Into<Vec<u8>>, vbucket: u16, row_id: i64) -> Self {
        Self {
            key: key.into(),
            value: None,
            flags: 0,
            exptime: 0,
            cas: 0,
            seqno: 0,
            row_id,
            vbucket,
        }
    }

    pub fn exptime(mut self, exptime: u32) -> Self {
        self.exptime = exptime;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, |v| v.len())
    }
}

/// Queue operation carried by a [`QueuedItem`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Set,
    Del,
    /// Disk flush-all marker; the flusher resets the underlying store.
    Flush,
    Commit,
    Empty,
}

/// A mutation queued for persistence. Queued items reference stored values
/// by key only; the flusher re-reads the live state under the hash bucket
/// lock when the item is drained.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedItem {
    pub key: Vec<u8>,
    pub vbucket: u16,
    pub op: Operation,
    pub row_id: i64,
    pub seqno: u64,
    pub queued_at: u32,
}

impl QueuedItem {
    pub fn new(key: Vec<u8>, vbucket: u16, op: Operation, row_id: i64, seqno: u64) -> Self {
        Self {
            key,
            vbucket,
            op,
            row_id,
            seqno,
            queued_at: current_time(),
        }
    }

    /// Approximate memory footprint, used for queue statistics.
    pub fn size(&self) -> usize {
        std::mem::size_of::<QueuedItem>() + self.key.len()
    }
}
