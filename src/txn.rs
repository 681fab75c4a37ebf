//! Flusher transaction bracketing.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::item::QueuedItem;
use crate::kvstore::KVStore;
use crate::mutation_log::MutationLog;
use crate::stats::EngineStats;

/// Brackets one flusher batch against the underlying store.
///
/// `enter` opens the store transaction if none is open; `commit` drives the
/// two-phase durability protocol: seal the mutation log batch, commit the
/// store (retrying forever with a one second backoff), then confirm the log
/// batch. Items added through `add_uncommitted_item` let warmup recovery
/// distinguish committed from uncommitted log records after a crash.
pub struct TransactionContext {
    store: Arc<dyn KVStore>,
    mutation_log: Arc<MutationLog>,
    stats: Arc<EngineStats>,
    intxn: bool,
    uncommitted: Vec<QueuedItem>,
    txn_start: Option<Instant>,
    last_txn_time_per_item_us: u64,
}

impl TransactionContext {
    pub fn new(
        store: Arc<dyn KVStore>,
        mutation_log: Arc<MutationLog>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            store,
            mutation_log,
            stats,
            intxn: false,
            uncommitted: Vec::new(),
            txn_start: None,
            last_txn_time_per_item_us: 0,
        }
    }

    /// Opens the underlying transaction if needed. Returns whether a
    /// transaction is open.
    pub fn enter(&mut self) -> bool {
        if !self.intxn {
            self.intxn = self.store.begin();
            self.txn_start = Some(Instant::now());
        }
        self.intxn
    }

    /// Commits the batch with two-phase durability against the mutation log.
    pub fn commit(&mut self) {
        if !self.intxn {
            return;
        }
        let start = Instant::now();
        self.mutation_log.commit1();
        while !self.store.commit() {
            tracing::warn!("flusher commit failed, retry in 1 sec");
            self.stats.commit_failed.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(Duration::from_secs(1));
        }
        self.mutation_log.commit2();
        self.stats.flusher_commits.fetch_add(1, Ordering::Relaxed);

        let commit_us = start.elapsed().as_micros() as u64;
        self.stats.disk_commit_histo.add(commit_us);
        self.stats.commit_time.store(commit_us, Ordering::Relaxed);
        if let Some(txn_start) = self.txn_start {
            let txn_us = txn_start.elapsed().as_micros() as u64;
            if !self.uncommitted.is_empty() {
                self.last_txn_time_per_item_us = txn_us / self.uncommitted.len() as u64;
            }
        }

        self.intxn = false;
        self.uncommitted.clear();
        self.txn_start = None;
    }

    /// Records a set whose store write succeeded inside the open batch.
    pub fn add_uncommitted_item(&mut self, item: QueuedItem) {
        self.uncommitted.push(item);
    }

    pub fn num_uncommitted(&self) -> usize {
        self.uncommitted.len()
    }

    pub fn last_txn_time_per_item_us(&self) -> u64 {
        self.last_txn_time_per_item_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Operation;
    use crate::kvstore::MemoryKVStore;
    use crate::mutation_log::{LogRecord, MutationLog};
    use crate::tmpfs::NamedTempFile;

    fn context(kv: Arc<MemoryKVStore>) -> (NamedTempFile, TransactionContext) {
        let tmp = NamedTempFile::new().unwrap();
        let log = Arc::new(MutationLog::open(tmp.path().to_str().unwrap(), 512).unwrap());
        let stats = EngineStats::new(0);
        (tmp, TransactionContext::new(kv, log, stats))
    }

    #[test]
    fn test_enter_is_idempotent() {
        let kv = Arc::new(MemoryKVStore::new());
        let (_tmp, mut tctx) = context(kv);
        assert!(tctx.enter());
        assert!(tctx.enter());
    }

    #[test]
    fn test_commit_retries_until_store_succeeds() {
        let kv = Arc::new(MemoryKVStore::new());
        kv.fail_next_commits(1);
        let (_tmp, mut tctx) = context(kv.clone());

        assert!(tctx.enter());
        kv.set(&crate::item::Item::new(b"a".to_vec(), b"v".to_vec(), 0));
        tctx.add_uncommitted_item(QueuedItem::new(b"a".to_vec(), 0, Operation::Set, -1, 1));
        tctx.commit();

        assert_eq!(tctx.stats.commit_failed.load(Ordering::Relaxed), 1);
        assert_eq!(tctx.stats.flusher_commits.load(Ordering::Relaxed), 1);
        assert_eq!(kv.num_rows(), 1);
        assert_eq!(tctx.num_uncommitted(), 0);
    }

    #[test]
    fn test_commit_writes_both_phases_to_log() {
        let kv = Arc::new(MemoryKVStore::new());
        let (_tmp, mut tctx) = context(kv);
        tctx.enter();
        tctx.mutation_log.new_item(0, b"a", 1);
        tctx.commit();

        let records: Vec<_> = tctx
            .mutation_log
            .reader()
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            records,
            vec![
                LogRecord::New {
                    vbucket: 0,
                    key: b"a".to_vec(),
                    row_id: 1
                },
                LogRecord::Commit1,
                LogRecord::Commit2,
            ]
        );
    }
}
