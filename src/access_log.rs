//! Access scanner: periodically writes a log of recently touched items.
//!
//! Each run emits a `new(vb, key, row_id)` record for every resident,
//! referenced, non-expired, non-deleted stored value into `<path>.next`,
//! two-phase-commits it, then rotates atomically: the previous log becomes
//! `<path>.old` and the new one takes `<path>`. Any rename failure removes
//! the partial `.next` and leaves the previous generation intact. An empty
//! scan result is discarded without rotation.

use std::sync::{Arc, Weak};

use crate::dispatcher::{Callback, Dispatcher, TaskHandle};
use crate::hashtable::StoredValue;
use crate::item::current_time;
use crate::mutation_log::{MutationLog, RecordType};
use crate::store::EmberStore;
use crate::vbucket::{VBucket, VBucketVisitor};

pub(crate) struct ItemAccessVisitor {
    log: Option<MutationLog>,
    name: String,
    prev: String,
    next: String,
    start_time: u32,
    current_vbucket: u16,
}

impl ItemAccessVisitor {
    pub(crate) fn new(path: &str, block_size: usize) -> Self {
        let next = format!("{path}.next");
        let log = match MutationLog::open(next.as_str(), block_size) {
            Ok(log) => Some(log),
            Err(e) => {
                tracing::error!(path = %next, error = %e, "failed to open access log");
                None
            }
        };
        Self {
            log,
            name: path.to_string(),
            prev: format!("{path}.old"),
            next,
            start_time: current_time(),
            current_vbucket: 0,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.log.is_some()
    }

    fn rotate(&mut self) {
        let Some(log) = self.log.take() else {
            return;
        };
        let num_items = log.items_logged(RecordType::New);
        log.commit1();
        log.commit2();
        drop(log);

        if num_items == 0 {
            tracing::info!("new access log is empty, discarding it");
            let _ = std::fs::remove_file(&self.next);
            return;
        }

        let prev_exists = std::path::Path::new(&self.prev).exists();
        let name_exists = std::path::Path::new(&self.name).exists();
        if prev_exists {
            if let Err(e) = std::fs::remove_file(&self.prev) {
                tracing::warn!(path = %self.prev, error = %e, "failed to remove old access log");
                let _ = std::fs::remove_file(&self.next);
                return;
            }
        }
        if name_exists {
            if let Err(e) = std::fs::rename(&self.name, &self.prev) {
                tracing::warn!(from = %self.name, to = %self.prev, error = %e,
                               "failed to rotate access log");
                let _ = std::fs::remove_file(&self.next);
                return;
            }
        }
        if let Err(e) = std::fs::rename(&self.next, &self.name) {
            tracing::warn!(from = %self.next, to = %self.name, error = %e,
                           "failed to install new access log");
            let _ = std::fs::remove_file(&self.next);
        } else {
            tracing::info!(items = num_items, path = %self.name, "access log rotated");
        }
    }
}

impl VBucketVisitor for ItemAccessVisitor {
    fn visit_bucket(&mut self, vb: &Arc<VBucket>) -> bool {
        if self.log.is_none() {
            return false;
        }
        self.current_vbucket = vb.id();
        true
    }

    fn visit(&mut self, sv: &mut StoredValue) {
        let Some(log) = &self.log else {
            return;
        };
        if !sv.referenced || !sv.is_resident() {
            return;
        }
        if sv.deleted || sv.is_expired(self.start_time) {
            tracing::debug!(
                key = %String::from_utf8_lossy(&sv.key),
                "skipping expired/deleted item in access scan"
            );
            return;
        }
        log.new_item(self.current_vbucket, &sv.key, sv.row_id);
    }

    fn complete(&mut self) {
        self.rotate();
    }
}

/// Periodic task generating the access log.
pub(crate) struct AccessScanner {
    pub store: Weak<EmberStore>,
    pub sleep_time: f64,
}

impl Callback for AccessScanner {
    fn callback(&mut self, _d: &Dispatcher, t: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        store.run_access_scan();
        t.snooze(self.sleep_time);
        true
    }

    fn description(&self) -> String {
        "Generating access log".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation_log::{LogRecord, MutationLogReader};
    use crate::tmpfs::TempDir;

    fn visited_value(key: &[u8], referenced: bool, deleted: bool) -> StoredValue {
        StoredValue {
            key: key.to_vec(),
            value: Some(b"v".to_vec()),
            flags: 0,
            exptime: 0,
            cas: 1,
            seqno: 1,
            row_id: 42,
            dirtied_at: 0,
            queued_at: 0,
            locked_until: 0,
            dirty: false,
            deleted,
            temp: false,
            nonexistent: false,
            pending_id: false,
            referenced,
        }
    }

    #[test]
    fn test_scan_writes_and_rotates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        let path_str = path.to_str().unwrap();

        let mut visitor = ItemAccessVisitor::new(path_str, 512);
        assert!(visitor.is_open());
        visitor.current_vbucket = 3;
        let mut sv = visited_value(b"hot", true, false);
        visitor.visit(&mut sv);
        let mut cold = visited_value(b"cold", false, false);
        visitor.visit(&mut cold);
        let mut gone = visited_value(b"gone", true, true);
        visitor.visit(&mut gone);
        visitor.complete();

        assert!(path.exists());
        assert!(!std::path::Path::new(&format!("{path_str}.next")).exists());

        let records: Vec<_> = MutationLogReader::open(&path)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let news: Vec<_> = records
            .iter()
            .filter(|r| matches!(r, LogRecord::New { .. }))
            .collect();
        assert_eq!(news.len(), 1);
        assert_eq!(
            *news[0],
            LogRecord::New {
                vbucket: 3,
                key: b"hot".to_vec(),
                row_id: 42
            }
        );
    }

    #[test]
    fn test_empty_scan_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        let path_str = path.to_str().unwrap();

        let mut visitor = ItemAccessVisitor::new(path_str, 512);
        visitor.complete();

        assert!(!path.exists());
        assert!(!std::path::Path::new(&format!("{path_str}.next")).exists());
    }

    #[test]
    fn test_rotation_keeps_previous_generation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        let path_str = path.to_str().unwrap();

        for round in 0..2 {
            let mut visitor = ItemAccessVisitor::new(path_str, 512);
            visitor.current_vbucket = 0;
            let key = format!("key{round}");
            let mut sv = visited_value(key.as_bytes(), true, false);
            visitor.visit(&mut sv);
            visitor.complete();
        }

        assert!(path.exists());
        assert!(std::path::Path::new(&format!("{path_str}.old")).exists());

        // The current generation holds the second round's key.
        let records: Vec<_> = MutationLogReader::open(&path)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert!(records
            .iter()
            .any(|r| matches!(r, LogRecord::New { key, .. } if key == b"key1")));
    }
}
