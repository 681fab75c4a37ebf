//! Per-vbucket checkpoint queues.
//!
//! A checkpoint is an append-only segment of a vbucket's mutation stream
//! with a monotonic id. Mutations land in the open checkpoint; once it
//! reaches its item or byte cap it is closed and a new one opens. Named
//! cursors (the persistence cursor plus any TAP cursors) advance through
//! closed checkpoints; the checkpoint remover drops closed checkpoints that
//! every cursor has passed.

use std::collections::{HashMap, VecDeque};

use crate::config::CheckpointConfig;
use crate::item::QueuedItem;

/// Name of the cursor the flusher drains through.
pub const PERSISTENCE_CURSOR: &str = "persistence";

#[derive(Debug)]
struct Checkpoint {
    id: u64,
    open: bool,
    items: Vec<QueuedItem>,
    /// Index of each key's slot in `items`, for in-checkpoint de-dup.
    key_index: HashMap<Vec<u8>, usize>,
    bytes: usize,
}

impl Checkpoint {
    fn new(id: u64) -> Self {
        Self {
            id,
            open: true,
            items: Vec::new(),
            key_index: HashMap::new(),
            bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    checkpoint_id: u64,
    offset: usize,
}

/// Ordered sequence of checkpoints with named cursors.
#[derive(Debug)]
pub struct CheckpointManager {
    vbucket: u16,
    config: CheckpointConfig,
    checkpoints: VecDeque<Checkpoint>,
    cursors: HashMap<String, Cursor>,
    /// Highest checkpoint id fully drained by the persistence cursor.
    persistence_pre_chk_id: u64,
}

impl CheckpointManager {
    /// `start_id` is 2 for active vbuckets and 0 otherwise, so a replica
    /// promoted to active opens fresh ids that sort after the initial ones.
    pub fn new(vbucket: u16, start_id: u64, config: CheckpointConfig) -> Self {
        let mut checkpoints = VecDeque::new();
        checkpoints.push_back(Checkpoint::new(start_id));
        let mut cursors = HashMap::new();
        cursors.insert(
            PERSISTENCE_CURSOR.to_string(),
            Cursor {
                checkpoint_id: start_id,
                offset: 0,
            },
        );
        Self {
            vbucket,
            config,
            checkpoints,
            cursors,
            persistence_pre_chk_id: 0,
        }
    }

    pub fn open_checkpoint_id(&self) -> u64 {
        self.checkpoints.back().map(|c| c.id).unwrap_or(0)
    }

    pub fn num_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    /// Appends a mutation to the open checkpoint. Returns true when this is
    /// new work for the flusher (the caller bumps the enqueue statistics
    /// only then); a repeated key still awaiting persistence replaces its
    /// earlier slot instead. A key whose earlier slot is already behind the
    /// persistence cursor counts as new work again.
    pub fn queue_dirty(&mut self, item: QueuedItem) -> bool {
        self.maybe_close_open_checkpoint();
        let cursor = self.cursors.get(PERSISTENCE_CURSOR).copied();
        let open = self.checkpoints.back_mut().expect("open checkpoint");
        debug_assert!(open.open);
        let cursor_offset = match cursor {
            Some(c) if c.checkpoint_id == open.id => c.offset,
            _ => 0,
        };
        match open.key_index.get(&item.key).copied() {
            Some(idx) if idx >= cursor_offset => {
                open.bytes = open.bytes - open.items[idx].size() + item.size();
                open.items[idx] = item;
                false
            }
            _ => {
                open.bytes += item.size();
                open.key_index.insert(item.key.clone(), open.items.len());
                open.items.push(item);
                true
            }
        }
    }

    fn maybe_close_open_checkpoint(&mut self) {
        let open = self.checkpoints.back().expect("open checkpoint");
        if open.items.len() >= self.config.max_items || open.bytes >= self.config.max_bytes {
            let next_id = open.id + 1;
            self.checkpoints.back_mut().unwrap().open = false;
            self.checkpoints.push_back(Checkpoint::new(next_id));
            tracing::debug!(
                vbucket = self.vbucket,
                checkpoint = next_id,
                "opened new checkpoint"
            );
        }
    }

    /// Drains everything reachable by the persistence cursor, including the
    /// open checkpoint, and advances the cursor to the end of the open
    /// checkpoint. Items are copied, not removed, so other cursors still
    /// see them; only the checkpoint remover frees storage. Returns the
    /// number of items appended to `out`.
    pub fn get_all_items_for_persistence(&mut self, out: &mut Vec<QueuedItem>) -> usize {
        let cursor = *self
            .cursors
            .get(PERSISTENCE_CURSOR)
            .expect("persistence cursor");
        let mut drained = 0;
        for ckpt in self.checkpoints.iter() {
            if ckpt.id < cursor.checkpoint_id {
                continue;
            }
            let start = if ckpt.id == cursor.checkpoint_id {
                cursor.offset
            } else {
                0
            };
            for item in &ckpt.items[start.min(ckpt.items.len())..] {
                out.push(item.clone());
                drained += 1;
            }
        }
        let open_id = self.open_checkpoint_id();
        let open_len = self.checkpoints.back().map(|c| c.items.len()).unwrap_or(0);
        self.cursors.insert(
            PERSISTENCE_CURSOR.to_string(),
            Cursor {
                checkpoint_id: open_id,
                offset: open_len,
            },
        );
        self.persistence_pre_chk_id = self
            .persistence_pre_chk_id
            .max(open_id.saturating_sub(1));
        drained
    }

    /// Highest checkpoint id fully past the persistence cursor.
    pub fn persistence_cursor_pre_chk_id(&self) -> u64 {
        self.persistence_pre_chk_id
    }

    pub fn has_items_for_persistence(&self) -> bool {
        self.num_items_for_persistence() > 0
    }

    /// Items at or past the persistence cursor.
    pub fn num_items_for_persistence(&self) -> usize {
        let Some(cursor) = self.cursors.get(PERSISTENCE_CURSOR) else {
            return 0;
        };
        let mut count = 0;
        for ckpt in self.checkpoints.iter() {
            if ckpt.id < cursor.checkpoint_id {
                continue;
            }
            let start = if ckpt.id == cursor.checkpoint_id {
                cursor.offset
            } else {
                0
            };
            count += ckpt.items.len().saturating_sub(start);
        }
        count
    }

    /// Registers a named TAP cursor at the current open checkpoint.
    pub fn register_tap_cursor(&mut self, name: impl Into<String>) {
        let id = self.open_checkpoint_id();
        self.cursors.insert(
            name.into(),
            Cursor {
                checkpoint_id: id,
                offset: 0,
            },
        );
    }

    pub fn remove_tap_cursor(&mut self, name: &str) {
        if name != PERSISTENCE_CURSOR {
            self.cursors.remove(name);
        }
    }

    /// TAP cursor names, preserved across vbucket resets.
    pub fn tap_cursor_names(&self) -> Vec<String> {
        self.cursors
            .keys()
            .filter(|k| k.as_str() != PERSISTENCE_CURSOR)
            .cloned()
            .collect()
    }

    /// Drops closed checkpoints that every cursor has passed. Returns the
    /// number of queued items released.
    pub fn remove_closed_unref_checkpoints(&mut self) -> usize {
        let min_cursor_id = self
            .cursors
            .values()
            .map(|c| c.checkpoint_id)
            .min()
            .unwrap_or(0);
        let mut removed = 0;
        while let Some(front) = self.checkpoints.front() {
            if front.open || front.id >= min_cursor_id {
                break;
            }
            let ckpt = self.checkpoints.pop_front().unwrap();
            removed += ckpt.items.len();
            tracing::debug!(
                vbucket = self.vbucket,
                checkpoint = ckpt.id,
                items = ckpt.items.len(),
                "removed closed checkpoint"
            );
        }
        removed
    }

    /// Resets the manager to one empty open checkpoint, keeping the id
    /// sequence moving forward. TAP cursors in `tap_cursors` are re-created
    /// at the new open checkpoint.
    pub fn clear(&mut self, tap_cursors: &[String]) {
        let next_id = self.open_checkpoint_id().max(1) + 1;
        self.checkpoints.clear();
        self.checkpoints.push_back(Checkpoint::new(next_id));
        self.cursors.clear();
        self.cursors.insert(
            PERSISTENCE_CURSOR.to_string(),
            Cursor {
                checkpoint_id: next_id,
                offset: 0,
            },
        );
        for name in tap_cursors {
            self.register_tap_cursor(name.clone());
        }
        self.persistence_pre_chk_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Operation;

    fn qitem(key: &[u8]) -> QueuedItem {
        QueuedItem::new(key.to_vec(), 0, Operation::Set, -1, 1)
    }

    fn manager(max_items: usize) -> CheckpointManager {
        CheckpointManager::new(0, 2, CheckpointConfig::default().max_items(max_items))
    }

    #[test]
    fn test_active_vbucket_starts_at_two() {
        let cm = manager(10);
        assert_eq!(cm.open_checkpoint_id(), 2);
    }

    #[test]
    fn test_queue_dirty_dedups_within_open_checkpoint() {
        let mut cm = manager(10);
        assert!(cm.queue_dirty(qitem(b"a")));
        assert!(!cm.queue_dirty(qitem(b"a")));
        assert!(cm.queue_dirty(qitem(b"b")));
    }

    #[test]
    fn test_single_item_is_drained_from_open_checkpoint() {
        let mut cm = manager(10);
        cm.queue_dirty(qitem(b"a"));
        assert!(cm.has_items_for_persistence());

        let mut out = Vec::new();
        assert_eq!(cm.get_all_items_for_persistence(&mut out), 1);
        assert_eq!(out[0].key, b"a");
        assert!(!cm.has_items_for_persistence());

        // The same key after the cursor passed counts as new work.
        assert!(cm.queue_dirty(qitem(b"a")));
        let mut out = Vec::new();
        assert_eq!(cm.get_all_items_for_persistence(&mut out), 1);
    }

    #[test]
    fn test_checkpoint_closes_at_cap_and_drains() {
        let mut cm = manager(2);
        cm.queue_dirty(qitem(b"a"));
        cm.queue_dirty(qitem(b"b"));
        // Cap reached; the next enqueue opens checkpoint 3.
        cm.queue_dirty(qitem(b"c"));
        assert_eq!(cm.open_checkpoint_id(), 3);
        assert_eq!(cm.num_items_for_persistence(), 3);

        let mut out = Vec::new();
        assert_eq!(cm.get_all_items_for_persistence(&mut out), 3);
        assert_eq!(out[0].key, b"a");
        assert_eq!(out[1].key, b"b");
        assert_eq!(out[2].key, b"c");
        assert_eq!(cm.persistence_cursor_pre_chk_id(), 2);
        assert!(!cm.has_items_for_persistence());
    }

    #[test]
    fn test_remove_closed_unref_checkpoints() {
        let mut cm = manager(1);
        cm.queue_dirty(qitem(b"a"));
        cm.queue_dirty(qitem(b"b"));
        cm.queue_dirty(qitem(b"c"));
        assert_eq!(cm.num_checkpoints(), 3);

        // Nothing removable while the persistence cursor is behind.
        assert_eq!(cm.remove_closed_unref_checkpoints(), 0);

        let mut out = Vec::new();
        cm.get_all_items_for_persistence(&mut out);
        assert_eq!(cm.remove_closed_unref_checkpoints(), 2);
        assert_eq!(cm.num_checkpoints(), 1);
    }

    #[test]
    fn test_tap_cursor_holds_checkpoints() {
        let mut cm = manager(1);
        cm.register_tap_cursor("tap:client");
        cm.queue_dirty(qitem(b"a"));
        cm.queue_dirty(qitem(b"b"));

        let mut out = Vec::new();
        cm.get_all_items_for_persistence(&mut out);
        // The TAP cursor still points at checkpoint 2.
        assert_eq!(cm.remove_closed_unref_checkpoints(), 0);

        cm.remove_tap_cursor("tap:client");
        assert!(cm.remove_closed_unref_checkpoints() > 0);
    }

    #[test]
    fn test_clear_preserves_tap_cursor_names() {
        let mut cm = manager(10);
        cm.register_tap_cursor("tap:a");
        cm.queue_dirty(qitem(b"x"));
        let names = cm.tap_cursor_names();
        cm.clear(&names);

        assert_eq!(cm.tap_cursor_names(), vec!["tap:a".to_string()]);
        assert!(!cm.has_items_for_persistence());
        let mut out = Vec::new();
        assert_eq!(cm.get_all_items_for_persistence(&mut out), 0);
    }
}
