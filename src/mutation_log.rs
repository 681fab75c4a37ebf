//! Block-framed mutation log.
//!
//! An append-only record of which rows exist on disk, replayed at warmup so
//! the engine knows every (vbucket, key, row id) without scanning the
//! backing store. Records are framed into fixed-size blocks; each block
//! carries a CRC32 checksum and a record count, and partially written tail
//! blocks are discarded on read.
//!
//! # File format
//!
//! ```text
//! +--------------------------------------+
//! | Header: magic u32 | version u32      |
//! |         block_size u32 | reserved u32|
//! +--------------------------------------+
//! | Block 0 (block_size bytes)           |
//! +--------------------------------------+
//! | Block 1 ...                          |
//! +--------------------------------------+
//! ```
//!
//! ## Block format
//!
//! ```text
//! +---------+----------+-------------------+---------+
//! | crc u32 | count u16| records           | zero pad|
//! +---------+----------+-------------------+---------+
//! ```
//!
//! ## Record format
//!
//! ```text
//! +---------+--------+------------+--------+--------------------+
//! | type u8 | vb u16 | key_len u16| key    | row_id i64 (New)   |
//! +---------+--------+------------+--------+--------------------+
//! ```
//!
//! All integers are big-endian. A `Commit1` record seals a batch; `Commit2`
//! confirms the downstream store committed it. A batch is durable only when
//! closed by both.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const LOG_MAGIC: u32 = 0x454d_4c47;
const LOG_VERSION: u32 = 1;
const HEADER_SIZE: usize = 16;
const BLOCK_HEADER_SIZE: usize = 6;

/// When the log file is synced to disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    Off,
    Commit1,
    Commit2,
    Full,
}

impl SyncMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(SyncMode::Off),
            "commit1" => Ok(SyncMode::Commit1),
            "commit2" => Ok(SyncMode::Commit2),
            "full" => Ok(SyncMode::Full),
            other => Err(Error::InvalidInput(format!("unknown sync mode: {other}"))),
        }
    }

    fn sync_on_commit1(self) -> bool {
        matches!(self, SyncMode::Commit1 | SyncMode::Full)
    }

    fn sync_on_commit2(self) -> bool {
        matches!(self, SyncMode::Commit2 | SyncMode::Full)
    }
}

/// Record kinds, also used to index the per-kind counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordType {
    New = 0,
    Del = 1,
    DelAll = 2,
    Commit1 = 3,
    Commit2 = 4,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogRecord {
    New {
        vbucket: u16,
        key: Vec<u8>,
        row_id: i64,
    },
    Del {
        vbucket: u16,
        key: Vec<u8>,
    },
    DelAll {
        vbucket: u16,
    },
    Commit1,
    Commit2,
}

impl LogRecord {
    fn record_type(&self) -> RecordType {
        match self {
            LogRecord::New { .. } => RecordType::New,
            LogRecord::Del { .. } => RecordType::Del,
            LogRecord::DelAll { .. } => RecordType::DelAll,
            LogRecord::Commit1 => RecordType::Commit1,
            LogRecord::Commit2 => RecordType::Commit2,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            LogRecord::New {
                vbucket,
                key,
                row_id,
            } => {
                buf.write_u8(1).unwrap();
                buf.write_u16::<BigEndian>(*vbucket).unwrap();
                buf.write_u16::<BigEndian>(key.len() as u16).unwrap();
                buf.extend_from_slice(key);
                buf.write_i64::<BigEndian>(*row_id).unwrap();
            }
            LogRecord::Del { vbucket, key } => {
                buf.write_u8(2).unwrap();
                buf.write_u16::<BigEndian>(*vbucket).unwrap();
                buf.write_u16::<BigEndian>(key.len() as u16).unwrap();
                buf.extend_from_slice(key);
            }
            LogRecord::DelAll { vbucket } => {
                buf.write_u8(3).unwrap();
                buf.write_u16::<BigEndian>(*vbucket).unwrap();
                buf.write_u16::<BigEndian>(0).unwrap();
            }
            LogRecord::Commit1 => {
                buf.write_u8(4).unwrap();
                buf.write_u16::<BigEndian>(0).unwrap();
                buf.write_u16::<BigEndian>(0).unwrap();
            }
            LogRecord::Commit2 => {
                buf.write_u8(5).unwrap();
                buf.write_u16::<BigEndian>(0).unwrap();
                buf.write_u16::<BigEndian>(0).unwrap();
            }
        }
        buf
    }

    fn decode(cursor: &mut Cursor<&[u8]>) -> Result<LogRecord> {
        let tag = cursor.read_u8().map_err(Error::from)?;
        let vbucket = cursor.read_u16::<BigEndian>().map_err(Error::from)?;
        let key_len = cursor.read_u16::<BigEndian>().map_err(Error::from)? as usize;
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key).map_err(Error::from)?;
        match tag {
            1 => {
                let row_id = cursor.read_i64::<BigEndian>().map_err(Error::from)?;
                Ok(LogRecord::New {
                    vbucket,
                    key,
                    row_id,
                })
            }
            2 => Ok(LogRecord::Del { vbucket, key }),
            3 => Ok(LogRecord::DelAll { vbucket }),
            4 => Ok(LogRecord::Commit1),
            5 => Ok(LogRecord::Commit2),
            other => Err(Error::InvalidData(format!("unknown log record tag {other}"))),
        }
    }
}

struct LogInner {
    file: Option<File>,
    /// Payload of the block being assembled.
    block: Vec<u8>,
    records_in_block: u16,
    sync_mode: SyncMode,
}

/// The append side of the mutation log.
///
/// A write failure disables the log for the rest of the run; subsequent
/// records are dropped and counted rather than guessed at, and the engine
/// degrades to memory-only warmup.
pub struct MutationLog {
    path: PathBuf,
    block_size: usize,
    inner: Mutex<LogInner>,
    enabled: AtomicBool,
    disabled_drops: AtomicU64,
    items_logged: [AtomicU64; 5],
}

impl MutationLog {
    /// Opens (creating if needed) the log at `path`. An empty `path`
    /// produces a permanently disabled log.
    pub fn open(path: impl Into<PathBuf>, block_size: usize) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Ok(Self::disabled_log(path, block_size));
        }
        if !block_size.is_power_of_two() || block_size <= BLOCK_HEADER_SIZE {
            return Err(Error::InvalidInput(format!(
                "mutation log block size must be a power of two, got {block_size}"
            )));
        }

        let mut file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let block_size = if len == 0 {
            let mut header = Vec::with_capacity(HEADER_SIZE);
            header.write_u32::<BigEndian>(LOG_MAGIC)?;
            header.write_u32::<BigEndian>(LOG_VERSION)?;
            header.write_u32::<BigEndian>(block_size as u32)?;
            header.write_u32::<BigEndian>(0)?;
            file.write_all(&header)?;
            file.sync_all()?;
            block_size
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            let mut cursor = Cursor::new(&buf[..]);
            let magic = cursor.read_u32::<BigEndian>().map_err(Error::from)?;
            let version = cursor.read_u32::<BigEndian>().map_err(Error::from)?;
            if magic != LOG_MAGIC || version != LOG_VERSION {
                return Err(Error::InvalidData(format!(
                    "bad mutation log header in {}",
                    path.display()
                )));
            }
            cursor.read_u32::<BigEndian>().map_err(Error::from)? as usize
        };

        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            path,
            block_size,
            inner: Mutex::new(LogInner {
                file: Some(file),
                block: Vec::with_capacity(block_size),
                records_in_block: 0,
                sync_mode: SyncMode::Commit2,
            }),
            enabled: AtomicBool::new(true),
            disabled_drops: AtomicU64::new(0),
            items_logged: Default::default(),
        })
    }

    fn disabled_log(path: PathBuf, block_size: usize) -> Self {
        Self {
            path,
            block_size,
            inner: Mutex::new(LogInner {
                file: None,
                block: Vec::new(),
                records_in_block: 0,
                sync_mode: SyncMode::Off,
            }),
            enabled: AtomicBool::new(false),
            disabled_drops: AtomicU64::new(0),
            items_logged: Default::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Disables the log. Later records are dropped and counted.
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            tracing::warn!(path = %self.path.display(), "mutation log disabled; further records will be dropped");
        }
    }

    /// Records dropped while disabled; a health counter, surfaced in stats.
    pub fn disabled_drops(&self) -> u64 {
        self.disabled_drops.load(Ordering::Relaxed)
    }

    pub fn items_logged(&self, rt: RecordType) -> u64 {
        self.items_logged[rt as usize].load(Ordering::Relaxed)
    }

    pub fn set_sync_config(&self, mode: SyncMode) -> bool {
        self.inner.lock().unwrap().sync_mode = mode;
        true
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn log_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn new_item(&self, vbucket: u16, key: &[u8], row_id: i64) {
        self.append(LogRecord::New {
            vbucket,
            key: key.to_vec(),
            row_id,
        });
    }

    pub fn del_item(&self, vbucket: u16, key: &[u8]) {
        self.append(LogRecord::Del {
            vbucket,
            key: key.to_vec(),
        });
    }

    /// Invalidates every record for the vbucket; used on vbucket delete.
    pub fn delete_all(&self, vbucket: u16) {
        self.append(LogRecord::DelAll { vbucket });
    }

    /// Seals the current batch.
    pub fn commit1(&self) {
        self.append(LogRecord::Commit1);
        let mut inner = self.inner.lock().unwrap();
        let sync = inner.sync_mode.sync_on_commit1();
        if let Err(e) = self.flush_block(&mut inner, sync) {
            drop(inner);
            self.fail(e);
        }
    }

    /// Confirms durability of the downstream store for the sealed batch.
    pub fn commit2(&self) {
        self.append(LogRecord::Commit2);
        let mut inner = self.inner.lock().unwrap();
        let sync = inner.sync_mode.sync_on_commit2();
        if let Err(e) = self.flush_block(&mut inner, sync) {
            drop(inner);
            self.fail(e);
        }
    }

    fn append(&self, record: LogRecord) {
        if !self.is_enabled() {
            self.disabled_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let encoded = record.encode();
        if BLOCK_HEADER_SIZE + encoded.len() > self.block_size {
            tracing::warn!(
                len = encoded.len(),
                block_size = self.block_size,
                "mutation log record does not fit a block, dropped"
            );
            return;
        }
        let rt = record.record_type();
        let mut inner = self.inner.lock().unwrap();
        if BLOCK_HEADER_SIZE + inner.block.len() + encoded.len() > self.block_size {
            if let Err(e) = self.flush_block(&mut inner, false) {
                drop(inner);
                self.fail(e);
                return;
            }
        }
        inner.block.extend_from_slice(&encoded);
        inner.records_in_block += 1;
        self.items_logged[rt as usize].fetch_add(1, Ordering::Relaxed);
    }

    fn flush_block(&self, inner: &mut LogInner, sync: bool) -> Result<()> {
        if inner.records_in_block == 0 {
            if sync {
                if let Some(file) = &inner.file {
                    file.sync_all()?;
                }
            }
            return Ok(());
        }
        let Some(file) = inner.file.as_mut() else {
            return Ok(());
        };
        let mut block = Vec::with_capacity(self.block_size);
        block.write_u32::<BigEndian>(CRC32.checksum(&inner.block))?;
        block.write_u16::<BigEndian>(inner.records_in_block)?;
        block.extend_from_slice(&inner.block);
        block.resize(self.block_size, 0);
        file.write_all(&block)?;
        if sync {
            file.sync_all()?;
        }
        inner.block.clear();
        inner.records_in_block = 0;
        Ok(())
    }

    fn fail(&self, e: Error) {
        tracing::warn!(path = %self.path.display(), error = %e, "mutation log write failed");
        self.disable();
    }

    /// An independent reader over the committed blocks.
    pub fn reader(&self) -> Result<MutationLogReader> {
        MutationLogReader::open(&self.path)
    }

    /// Atomically replaces this log's file with a freshly written one (the
    /// compactor's rewrite), re-opening the writer on the new file.
    pub fn replace_with(&self, new_file: &Path, new_item_count: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.block.clear();
        inner.records_in_block = 0;
        inner.file = None;
        std::fs::rename(new_file, &self.path)?;

        let mut file = File::options().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        inner.file = Some(file);

        for counter in &self.items_logged {
            counter.store(0, Ordering::Relaxed);
        }
        self.items_logged[RecordType::New as usize].store(new_item_count, Ordering::Relaxed);
        tracing::info!(path = %self.path.display(), items = new_item_count, "mutation log compacted");
        Ok(())
    }

    /// Total records appended since open (or since the last compaction).
    pub fn records_appended(&self) -> u64 {
        self.items_logged.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

/// Iterates records block by block. Iteration ends at the first truncated
/// or checksum-invalid block, which is the expected crash tail.
pub struct MutationLogReader {
    reader: BufReader<File>,
    block_size: usize,
    pending: VecDeque<LogRecord>,
    done: bool,
}

impl MutationLogReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let mut cursor = Cursor::new(&header[..]);
        let magic = cursor.read_u32::<BigEndian>().map_err(Error::from)?;
        let version = cursor.read_u32::<BigEndian>().map_err(Error::from)?;
        if magic != LOG_MAGIC || version != LOG_VERSION {
            return Err(Error::InvalidData(format!(
                "bad mutation log header in {}",
                path.display()
            )));
        }
        let block_size = cursor.read_u32::<BigEndian>().map_err(Error::from)? as usize;
        Ok(Self {
            reader,
            block_size,
            pending: VecDeque::new(),
            done: false,
        })
    }

    fn refill(&mut self) -> Result<bool> {
        let mut block = vec![0u8; self.block_size];
        match self.reader.read_exact(&mut block) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        let mut cursor = Cursor::new(&block[..]);
        let stored_crc = cursor.read_u32::<BigEndian>().map_err(Error::from)?;
        let count = cursor.read_u16::<BigEndian>().map_err(Error::from)?;
        let payload = &block[BLOCK_HEADER_SIZE..];
        if CRC32.checksum(payload) != stored_crc {
            tracing::warn!("mutation log block checksum mismatch, stopping read");
            return Ok(false);
        }
        let mut cursor = Cursor::new(payload);
        for _ in 0..count {
            self.pending.push_back(LogRecord::decode(&mut cursor)?);
        }
        Ok(true)
    }
}

impl Iterator for MutationLogReader {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(rec) = self.pending.pop_front() {
                return Some(Ok(rec));
            }
            if self.done {
                return None;
            }
            match self.refill() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// An item the crash tail left without a committed batch. After warmup the
/// engine schedules a store-side delete for each.
#[derive(Clone, Debug, PartialEq)]
pub struct UncommittedItem {
    pub vbucket: u16,
    pub key: Vec<u8>,
    pub row_id: i64,
    pub is_new: bool,
}

type KeyState = HashMap<Vec<u8>, Option<i64>>;

/// Streams a mutation log and classifies its records into the committed
/// per-key state plus the uncommitted crash tail.
#[derive(Default)]
pub struct MutationLogHarvester {
    vbuckets: HashSet<u16>,
    filter_vbuckets: bool,
    committed: HashMap<u16, HashMap<Vec<u8>, i64>>,
    deleted: HashMap<u16, HashSet<Vec<u8>>>,
    loading: HashMap<u16, KeyState>,
    sealed: HashMap<u16, KeyState>,
    items_seen: u64,
}

impl MutationLogHarvester {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts harvesting to this vbucket (call once per known vbucket).
    pub fn set_vbucket(&mut self, vbucket: u16) {
        self.filter_vbuckets = true;
        self.vbuckets.insert(vbucket);
    }

    fn wants(&self, vbucket: u16) -> bool {
        !self.filter_vbuckets || self.vbuckets.contains(&vbucket)
    }

    /// Loads the log. Returns an error only on unreadable headers; a
    /// corrupt tail simply terminates the stream.
    pub fn load(&mut self, log: &MutationLog) -> Result<()> {
        let reader = log.reader()?;
        for record in reader {
            let record = record?;
            self.items_seen += 1;
            match record {
                LogRecord::New {
                    vbucket,
                    key,
                    row_id,
                } => {
                    if self.wants(vbucket) {
                        self.loading.entry(vbucket).or_default().insert(key, Some(row_id));
                    }
                }
                LogRecord::Del { vbucket, key } => {
                    if self.wants(vbucket) {
                        self.loading.entry(vbucket).or_default().insert(key, None);
                    }
                }
                LogRecord::DelAll { vbucket } => {
                    self.loading.remove(&vbucket);
                    self.sealed.remove(&vbucket);
                    self.committed.remove(&vbucket);
                    self.deleted.remove(&vbucket);
                }
                LogRecord::Commit1 => {
                    for (vb, keys) in self.loading.drain() {
                        let sealed = self.sealed.entry(vb).or_default();
                        for (key, state) in keys {
                            sealed.insert(key, state);
                        }
                    }
                }
                LogRecord::Commit2 => {
                    for (vb, keys) in self.sealed.drain() {
                        let committed = self.committed.entry(vb).or_default();
                        let deleted = self.deleted.entry(vb).or_default();
                        for (key, state) in keys {
                            match state {
                                Some(row_id) => {
                                    committed.insert(key.clone(), row_id);
                                    deleted.remove(&key);
                                }
                                None => {
                                    committed.remove(&key);
                                    deleted.insert(key);
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Records read from the log.
    pub fn items_seen(&self) -> u64 {
        self.items_seen
    }

    /// Committed live keys.
    pub fn total(&self) -> usize {
        self.committed.values().map(|m| m.len()).sum()
    }

    /// Applies every committed (vbucket, key, row id) to `f`.
    pub fn apply(&self, mut f: impl FnMut(u16, &[u8], i64)) {
        for (vb, keys) in &self.committed {
            for (key, row_id) in keys {
                f(*vb, key, *row_id);
            }
        }
    }

    /// True when the key's last committed record is a delete.
    pub fn is_deleted(&self, vbucket: u16, key: &[u8]) -> bool {
        self.deleted
            .get(&vbucket)
            .map(|s| s.contains(key))
            .unwrap_or(false)
    }

    /// Records in batches never closed by both commit phases.
    pub fn uncommitted(&self) -> Vec<UncommittedItem> {
        let mut out = Vec::new();
        for source in [&self.loading, &self.sealed] {
            for (vb, keys) in source {
                for (key, state) in keys {
                    out.push(UncommittedItem {
                        vbucket: *vb,
                        key: key.clone(),
                        row_id: state.unwrap_or(-1),
                        is_new: state.is_some(),
                    });
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;

    fn temp_log() -> (NamedTempFile, MutationLog) {
        let tmp = NamedTempFile::new().expect("temp file");
        let log = MutationLog::open(tmp.path().to_str().unwrap(), 512).expect("open log");
        (tmp, log)
    }

    #[test]
    fn test_round_trip_committed_batch() {
        let (_tmp, log) = temp_log();
        log.new_item(0, b"a", 1);
        log.new_item(0, b"b", 2);
        log.del_item(0, b"c");
        log.commit1();
        log.commit2();

        let records: Vec<_> = log.reader().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 5);
        assert_eq!(
            records[0],
            LogRecord::New {
                vbucket: 0,
                key: b"a".to_vec(),
                row_id: 1
            }
        );
        assert_eq!(records[3], LogRecord::Commit1);
        assert_eq!(records[4], LogRecord::Commit2);
    }

    #[test]
    fn test_commit1_before_commit2_ordering() {
        let (_tmp, log) = temp_log();
        for batch in 0..3i64 {
            log.new_item(0, format!("k{batch}").as_bytes(), batch + 1);
            log.commit1();
            log.commit2();
        }

        let mut pending_commit1 = false;
        for record in log.reader().unwrap() {
            match record.unwrap() {
                LogRecord::Commit1 => {
                    assert!(!pending_commit1);
                    pending_commit1 = true;
                }
                LogRecord::Commit2 => {
                    assert!(pending_commit1, "commit2 must follow commit1");
                    pending_commit1 = false;
                }
                _ => assert!(!pending_commit1, "no records between commit1 and commit2"),
            }
        }
        assert!(!pending_commit1);
    }

    #[test]
    fn test_blocks_span_many_records() {
        let (_tmp, log) = temp_log();
        // More payload than one 512-byte block holds.
        for i in 0..100i64 {
            log.new_item(1, format!("key-{i:04}").as_bytes(), i + 1);
        }
        log.commit1();
        log.commit2();

        let news = log
            .reader()
            .unwrap()
            .map(|r| r.unwrap())
            .filter(|r| matches!(r, LogRecord::New { .. }))
            .count();
        assert_eq!(news, 100);
        assert!(log.log_size() > 512);
    }

    #[test]
    fn test_corrupt_block_terminates_read() {
        use std::io::{Seek, SeekFrom, Write};
        let (tmp, log) = temp_log();
        log.new_item(0, b"a", 1);
        log.commit1();
        log.commit2();
        log.new_item(0, b"b", 2);
        log.commit1();
        log.commit2();

        // Smash the second block's payload.
        let mut file = tmp.reopen().unwrap();
        file.seek(SeekFrom::Start(16 + 512 + 10)).unwrap();
        file.write_all(b"garbage").unwrap();
        file.sync_all().unwrap();

        let records: Vec<_> = log.reader().unwrap().map(|r| r.unwrap()).collect();
        // Each commit phase seals its own block, so the first block holds
        // the new record plus commit1; everything after the smashed block
        // is unreadable.
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], LogRecord::Commit1);
    }

    #[test]
    fn test_disabled_log_counts_drops() {
        let (_tmp, log) = temp_log();
        log.disable();
        log.new_item(0, b"a", 1);
        log.del_item(0, b"b");
        assert_eq!(log.disabled_drops(), 2);
        assert_eq!(log.items_logged(RecordType::New), 0);
    }

    #[test]
    fn test_empty_path_is_disabled() {
        let log = MutationLog::open("", 512).unwrap();
        assert!(!log.is_enabled());
    }

    #[test]
    fn test_harvester_committed_and_deleted() {
        let (_tmp, log) = temp_log();
        log.new_item(0, b"a", 1);
        log.new_item(0, b"b", 2);
        log.commit1();
        log.commit2();
        log.del_item(0, b"a");
        log.new_item(1, b"c", 3);
        log.commit1();
        log.commit2();

        let mut h = MutationLogHarvester::new();
        h.set_vbucket(0);
        h.set_vbucket(1);
        h.load(&log).unwrap();

        assert_eq!(h.total(), 2);
        assert!(h.is_deleted(0, b"a"));

        let mut seen = Vec::new();
        h.apply(|vb, key, row_id| seen.push((vb, key.to_vec(), row_id)));
        seen.sort();
        assert_eq!(seen, vec![(0, b"b".to_vec(), 2), (1, b"c".to_vec(), 3)]);
        assert!(h.uncommitted().is_empty());
    }

    #[test]
    fn test_harvester_uncommitted_tail() {
        let (_tmp, log) = temp_log();
        log.new_item(0, b"a", 1);
        log.commit1();
        log.commit2();
        // Crash tail: sealed but never confirmed.
        log.new_item(0, b"d", 77);
        log.commit1();

        let mut h = MutationLogHarvester::new();
        h.load(&log).unwrap();

        assert_eq!(h.total(), 1);
        let uncommitted = h.uncommitted();
        assert_eq!(uncommitted.len(), 1);
        assert_eq!(uncommitted[0].key, b"d");
        assert_eq!(uncommitted[0].row_id, 77);
        assert!(uncommitted[0].is_new);
    }

    #[test]
    fn test_harvester_delete_all() {
        let (_tmp, log) = temp_log();
        log.new_item(0, b"a", 1);
        log.new_item(1, b"b", 2);
        log.commit1();
        log.commit2();
        log.delete_all(0);
        log.commit1();
        log.commit2();

        let mut h = MutationLogHarvester::new();
        h.load(&log).unwrap();
        assert_eq!(h.total(), 1);
        let mut seen = Vec::new();
        h.apply(|vb, _key, _row| seen.push(vb));
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn test_harvester_vbucket_filter() {
        let (_tmp, log) = temp_log();
        log.new_item(0, b"a", 1);
        log.new_item(7, b"b", 2);
        log.commit1();
        log.commit2();

        let mut h = MutationLogHarvester::new();
        h.set_vbucket(0);
        h.load(&log).unwrap();
        assert_eq!(h.total(), 1);
    }
}
