//! RocksDB-backed canvas store.
//!
//! Column families:
//! - `snapshots` — compacted replica snapshots (bincode, LZ4 compressed)
//! - `oplog`     — framed operation batches, keyed by canvas + sequence
//! - `sessions`  — last session record per canvas
//! - `metadata`  — per-canvas sequence bookkeeping
//!
//! Oplog key layout: `<len:u8><canvas_id bytes><sequence:u64 BE>`, so one
//! canvas' records are contiguous and sorted by sequence.
//!
//! Write-ahead ordering: a snapshot and the metadata that moves
//! `snapshot_sequence` past the records it covers are committed in one
//! batch, and only afterwards are those records deleted. A crash in between
//! leaves stale records below `snapshot_sequence`, which `load` ignores.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::SystemTime;

use canvas_core::{CanvasId, Operation, ReplicaSnapshot};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::wal::LogRecord;
use crate::persist::SessionRecord;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_OPLOG: &str = "oplog";
const CF_SESSIONS: &str = "sessions";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_OPLOG, CF_SESSIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canvas_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, caller-owned directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-canvas bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasMetadata {
    pub canvas_id: CanvasId,
    /// Records below this sequence are covered by the snapshot
    pub snapshot_sequence: u64,
    /// Sequence the next appended record receives
    pub next_sequence: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl CanvasMetadata {
    fn new(canvas_id: CanvasId) -> Self {
        let now = now_secs();
        Self {
            canvas_id,
            snapshot_sequence: 0,
            next_sequence: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Log records not yet folded into the snapshot.
    pub fn pending_records(&self) -> u64 {
        self.next_sequence.saturating_sub(self.snapshot_sequence)
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(format!("metadata: {e}")))?;
        Ok(meta)
    }
}

/// Everything persisted for one canvas.
#[derive(Debug, Clone)]
pub struct LoadedCanvas {
    pub snapshot: ReplicaSnapshot,
    /// Operations logged after the snapshot, in append order
    pub operations: Vec<Operation>,
    pub session: Option<SessionRecord>,
    pub metadata: CanvasMetadata,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Stored bytes fail checksum, framing or decoding
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::Corrupt(e) => write!(f, "Corrupt store data: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

// ─── Leases ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Leases {
    held: Mutex<HashSet<CanvasId>>,
    released: Condvar,
}

/// Exclusive access to one canvas' keys. Released on drop.
pub struct CanvasLease<'a> {
    leases: &'a Leases,
    canvas: CanvasId,
}

impl Drop for CanvasLease<'_> {
    fn drop(&mut self) {
        crate::lock(&self.leases.held).remove(&self.canvas);
        self.leases.released.notify_all();
    }
}

// ─── Store ────────────────────────────────────────────────────────────

/// RocksDB-backed canvas store.
///
/// Shared by every session in a process. Access to one canvas is
/// serialized through a lease; different canvases proceed in parallel.
pub struct CanvasStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    leases: Leases,
}

impl CanvasStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened canvas store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            leases: Leases::default(),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS | CF_METADATA | CF_SESSIONS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPLOG => {
                // Records are LZ4-framed already
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Block until no one else holds `canvas`, then hold it.
    pub fn lease(&self, canvas: &CanvasId) -> CanvasLease<'_> {
        let mut held = crate::lock(&self.leases.held);
        while held.contains(canvas) {
            held = self
                .leases
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(canvas.clone());
        CanvasLease {
            leases: &self.leases,
            canvas: canvas.clone(),
        }
    }

    // ─── Operation log ────────────────────────────────────────────────

    /// Append one batch of operations. Returns the record's sequence.
    pub fn append(&self, canvas: &CanvasId, ops: &[Operation]) -> Result<u64, StoreError> {
        let _lease = self.lease(canvas);
        let cf_oplog = self.cf(CF_OPLOG)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .read_metadata(canvas)?
            .unwrap_or_else(|| CanvasMetadata::new(canvas.clone()));
        let sequence = meta.next_sequence;
        let record = LogRecord::new(sequence, canvas.clone(), ops)?;
        meta.next_sequence += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_oplog, oplog_key(canvas, sequence), record.encode()?);
        batch.put_cf(&cf_meta, canvas.as_str().as_bytes(), meta.encode()?);
        self.write(batch)?;

        log::debug!("Appended record {sequence} ({} ops) for {canvas}", ops.len());
        Ok(sequence)
    }

    /// Load a canvas' snapshot, log tail and session record.
    ///
    /// Returns `Ok(None)` when nothing was ever stored for `canvas`.
    pub fn load(&self, canvas: &CanvasId) -> Result<Option<LoadedCanvas>, StoreError> {
        let _lease = self.lease(canvas);
        let Some(metadata) = self.read_metadata(canvas)? else {
            return Ok(None);
        };

        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let snapshot = match self.db.get_cf(&cf_snap, canvas.as_str().as_bytes())? {
            Some(compressed) => decode_snapshot(&compressed)?,
            None => ReplicaSnapshot::default(),
        };

        let cf_oplog = self.cf(CF_OPLOG)?;
        let prefix = oplog_prefix(canvas);
        let start = oplog_key(canvas, metadata.snapshot_sequence);
        let mut operations = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf_oplog, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let sequence = sequence_from_key(&key, prefix.len())?;
            let record = LogRecord::decode(&value)?;
            if record.sequence != sequence || &record.canvas != canvas {
                return Err(StoreError::Corrupt(format!(
                    "record at {sequence} of {canvas} claims {} of {}",
                    record.sequence, record.canvas
                )));
            }
            operations.extend(record.operations()?);
        }

        let session = self.read_session(canvas)?;
        log::debug!(
            "Loaded {canvas}: {} snapshot ops, {} logged ops",
            snapshot.operations.len(),
            operations.len()
        );
        Ok(Some(LoadedCanvas {
            snapshot,
            operations,
            session,
            metadata,
        }))
    }

    /// Per-canvas bookkeeping, if the canvas was ever stored.
    pub fn metadata(&self, canvas: &CanvasId) -> Result<Option<CanvasMetadata>, StoreError> {
        let _lease = self.lease(canvas);
        self.read_metadata(canvas)
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Start a snapshot save. Holds the canvas lease until the transaction
    /// is committed or dropped.
    pub fn begin_save(&self, canvas: &CanvasId) -> SaveTxn<'_> {
        let lease = self.lease(canvas);
        SaveTxn {
            store: self,
            _lease: lease,
            canvas: canvas.clone(),
            batch: WriteBatch::default(),
            covered: None,
            metadata: None,
            committed: false,
        }
    }

    /// Replace the canvas snapshot and truncate every log record appended
    /// before it.
    pub fn save_snapshot(
        &self,
        canvas: &CanvasId,
        snapshot: &ReplicaSnapshot,
    ) -> Result<CanvasMetadata, StoreError> {
        let mut txn = self.begin_save(canvas);
        txn.put_snapshot(snapshot)?;
        txn.commit()
    }

    fn truncate_log(&self, canvas: &CanvasId, below: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let prefix = oplog_prefix(canvas);
        let mut batch = WriteBatch::default();
        let mut count = 0u64;

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) || sequence_from_key(&key, prefix.len())? >= below {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }
        if count > 0 {
            self.write(batch)?;
        }
        Ok(count)
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    pub fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let _lease = self.lease(&record.canvas_id);
        let cf = self.cf(CF_SESSIONS)?;
        let bytes = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, record.canvas_id.as_str().as_bytes(), bytes);
        self.write(batch)
    }

    pub fn load_session(&self, canvas: &CanvasId) -> Result<Option<SessionRecord>, StoreError> {
        let _lease = self.lease(canvas);
        self.read_session(canvas)
    }

    fn read_session(&self, canvas: &CanvasId) -> Result<Option<SessionRecord>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        match self.db.get_cf(&cf, canvas.as_str().as_bytes())? {
            Some(bytes) => {
                let (record, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::Corrupt(format!("session record: {e}")))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    // ─── Maintenance ──────────────────────────────────────────────────

    /// Remove everything stored for a canvas.
    pub fn discard(&self, canvas: &CanvasId) -> Result<(), StoreError> {
        let _lease = self.lease(canvas);
        let key = canvas.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_SNAPSHOTS)?, key);
        batch.delete_cf(&self.cf(CF_SESSIONS)?, key);
        batch.delete_cf(&self.cf(CF_METADATA)?, key);

        let cf_oplog = self.cf(CF_OPLOG)?;
        let prefix = oplog_prefix(canvas);
        let iter = self
            .db
            .iterator_cf(&cf_oplog, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(&cf_oplog, &key);
        }

        self.write(batch)?;
        log::warn!("Discarded stored state for {canvas}");
        Ok(())
    }

    /// Every canvas with stored metadata.
    pub fn list_canvases(&self) -> Result<Vec<CanvasId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut canvases = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let canvas = std::str::from_utf8(&key)
                .ok()
                .and_then(|s| CanvasId::parse(s).ok())
                .ok_or_else(|| StoreError::Corrupt("invalid canvas key in metadata".into()))?;
            canvases.push(canvas);
        }
        Ok(canvases)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn read_metadata(&self, canvas: &CanvasId) -> Result<Option<CanvasMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, canvas.as_str().as_bytes())? {
            Some(bytes) => CanvasMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

// ─── Save transaction ─────────────────────────────────────────────────

/// Staged snapshot write. Nothing reaches the database until
/// [`SaveTxn::commit`]; dropping the transaction discards the staged batch.
pub struct SaveTxn<'a> {
    store: &'a CanvasStore,
    _lease: CanvasLease<'a>,
    canvas: CanvasId,
    batch: WriteBatch,
    covered: Option<u64>,
    metadata: Option<CanvasMetadata>,
    committed: bool,
}

impl SaveTxn<'_> {
    /// Stage a snapshot covering every record appended so far.
    pub fn put_snapshot(&mut self, snapshot: &ReplicaSnapshot) -> Result<(), StoreError> {
        let raw = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let mut meta = self
            .store
            .read_metadata(&self.canvas)?
            .unwrap_or_else(|| CanvasMetadata::new(self.canvas.clone()));
        meta.snapshot_sequence = meta.next_sequence;
        meta.snapshot_size = raw.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let key = self.canvas.as_str().as_bytes();
        self.batch
            .put_cf(&self.store.cf(CF_SNAPSHOTS)?, key, &compressed);
        self.batch
            .put_cf(&self.store.cf(CF_METADATA)?, key, meta.encode()?);
        self.covered = Some(meta.snapshot_sequence);
        self.metadata = Some(meta);
        Ok(())
    }

    /// Atomically write the staged batch, then truncate covered records.
    pub fn commit(mut self) -> Result<CanvasMetadata, StoreError> {
        let (Some(covered), Some(meta)) = (self.covered, self.metadata.take()) else {
            return Err(StoreError::SerializationError(
                "commit without a staged snapshot".into(),
            ));
        };
        let batch = std::mem::take(&mut self.batch);
        self.store.write(batch)?;
        self.committed = true;

        // Snapshot is durable; stale records are ignored by load even if
        // this step fails.
        match self.store.truncate_log(&self.canvas, covered) {
            Ok(n) if n > 0 => log::debug!("Truncated {n} records of {}", self.canvas),
            Ok(_) => {}
            Err(e) => log::warn!("Log truncation for {} failed: {e}", self.canvas),
        }
        Ok(meta)
    }
}

impl Drop for SaveTxn<'_> {
    fn drop(&mut self) {
        if !self.committed {
            log::debug!("Rolled back uncommitted snapshot save for {}", self.canvas);
        }
    }
}

fn decode_snapshot(compressed: &[u8]) -> Result<ReplicaSnapshot, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| StoreError::Corrupt(format!("snapshot decompression: {e}")))?;
    let (snapshot, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Corrupt(format!("snapshot: {e}")))?;
    Ok(snapshot)
}

fn oplog_prefix(canvas: &CanvasId) -> Vec<u8> {
    let bytes = canvas.as_str().as_bytes();
    let mut prefix = Vec::with_capacity(1 + bytes.len());
    // Canvas ids are at most 128 bytes
    prefix.push(bytes.len() as u8);
    prefix.extend_from_slice(bytes);
    prefix
}

fn oplog_key(canvas: &CanvasId, sequence: u64) -> Vec<u8> {
    let mut key = oplog_prefix(canvas);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn sequence_from_key(key: &[u8], prefix_len: usize) -> Result<u64, StoreError> {
    let tail: [u8; 8] = key
        .get(prefix_len..)
        .and_then(|t| t.try_into().ok())
        .ok_or_else(|| StoreError::Corrupt("malformed oplog key".into()))?;
    Ok(u64::from_be_bytes(tail))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
