//! # Config — engine-wide immutable configuration
//!
//! Every tunable that the storage engine and its subsystems need is
//! collapsed into a single [`EngineConfig`] value. It is built once
//! (typically at `Engine::open`) and passed by reference from then on —
//! nothing re-reads a loose parameter or environment variable per
//! operation.
//!
//! Directory layout under `data_dir` follows a fixed scheme so every
//! component can derive its own path from the shared config:
//!
//! ```text
//! <data_dir>/
//!   database.amdb                          engine metadata
//!   wal/wal_<ts>.wal                       rotating WAL files
//!   versions/versions.ver                  version snapshot
//!   merkle/merkle_tree.mpt                 MPT snapshot
//!   bplus/tree.meta + node_<id>.bpt        B+-tree pages
//!   shard_<hi>/shard_<lo>/sstable_<ts>_<n>.sst
//! ```

use std::path::{Path, PathBuf};

/// Durability mode for the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// `fsync` after every WAL append. No data-loss window, slower writes.
    Strict,
    /// Batched `fsync`; a crash can lose the most recent un-synced appends.
    Relaxed,
}

/// Default number of independent LSM shards.
pub const DEFAULT_SHARD_COUNT: usize = 8;
/// Default memtable byte budget before a shard rotates to an immutable memtable.
pub const DEFAULT_MEMTABLE_BYTES: usize = 10 * 1024 * 1024;
/// Default number of L0 SSTables per shard that triggers compaction.
pub const DEFAULT_L0_COMPACTION_TRIGGER: usize = 4;
/// Default B+-tree order (max children per internal node).
pub const DEFAULT_BPLUS_ORDER: usize = 64;
/// Default number of B+-tree nodes kept resident in the LRU cache.
pub const DEFAULT_BPLUS_CACHE_CAPACITY: usize = 256;
/// Default size of the flush worker pool (shared across all shards).
pub const DEFAULT_FLUSH_WORKERS: usize = 2;
/// Default size of the compaction worker pool (shared across all shards).
pub const DEFAULT_COMPACTION_WORKERS: usize = 1;
/// Default bound on the per-shard immutable-memtable queue.
pub const DEFAULT_IMMUTABLE_QUEUE_CAPACITY: usize = 4;
/// Default number of versions between full `prev_hash` recomputation in a
/// batch append (0 disables the skip optimization: every version links to
/// the immediately preceding one).
pub const DEFAULT_VERSION_PREV_HASH_SKIP: usize = 0;
/// Default number of items per `batch_put` sub-batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Immutable engine configuration, constructed once per open database.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    data_dir: PathBuf,
    shard_count: usize,
    memtable_bytes: usize,
    l0_compaction_trigger: usize,
    sync_mode: SyncMode,
    version_prev_hash_skip: usize,
    bplus_order: usize,
    bplus_cache_capacity: usize,
    flush_workers: usize,
    compaction_workers: usize,
    immutable_queue_capacity: usize,
    batch_size: usize,
}

impl EngineConfig {
    /// Starts a configuration rooted at `data_dir` with every other value
    /// set to its documented default.
    #[must_use]
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            shard_count: DEFAULT_SHARD_COUNT,
            memtable_bytes: DEFAULT_MEMTABLE_BYTES,
            l0_compaction_trigger: DEFAULT_L0_COMPACTION_TRIGGER,
            sync_mode: SyncMode::Strict,
            version_prev_hash_skip: DEFAULT_VERSION_PREV_HASH_SKIP,
            bplus_order: DEFAULT_BPLUS_ORDER,
            bplus_cache_capacity: DEFAULT_BPLUS_CACHE_CAPACITY,
            flush_workers: DEFAULT_FLUSH_WORKERS,
            compaction_workers: DEFAULT_COMPACTION_WORKERS,
            immutable_queue_capacity: DEFAULT_IMMUTABLE_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Sets the number of independent LSM shards. Clamped to at least 1.
    #[must_use]
    pub fn with_shard_count(mut self, n: usize) -> Self {
        self.shard_count = n.max(1);
        self
    }

    /// Sets the per-shard memtable byte budget before rotation.
    #[must_use]
    pub fn with_memtable_bytes(mut self, n: usize) -> Self {
        self.memtable_bytes = n.max(1);
        self
    }

    /// Sets the L0 SSTable count that triggers compaction. `0` disables
    /// automatic compaction for every shard.
    #[must_use]
    pub fn with_l0_compaction_trigger(mut self, n: usize) -> Self {
        self.l0_compaction_trigger = n;
        self
    }

    /// Selects the WAL durability mode.
    #[must_use]
    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Sets how many versions may elapse between full `prev_hash`
    /// recomputation during a batch append. `0` disables the skip.
    #[must_use]
    pub fn with_version_prev_hash_skip(mut self, n: usize) -> Self {
        self.version_prev_hash_skip = n;
        self
    }

    /// Sets the B+-tree order (max children per internal node).
    #[must_use]
    pub fn with_bplus_order(mut self, n: usize) -> Self {
        self.bplus_order = n.max(3);
        self
    }

    /// Sets the number of B+-tree nodes kept in the LRU cache.
    #[must_use]
    pub fn with_bplus_cache_capacity(mut self, n: usize) -> Self {
        self.bplus_cache_capacity = n.max(1);
        self
    }

    /// Sets the flush worker pool size.
    #[must_use]
    pub fn with_flush_workers(mut self, n: usize) -> Self {
        self.flush_workers = n.max(1);
        self
    }

    /// Sets the compaction worker pool size.
    #[must_use]
    pub fn with_compaction_workers(mut self, n: usize) -> Self {
        self.compaction_workers = n.max(1);
        self
    }

    /// Sets the bound on each shard's immutable-memtable queue. A full
    /// queue blocks the next memtable rotation until a flush worker drains
    /// a slot.
    #[must_use]
    pub fn with_immutable_queue_capacity(mut self, n: usize) -> Self {
        self.immutable_queue_capacity = n.max(1);
        self
    }

    /// Sets the number of items per `batch_put` sub-batch.
    #[must_use]
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    /// Root directory for this database.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Number of independent LSM shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Per-shard memtable byte budget.
    #[must_use]
    pub fn memtable_bytes(&self) -> usize {
        self.memtable_bytes
    }

    /// L0 SSTable count that triggers compaction.
    #[must_use]
    pub fn l0_compaction_trigger(&self) -> usize {
        self.l0_compaction_trigger
    }

    /// WAL durability mode.
    #[must_use]
    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// Whether the WAL should fsync on every append.
    #[must_use]
    pub fn sync_wal(&self) -> bool {
        self.sync_mode == SyncMode::Strict
    }

    /// `prev_hash` recomputation skip threshold for batch version appends.
    #[must_use]
    pub fn version_prev_hash_skip(&self) -> usize {
        self.version_prev_hash_skip
    }

    /// B+-tree order.
    #[must_use]
    pub fn bplus_order(&self) -> usize {
        self.bplus_order
    }

    /// B+-tree LRU cache capacity, in nodes.
    #[must_use]
    pub fn bplus_cache_capacity(&self) -> usize {
        self.bplus_cache_capacity
    }

    /// Flush worker pool size.
    #[must_use]
    pub fn flush_workers(&self) -> usize {
        self.flush_workers
    }

    /// Compaction worker pool size.
    #[must_use]
    pub fn compaction_workers(&self) -> usize {
        self.compaction_workers
    }

    /// Bound on each shard's immutable-memtable queue.
    #[must_use]
    pub fn immutable_queue_capacity(&self) -> usize {
        self.immutable_queue_capacity
    }

    /// Number of items per `batch_put` sub-batch.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Path to the engine metadata file (`database.amdb`).
    #[must_use]
    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("database.amdb")
    }

    /// Directory holding rotating WAL files.
    #[must_use]
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    /// Path to the version manager's snapshot file.
    #[must_use]
    pub fn versions_path(&self) -> PathBuf {
        self.data_dir.join("versions").join("versions.ver")
    }

    /// Path to the Merkle Patricia Tree's snapshot file.
    #[must_use]
    pub fn merkle_path(&self) -> PathBuf {
        self.data_dir.join("merkle").join("merkle_tree.mpt")
    }

    /// Directory holding B+-tree node files and tree metadata.
    #[must_use]
    pub fn bplus_dir(&self) -> PathBuf {
        self.data_dir.join("bplus")
    }

    /// Two-level fan-out directory for a shard's SSTables and WAL-adjacent
    /// state: `shard_<hi>/shard_<lo>`.
    #[must_use]
    pub fn shard_dir(&self, shard_id: usize) -> PathBuf {
        let hi = shard_id / 16;
        let lo = shard_id % 16;
        self.data_dir
            .join(format!("shard_{:02}", hi))
            .join(format!("shard_{:02}", lo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let cfg = EngineConfig::new("/tmp/db");
        assert_eq!(cfg.shard_count(), DEFAULT_SHARD_COUNT);
        assert_eq!(cfg.memtable_bytes(), DEFAULT_MEMTABLE_BYTES);
        assert!(cfg.sync_wal());
    }

    #[test]
    fn builder_overrides_take_effect() {
        let cfg = EngineConfig::new("/tmp/db")
            .with_shard_count(4)
            .with_sync_mode(SyncMode::Relaxed)
            .with_bplus_order(8);
        assert_eq!(cfg.shard_count(), 4);
        assert!(!cfg.sync_wal());
        assert_eq!(cfg.bplus_order(), 8);
    }

    #[test]
    fn shard_count_is_clamped_to_one() {
        let cfg = EngineConfig::new("/tmp/db").with_shard_count(0);
        assert_eq!(cfg.shard_count(), 1);
    }

    #[test]
    fn derived_paths_are_rooted_at_data_dir() {
        let cfg = EngineConfig::new("/tmp/db");
        assert_eq!(cfg.metadata_path(), Path::new("/tmp/db/database.amdb"));
        assert_eq!(cfg.wal_dir(), Path::new("/tmp/db/wal"));
        assert_eq!(cfg.shard_dir(17), Path::new("/tmp/db/shard_01/shard_01"));
        assert_eq!(cfg.shard_dir(3), Path::new("/tmp/db/shard_00/shard_03"));
    }
}
