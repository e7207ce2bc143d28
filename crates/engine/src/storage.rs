//! Storage engine composition (C8).
//!
//! `Engine` is the public entry point: it owns a [`ShardedLsm`], a
//! [`VersionManager`], a [`MerkleTree`], and a [`BPlusTree`], and sequences
//! every write across them in the order `WAL ≥ LSM ≥ VersionMgr ≥ MPT`
//! (the WAL itself lives inside each shard's [`ShardLsm`](crate::ShardLsm)).
//!
//! Grounded in `original_source/src/amdb/storage/storage_engine.py`'s
//! `StorageEngine` (write/get/get_with_proof/verify/range_query/flush and
//! the B+-tree "synced" read-through flag), combined with the teacher's
//! crash-safety idiom for every new durable file this layer introduces.

use crate::shard::{ShardedLsm, ShardedStats};
use anyhow::{bail, Context, Result};
use bplus::BPlusTree;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use config::EngineConfig;
use crossbeam::channel::{bounded, Sender};
use merkle::MerkleTree;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{error, info, warn};
use versions::{Version, VersionManager, VersionManagerConfig};

/// Magic bytes at the start of the engine metadata file (`database.amdb`).
pub const AMDB_MAGIC: &[u8; 4] = b"AMDB";

/// Sentinel value recorded as a key's version when [`Engine::delete`] is
/// called. The per-shard LSM tombstones the key at the storage layer
/// (`get` through the LSM returns `None` immediately); this sentinel lets
/// the version manager and MPT keep the deletion itself as a first-class,
/// provable event in a key's history.
pub const TOMBSTONE: &[u8] = b"__DELETED__";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic in engine metadata file")]
    BadMagic,
    #[error("engine metadata checksum mismatch")]
    ChecksumMismatch,
    #[error(
        "recovered Merkle root {recovered:02x?} does not match snapshot root {snapshot:02x?}"
    )]
    RootMismatchOnOpen {
        recovered: [u8; 32],
        snapshot: [u8; 32],
    },
}

/// Aggregate counters surfaced by [`Engine::get_stats`].
#[derive(Debug, Clone)]
pub struct Stats {
    pub shard_count: usize,
    pub total_sstables: usize,
    pub total_memtable_entries: usize,
    pub key_count: usize,
    pub root_hash: [u8; 32],
    pub bplus_synced: bool,
}

/// Persistent engine-level metadata (`database.amdb`): created-at
/// timestamp, description, sharding flag, shard count, max file size,
/// last-known totals, root hash, trailing checksum.
#[derive(Debug, Clone)]
struct Metadata {
    created_at: f64,
    description: String,
    sharding_enabled: bool,
    shard_count: u32,
    max_file_size: u64,
    last_known_key_count: u64,
    root_hash: [u8; 32],
}

impl Metadata {
    fn write_to<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), EngineError> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("amdb.tmp");

        let mut buf = Vec::new();
        buf.write_all(AMDB_MAGIC)?;
        buf.write_u16::<LittleEndian>(1)?;
        buf.write_f64::<LittleEndian>(self.created_at)?;
        buf.write_u32::<LittleEndian>(self.description.len() as u32)?;
        buf.write_all(self.description.as_bytes())?;
        buf.write_u8(u8::from(self.sharding_enabled))?;
        buf.write_u32::<LittleEndian>(self.shard_count)?;
        buf.write_u64::<LittleEndian>(self.max_file_size)?;
        buf.write_u64::<LittleEndian>(self.last_known_key_count)?;
        buf.write_all(&self.root_hash)?;

        let checksum: [u8; 32] = Sha256::digest(&buf).into();
        buf.write_all(&checksum)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        {
            let mut f = std::fs::File::create(&tmp_path)?;
            f.write_all(&buf)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn read_from<P: AsRef<std::path::Path>>(path: P) -> Result<Option<Self>, EngineError> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < 32 {
            return Err(EngineError::ChecksumMismatch);
        }
        let (body, checksum) = bytes.split_at(bytes.len() - 32);
        let expected: [u8; 32] = Sha256::digest(body).into();
        if expected.as_slice() != checksum {
            return Err(EngineError::ChecksumMismatch);
        }

        let mut cur = Cursor::new(body);
        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic)?;
        if &magic != AMDB_MAGIC {
            return Err(EngineError::BadMagic);
        }
        let _format_version = cur.read_u16::<LittleEndian>()?;
        let created_at = cur.read_f64::<LittleEndian>()?;
        let dlen = cur.read_u32::<LittleEndian>()? as usize;
        let mut dbuf = vec![0u8; dlen];
        cur.read_exact(&mut dbuf)?;
        let description = String::from_utf8_lossy(&dbuf).into_owned();
        let sharding_enabled = cur.read_u8()? == 1;
        let shard_count = cur.read_u32::<LittleEndian>()?;
        let max_file_size = cur.read_u64::<LittleEndian>()?;
        let last_known_key_count = cur.read_u64::<LittleEndian>()?;
        let mut root_hash = [0u8; 32];
        cur.read_exact(&mut root_hash)?;

        Ok(Some(Self {
            created_at,
            description,
            sharding_enabled,
            shard_count,
            max_file_size,
            last_known_key_count,
            root_hash,
        }))
    }
}

enum MirrorMsg {
    Put(Vec<u8>, Vec<u8>),
    Shutdown,
}

/// The versioned, Merkle-authenticated composition over a sharded LSM.
///
/// Write sequencing per call: per-shard WAL append + memtable insert (inside
/// [`ShardedLsm`]), then version-manager append, then MPT update, then an
/// asynchronous B+-tree mirror — matching spec.md's "WAL ≥ LSM ≥ VersionMgr
/// ≥ MPT" ordering. A single top-level lock serializes this sequence across
/// callers so readers never observe a write applied to only some components.
pub struct Engine {
    config: EngineConfig,
    lsm: ShardedLsm,
    versions: VersionManager,
    merkle: MerkleTree,
    bplus: Arc<BPlusTree>,
    bplus_synced: std::sync::atomic::AtomicBool,
    lock: Mutex<()>,
    mirror_tx: Sender<MirrorMsg>,
    mirror_thread: Option<JoinHandle<()>>,
}

impl Engine {
    /// Opens (or creates) a database rooted at `config.data_dir()`.
    ///
    /// Recovery: loads the version snapshot, the MPT snapshot, and the
    /// B+-tree metadata, replays every shard's WAL on top of them (each
    /// shard's [`ShardLsm`](crate::ShardLsm) does this internally on
    /// construction), then validates the MPT root rebuilt from the version
    /// snapshot's key set against the persisted MPT root — a mismatch is a
    /// strict open-time error per spec.md §7.
    pub fn open(config: EngineConfig) -> Result<Self> {
        info!("Opening database at {}", config.data_dir().display());
        std::fs::create_dir_all(config.data_dir())?;

        let lsm = ShardedLsm::open(&config)?;

        let versions = VersionManager::new(VersionManagerConfig {
            skip_prev_hash_threshold: config.version_prev_hash_skip(),
        });
        if let Some(parent) = config.versions_path().parent() {
            versions
                .load_from_disk(parent)
                .context("loading version snapshot")?;
        }

        let merkle = MerkleTree::new();
        if let Some(parent) = config.merkle_path().parent() {
            merkle
                .load_from_disk(parent)
                .context("loading MPT snapshot")?;
        }

        // Cross-component invariant: the restored MPT root must match the
        // root recomputed from the version manager's latest-per-key view,
        // since both are driven by the same committed writes.
        if !versions.get_all_keys().is_empty() && !merkle.is_empty() {
            let recovered = recompute_root_from_versions(&versions, &merkle);
            let snapshot = merkle.get_root_hash();
            if recovered != snapshot {
                error!(
                    "Merkle root mismatch on open: recovered {:02x?}, snapshot {:02x?}",
                    recovered, snapshot
                );
                bail!(EngineError::RootMismatchOnOpen {
                    recovered,
                    snapshot,
                });
            }
        }

        std::fs::create_dir_all(config.bplus_dir())?;
        let bplus = Arc::new(
            BPlusTree::open(config.bplus_dir(), config.bplus_order(), config.bplus_cache_capacity())
                .context("opening B+-tree cache")?,
        );

        let (mirror_tx, mirror_rx) = bounded::<MirrorMsg>(config.immutable_queue_capacity().max(64));
        let mirror_thread = {
            let tree = Arc::clone(&bplus);
            std::thread::spawn(move || {
                for msg in mirror_rx {
                    match msg {
                        MirrorMsg::Put(k, v) => {
                            let _ = tree.insert(k, v);
                        }
                        MirrorMsg::Shutdown => break,
                    }
                }
                if let Err(e) = tree.flush() {
                    error!("Failed to flush B+-tree mirror on shutdown: {}", e);
                }
            })
        };

        Ok(Self {
            config,
            lsm,
            versions,
            merkle,
            bplus,
            bplus_synced: std::sync::atomic::AtomicBool::new(false),
            lock: Mutex::new(()),
            mirror_tx,
            mirror_thread: Some(mirror_thread),
        })
    }

    /// Writes `key`/`value`, advancing every component in sequence, and
    /// returns the new MPT root hash.
    pub fn put(&self, key: &[u8], value: Vec<u8>) -> Result<[u8; 32]> {
        let _guard = self.lock.lock();
        self.lsm.put(key, value.clone())?;
        self.versions.create_version(key, value.clone());
        let root = self.merkle.put(key.to_vec(), value.clone());
        self.mirror_put(key.to_vec(), value);
        Ok(root)
    }

    /// Writes every `(key, value)` pair, split into sub-batches of
    /// `config.batch_size()` so a single oversized call doesn't hold the
    /// engine lock for an unbounded stretch. Returns the MPT root hash after
    /// the last sub-batch.
    pub fn batch_put(&self, items: Vec<(Vec<u8>, Vec<u8>)>) -> Result<[u8; 32]> {
        let _guard = self.lock.lock();
        let mut root = self.merkle.get_root_hash();
        for chunk in items.chunks(self.config.batch_size()) {
            for (key, value) in chunk {
                self.lsm.put(key, value.clone())?;
            }
            self.versions.create_versions_batch(chunk.to_vec());
            root = self.merkle.put_many(chunk.iter().cloned());
            for (key, value) in chunk {
                self.mirror_put(key.clone(), value.clone());
            }
        }
        Ok(root)
    }

    /// Reads `key`. `version = None` reads the latest value (LSM fast path,
    /// falling back to the version manager); `version = Some(v)` reads
    /// exactly that historical version from the version manager. A
    /// tombstone value (written by [`Engine::delete`]) resolves to `None`.
    #[must_use]
    pub fn get(&self, key: &[u8], version: Option<u32>) -> Result<Option<Vec<u8>>> {
        if let Some(v) = version {
            return Ok(self
                .versions
                .get_version(key, v)
                .and_then(|ver| strip_tombstone(ver.value)));
        }
        if let Some(value) = self.lsm.get(key)? {
            return Ok(strip_tombstone(value));
        }
        Ok(self
            .versions
            .get_latest(key)
            .and_then(|ver| strip_tombstone(ver.value)))
    }

    /// Reads `key`'s latest value together with an inclusion proof against
    /// the current MPT root.
    #[must_use]
    pub fn get_with_proof(&self, key: &[u8]) -> Result<Option<(Vec<u8>, merkle::Proof, [u8; 32])>> {
        let Some(value) = self.get(key, None)? else {
            return Ok(None);
        };
        let proof = self.merkle.get_proof(key);
        let root = self.merkle.get_root_hash();
        Ok(Some((value, proof, root)))
    }

    /// Verifies `(key, value)` against `proof` and the current MPT root.
    #[must_use]
    pub fn verify(&self, key: &[u8], value: &[u8], proof: &[merkle::ProofStep]) -> bool {
        self.merkle.verify(key, value, proof)
    }

    /// Full version history for `key`, optionally bounded to
    /// `[start, end]` (inclusive).
    #[must_use]
    pub fn get_history(&self, key: &[u8], start: Option<u32>, end: Option<u32>) -> Vec<Version> {
        self.versions.get_history(key, start, end)
    }

    /// The version of `key` that was current at time `ts` (seconds since
    /// the Unix epoch).
    #[must_use]
    pub fn get_at_time(&self, key: &[u8], ts: f64) -> Option<Version> {
        self.versions.get_at_time(key, ts)
    }

    /// Ascending `[lo, hi]` range scan (both ends inclusive, matching the
    /// B+-tree's own convention). Served from the B+-tree once it has been
    /// synced (fast path); otherwise falls back to scanning every shard's
    /// LSM directly — an improvement on the reference implementation, which
    /// returns an empty result unsynced (see `DESIGN.md`). The LSM's own
    /// `scan` is exclusive of `hi` (the teacher's long-standing convention
    /// for the raw `SCAN` command), so the fallback path bumps `hi` to the
    /// smallest key that sorts strictly after it before delegating.
    pub fn range_query(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if self.bplus_synced.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(self.bplus.range_query(lo, hi)?);
        }
        if hi.is_empty() {
            // Empty `hi` means "no upper bound" to the LSM's own `scan`;
            // bumping it would turn an unbounded scan into an empty one.
            return self.lsm.range_query(lo, hi);
        }
        let exclusive_hi = inclusive_upper_bound(hi);
        self.lsm.range_query(lo, &exclusive_hi)
    }

    /// Writes a tombstone: the LSM removes the key from the read path
    /// immediately; the version manager and MPT record the tombstone
    /// sentinel as the key's next version so the deletion itself is part
    /// of the key's authenticated history.
    pub fn delete(&self, key: &[u8]) -> Result<[u8; 32]> {
        let _guard = self.lock.lock();
        self.lsm.delete(key)?;
        self.versions.create_version(key, TOMBSTONE.to_vec());
        let root = self.merkle.put(key.to_vec(), TOMBSTONE.to_vec());
        self.mirror_put(key.to_vec(), TOMBSTONE.to_vec());
        Ok(root)
    }

    /// Flushes every shard's memtable to SSTable. When `sync` is `true`,
    /// also rewrites the version snapshot, MPT snapshot, B+-tree metadata,
    /// and engine metadata file — the full durable checkpoint described in
    /// spec.md §5 ("`flush(async)` only guarantees the LSM side").
    pub fn flush(&self, sync: bool) -> Result<()> {
        let _guard = self.lock.lock();
        self.lsm.flush_all()?;
        if !sync {
            return Ok(());
        }
        if let Some(parent) = self.config.versions_path().parent() {
            self.versions.save_to_disk(parent)?;
        }
        if let Some(parent) = self.config.merkle_path().parent() {
            self.merkle.save_to_disk(parent)?;
        }
        self.bplus.flush()?;
        self.write_metadata()?;
        info!("Full checkpoint complete (LSM + version/MPT/B+-tree/metadata)");
        Ok(())
    }

    /// Rebuilds the B+-tree cache from a full scan of every shard, then
    /// marks it synced so reads and range queries prefer it. Ported from
    /// `sync_bplus_tree`.
    pub fn sync_bplus_tree(&self) -> Result<()> {
        let _guard = self.lock.lock();
        let all = self.lsm.scan_all()?;
        let count = all.len();
        bplus::bulk_sync(&self.bplus, all)?;
        self.bplus_synced.store(true, std::sync::atomic::Ordering::Release);
        info!("B+-tree cache rebuilt from {} keys, now serving reads", count);
        Ok(())
    }

    #[must_use]
    pub fn get_root_hash(&self) -> [u8; 32] {
        self.merkle.get_root_hash()
    }

    /// Every key that has ever been written (including deleted keys, whose
    /// latest version is the tombstone sentinel). Used by tooling such as
    /// `cli`'s `show keys`.
    #[must_use]
    pub fn all_keys(&self) -> Vec<Vec<u8>> {
        self.versions.get_all_keys()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn get_stats(&self) -> Stats {
        let ShardedStats {
            shard_count,
            total_sstables,
            total_memtable_entries,
        } = self.lsm.stats();
        Stats {
            shard_count,
            total_sstables,
            total_memtable_entries,
            key_count: self.versions.key_count(),
            root_hash: self.merkle.get_root_hash(),
            bplus_synced: self.bplus_synced.load(std::sync::atomic::Ordering::Acquire),
        }
    }

    fn write_metadata(&self) -> Result<()> {
        let meta = Metadata {
            created_at: now_as_secs(),
            description: "RiptideKV versioned, Merkle-authenticated store".to_string(),
            sharding_enabled: true,
            shard_count: self.config.shard_count() as u32,
            max_file_size: self.config.memtable_bytes() as u64,
            last_known_key_count: self.versions.key_count() as u64,
            root_hash: self.merkle.get_root_hash(),
        };
        meta.write_to(self.config.metadata_path())
            .context("writing engine metadata file")
    }

    fn mirror_put(&self, key: Vec<u8>, value: Vec<u8>) {
        // Best-effort: a full mirror queue means the B+-tree falls a step
        // behind the LSM/version/MPT state of record, never the reverse.
        if self.mirror_tx.try_send(MirrorMsg::Put(key, value)).is_err() {
            warn!("B+-tree mirror queue full, dropping one async update");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.mirror_tx.send(MirrorMsg::Shutdown);
        if let Some(handle) = self.mirror_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Smallest byte string that sorts strictly after `key` under
/// lexicographic ordering, used to turn the LSM's exclusive-`hi` `scan`
/// into an inclusive-`hi` range for [`Engine::range_query`].
fn inclusive_upper_bound(key: &[u8]) -> Vec<u8> {
    let mut bumped = key.to_vec();
    bumped.push(0);
    bumped
}

fn strip_tombstone(value: Vec<u8>) -> Option<Vec<u8>> {
    if value == TOMBSTONE {
        None
    } else {
        Some(value)
    }
}

fn now_as_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Recomputes what the MPT root "should" be from the version manager's
/// latest-per-key values, to cross-check against the loaded MPT snapshot at
/// open time. Uses a scratch tree rather than mutating `merkle` directly.
fn recompute_root_from_versions(versions: &VersionManager, merkle: &MerkleTree) -> [u8; 32] {
    let scratch = MerkleTree::new();
    let items: Vec<(Vec<u8>, Vec<u8>)> = versions
        .get_all_keys()
        .into_iter()
        .filter_map(|key| {
            let latest = versions.get_latest(&key)?;
            Some((key, latest.value))
        })
        .collect();
    if items.is_empty() {
        return merkle.get_root_hash();
    }
    scratch.put_many(items)
}

#[cfg(test)]
mod tests;
