//! # Memtable
//!
//! An in-memory, sorted, mutable write buffer for the storage engine.
//!
//! The memtable is the first point of contact for every write operation. It
//! buffers recent `PUT` and `DELETE` operations in a probabilistic balanced
//! structure (a skip list) before they are flushed to immutable on-disk
//! SSTables.
//!
//! ## Key properties
//! - **Sorted order**: entries are always in ascending key order (required for SSTable flush).
//! - **Sequence-number gated**: stale writes (lower sequence number) are silently rejected.
//! - **Tombstone support**: deletes are recorded as `ValueEntry { value: None }` markers.
//! - **Byte budget**: once the tracked size would exceed the configured capacity,
//!   further writes are rejected with [`PutOutcome::Full`] instead of growing
//!   without bound; the caller is expected to rotate the memtable and retry.
//! - **Concurrent reads, serialized writes**: backed by a [`parking_lot::RwLock`],
//!   so multiple readers can run alongside a single writer.
//!
//! ## Example
//! ```rust
//! use memtable::{Memtable, PutOutcome};
//!
//! let m = Memtable::new();
//! assert_eq!(m.put(b"hello".to_vec(), b"world".to_vec(), 1), PutOutcome::Inserted);
//! assert_eq!(m.get(b"hello").unwrap().1, b"world".to_vec());
//!
//! m.delete(b"hello".to_vec(), 2);
//! assert!(m.get(b"hello").is_none());
//! ```

use parking_lot::RwLock;
use rand::Rng;

/// Maximum number of skip list levels. A level is only added once enough
/// entries exist to statistically need it; 16 levels comfortably cover
/// memtables in the tens-of-millions-of-entries range at p=0.5.
pub const MAX_LEVEL: usize = 16;

/// Probability that an inserted node is promoted to the next level.
const LEVEL_UP_PROBABILITY: f64 = 0.5;

/// Default byte budget for a single memtable before it reports `Full`.
pub const DEFAULT_MAX_SIZE_BYTES: usize = 10 * 1024 * 1024;

/// Per-entry bookkeeping overhead counted against the byte budget, on top of
/// the raw key + value length (node pointers, sequence number, tag byte).
const ENTRY_OVERHEAD_BYTES: usize = 16;

/// A single entry in the memtable, pairing a sequence number with an optional value.
///
/// - `value == Some(bytes)` — the key holds a live value.
/// - `value == None` — the key has been deleted (tombstone).
///
/// Tombstones are retained in the memtable and flushed to SSTables so that
/// older values in lower levels are correctly shadowed during reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEntry {
    /// Monotonically increasing sequence number assigned at write time.
    pub seq: u64,
    /// `Some(bytes)` for live values, `None` for tombstones (deletes).
    pub value: Option<Vec<u8>>,
    /// Wall-clock time the entry was written, seconds since the Unix epoch.
    /// Carried through to the SSTable record so a flushed file can answer
    /// "what did this key look like around time T" without consulting the
    /// version manager.
    pub timestamp: f64,
}

fn now_as_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Result of a write attempt against the memtable's byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a Full outcome means the write was rejected and must be retried elsewhere"]
pub enum PutOutcome {
    /// The entry was written (or the write was a no-op stale write).
    Inserted,
    /// The memtable's byte budget would be exceeded; caller must rotate.
    Full,
}

fn entry_size(key: &[u8], value: &Option<Vec<u8>>) -> usize {
    key.len() + value.as_ref().map_or(0, |v| v.len()) + ENTRY_OVERHEAD_BYTES
}

fn random_level() -> usize {
    let mut level = 1;
    let mut rng = rand::thread_rng();
    while level < MAX_LEVEL && rng.gen_bool(LEVEL_UP_PROBABILITY) {
        level += 1;
    }
    level
}

#[derive(Debug)]
struct Node {
    key: Vec<u8>,
    entry: ValueEntry,
    /// Forward pointers, one per level this node participates in.
    forward: Vec<Option<usize>>,
}

/// The skip list itself. Not exposed directly; [`Memtable`] wraps it behind
/// a lock so callers never touch node indices.
#[derive(Debug)]
struct SkipList {
    /// Node arena. Indices are stable for the lifetime of the skip list
    /// (nodes are never removed, only tombstoned).
    nodes: Vec<Node>,
    /// Head's forward pointers, one per possible level.
    head: [Option<usize>; MAX_LEVEL],
    /// Highest level currently in use (1..=MAX_LEVEL).
    level: usize,
    len: usize,
    size_bytes: usize,
    max_size_bytes: usize,
}

impl SkipList {
    fn new(max_size_bytes: usize) -> Self {
        Self {
            nodes: Vec::new(),
            head: [None; MAX_LEVEL],
            level: 1,
            len: 0,
            size_bytes: 0,
            max_size_bytes,
        }
    }

    fn forward_at(&self, node: Option<usize>, lvl: usize) -> Option<usize> {
        match node {
            Some(idx) => self.nodes[idx].forward.get(lvl).copied().flatten(),
            None => self.head[lvl],
        }
    }

    /// Walks the list from the top level down, returning for each level the
    /// index of the last node whose key is strictly less than `key`.
    fn find_update_path(&self, key: &[u8]) -> [Option<usize>; MAX_LEVEL] {
        let mut update = [None; MAX_LEVEL];
        let mut x: Option<usize> = None;
        for lvl in (0..self.level).rev() {
            loop {
                match self.forward_at(x, lvl) {
                    Some(next) if self.nodes[next].key.as_slice() < key => x = Some(next),
                    _ => break,
                }
            }
            update[lvl] = x;
        }
        update
    }

    fn find_node_idx(&self, key: &[u8]) -> Option<usize> {
        let update = self.find_update_path(key);
        let candidate = self.forward_at(update[0], 0);
        match candidate {
            Some(idx) if self.nodes[idx].key.as_slice() == key => Some(idx),
            _ => None,
        }
    }

    fn put(&mut self, key: Vec<u8>, value: Option<Vec<u8>>, seq: u64) -> PutOutcome {
        if key.is_empty() {
            // The empty key is reserved as the skip list's internal sentinel
            // (the head node) and is never stored as a real entry.
            return PutOutcome::Inserted;
        }

        if let Some(idx) = self.find_node_idx(&key) {
            if self.nodes[idx].entry.seq >= seq {
                return PutOutcome::Inserted;
            }
            let old_size = entry_size(&self.nodes[idx].key, &self.nodes[idx].entry.value);
            let new_size = entry_size(&key, &value);
            let projected = self.size_bytes - old_size + new_size;
            if projected > self.max_size_bytes {
                return PutOutcome::Full;
            }
            self.size_bytes = projected;
            self.nodes[idx].entry = ValueEntry {
                seq,
                value,
                timestamp: now_as_secs(),
            };
            return PutOutcome::Inserted;
        }

        let new_size = entry_size(&key, &value);
        if self.size_bytes.saturating_add(new_size) > self.max_size_bytes {
            return PutOutcome::Full;
        }

        let update = self.find_update_path(&key);
        let node_level = random_level();
        if node_level > self.level {
            self.level = node_level;
        }

        let node_idx = self.nodes.len();
        let mut forward = vec![None; node_level];
        for (lvl, slot) in forward.iter_mut().enumerate() {
            let pred = update[lvl];
            *slot = self.forward_at(pred, lvl);
            match pred {
                Some(p) => {
                    if self.nodes[p].forward.len() <= lvl {
                        self.nodes[p].forward.resize(lvl + 1, None);
                    }
                    self.nodes[p].forward[lvl] = Some(node_idx);
                }
                None => self.head[lvl] = Some(node_idx),
            }
        }

        self.nodes.push(Node {
            key,
            entry: ValueEntry {
                seq,
                value,
                timestamp: now_as_secs(),
            },
            forward,
        });
        self.len += 1;
        self.size_bytes += new_size;
        PutOutcome::Inserted
    }

    fn get_entry(&self, key: &[u8]) -> Option<&ValueEntry> {
        self.find_node_idx(key).map(|idx| &self.nodes[idx].entry)
    }

    fn iter_sorted(&self) -> Vec<(Vec<u8>, ValueEntry)> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head[0];
        while let Some(idx) = cur {
            let node = &self.nodes[idx];
            out.push((node.key.clone(), node.entry.clone()));
            cur = node.forward.first().copied().flatten();
        }
        out
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.head = [None; MAX_LEVEL];
        self.level = 1;
        self.len = 0;
        self.size_bytes = 0;
    }
}

/// An ordered, in-memory write buffer backed by a skip list.
///
/// The memtable tracks a byte budget so the engine can decide when to flush
/// (or, once the budget is exceeded, must rotate it out and start a fresh
/// one). Sequence numbers gate every mutation: a write with a sequence
/// number <= the existing entry's sequence is silently dropped, ensuring
/// consistency during WAL replay and concurrent recovery.
#[derive(Debug)]
pub struct Memtable {
    inner: RwLock<SkipList>,
}

impl Memtable {
    /// Creates a new, empty memtable with the default byte budget.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_SIZE_BYTES)
    }

    /// Creates a new, empty memtable with a custom byte budget.
    pub fn with_capacity(max_size_bytes: usize) -> Self {
        Self {
            inner: RwLock::new(SkipList::new(max_size_bytes)),
        }
    }

    /// Inserts a key-value pair with the given sequence number.
    ///
    /// Returns [`PutOutcome::Full`] without mutating state if the byte
    /// budget would be exceeded; the caller should rotate this memtable out
    /// and retry against a fresh one. A stale write (sequence number <= the
    /// existing entry's) is silently ignored and reported as `Inserted`.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, seq: u64) -> PutOutcome {
        self.inner.write().put(key, Some(value), seq)
    }

    /// Inserts a batch of key-value pairs, stopping at the first entry that
    /// would exceed the byte budget. Returns the number of entries actually
    /// applied; callers should re-submit the remainder after rotation.
    pub fn put_batch(&self, items: Vec<(Vec<u8>, Vec<u8>, u64)>) -> usize {
        let mut guard = self.inner.write();
        let mut applied = 0;
        for (key, value, seq) in items {
            match guard.put(key, Some(value), seq) {
                PutOutcome::Inserted => applied += 1,
                PutOutcome::Full => break,
            }
        }
        applied
    }

    /// Records a tombstone (delete marker) for the given key.
    ///
    /// A tombstone is stored as `ValueEntry { seq, value: None }`. It shadows
    /// any older value both in the memtable and in SSTables during reads.
    /// Stale-write protection applies identically to [`put`](Memtable::put).
    pub fn delete(&self, key: Vec<u8>, seq: u64) -> PutOutcome {
        self.inner.write().put(key, None, seq)
    }

    /// Returns the value for the given key if it exists and is **not** a
    /// tombstone.
    ///
    /// **Prefer [`get_entry`](Memtable::get_entry)** when you need to
    /// distinguish "key not found" from "key was deleted" (tombstone).
    pub fn get(&self, key: &[u8]) -> Option<(u64, Vec<u8>)> {
        self.inner
            .read()
            .get_entry(key)
            .and_then(|e| e.value.as_ref().map(|v| (e.seq, v.clone())))
    }

    /// Returns a clone of the raw [`ValueEntry`] for the given key, if
    /// present. Unlike [`get`](Memtable::get), this does **not** filter out
    /// tombstones.
    pub fn get_entry(&self, key: &[u8]) -> Option<ValueEntry> {
        self.inner.read().get_entry(key).cloned()
    }

    /// Returns all entries in ascending key order, including tombstones.
    ///
    /// This is used by SSTable flush and by compaction-adjacent lookups; it
    /// materializes a snapshot rather than borrowing, since the underlying
    /// lock guard cannot outlive the call.
    pub fn iter(&self) -> Vec<(Vec<u8>, ValueEntry)> {
        self.inner.read().iter_sorted()
    }

    /// Returns the number of entries (including tombstones).
    pub fn len(&self) -> usize {
        self.inner.read().len
    }

    /// Returns the tracked byte size of all keys and values stored.
    pub fn size_bytes(&self) -> usize {
        self.inner.read().size_bytes
    }

    /// Deprecated alias for [`size_bytes`](Memtable::size_bytes), kept for
    /// call sites ported from the single-shard engine.
    pub fn approx_size(&self) -> usize {
        self.size_bytes()
    }

    /// Returns `true` if the memtable contains zero entries.
    pub fn is_empty(&self) -> bool {
        self.inner.read().len == 0
    }

    /// Returns `true` if the memtable contains the given key (including
    /// tombstones).
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.inner.read().get_entry(key).is_some()
    }

    /// Removes all entries and resets the byte budget counter to zero.
    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}
