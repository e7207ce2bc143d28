//! # Versions — per-key append-only version chains
//!
//! Every write the engine commits is recorded here as a new [`Version`] for
//! its key, hash-linked to the version before it. The manager is the single
//! source of truth for key history — compaction in the LSM keeps only the
//! latest value per key, but `VersionManager` keeps every version a key has
//! ever held, for as long as the process runs (and across restarts, via the
//! `.ver` snapshot).
//!
//! ## Hash chain
//!
//! `hash = SHA256(version || timestamp || value || prev_hash)`. `prev_hash`
//! is the hash of the immediately preceding version for the same key, or
//! empty for version 1. A batch append may skip `prev_hash` computation for
//! intermediate versions once [`VersionManagerConfig::skip_prev_hash_threshold`]
//! is exceeded — off by default, see `DESIGN.md` for the authenticated-mode
//! tradeoff this encodes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Magic bytes at the start of a `.ver` snapshot file.
pub const VER_MAGIC: &[u8; 4] = b"VER\0";

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic in version snapshot")]
    BadMagic,
    #[error("version snapshot checksum mismatch")]
    ChecksumMismatch,
    #[error("version chain is not contiguous for a key")]
    NonContiguousChain,
}

/// A single historical value for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Monotonic per-key counter, starting at 1.
    pub version: u32,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub value: Vec<u8>,
    /// Hash of the previous version for this key; `None` for version 1.
    pub prev_hash: Option<[u8; 32]>,
    /// `SHA256(version || timestamp || value || prev_hash)`. Lazily absent
    /// only while a batch append has deliberately skipped it; callers that
    /// need it can reconstruct it on demand from the fields above.
    pub hash: Option<[u8; 32]>,
}

impl Version {
    fn compute_hash(version: u32, timestamp: f64, value: &[u8], prev_hash: Option<[u8; 32]>) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(version.to_le_bytes());
        hasher.update(timestamp.to_le_bytes());
        hasher.update(value);
        if let Some(p) = prev_hash {
            hasher.update(p);
        }
        hasher.finalize().into()
    }

    /// Computes (and caches) this version's hash if it is not already known.
    pub fn hash_or_compute(&mut self) -> [u8; 32] {
        if let Some(h) = self.hash {
            return h;
        }
        let h = Self::compute_hash(self.version, self.timestamp, &self.value, self.prev_hash);
        self.hash = Some(h);
        h
    }
}

fn now_as_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Tunables for [`VersionManager`]. Constructed once and held by reference,
/// matching the engine-wide config collapse described in `config`.
#[derive(Debug, Clone, Copy)]
pub struct VersionManagerConfig {
    /// Above this many items in a single batch, `prev_hash` is not computed
    /// eagerly for intermediate versions (the field is left `None` and can
    /// be recomputed lazily). `0` disables the skip: every version is fully
    /// chained even in large batches.
    pub skip_prev_hash_threshold: usize,
}

impl Default for VersionManagerConfig {
    fn default() -> Self {
        Self {
            skip_prev_hash_threshold: 0,
        }
    }
}

struct KeyState {
    current_version: u32,
    history: Vec<Version>,
}

/// Per-key append-only version chains, guarded by a single RW-lock.
pub struct VersionManager {
    config: VersionManagerConfig,
    inner: RwLock<HashMap<Vec<u8>, KeyState>>,
}

impl VersionManager {
    #[must_use]
    pub fn new(config: VersionManagerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Appends a new version for `key`, linking it to the previous version's
    /// hash. Always computes `prev_hash` eagerly (the per-key, non-batch path).
    pub fn create_version(&self, key: &[u8], value: Vec<u8>) -> Version {
        let mut guard = self.inner.write();
        let state = guard.entry(key.to_vec()).or_insert_with(|| KeyState {
            current_version: 0,
            history: Vec::new(),
        });

        let prev_hash = state
            .history
            .last_mut()
            .map(Version::hash_or_compute);

        let new_version = state.current_version + 1;
        let timestamp = now_as_secs();
        let hash = Version::compute_hash(new_version, timestamp, &value, prev_hash);
        let version = Version {
            version: new_version,
            timestamp,
            value,
            prev_hash,
            hash: Some(hash),
        };

        state.history.push(version.clone());
        state.current_version = new_version;
        version
    }

    /// Appends one version per `(key, value)` pair. When `items.len()`
    /// exceeds `skip_prev_hash_threshold` (and the threshold is non-zero),
    /// intermediate `prev_hash` fields are left unset to trade authentication
    /// strength for batch throughput; the chain remains reconstructible
    /// lazily via [`Version::hash_or_compute`].
    pub fn create_versions_batch(&self, items: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<Version> {
        let skip_prev_hash = self.config.skip_prev_hash_threshold > 0
            && items.len() > self.config.skip_prev_hash_threshold;
        let base_timestamp = now_as_secs();

        let mut guard = self.inner.write();
        let mut out = Vec::with_capacity(items.len());
        for (key, value) in items {
            let state = guard.entry(key).or_insert_with(|| KeyState {
                current_version: 0,
                history: Vec::new(),
            });

            // A key repeated within one batch must still get strictly
            // increasing timestamps (P2); bump to the next representable
            // f64 above the prior version's timestamp rather than reusing
            // `base_timestamp` verbatim.
            let timestamp = match state.history.last() {
                Some(prev) if prev.timestamp >= base_timestamp => {
                    f64::from_bits(prev.timestamp.to_bits() + 1)
                }
                _ => base_timestamp,
            };

            let prev_hash = if skip_prev_hash {
                None
            } else {
                state.history.last_mut().map(Version::hash_or_compute)
            };

            let new_version = state.current_version + 1;
            let hash = if skip_prev_hash {
                None
            } else {
                Some(Version::compute_hash(new_version, timestamp, &value, prev_hash))
            };

            let version = Version {
                version: new_version,
                timestamp,
                value,
                prev_hash,
                hash,
            };
            state.history.push(version.clone());
            state.current_version = new_version;
            out.push(version);
        }
        out
    }

    #[must_use]
    pub fn get_latest(&self, key: &[u8]) -> Option<Version> {
        self.inner.read().get(key).and_then(|s| s.history.last().cloned())
    }

    /// Binary search over the per-key version vector (versions are dense and
    /// sorted, so index `v-1` is always correct, but we search explicitly to
    /// mirror the component contract rather than assume density blindly).
    #[must_use]
    pub fn get_version(&self, key: &[u8], version: u32) -> Option<Version> {
        let guard = self.inner.read();
        let state = guard.get(key)?;
        state
            .history
            .binary_search_by_key(&version, |v| v.version)
            .ok()
            .map(|idx| state.history[idx].clone())
    }

    /// Latest version whose timestamp is `<= ts`.
    #[must_use]
    pub fn get_at_time(&self, key: &[u8], ts: f64) -> Option<Version> {
        let guard = self.inner.read();
        let state = guard.get(key)?;
        state
            .history
            .iter()
            .take_while(|v| v.timestamp <= ts)
            .last()
            .cloned()
    }

    /// Versions with `start <= version <= end` (both bounds inclusive).
    /// `start` defaults to 1, `end` to the current version, when `None`.
    #[must_use]
    pub fn get_history(&self, key: &[u8], start: Option<u32>, end: Option<u32>) -> Vec<Version> {
        let guard = self.inner.read();
        let Some(state) = guard.get(key) else {
            return Vec::new();
        };
        let start = start.unwrap_or(0);
        let end = end.unwrap_or(u32::MAX);
        state
            .history
            .iter()
            .filter(|v| v.version >= start && v.version <= end)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get_all_keys(&self) -> Vec<Vec<u8>> {
        self.inner.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn get_current_version(&self, key: &[u8]) -> u32 {
        self.inner.read().get(key).map_or(0, |s| s.current_version)
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.inner.read().len()
    }

    /// Rewrites the `.ver` snapshot in full. There is no incremental log:
    /// concurrent readers observe the in-memory state, never the file.
    pub fn save_to_disk<P: AsRef<Path>>(&self, dir: P) -> Result<(), VersionError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join("versions.ver");
        let tmp_path = dir.join("versions.ver.tmp");

        let mut buf: Vec<u8> = Vec::new();
        buf.write_all(VER_MAGIC)?;
        buf.write_u16::<LittleEndian>(1)?;

        let guard = self.inner.read();
        buf.write_u64::<LittleEndian>(guard.len() as u64)?;
        for (key, state) in guard.iter() {
            buf.write_u32::<LittleEndian>(key.len() as u32)?;
            buf.write_all(key)?;
            buf.write_u32::<LittleEndian>(state.current_version)?;
            buf.write_u32::<LittleEndian>(state.history.len() as u32)?;
            for v in &state.history {
                buf.write_u32::<LittleEndian>(v.version)?;
                buf.write_f64::<LittleEndian>(v.timestamp)?;
                buf.write_u32::<LittleEndian>(v.value.len() as u32)?;
                buf.write_all(&v.value)?;
                match v.prev_hash {
                    Some(h) => {
                        buf.write_u32::<LittleEndian>(32)?;
                        buf.write_all(&h)?;
                    }
                    None => buf.write_u32::<LittleEndian>(0)?,
                }
            }
        }
        drop(guard);

        let checksum: [u8; 32] = Sha256::digest(&buf).into();
        buf.write_all(&checksum)?;

        {
            let mut f = std::fs::File::create(&tmp_path)?;
            f.write_all(&buf)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Loads a `.ver` snapshot, replacing the in-memory state. A checksum
    /// mismatch or bad magic is refused rather than partially applied.
    pub fn load_from_disk<P: AsRef<Path>>(&self, dir: P) -> Result<(), VersionError> {
        let path = dir.as_ref().join("versions.ver");
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if bytes.len() < 32 {
            return Err(VersionError::ChecksumMismatch);
        }
        let (body, checksum) = bytes.split_at(bytes.len() - 32);
        let expected: [u8; 32] = Sha256::digest(body).into();
        if expected.as_slice() != checksum {
            return Err(VersionError::ChecksumMismatch);
        }

        let mut cur = Cursor::new(body);
        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic)?;
        if &magic != VER_MAGIC {
            return Err(VersionError::BadMagic);
        }
        let _format_version = cur.read_u16::<LittleEndian>()?;
        let key_count = cur.read_u64::<LittleEndian>()?;

        let mut map = HashMap::with_capacity(key_count as usize);
        for _ in 0..key_count {
            let klen = cur.read_u32::<LittleEndian>()? as usize;
            let mut key = vec![0u8; klen];
            cur.read_exact(&mut key)?;
            let current_version = cur.read_u32::<LittleEndian>()?;
            let history_len = cur.read_u32::<LittleEndian>()?;

            let mut history = Vec::with_capacity(history_len as usize);
            let mut expected_next = 1u32;
            for _ in 0..history_len {
                let version = cur.read_u32::<LittleEndian>()?;
                if version != expected_next {
                    return Err(VersionError::NonContiguousChain);
                }
                expected_next += 1;
                let timestamp = cur.read_f64::<LittleEndian>()?;
                let vlen = cur.read_u32::<LittleEndian>()? as usize;
                let mut value = vec![0u8; vlen];
                cur.read_exact(&mut value)?;
                let hlen = cur.read_u32::<LittleEndian>()?;
                let prev_hash = if hlen == 32 {
                    let mut h = [0u8; 32];
                    cur.read_exact(&mut h)?;
                    Some(h)
                } else {
                    None
                };
                history.push(Version {
                    version,
                    timestamp,
                    value,
                    prev_hash,
                    hash: None,
                });
            }
            map.insert(key, KeyState { current_version, history });
        }

        *self.inner.write() = map;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
