//! # B+-tree read cache (C7)
//!
//! An optional, disk-resident ordered index over the engine's latest
//! state, used as a read fast-path once the engine has mirrored writes
//! into it. One node lives per file (`node_<id>.bpt`); a small metadata
//! file (`tree.meta`) records the root id and the next id to allocate. A
//! fixed-capacity LRU keeps hot nodes resident and writes a node back to
//! disk only when it is dirty and gets evicted (or on an explicit
//! [`BPlusTree::flush`]).
//!
//! Ported from `original_source/src/amdb/storage/bplus_tree.py`'s
//! `BPlusTree`/`BPlusNode`, with child pointers modeled as a proper `enum`
//! instead of packed byte blobs, and the LRU swapped for the `lru` crate.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const BPT_MAGIC: &[u8; 4] = b"BPT\0";

#[derive(Debug, Error)]
pub enum BPlusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic in node file")]
    BadMagic,
    #[error("node file not found for id {0}")]
    NodeNotFound(u64),
}

type NodeId = u64;

#[derive(Debug, Clone)]
enum Body {
    Leaf {
        keys: Vec<Vec<u8>>,
        values: Vec<Vec<u8>>,
        next_leaf: Option<NodeId>,
    },
    Internal {
        /// `keys.len() == children.len() - 1`; `children[i]` holds entries
        /// `< keys[i]`, `children[last]` holds entries `>= keys[last]`.
        keys: Vec<Vec<u8>>,
        children: Vec<NodeId>,
    },
}

#[derive(Debug, Clone)]
struct Node {
    id: NodeId,
    parent_id: Option<NodeId>,
    body: Body,
    dirty: bool,
}

impl Node {
    fn is_leaf(&self) -> bool {
        matches!(self.body, Body::Leaf { .. })
    }

    fn keys(&self) -> &[Vec<u8>] {
        match &self.body {
            Body::Leaf { keys, .. } => keys,
            Body::Internal { keys, .. } => keys,
        }
    }
}

/// Position of the first key `>= key` (standard lower-bound binary search).
fn lower_bound(keys: &[Vec<u8>], key: &[u8]) -> usize {
    keys.partition_point(|k| k.as_slice() < key)
}

struct Inner {
    dir: PathBuf,
    order: usize,
    root_id: Option<NodeId>,
    next_id: NodeId,
    cache: LruCache<NodeId, Node>,
}

/// A B+-tree used as a read fast-path once the engine marks it synced.
pub struct BPlusTree {
    inner: Mutex<Inner>,
}

impl BPlusTree {
    /// Opens (or creates) a B+-tree rooted at `dir`, loading `tree.meta`
    /// if present.
    pub fn open<P: AsRef<Path>>(dir: P, order: usize, cache_capacity: usize) -> Result<Self, BPlusError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let (root_id, next_id) = load_metadata(&dir)?;
        let cap = NonZeroUsize::new(cache_capacity.max(1)).unwrap();
        Ok(Self {
            inner: Mutex::new(Inner {
                dir,
                order: order.max(3),
                root_id,
                next_id,
                cache: LruCache::new(cap),
            }),
        })
    }

    /// Inserts or updates `key` -> `value`.
    pub fn insert(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), BPlusError> {
        let mut inner = self.inner.lock();
        if inner.root_id.is_none() {
            let id = inner.alloc_id();
            let node = Node {
                id,
                parent_id: None,
                body: Body::Leaf {
                    keys: vec![key],
                    values: vec![value],
                    next_leaf: None,
                },
                dirty: true,
            };
            inner.root_id = Some(id);
            inner.put_cache(node)?;
            inner.save_metadata()?;
            return Ok(());
        }

        let leaf_id = inner.find_leaf_id(&key)?;
        let order = inner.order;
        {
            let leaf = inner.load(leaf_id)?;
            let Body::Leaf { keys, values, .. } = &mut leaf.body else {
                unreachable!("find_leaf_id always returns a leaf")
            };
            let pos = lower_bound(keys, &key);
            if pos < keys.len() && keys[pos] == key {
                values[pos] = value;
            } else {
                keys.insert(pos, key);
                values.insert(pos, value);
            }
            leaf.dirty = true;
        }
        if inner.load(leaf_id)?.keys().len() >= order {
            inner.split_leaf(leaf_id)?;
        }
        inner.save_metadata()?;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        if inner.root_id.is_none() {
            return None;
        }
        let leaf_id = inner.find_leaf_id(key).ok()?;
        let leaf = inner.load(leaf_id).ok()?;
        let Body::Leaf { keys, values, .. } = &leaf.body else {
            return None;
        };
        let pos = lower_bound(keys, key);
        if pos < keys.len() && keys[pos] == key {
            Some(values[pos].clone())
        } else {
            None
        }
    }

    /// Inclusive range scan `[lo, hi]`, ascending by key.
    pub fn range_query(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BPlusError> {
        let mut inner = self.inner.lock();
        if inner.root_id.is_none() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        let mut leaf_id = Some(inner.find_leaf_id(lo)?);
        while let Some(id) = leaf_id {
            let leaf = inner.load(id)?;
            let Body::Leaf { keys, values, next_leaf } = &leaf.body else {
                break;
            };
            let mut done = false;
            for (k, v) in keys.iter().zip(values.iter()) {
                if k.as_slice() > hi {
                    done = true;
                    break;
                }
                if k.as_slice() >= lo {
                    results.push((k.clone(), v.clone()));
                }
            }
            if done {
                break;
            }
            leaf_id = *next_leaf;
        }
        Ok(results)
    }

    /// Writes every dirty cached node and the tree metadata to disk.
    pub fn flush(&self) -> Result<(), BPlusError> {
        let mut inner = self.inner.lock();
        let ids: Vec<NodeId> = inner.cache.iter().map(|(id, _)| *id).collect();
        for id in ids {
            if let Some(node) = inner.cache.peek(&id).cloned() {
                if node.dirty {
                    save_node(&inner.dir, &node)?;
                    if let Some(n) = inner.cache.get_mut(&id) {
                        n.dirty = false;
                    }
                }
            }
        }
        inner.save_metadata()?;
        Ok(())
    }
}

impl Inner {
    fn alloc_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn put_cache(&mut self, node: Node) -> Result<(), BPlusError> {
        if let Some((_, evicted)) = self.cache.push(node.id, node) {
            if evicted.dirty {
                save_node(&self.dir, &evicted)?;
            }
        }
        Ok(())
    }

    /// Loads a node by id, from cache or disk, and returns a mutable
    /// reference into the cache.
    fn load(&mut self, id: NodeId) -> Result<&mut Node, BPlusError> {
        if !self.cache.contains(&id) {
            let node = load_node(&self.dir, id)?;
            self.put_cache(node)?;
        }
        Ok(self.cache.get_mut(&id).expect("just inserted"))
    }

    fn find_leaf_id(&mut self, key: &[u8]) -> Result<NodeId, BPlusError> {
        let mut id = self.root_id.expect("caller checked root exists");
        loop {
            let node = self.load(id)?;
            if node.is_leaf() {
                return Ok(id);
            }
            let Body::Internal { keys, children } = &node.body else {
                unreachable!()
            };
            let pos = lower_bound(keys, key);
            // keys[pos] is the first separator > key's slot; child at `pos`
            // holds entries < keys[pos].
            let child_pos = if pos < keys.len() && keys[pos] == key {
                pos + 1
            } else {
                pos
            };
            id = children[child_pos.min(children.len() - 1)];
        }
    }

    fn split_leaf(&mut self, leaf_id: NodeId) -> Result<(), BPlusError> {
        let (mid_key, right_keys, right_values, next_leaf, parent_id) = {
            let leaf = self.load(leaf_id)?;
            let Body::Leaf { keys, values, next_leaf } = &mut leaf.body else {
                unreachable!()
            };
            let mid = keys.len() / 2;
            let right_keys: Vec<_> = keys.split_off(mid);
            let right_values: Vec<_> = values.split_off(mid);
            let old_next = *next_leaf;
            let mid_key = right_keys[0].clone();
            leaf.dirty = true;
            (mid_key, right_keys, right_values, old_next, leaf.parent_id)
        };

        let new_id = self.alloc_id();
        let new_node = Node {
            id: new_id,
            parent_id,
            body: Body::Leaf {
                keys: right_keys,
                values: right_values,
                next_leaf,
            },
            dirty: true,
        };
        self.put_cache(new_node)?;
        {
            let leaf = self.load(leaf_id)?;
            let Body::Leaf { next_leaf, .. } = &mut leaf.body else {
                unreachable!()
            };
            *next_leaf = Some(new_id);
        }

        self.attach_split(leaf_id, new_id, mid_key, parent_id)
    }

    /// Inserts `(separator, new_child)` into `parent_id`, creating a new
    /// root if `left_id` had none, and recursing if the parent overflows.
    fn attach_split(
        &mut self,
        left_id: NodeId,
        new_id: NodeId,
        separator: Vec<u8>,
        parent_id: Option<NodeId>,
    ) -> Result<(), BPlusError> {
        match parent_id {
            None => {
                let new_root_id = self.alloc_id();
                let new_root = Node {
                    id: new_root_id,
                    parent_id: None,
                    body: Body::Internal {
                        keys: vec![separator],
                        children: vec![left_id, new_id],
                    },
                    dirty: true,
                };
                self.load(left_id)?.parent_id = Some(new_root_id);
                self.load(new_id)?.parent_id = Some(new_root_id);
                self.put_cache(new_root)?;
                self.root_id = Some(new_root_id);
                Ok(())
            }
            Some(pid) => {
                let order = self.order;
                let grandparent = self.load(pid)?.parent_id;
                {
                    let parent = self.load(pid)?;
                    let Body::Internal { keys, children } = &mut parent.body else {
                        unreachable!()
                    };
                    let pos = lower_bound(keys, &separator);
                    keys.insert(pos, separator);
                    children.insert(pos + 1, new_id);
                    parent.dirty = true;
                }
                self.load(new_id)?.parent_id = Some(pid);
                if self.load(pid)?.keys().len() >= order {
                    self.split_internal(pid, grandparent)?;
                }
                Ok(())
            }
        }
    }

    fn split_internal(
        &mut self,
        node_id: NodeId,
        parent_id: Option<NodeId>,
    ) -> Result<(), BPlusError> {
        let (split_key, right_keys, right_children) = {
            let node = self.load(node_id)?;
            let Body::Internal { keys, children } = &mut node.body else {
                unreachable!()
            };
            let mid = keys.len() / 2;
            let split_key = keys[mid].clone();
            let right_keys = keys.split_off(mid + 1);
            keys.pop(); // drop the promoted split_key from the left side
            let right_children = children.split_off(mid + 1);
            node.dirty = true;
            (split_key, right_keys, right_children)
        };

        let new_id = self.alloc_id();
        for &child in &right_children {
            self.load(child)?.parent_id = Some(new_id);
        }
        let new_node = Node {
            id: new_id,
            parent_id,
            body: Body::Internal {
                keys: right_keys,
                children: right_children,
            },
            dirty: true,
        };
        self.put_cache(new_node)?;

        self.attach_split(node_id, new_id, split_key, parent_id)
    }

    fn save_metadata(&self) -> Result<(), BPlusError> {
        let path = self.dir.join("tree.meta");
        let tmp = self.dir.join("tree.meta.tmp");
        let mut buf = Vec::new();
        buf.write_u8(self.root_id.is_some() as u8)?;
        buf.write_u64::<LittleEndian>(self.root_id.unwrap_or(0))?;
        buf.write_u64::<LittleEndian>(self.next_id)?;
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&buf)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn load_metadata(dir: &Path) -> Result<(Option<NodeId>, NodeId), BPlusError> {
    let path = dir.join("tree.meta");
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((None, 1)),
        Err(e) => return Err(e.into()),
    };
    let mut cur = Cursor::new(bytes);
    let has_root = cur.read_u8()? == 1;
    let root_id = cur.read_u64::<LittleEndian>()?;
    let next_id = cur.read_u64::<LittleEndian>()?;
    Ok((if has_root { Some(root_id) } else { None }, next_id.max(1)))
}

fn node_path(dir: &Path, id: NodeId) -> PathBuf {
    dir.join(format!("node_{id}.bpt"))
}

fn save_node(dir: &Path, node: &Node) -> Result<(), BPlusError> {
    let path = node_path(dir, node.id);
    let tmp = dir.join(format!("node_{}.bpt.tmp", node.id));
    let mut buf = Vec::new();
    buf.write_all(BPT_MAGIC)?;
    buf.write_u64::<LittleEndian>(node.id)?;
    buf.write_u8(node.parent_id.is_some() as u8)?;
    buf.write_u64::<LittleEndian>(node.parent_id.unwrap_or(0))?;
    match &node.body {
        Body::Leaf { keys, values, next_leaf } => {
            buf.write_u8(1)?;
            buf.write_u32::<LittleEndian>(keys.len() as u32)?;
            for (k, v) in keys.iter().zip(values.iter()) {
                buf.write_u32::<LittleEndian>(k.len() as u32)?;
                buf.write_all(k)?;
                buf.write_u32::<LittleEndian>(v.len() as u32)?;
                buf.write_all(v)?;
            }
            buf.write_u8(next_leaf.is_some() as u8)?;
            buf.write_u64::<LittleEndian>(next_leaf.unwrap_or(0))?;
        }
        Body::Internal { keys, children } => {
            buf.write_u8(0)?;
            buf.write_u32::<LittleEndian>(keys.len() as u32)?;
            for k in keys {
                buf.write_u32::<LittleEndian>(k.len() as u32)?;
                buf.write_all(k)?;
            }
            buf.write_u32::<LittleEndian>(children.len() as u32)?;
            for c in children {
                buf.write_u64::<LittleEndian>(*c)?;
            }
        }
    }
    let mut f = std::fs::File::create(&tmp)?;
    f.write_all(&buf)?;
    f.sync_all()?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

fn load_node(dir: &Path, id: NodeId) -> Result<Node, BPlusError> {
    let path = node_path(dir, id);
    let bytes = std::fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BPlusError::NodeNotFound(id)
        } else {
            BPlusError::Io(e)
        }
    })?;
    let mut cur = Cursor::new(bytes);
    let mut magic = [0u8; 4];
    cur.read_exact(&mut magic)?;
    if &magic != BPT_MAGIC {
        return Err(BPlusError::BadMagic);
    }
    let node_id = cur.read_u64::<LittleEndian>()?;
    let has_parent = cur.read_u8()? == 1;
    let parent_raw = cur.read_u64::<LittleEndian>()?;
    let parent_id = if has_parent { Some(parent_raw) } else { None };
    let is_leaf = cur.read_u8()? == 1;
    let body = if is_leaf {
        let count = cur.read_u32::<LittleEndian>()? as usize;
        let mut keys = Vec::with_capacity(count);
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let klen = cur.read_u32::<LittleEndian>()? as usize;
            let mut k = vec![0u8; klen];
            cur.read_exact(&mut k)?;
            let vlen = cur.read_u32::<LittleEndian>()? as usize;
            let mut v = vec![0u8; vlen];
            cur.read_exact(&mut v)?;
            keys.push(k);
            values.push(v);
        }
        let has_next = cur.read_u8()? == 1;
        let next_raw = cur.read_u64::<LittleEndian>()?;
        Body::Leaf {
            keys,
            values,
            next_leaf: if has_next { Some(next_raw) } else { None },
        }
    } else {
        let key_count = cur.read_u32::<LittleEndian>()? as usize;
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            let klen = cur.read_u32::<LittleEndian>()? as usize;
            let mut k = vec![0u8; klen];
            cur.read_exact(&mut k)?;
            keys.push(k);
        }
        let child_count = cur.read_u32::<LittleEndian>()? as usize;
        let mut children = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            children.push(cur.read_u64::<LittleEndian>()?);
        }
        Body::Internal { keys, children }
    };
    Ok(Node {
        id: node_id,
        parent_id,
        body,
        dirty: false,
    })
}

/// Bulk (re)population from a full scan of the committed key→value set —
/// used to sync the B+-tree out of band when `bplus_synced` has lapsed.
pub fn bulk_sync(tree: &BPlusTree, items: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<(), BPlusError> {
    let grouped: HashMap<Vec<u8>, Vec<u8>> = items.into_iter().collect();
    for (k, v) in grouped {
        tree.insert(k, v)?;
    }
    tree.flush()
}
