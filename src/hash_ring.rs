//! Consistent hashing of resource keys onto node ids.
//!
//! Every id occupies [`DEFAULT_REPLICAS`] virtual positions on a `u64` ring,
//! placed at `blake3(id ++ vnode_index)`. A key maps to the first distinct ids
//! found walking clockwise from `blake3(key)`. Ids are kept sorted, so the
//! result never depends on insertion order. The ring is rebuilt lazily on the
//! first lookup after a membership change.

use std::collections::BTreeSet;

/// Virtual positions per id.
pub const DEFAULT_REPLICAS: u32 = 100;

fn position(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(head)
}

fn vnode_position(id: &[u8], index: u32) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(id);
    hasher.update(&index.to_be_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    u64::from_be_bytes(head)
}

/// Key for partition `partition` of `stream_id`.
///
/// The partition number comes first so that keys of one stream differ in
/// their leading bytes.
pub fn format_partition_key(stream_id: &str, partition: u32) -> String {
    format!("{partition}#{stream_id}")
}

#[derive(Clone, Debug)]
pub struct ConsistentHashRing<T> {
    replicas: u32,
    ids: BTreeSet<T>,
    ring: Vec<(u64, T)>,
    dirty: bool,
}

impl<T: Ord + Clone + AsRef<[u8]>> Default for ConsistentHashRing<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone + AsRef<[u8]>> ConsistentHashRing<T> {
    pub fn new() -> Self {
        Self::with_replicas(DEFAULT_REPLICAS)
    }

    pub fn with_replicas(replicas: u32) -> Self {
        Self {
            replicas: replicas.max(1),
            ids: BTreeSet::new(),
            ring: Vec::new(),
            dirty: false,
        }
    }

    pub fn add(&mut self, id: T) {
        if self.ids.insert(id) {
            self.dirty = true;
        }
    }

    pub fn remove(&mut self, id: &T) {
        if self.ids.remove(id) {
            self.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn rebuild(&mut self) {
        self.ring.clear();
        for id in &self.ids {
            for index in 0..self.replicas {
                self.ring.push((vnode_position(id.as_ref(), index), id.clone()));
            }
        }
        self.ring.sort();
        self.dirty = false;
    }

    /// Up to `count` distinct ids responsible for `key`, primary first.
    pub fn get(&mut self, key: impl AsRef<[u8]>, count: usize) -> Vec<T> {
        if self.dirty {
            self.rebuild();
        }
        let wanted = count.min(self.ids.len());
        let mut picked: Vec<T> = Vec::with_capacity(wanted);
        if wanted == 0 {
            return picked;
        }
        let start = position(key.as_ref());
        let first = self.ring.partition_point(|(pos, _)| *pos < start);
        for offset in 0..self.ring.len() {
            let (_, id) = &self.ring[(first + offset) % self.ring.len()];
            if !picked.contains(id) {
                picked.push(id.clone());
                if picked.len() == wanted {
                    break;
                }
            }
        }
        picked
    }
}
