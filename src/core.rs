//! Identity, distance metrics and the shared value types of the overlay.
//!
//! This module contains the fundamental building blocks every other component
//! relies on:
//!
//! - **Identity & Hashing**: [`NodeId`], [`Key`], [`derive_node_id`], [`hash_key`]
//! - **Distance Metrics**: [`xor_distance`] for Kademlia-style routing and
//!   [`ring_distance`] for the region-aware ring topology
//! - **Descriptors**: [`PeerDescriptor`] and [`NodeType`]
//! - **Stored data**: [`DataEntry`]

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use blake3::Hasher;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{DhtError, DhtResult};

// ============================================================================
// Type Aliases
// ============================================================================

/// Length in bytes of every identifier in the overlay.
pub const ID_LENGTH: usize = 32;

/// A 256-bit identifier for DHT nodes.
///
/// Node IDs are derived by BLAKE3 hashing, ensuring a uniform distribution
/// across the identifier space.
pub type NodeId = [u8; ID_LENGTH];

/// A 256-bit key for stored values. Keys share the identifier space with
/// [`NodeId`] so the same XOR metric applies to both.
pub type Key = [u8; ID_LENGTH];

/// A position on the region-aware ring: region in the top 16 bits, the
/// leading 48 bits of the node id below it.
pub type RingPosition = u64;

// ============================================================================
// Hashing Functions
// ============================================================================

/// Compute a 32-byte BLAKE3 digest of the input data.
fn blake3_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// Derive a stable [`NodeId`] by hashing arbitrary input with BLAKE3.
///
/// ```
/// use layered_dht::derive_node_id;
///
/// let node_id = derive_node_id(b"example-public-key-bytes");
/// assert_eq!(node_id.len(), 32);
/// ```
pub fn derive_node_id(data: &[u8]) -> NodeId {
    blake3_digest(data)
}

/// Map an application key (any byte string) into the DHT key space.
///
/// ```
/// use layered_dht::hash_key;
///
/// assert_eq!(hash_key(b"stream-1"), hash_key(b"stream-1"));
/// assert_ne!(hash_key(b"stream-1"), hash_key(b"stream-2"));
/// ```
pub fn hash_key(data: &[u8]) -> Key {
    blake3_digest(data)
}

/// Generate a uniformly random node id.
pub fn random_node_id() -> NodeId {
    let mut id = [0u8; ID_LENGTH];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Parse a node id from raw bytes, rejecting anything that is not exactly
/// [`ID_LENGTH`] bytes long.
pub fn node_id_from_slice(bytes: &[u8]) -> DhtResult<NodeId> {
    if bytes.len() != ID_LENGTH {
        return Err(DhtError::InvalidIdLength {
            expected: ID_LENGTH,
            actual: bytes.len(),
        });
    }
    let mut id = [0u8; ID_LENGTH];
    id.copy_from_slice(bytes);
    Ok(id)
}

/// Parse a hex encoded node id.
pub fn node_id_from_hex(hex_id: &str) -> DhtResult<NodeId> {
    let bytes = hex::decode(hex_id)
        .map_err(|err| DhtError::Config(format!("node id is not valid hex: {err}")))?;
    node_id_from_slice(&bytes)
}

/// Short hex rendering (first 8 bytes) used in log fields.
pub fn short_id(id: &NodeId) -> String {
    hex::encode(&id[..8])
}

/// The bitwise complement of an id: the point of the key space farthest
/// from `id`. Used to seed discovery of distant parts of the network.
pub fn complement_id(id: &NodeId) -> NodeId {
    let mut out = [0u8; ID_LENGTH];
    for (dst, src) in out.iter_mut().zip(id.iter()) {
        *dst = !*src;
    }
    out
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// Compute the XOR distance between two ids.
///
/// # Properties
/// - `xor_distance(a, a) == [0; 32]` (reflexive)
/// - `xor_distance(a, b) == xor_distance(b, a)` (symmetric)
/// - The result is compared with [`distance_cmp`] as a big-endian integer.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Compare two distances as big-endian unsigned integers.
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    for i in 0..32 {
        if a[i] < b[i] {
            return Ordering::Less;
        } else if a[i] > b[i] {
            return Ordering::Greater;
        }
    }
    Ordering::Equal
}

/// True when `candidate` is strictly closer to `target` than `reference`.
pub fn is_closer(candidate: &NodeId, reference: &NodeId, target: &NodeId) -> bool {
    distance_cmp(
        &xor_distance(candidate, target),
        &xor_distance(reference, target),
    ) == Ordering::Less
}

/// Ring position of a peer in the given region.
pub fn ring_position(region: u16, id: &NodeId) -> RingPosition {
    let mut raw = [0u8; 8];
    raw[..2].copy_from_slice(&region.to_be_bytes());
    raw[2..].copy_from_slice(&id[..6]);
    u64::from_be_bytes(raw)
}

/// Circular distance between two ring positions.
pub fn ring_distance(a: RingPosition, b: RingPosition) -> u64 {
    a.wrapping_sub(b).min(b.wrapping_sub(a))
}

/// Ring distance widened into the 32-byte distance representation so both
/// metrics can share the same sorted containers.
pub(crate) fn ring_distance_bytes(a: RingPosition, b: RingPosition) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&ring_distance(a, b).to_be_bytes());
    out
}

/// The metric a contact list or lookup orders candidates by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Metric {
    /// XOR distance to a node id or key.
    Xor(NodeId),
    /// Circular distance to a ring position.
    Ring(RingPosition),
}

impl Metric {
    /// Distance of `peer` from the metric's reference point.
    pub fn distance(&self, peer: &PeerDescriptor) -> [u8; 32] {
        match self {
            Metric::Xor(target) => xor_distance(&peer.node_id, target),
            Metric::Ring(position) => ring_distance_bytes(peer.ring_position(), *position),
        }
    }

    /// True when `peer` sits exactly on the reference point.
    pub fn is_reference(&self, peer: &PeerDescriptor) -> bool {
        match self {
            Metric::Xor(target) => &peer.node_id == target,
            Metric::Ring(position) => peer.ring_position() == *position,
        }
    }
}

// ============================================================================
// Peer Descriptors
// ============================================================================

/// Kind of runtime a peer runs in. Browser peers cannot accept inbound
/// connections, which collaborators may take into account.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[default]
    Native,
    Browser,
}

/// Everything needed to address a participant of the overlay.
///
/// Descriptors are immutable: an updated peer is represented by a new
/// descriptor replacing the old one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub node_id: NodeId,
    pub region: u16,
    pub endpoints: Vec<String>,
    pub node_type: NodeType,
}

impl PeerDescriptor {
    pub fn new(node_id: NodeId, region: u16) -> Self {
        Self {
            node_id,
            region,
            endpoints: Vec::new(),
            node_type: NodeType::Native,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = node_type;
        self
    }

    pub fn ring_position(&self) -> RingPosition {
        ring_position(self.region, &self.node_id)
    }

    pub fn short_id(&self) -> String {
        short_id(&self.node_id)
    }
}

// ============================================================================
// Stored Data
// ============================================================================

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A replicated key/value record.
///
/// Copies are keyed by `(key, creator)`: one creator overwrites its own
/// record, different creators coexist under the same key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub key: Key,
    pub value: Vec<u8>,
    pub creator: NodeId,
    /// Creation time assigned by the writer; newer copies win on upsert.
    pub created_at_ms: u64,
    /// Local time at which the answering node stored its copy.
    pub stored_at_ms: u64,
    pub ttl_ms: u64,
    /// Set when the holder is no longer among the closest nodes for the key.
    pub stale: bool,
    /// Tombstone left by a delete from the creator.
    pub deleted: bool,
    /// Peers known to hold this copy. Filled in when fetch results are merged.
    #[serde(default)]
    pub storers: Vec<PeerDescriptor>,
}

impl DataEntry {
    pub fn new(key: Key, value: Vec<u8>, creator: NodeId, ttl_ms: u64) -> Self {
        let now = now_ms();
        Self {
            key,
            value,
            creator,
            created_at_ms: now,
            stored_at_ms: now,
            ttl_ms,
            stale: false,
            deleted: false,
            storers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_key_is_deterministic() {
        let data = b"hello world";
        assert_eq!(hash_key(data), hash_key(data));
        assert_ne!(
            hash_key(data),
            hash_key(b"goodbye world"),
            "hashes of different data should differ"
        );
    }

    #[test]
    fn derive_node_id_matches_blake3_reference() {
        let data = b"public key bytes";
        let expected = blake3::hash(data);
        assert_eq!(
            &derive_node_id(data),
            expected.as_bytes(),
            "derive_node_id should produce the BLAKE3 digest"
        );
    }

    #[test]
    fn xor_distance_produces_expected_value() {
        let mut a = [0u8; 32];
        a[0] = 0b1010_1010;
        let mut b = [0u8; 32];
        b[0] = 0b0101_0101;

        let dist = xor_distance(&a, &b);
        assert_eq!(dist[0], 0b1111_1111);
        assert!(dist.iter().skip(1).all(|byte| *byte == 0));
    }

    #[test]
    fn xor_distance_is_symmetric_and_zero_on_self() {
        for _ in 0..64 {
            let a = random_node_id();
            let b = random_node_id();
            assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
            assert_eq!(xor_distance(&a, &a), [0u8; 32]);
        }
    }

    #[test]
    fn distance_cmp_orders_as_big_endian_integers() {
        let mut smaller = [0u8; 32];
        smaller[1] = 1;
        let mut larger = [0u8; 32];
        larger[1] = 2;
        let mut low_byte_only = [0u8; 32];
        low_byte_only[31] = 0xff;

        assert_eq!(distance_cmp(&smaller, &larger), Ordering::Less);
        assert_eq!(distance_cmp(&larger, &smaller), Ordering::Greater);
        assert_eq!(distance_cmp(&smaller, &smaller), Ordering::Equal);
        assert_eq!(distance_cmp(&low_byte_only, &smaller), Ordering::Less);
    }

    #[test]
    fn ring_distance_wraps_around() {
        assert_eq!(ring_distance(0, u64::MAX), 1);
        assert_eq!(ring_distance(u64::MAX, 0), 1);
        assert_eq!(ring_distance(10, 4), 6);
        assert_eq!(ring_distance(7, 7), 0);
    }

    #[test]
    fn ring_position_groups_by_region() {
        let id = [0xAB; 32];
        let near = ring_position(3, &id);
        let same_region = ring_position(3, &[0x00; 32]);
        let far_region = ring_position(9, &id);
        assert!(ring_distance(near, same_region) < ring_distance(near, far_region));
    }

    #[test]
    fn node_id_from_slice_rejects_wrong_length() {
        let err = node_id_from_slice(&[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            DhtError::InvalidIdLength {
                expected: 32,
                actual: 3
            }
        ));
        assert!(node_id_from_slice(&[7u8; 32]).is_ok());
    }

    #[test]
    fn complement_is_farthest_point() {
        let id = random_node_id();
        let distance = xor_distance(&id, &complement_id(&id));
        assert!(distance.iter().all(|b| *b == 0xff));
    }
}
