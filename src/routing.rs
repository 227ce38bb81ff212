//! Kademlia k-bucket table.
//!
//! 256 buckets, one per bit position of the XOR distance to the local id.
//! Buckets prefer long-lived contacts: a full bucket only admits a newcomer
//! after its oldest member failed a liveness ping.

use crate::contact::{ContactLike, ContactListChange};
use crate::core::{distance_cmp, xor_distance, NodeId};

pub const BUCKET_COUNT: usize = 256;

/// Index of the bucket `other` belongs to: the position of the first bit in
/// which it differs from `self_id`. Bucket 0 holds the most distant half of
/// the key space.
pub fn bucket_index(self_id: &NodeId, other: &NodeId) -> usize {
    let dist = xor_distance(self_id, other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    BUCKET_COUNT - 1
}

#[derive(Debug, Clone)]
struct Bucket<C> {
    /// Oldest first, most recently seen last.
    contacts: Vec<C>,
}

/// Result of offering a contact to the table.
#[derive(Debug, Clone)]
pub enum BucketTouchOutcome<C> {
    Inserted,
    Refreshed,
    /// The bucket is full. The caller should ping `oldest` and report back
    /// through [`KBucketTable::apply_ping_result`].
    Full(PendingBucketUpdate<C>),
    /// The contact was the local node.
    Ignored,
}

/// A full-bucket decision waiting for the oldest member's ping result.
#[derive(Debug, Clone)]
pub struct PendingBucketUpdate<C> {
    bucket_index: usize,
    pub oldest: C,
    pub new_contact: C,
}

impl<C: ContactLike> Bucket<C> {
    fn touch(&mut self, contact: C, k: usize, bucket_index: usize) -> BucketTouchOutcome<C> {
        let id = contact.contact_id();
        if let Some(pos) = self.contacts.iter().position(|c| c.contact_id() == id) {
            let existing = self.contacts.remove(pos);
            self.contacts.push(existing);
            return BucketTouchOutcome::Refreshed;
        }
        if self.contacts.len() < k {
            self.contacts.push(contact);
            return BucketTouchOutcome::Inserted;
        }
        match self.contacts.first().cloned() {
            Some(oldest) => BucketTouchOutcome::Full(PendingBucketUpdate {
                bucket_index,
                oldest,
                new_contact: contact,
            }),
            None => BucketTouchOutcome::Ignored,
        }
    }

    fn refresh(&mut self, id: &NodeId) -> bool {
        match self.contacts.iter().position(|c| &c.contact_id() == id) {
            Some(pos) => {
                let existing = self.contacts.remove(pos);
                self.contacts.push(existing);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<C> {
        let pos = self.contacts.iter().position(|c| &c.contact_id() == id)?;
        Some(self.contacts.remove(pos))
    }
}

#[derive(Debug, Clone)]
pub struct KBucketTable<C> {
    self_id: NodeId,
    k: usize,
    buckets: Vec<Bucket<C>>,
}

impl<C: ContactLike> KBucketTable<C> {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let buckets = (0..BUCKET_COUNT)
            .map(|_| Bucket {
                contacts: Vec::new(),
            })
            .collect();
        Self {
            self_id,
            k,
            buckets,
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Add a new contact or refresh a known one.
    pub fn touch(&mut self, contact: C) -> BucketTouchOutcome<C> {
        let id = contact.contact_id();
        if id == self.self_id {
            return BucketTouchOutcome::Ignored;
        }
        let idx = bucket_index(&self.self_id, &id);
        self.buckets[idx].touch(contact, self.k, idx)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx]
            .contacts
            .iter()
            .any(|c| &c.contact_id() == id)
    }

    pub fn get(&self, id: &NodeId) -> Option<C> {
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx]
            .contacts
            .iter()
            .find(|c| &c.contact_id() == id)
            .cloned()
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<C> {
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].remove(id)
    }

    /// Up to `limit` contacts closest to `target`.
    pub fn closest(&self, target: &NodeId, limit: usize) -> Vec<C> {
        let mut all = self.all();
        all.sort_by(|a, b| {
            let da = xor_distance(&a.contact_id(), target);
            let db = xor_distance(&b.contact_id(), target);
            distance_cmp(&da, &db)
        });
        all.truncate(limit);
        all
    }

    pub fn all(&self) -> Vec<C> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.contacts.is_empty())
    }

    /// Resolve a full-bucket decision.
    ///
    /// A live oldest member is refreshed and the newcomer dropped. A dead one
    /// is replaced by the newcomer. Returns the resulting membership changes.
    pub fn apply_ping_result(
        &mut self,
        pending: PendingBucketUpdate<C>,
        oldest_alive: bool,
    ) -> Vec<ContactListChange<C>> {
        let k = self.k;
        let bucket = &mut self.buckets[pending.bucket_index];
        if oldest_alive {
            bucket.refresh(&pending.oldest.contact_id());
            return Vec::new();
        }
        let mut changes = Vec::new();
        if let Some(removed) = bucket.remove(&pending.oldest.contact_id()) {
            changes.push(ContactListChange::Removed(removed));
        }
        let new_id = pending.new_contact.contact_id();
        let already_present = bucket.contacts.iter().any(|c| c.contact_id() == new_id);
        if !already_present && bucket.contacts.len() < k {
            bucket.contacts.push(pending.new_contact.clone());
            changes.push(ContactListChange::Added(pending.new_contact));
        }
        changes
    }

    pub fn clear(&mut self) -> Vec<C> {
        self.buckets
            .iter_mut()
            .flat_map(|b| b.contacts.drain(..))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PeerDescriptor;

    fn peer_in_bucket(bucket: usize, tag: u8) -> PeerDescriptor {
        // Differ from the zero id first at bit `bucket`, then tag the last byte.
        let mut id = [0u8; 32];
        id[bucket / 8] = 0x80 >> (bucket % 8);
        id[31] |= tag;
        PeerDescriptor::new(id, 0)
    }

    #[test]
    fn bucket_index_finds_first_different_bit() {
        let base = [0u8; 32];
        let mut other = [0u8; 32];
        other[0] = 0b1000_0000;
        assert_eq!(bucket_index(&base, &other), 0);

        let mut other = [0u8; 32];
        other[1] = 0b0001_0000;
        assert_eq!(bucket_index(&base, &other), 11);

        assert_eq!(bucket_index(&base, &base), 255);
    }

    #[test]
    fn ignores_self() {
        let mut table = KBucketTable::new([0u8; 32], 2);
        assert!(matches!(
            table.touch(PeerDescriptor::new([0u8; 32], 0)),
            BucketTouchOutcome::Ignored
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn full_bucket_keeps_live_oldest() {
        let mut table = KBucketTable::new([0u8; 32], 2);
        table.touch(peer_in_bucket(3, 1));
        table.touch(peer_in_bucket(3, 2));
        let pending = match table.touch(peer_in_bucket(3, 4)) {
            BucketTouchOutcome::Full(pending) => pending,
            other => panic!("expected full bucket, got {other:?}"),
        };
        assert_eq!(pending.oldest, peer_in_bucket(3, 1));

        let changes = table.apply_ping_result(pending, true);
        assert!(changes.is_empty());
        assert!(table.contains(&peer_in_bucket(3, 1).node_id));
        assert!(!table.contains(&peer_in_bucket(3, 4).node_id));
    }

    #[test]
    fn full_bucket_replaces_dead_oldest() {
        let mut table = KBucketTable::new([0u8; 32], 2);
        table.touch(peer_in_bucket(3, 1));
        table.touch(peer_in_bucket(3, 2));
        let BucketTouchOutcome::Full(pending) = table.touch(peer_in_bucket(3, 4)) else {
            panic!("expected full bucket");
        };

        let changes = table.apply_ping_result(pending, false);
        assert_eq!(
            changes,
            vec![
                ContactListChange::Removed(peer_in_bucket(3, 1)),
                ContactListChange::Added(peer_in_bucket(3, 4)),
            ]
        );
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn closest_sorts_across_buckets() {
        let mut table = KBucketTable::new([0u8; 32], 4);
        for bucket in [0, 8, 100, 200] {
            table.touch(peer_in_bucket(bucket, 0));
        }
        let target = peer_in_bucket(200, 0).node_id;
        let closest = table.closest(&target, 2);
        assert_eq!(closest[0].node_id, target);
        assert_eq!(closest.len(), 2);
    }
}
