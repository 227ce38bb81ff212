//! Bounded contact containers.
//!
//! [`SortedContactList`] keeps contacts ordered by a [`Metric`] and evicts the
//! farthest member when a strictly closer contact arrives. It backs the nearby
//! list, the ring list and the candidate sets of every lookup.
//! [`RandomContactList`] keeps a uniformly mixed sample of the network.
//!
//! Mutations return the membership changes they caused, in the order they
//! happened (an eviction is always reported before the addition that caused
//! it), so owners can turn them into events.

use std::collections::HashSet;

use rand::seq::{IteratorRandom, SliceRandom};
use rand::Rng;

use crate::core::{Metric, NodeId, PeerDescriptor};

/// Anything that can be stored in a contact list.
pub trait ContactLike: Clone {
    fn descriptor(&self) -> &PeerDescriptor;

    fn contact_id(&self) -> NodeId {
        self.descriptor().node_id
    }
}

impl ContactLike for PeerDescriptor {
    fn descriptor(&self) -> &PeerDescriptor {
        self
    }
}

/// Membership change caused by a list mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContactListChange<C> {
    Added(C),
    Removed(C),
}

#[derive(Clone, Debug)]
struct ListEntry<C> {
    contact: C,
    distance: [u8; 32],
    contacted: bool,
    active: bool,
}

/// Contacts ordered by distance from a reference point, closest first.
#[derive(Clone, Debug)]
pub struct SortedContactList<C> {
    metric: Metric,
    owner: Option<NodeId>,
    max_size: usize,
    excluded: HashSet<NodeId>,
    entries: Vec<ListEntry<C>>,
}

impl<C: ContactLike> SortedContactList<C> {
    pub fn new(metric: Metric, max_size: usize) -> Self {
        Self {
            metric,
            owner: None,
            max_size,
            excluded: HashSet::new(),
            entries: Vec::new(),
        }
    }

    /// Never accept a contact with the owner's id.
    pub fn with_owner(mut self, owner: NodeId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Never accept any of these ids.
    pub fn with_excluded(mut self, excluded: HashSet<NodeId>) -> Self {
        self.excluded = excluded;
        self
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &NodeId) -> Option<&C> {
        self.position(id).map(|idx| &self.entries[idx].contact)
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.contact.contact_id() == *id)
    }

    /// Insert `contact` at its sorted position.
    ///
    /// Self, excluded and duplicate contacts are ignored. When the list is
    /// full the contact is kept only if it is strictly closer than the
    /// current farthest member, which is evicted.
    pub fn add_contact(&mut self, contact: C) -> Vec<ContactListChange<C>> {
        let id = contact.contact_id();
        if self.owner == Some(id) || self.excluded.contains(&id) || self.contains(&id) {
            return Vec::new();
        }
        if self.max_size == 0 {
            return Vec::new();
        }
        let distance = self.metric.distance(contact.descriptor());
        let mut changes = Vec::new();
        if self.entries.len() >= self.max_size {
            let farthest = match self.entries.last() {
                Some(entry) => entry.distance,
                None => return changes,
            };
            if distance >= farthest {
                return changes;
            }
            if let Some(evicted) = self.entries.pop() {
                changes.push(ContactListChange::Removed(evicted.contact));
            }
        }
        let idx = self.entries.partition_point(|entry| entry.distance < distance);
        self.entries.insert(
            idx,
            ListEntry {
                contact: contact.clone(),
                distance,
                contacted: false,
                active: false,
            },
        );
        changes.push(ContactListChange::Added(contact));
        changes
    }

    pub fn remove_contact(&mut self, id: &NodeId) -> Option<C> {
        self.position(id)
            .map(|idx| self.entries.remove(idx).contact)
    }

    /// Up to `limit` closest contacts.
    pub fn closest(&self, limit: usize) -> Vec<C> {
        self.entries
            .iter()
            .take(limit)
            .map(|entry| entry.contact.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<C> {
        self.closest(self.entries.len())
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.entries
            .iter()
            .map(|entry| entry.contact.contact_id())
            .collect()
    }

    /// Distance of the closest member.
    pub fn closest_distance(&self) -> Option<[u8; 32]> {
        self.entries.first().map(|entry| entry.distance)
    }

    /// Distance of the farthest member.
    pub fn farthest_distance(&self) -> Option<[u8; 32]> {
        self.entries.last().map(|entry| entry.distance)
    }

    pub fn set_contacted(&mut self, id: &NodeId) {
        if let Some(idx) = self.position(id) {
            self.entries[idx].contacted = true;
        }
    }

    pub fn set_active(&mut self, id: &NodeId) {
        if let Some(idx) = self.position(id) {
            self.entries[idx].active = true;
        }
    }

    /// Up to `limit` closest contacts that have not been contacted yet.
    pub fn uncontacted(&self, limit: usize) -> Vec<C> {
        self.entries
            .iter()
            .filter(|entry| !entry.contacted)
            .take(limit)
            .map(|entry| entry.contact.clone())
            .collect()
    }

    /// Up to `limit` closest contacts that answered.
    pub fn active(&self, limit: usize) -> Vec<C> {
        self.entries
            .iter()
            .filter(|entry| entry.active)
            .take(limit)
            .map(|entry| entry.contact.clone())
            .collect()
    }

    pub fn clear(&mut self) -> Vec<C> {
        self.entries.drain(..).map(|entry| entry.contact).collect()
    }
}

/// Probability that a full random list swaps one member for a newcomer.
pub const RANDOM_LIST_ACCEPT_PROBABILITY: f64 = 0.2;

/// A bounded, randomly refreshed sample of contacts.
#[derive(Clone, Debug)]
pub struct RandomContactList<C> {
    owner: NodeId,
    max_size: usize,
    accept_probability: f64,
    contacts: Vec<C>,
}

impl<C: ContactLike> RandomContactList<C> {
    pub fn new(owner: NodeId, max_size: usize) -> Self {
        Self {
            owner,
            max_size,
            accept_probability: RANDOM_LIST_ACCEPT_PROBABILITY,
            contacts: Vec::new(),
        }
    }

    pub fn with_accept_probability(mut self, probability: f64) -> Self {
        self.accept_probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.contacts.iter().any(|c| c.contact_id() == *id)
    }

    pub fn add_contact(&mut self, contact: C) -> Vec<ContactListChange<C>> {
        let id = contact.contact_id();
        if id == self.owner || self.contains(&id) || self.max_size == 0 {
            return Vec::new();
        }
        let mut changes = Vec::new();
        if self.contacts.len() >= self.max_size {
            let mut rng = rand::thread_rng();
            if !rng.gen_bool(self.accept_probability) {
                return changes;
            }
            let victim = rng.gen_range(0..self.contacts.len());
            changes.push(ContactListChange::Removed(self.contacts.swap_remove(victim)));
        }
        self.contacts.push(contact.clone());
        changes.push(ContactListChange::Added(contact));
        changes
    }

    pub fn remove_contact(&mut self, id: &NodeId) -> Option<C> {
        let idx = self.contacts.iter().position(|c| c.contact_id() == *id)?;
        Some(self.contacts.swap_remove(idx))
    }

    /// Up to `limit` members chosen uniformly at random.
    pub fn random(&self, limit: usize) -> Vec<C> {
        let mut rng = rand::thread_rng();
        let mut picked: Vec<C> = self
            .contacts
            .iter()
            .cloned()
            .choose_multiple(&mut rng, limit);
        picked.shuffle(&mut rng);
        picked
    }

    pub fn all(&self) -> Vec<C> {
        self.contacts.clone()
    }

    pub fn clear(&mut self) -> Vec<C> {
        std::mem::take(&mut self.contacts)
    }
}
