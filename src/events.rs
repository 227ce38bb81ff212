//! Typed events published between components.
//!
//! All channels are `tokio::sync::broadcast`; a lagging subscriber loses the
//! oldest events rather than blocking the publisher.
//!
//! Emission order for one membership change in the peer manager:
//!
//! 1. a nearby-list eviction (`ContactRemoved`) before the addition that caused it
//!    (`NewContact`);
//! 2. a contact evicted from the nearby list is then offered to the random list
//!    (`NewRandomContact`, possibly preceded by `RandomContactRemoved`);
//! 3. `BucketEmpty` after the removal that emptied the k-bucket table.

use crate::core::PeerDescriptor;

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Membership changes of the peer manager's lists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerManagerEvent {
    /// A contact entered the nearby list. `closest` is a snapshot of the
    /// nearby list right after the insertion.
    NewContact {
        contact: PeerDescriptor,
        closest: Vec<PeerDescriptor>,
    },
    ContactRemoved {
        contact: PeerDescriptor,
        closest: Vec<PeerDescriptor>,
    },
    NewRandomContact(PeerDescriptor),
    RandomContactRemoved(PeerDescriptor),
    NewRingContact(PeerDescriptor),
    RingContactRemoved(PeerDescriptor),
    /// The last k-bucket member was removed.
    BucketEmpty,
}

/// Events surfaced to users of a [`crate::DhtNode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    NewContact(PeerDescriptor),
    ContactRemoved(PeerDescriptor),
    NewRandomContact(PeerDescriptor),
    RandomContactRemoved(PeerDescriptor),
    NewRingContact(PeerDescriptor),
    RingContactRemoved(PeerDescriptor),
    JoinCompleted,
    /// Every contact was lost and no entry points are configured, so the
    /// application has to call `join` again.
    ManualRejoinRequired,
}

impl PeerManagerEvent {
    /// The user-facing counterpart of this event, if any.
    pub fn to_node_event(&self) -> Option<NodeEvent> {
        match self {
            PeerManagerEvent::NewContact { contact, .. } => {
                Some(NodeEvent::NewContact(contact.clone()))
            }
            PeerManagerEvent::ContactRemoved { contact, .. } => {
                Some(NodeEvent::ContactRemoved(contact.clone()))
            }
            PeerManagerEvent::NewRandomContact(c) => Some(NodeEvent::NewRandomContact(c.clone())),
            PeerManagerEvent::RandomContactRemoved(c) => {
                Some(NodeEvent::RandomContactRemoved(c.clone()))
            }
            PeerManagerEvent::NewRingContact(c) => Some(NodeEvent::NewRingContact(c.clone())),
            PeerManagerEvent::RingContactRemoved(c) => {
                Some(NodeEvent::RingContactRemoved(c.clone()))
            }
            PeerManagerEvent::BucketEmpty => None,
        }
    }
}
