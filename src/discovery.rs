use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::identity::{Contact, NodeId};

/// Contract for the UDP-based node discovery collaborator (spec.md §4.6). The core only ever
/// asks it to resolve a candidate address for an identifier and to report our own identity; the
/// Kademlia-style lookup machinery itself lives entirely outside this crate.
#[async_trait]
pub trait DiscoveryTable: Send + Sync {
    fn set_fallback_nodes(&self, bootstrap: Vec<Contact>);
    fn self_id(&self) -> NodeId;
    async fn resolve(&self, id: NodeId) -> Option<Contact>;
    /// Hands back the next unvisited candidate discovered so far, if any, for the dial
    /// scheduler's discovery-task code path (spec.md §4.4 "dynamic candidates ... in first-seen
    /// order").
    async fn next_candidate(&self) -> Option<Contact>;
    async fn close(&self);
}

/// A discovery stand-in that resolves only from a fixed bootstrap list, with no real lookup
/// machinery. Sufficient to drive the dial scheduler's discovery-task code path in tests; not a
/// production discovery implementation (spec.md §1 explicitly keeps real discovery out of scope).
pub struct StaticDiscoveryTable {
    self_id: NodeId,
    candidates: Mutex<VecDeque<Contact>>,
}

impl StaticDiscoveryTable {
    pub fn new(self_id: NodeId, bootstrap: Vec<Contact>) -> Self {
        Self {
            self_id,
            candidates: Mutex::new(bootstrap.into()),
        }
    }

    pub fn push_candidate(&self, contact: Contact) {
        self.candidates.lock().unwrap().push_back(contact);
    }
}

#[async_trait]
impl DiscoveryTable for StaticDiscoveryTable {
    fn set_fallback_nodes(&self, bootstrap: Vec<Contact>) {
        let mut guard = self.candidates.lock().unwrap();
        for contact in bootstrap {
            if !guard.iter().any(|c| c.id == contact.id) {
                guard.push_back(contact);
            }
        }
    }

    fn self_id(&self) -> NodeId {
        self.self_id
    }

    async fn resolve(&self, id: NodeId) -> Option<Contact> {
        self.candidates.lock().unwrap().iter().find(|c| c.id == id).copied()
    }

    async fn next_candidate(&self) -> Option<Contact> {
        self.candidates.lock().unwrap().pop_front()
    }

    async fn close(&self) {}
}
