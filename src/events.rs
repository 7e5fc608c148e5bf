use crate::identity::NodeId;

/// Emitted by the server on peer add and peer drop (spec.md §6 `SubscribeEvents`). Per-message
/// events are optional and not implemented by this core; only the two coarse events are emitted.
#[derive(Clone, Debug)]
pub enum Event {
    PeerAdded { peer_id: NodeId },
    PeerDropped { peer_id: NodeId, error: Option<String> },
}
