use std::collections::HashMap;

use crate::{
    connection::ConnectionFlags,
    error::DisconnectReason,
    identity::NodeId,
    peer::Peer,
};

/// Ordered admission checks shared by both handshake gates (spec.md §4.1 "Admission checks").
/// Pure function over the current peer map so it can be unit tested and reused by gate 1 and
/// gate 2 without duplicating the ordering.
pub fn check_admission(
    peers: &HashMap<NodeId, Peer>,
    self_id: NodeId,
    candidate: NodeId,
    flags: ConnectionFlags,
    max_peers: usize,
    no_max_peers: bool,
) -> Result<(), DisconnectReason> {
    if !flags.is_static_or_trusted() && !no_max_peers {
        let current = peers.values().filter(|p| p.counts_against_cap()).count();
        if current >= max_peers {
            return Err(DisconnectReason::TooManyPeers);
        }
    }

    if peers.contains_key(&candidate) {
        return Err(DisconnectReason::AlreadyConnected);
    }

    if candidate == self_id {
        return Err(DisconnectReason::SelfConnection);
    }

    Ok(())
}
