use crate::{
    connection::{ConnectionFlags, ConnectionRecord, Continuation},
    error::DisconnectReason,
    identity::NodeId,
};

/// Gate 1 (`posthandshake`): sent after the encryption handshake, when the identifier is known
/// but capabilities are not yet. On success, the continuation carries back `flags` with the
/// `TRUSTED` bit set if applicable — trusted elevation happens before the cap check runs and must
/// be visible to the runner for gate 2 (spec.md §4.1 "Trusted elevation").
pub struct PostHandshakeRequest {
    pub identity: NodeId,
    pub flags: ConnectionFlags,
    pub continuation: Continuation<Result<ConnectionFlags, DisconnectReason>>,
}

/// Gate 2 (`addpeer`): sent after the protocol handshake. Carries the full connection, including
/// its socket, because on admission the coordinator hands it to a spawned peer runner.
pub struct AddPeerRequest {
    pub conn: ConnectionRecord,
    pub continuation: Continuation<Result<(), DisconnectReason>>,
}
