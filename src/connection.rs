use std::fmt;

use tokio::sync::oneshot;

use crate::{
    identity::{Capability, NodeId},
    transport::Transport,
};

bitflags::bitflags! {
    /// A connection always has exactly one provenance bit (dyn/static/inbound); `TRUSTED` is
    /// orthogonal and may be set by the coordinator after identity is known (spec.md §3).
    #[derive(Default)]
    pub struct ConnectionFlags: u8 {
        const DYN_DIALED    = 0b0001;
        const STATIC_DIALED = 0b0010;
        const INBOUND       = 0b0100;
        const TRUSTED       = 0b1000;
    }
}

impl ConnectionFlags {
    pub fn is_static_or_trusted(self) -> bool {
        self.contains(ConnectionFlags::STATIC_DIALED) || self.contains(ConnectionFlags::TRUSTED)
    }
}

/// The central synchronisation primitive between the Handshake Runner and the Coordinator
/// (spec.md §4.5): the runner sends a request to a gate carrying one of these, then blocks on the
/// paired receiver. The coordinator writes exactly one result, after performing any state
/// mutation the result implies, and moves on. Neither side ever sends twice.
pub struct Continuation<T> {
    tx: Option<oneshot::Sender<T>>,
}

impl<T> Continuation<T> {
    pub fn reply(mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            // A closed receiver means the runner gave up (e.g. it unblocked on `quit` first);
            // nothing to do.
            let _ = tx.send(value);
        }
    }
}

pub fn continuation_pair<T>() -> (Continuation<T>, oneshot::Receiver<T>) {
    let (tx, rx) = oneshot::channel();
    (Continuation { tx: Some(tx) }, rx)
}

/// An in-flight connection with its flags, negotiated identity, capabilities, and a bound
/// transport socket. Created by the Acceptor or Dial Scheduler; mutated by the Handshake Runner
/// as each phase completes; destroyed on rejection, failure, or peer drop (spec.md §3).
pub struct ConnectionRecord {
    /// Retained per spec.md §3's field list even though the handshake runner drives everything
    /// through `transport`; a sub-protocol runner that needs raw socket options (e.g. keepalive)
    /// reaches it here.
    pub socket_addr: Option<std::net::SocketAddr>,
    pub transport: Box<dyn Transport>,
    pub flags: ConnectionFlags,
    /// Set after the encryption handshake. `None` beforehand.
    pub identity: Option<NodeId>,
    /// Set after the protocol handshake.
    pub capabilities: Vec<Capability>,
    pub remote_name: Option<String>,
    /// If this connection was dialed targeting a specific identity, the expected identifier to
    /// verify against after the encryption handshake.
    pub dial_target: Option<NodeId>,
}

impl ConnectionRecord {
    pub fn new(transport: Box<dyn Transport>, flags: ConnectionFlags, dial_target: Option<NodeId>) -> Self {
        Self {
            socket_addr: None,
            transport,
            flags,
            identity: None,
            capabilities: Vec::new(),
            remote_name: None,
            dial_target,
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.identity
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("flags", &self.flags)
            .field("identity", &self.identity)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
