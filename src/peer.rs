use std::time::Instant;

use tokio::sync::mpsc;

use crate::{
    connection::ConnectionFlags,
    error::DisconnectReason,
    identity::{Capability, NodeId},
    transport::Transport,
};

/// Disconnect reasons a running peer can be asked to shut down with, delivered on its
/// disconnect-reason channel (spec.md §3 "Peer" lifecycle).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectRequest {
    Requested,
    Quitting,
}

impl From<DisconnectRequest> for DisconnectReason {
    fn from(r: DisconnectRequest) -> Self {
        match r {
            DisconnectRequest::Requested => DisconnectReason::Requested,
            DisconnectRequest::Quitting => DisconnectReason::Quitting,
        }
    }
}

/// A connection that has passed both handshakes and all admission checks, plus bound
/// sub-protocol state, a creation timestamp, and a disconnect reason channel. Created exactly
/// once upon admission; mutated only by its owning sub-protocol runner, which is external to this
/// crate (spec.md §3).
pub struct Peer {
    pub node_id: NodeId,
    pub flags: ConnectionFlags,
    pub capabilities: Vec<Capability>,
    pub name: String,
    pub created_at: Instant,
    disconnect_tx: mpsc::Sender<DisconnectRequest>,
}

impl Peer {
    pub fn new(
        node_id: NodeId,
        flags: ConnectionFlags,
        capabilities: Vec<Capability>,
        name: String,
    ) -> (Self, mpsc::Receiver<DisconnectRequest>) {
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        (
            Self {
                node_id,
                flags,
                capabilities,
                name,
                created_at: Instant::now(),
                disconnect_tx,
            },
            disconnect_rx,
        )
    }

    /// Best-effort: if the peer runner has already exited, the channel is closed and this is a
    /// no-op. The core does not kill peer runners (spec.md §5).
    pub async fn disconnect(&self, reason: DisconnectRequest) {
        let _ = self.disconnect_tx.send(reason).await;
    }

    pub fn is_trusted(&self) -> bool {
        self.flags.contains(ConnectionFlags::TRUSTED)
    }

    pub fn is_static_dialed(&self) -> bool {
        self.flags.contains(ConnectionFlags::STATIC_DIALED)
    }

    /// Whether this peer counts against `MaxPeers` (spec.md §3 peer-map invariant).
    pub fn counts_against_cap(&self) -> bool {
        !self.is_trusted() && !self.is_static_dialed()
    }
}

/// Sent on `delpeer` when a peer runner returns (spec.md §4.1).
pub struct PeerDropped {
    pub node_id: NodeId,
    pub error: Option<String>,
    pub remote_requested: bool,
}

/// Spawns the external sub-protocol runner for a newly admitted peer (spec.md §1 "Sub-protocol
/// runners ... out of scope; §6 specifies only their interfaces"). The coordinator calls this
/// synchronously at the moment of admission, after the peer-map insert and before the gate-2
/// continuation is written, so the runner launch is ordered correctly with respect to both
/// (spec.md §4.1, §5 "Ordering guarantees").
pub trait PeerRunnerSpawner: Send + Sync {
    fn spawn(
        &self,
        peer_info: PeerInfo,
        transport: Box<dyn Transport>,
        disconnect_rx: mpsc::Receiver<DisconnectRequest>,
        delpeer_tx: mpsc::Sender<PeerDropped>,
    );
}

/// A sub-protocol runner stand-in that does nothing but wait for a disconnect request and report
/// back. Exercises the full admission/map/event lifecycle in tests without implementing any real
/// application protocol (spec.md §1 non-goal: "serving application-level protocols").
pub struct NoopPeerRunnerSpawner;

impl PeerRunnerSpawner for NoopPeerRunnerSpawner {
    fn spawn(
        &self,
        peer_info: PeerInfo,
        _transport: Box<dyn Transport>,
        mut disconnect_rx: mpsc::Receiver<DisconnectRequest>,
        delpeer_tx: mpsc::Sender<PeerDropped>,
    ) {
        tokio::spawn(async move {
            let reason = disconnect_rx.recv().await;
            let _ = delpeer_tx
                .send(PeerDropped {
                    node_id: peer_info.node_id,
                    error: reason.map(|r| DisconnectReason::from(r).to_string()),
                    remote_requested: false,
                })
                .await;
        });
    }
}

/// Observational snapshot returned by `Peers()`/`PeersInfo()`.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub name: String,
    pub capabilities: Vec<Capability>,
    pub inbound: bool,
    pub trusted: bool,
    pub static_dialed: bool,
    pub connected_since_secs: u64,
}

impl From<&Peer> for PeerInfo {
    fn from(peer: &Peer) -> Self {
        Self {
            node_id: peer.node_id,
            name: peer.name.clone(),
            capabilities: peer.capabilities.clone(),
            inbound: peer.flags.contains(ConnectionFlags::INBOUND),
            trusted: peer.is_trusted(),
            static_dialed: peer.is_static_dialed(),
            connected_since_secs: peer.created_at.elapsed().as_secs(),
        }
    }
}
