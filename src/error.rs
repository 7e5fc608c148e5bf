use thiserror::Error;

use crate::identity::NodeId;

/// Errors returned from `Config::validate()` at `Start()`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MaxPeers must be greater than zero")]
    MaxPeersZero,
    #[error("PrivateKey is required")]
    MissingPrivateKey,
}

/// Structured admission rejection reasons, shared by both handshake gates. Each variant maps to
/// a wire-level disconnect reason sent to the remote before closing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum DisconnectReason {
    #[error("too many peers")]
    TooManyPeers,
    #[error("already connected")]
    AlreadyConnected,
    #[error("self connection")]
    SelfConnection,
    #[error("useless peer")]
    UselessPeer,
    #[error("unexpected identity")]
    UnexpectedIdentity,
    #[error("requested")]
    Requested,
    #[error("server stopped")]
    ServerStopped,
    #[error("quitting")]
    Quitting,
}

/// Errors encountered while driving a single connection through the handshake workflow.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("rejected: {0}")]
    Rejected(#[from] DisconnectReason),
    #[error("encryption handshake failed: {0}")]
    EncHandshakeFailed(String),
    #[error("protocol handshake failed: {0}")]
    ProtoHandshakeFailed(String),
    #[error("too many peers reported by remote")]
    RemoteTooManyPeers,
    #[error("server stopped")]
    ServerStopped,
}

/// Errors surfaced by the connection manager / coordinator plumbing.
#[derive(Debug, Error)]
pub enum ConnectionManagerError {
    #[error("listener bind failed: {0}")]
    ListenerBindFailed(String),
    #[error("dial failed for {node_id}: {reason}")]
    DialFailed { node_id: NodeId, reason: String },
    #[error("server is not running")]
    NotRunning,
    #[error("server is already running")]
    AlreadyRunning,
}

/// Top-level error returned from the public `Start()` API.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    ConnectionManager(#[from] ConnectionManagerError),
}
