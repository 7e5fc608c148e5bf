use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::identity::{Capability, NodeId};

/// Observational metadata about a node, written through to the persistence sink after each
/// handshake (spec.md §3 "Known-node record"). `local_tcp_port`/`remote_tcp_port` resolve the
/// duplicate-key JSON schema issue flagged as an open question in spec.md §9.
#[derive(Clone, Debug, Serialize)]
pub struct NodeObservation {
    pub id_hash: u64,
    pub last_connected: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    pub remote_addr: Option<String>,
    pub local_tcp_port: Option<u16>,
    pub remote_tcp_port: Option<u16>,
    pub capabilities: Vec<Capability>,
    pub remote_name: Option<String>,
}

/// Write-only hooks exposed by the core to the persistence collaborator (spec.md §4.6). Never
/// called from the coordinator task directly — handshake runners call these on their own task so
/// a slow or failing sink cannot stall coordination (spec.md §7 "Persistence errors").
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn record_node_meta_info(
        &self,
        id: NodeId,
        id_hash: u64,
        did_dial: bool,
        did_accept: bool,
        too_many_peers: bool,
    );

    async fn record_node_info(&self, id: NodeId, observation: NodeObservation);
}

/// The sink collaborator "may be absent" (spec.md §4.6); this no-op satisfies the trait when no
/// real sink is configured.
pub struct NoopPersistenceSink;

#[async_trait]
impl PersistenceSink for NoopPersistenceSink {
    async fn record_node_meta_info(
        &self,
        _id: NodeId,
        _id_hash: u64,
        _did_dial: bool,
        _did_accept: bool,
        _too_many_peers: bool,
    ) {
    }

    async fn record_node_info(&self, _id: NodeId, _observation: NodeObservation) {}
}
