use std::{collections::HashSet, net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    identity::{Capability, Contact, NodeId},
};

/// A CIDR-style allow/deny entry. Kept deliberately simple (exact address or "any"); a real
/// deployment would plug in a proper CIDR matcher here, as the original net-restriction config
/// does via its own address-matcher collaborator.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NetFilter {
    Any,
    Exact(std::net::IpAddr),
}

impl NetFilter {
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            NetFilter::Any => true,
            NetFilter::Exact(ip) => &addr.ip() == ip,
        }
    }
}

/// Immutable run parameters for the server. Constructed once at `Start()` and never mutated
/// afterwards; the static node set and trusted set are snapshotted into the coordinator and dial
/// scheduler at construction time (the static set subsequently mutates via `AddPeer`/`RemovePeer`,
/// the trusted set never does, per spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Our own node private key. Required; the public-derived identifier is our `Self()`.
    pub private_key: Vec<u8>,
    /// Human readable client name, exchanged during the protocol handshake.
    pub name: String,
    /// Sub-protocols this node supports.
    pub protocols: Vec<Capability>,

    /// Maximum number of non-trusted, non-static-dialed peers. Must be > 0 unless `no_max_peers`.
    pub max_peers: usize,
    /// Bypass the peer cap entirely.
    pub no_max_peers: bool,
    /// Maximum number of outbound dial tasks in flight at once.
    pub max_dial: usize,
    /// Inbound handshake slots. `max_accept_conns`/`max_pending_peers`; the larger wins.
    pub max_accept_conns: usize,
    pub max_pending_peers: usize,

    pub no_discovery: bool,
    pub discovery_v5: bool,
    pub discovery_v5_addr: Option<SocketAddr>,
    pub no_dial: bool,

    /// Empty disables listening entirely.
    pub listen_addr: Option<SocketAddr>,

    pub bootstrap_nodes: Vec<Contact>,
    pub static_nodes: Vec<Contact>,
    pub trusted_nodes: HashSet<NodeId>,

    pub net_restrict: Option<Vec<NetFilter>>,
    pub blacklist: Option<Vec<NetFilter>>,

    pub node_database: Option<String>,

    /// Port-mapper descriptor (spec.md §6 `NAT`). NAT traversal itself is an external
    /// collaborator out of scope for this core (spec.md §1); this field is carried through
    /// config purely so the binary that wires up a real port-mapper has somewhere to read its
    /// configuration from.
    pub nat: Option<String>,

    /// Outbound dial timeout. Default 15s per spec.md §5.
    pub dial_timeout: Duration,

    pub enable_msg_events: bool,
    /// Persistence sink connection string, if any.
    pub persistence_dsn: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            private_key: Vec::new(),
            name: "overlay-net/0.1.0".to_string(),
            protocols: Vec::new(),
            max_peers: 25,
            no_max_peers: false,
            max_dial: 16,
            max_accept_conns: 50,
            max_pending_peers: 50,
            no_discovery: false,
            discovery_v5: false,
            discovery_v5_addr: None,
            no_dial: false,
            listen_addr: None,
            bootstrap_nodes: Vec::new(),
            static_nodes: Vec::new(),
            trusted_nodes: HashSet::new(),
            net_restrict: None,
            blacklist: None,
            node_database: None,
            nat: None,
            dial_timeout: Duration::from_secs(15),
            enable_msg_events: false,
            persistence_dsn: None,
        }
    }
}

impl Config {
    /// Validates the documented required fields. Run once at `Start()`; a configuration error
    /// here means the server never transitions to running (spec.md §7).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.private_key.is_empty() {
            return Err(ConfigError::MissingPrivateKey);
        }
        if !self.no_max_peers && self.max_peers == 0 {
            return Err(ConfigError::MaxPeersZero);
        }
        Ok(())
    }

    /// The larger of `max_accept_conns`/`max_pending_peers` wins, per spec.md §6.
    pub fn accept_slot_count(&self) -> usize {
        self.max_accept_conns.max(self.max_pending_peers)
    }

    /// Target dynamic-peer count the dial scheduler aims for: `max_dial` when discovery is
    /// enabled, else zero (spec.md §4.4).
    pub fn dial_target(&self) -> usize {
        if self.no_discovery {
            0
        } else {
            self.max_dial
        }
    }
}
