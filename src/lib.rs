//! Connection lifecycle engine for a peer-to-peer overlay network: dial scheduling, inbound
//! acceptance throttling, two-phase handshake checkpointing, and peer-set admission control under
//! a single-writer coordinator. The cryptographic transport, sub-protocol runners, node discovery,
//! and durable persistence are external collaborators; this crate depends only on their contracts
//! (see `transport`, `discovery`, `persistence`, `peer::PeerRunnerSpawner`).

pub mod acceptor;
pub mod admission;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod events;
pub mod gate;
pub mod handshake;
pub mod identity;
pub mod peer;
pub mod persistence;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use config::Config;
pub use error::ServerError;
pub use events::Event;
pub use identity::{Capability, Contact, NodeId};
pub use server::{NodeInfo, Server};
