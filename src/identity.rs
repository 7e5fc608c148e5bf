// Copyright 2019, The Tari Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Length in bytes of a node identifier, derived from an elliptic-curve public key.
pub const NODE_ID_LEN: usize = 64;

/// Opaque handle naming a remote node. Equality is byte-equality; ordering is the lexicographic
/// order of the hex encoding, which is what `PeersInfo`/`KnownNodes` sort by.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(#[serde(with = "hex_bytes")] pub [u8; NODE_ID_LEN]);

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::NODE_ID_LEN;

    pub fn serialize<S: Serializer>(bytes: &[u8; NODE_ID_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; NODE_ID_LEN], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let mut out = [0u8; NODE_ID_LEN];
        if v.len() != NODE_ID_LEN {
            return Err(serde::de::Error::custom(format!(
                "expected {} bytes, got {}",
                NODE_ID_LEN,
                v.len()
            )));
        }
        out.copy_from_slice(&v);
        Ok(out)
    }
}

impl NodeId {
    /// The all-zero identifier, returned by `Server::self_id()` when the server isn't running and
    /// there is no discovery-table identity to report (spec.md §6 "`Self()` ... returns the
    /// discovery-table self or a zeroed node if not running").
    pub const ZERO: NodeId = NodeId([0u8; NODE_ID_LEN]);

    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Generates a random identifier. Intended for tests and local key generation stand-ins; the
    /// real key derivation lives in the cryptographic transport collaborator.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Truncated identifier used in log lines, mirroring `NodeId::short_str()` conventions from
    /// the connection-manager crate this core is modelled on.
    pub fn short_str(&self) -> String {
        let full = self.to_hex();
        full[..12].to_string()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short_str())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_str())
    }
}

/// A (name, version) pair naming a sub-protocol a peer advertises support for.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub version: u32,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// A node identifier paired with the address it can be reached at. Static/bootstrap node
/// configuration and discovery resolution deal in contacts; the peer map and admission logic
/// deal in bare `NodeId`s once a connection is established.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub addr: std::net::SocketAddr,
}

/// Returns true if `ours` and `theirs` share at least one capability by name. Version is
/// advisory only here; sub-protocol runners negotiate the exact version themselves.
pub fn shares_capability(ours: &[Capability], theirs: &[Capability]) -> bool {
    ours.iter().any(|c| theirs.iter().any(|o| o.name == c.name))
}
