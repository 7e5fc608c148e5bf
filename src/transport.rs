use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::{Capability, NodeId};

/// Per-frame read/write deadlines applied inside the transport (spec.md §5).
pub const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const FRAME_WRITE_TIMEOUT: Duration = Duration::from_secs(20);

/// A raw duplex byte stream, boxed so the coordinator/acceptor/dialer don't need to be generic
/// over the concrete socket type. Production deployments plug in a real TCP (or other) socket;
/// tests use an in-memory duplex pipe.
pub type BoxedTransportSocket = Box<dyn TransportSocket>;

pub trait TransportSocket: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> TransportSocket for T {}

/// The result of the protocol handshake: the remote's declared identity, capabilities, name, and
/// the wall-clock time the first frame was received (spec.md §4.2 step 5).
pub struct ProtocolHandshakeOutput {
    pub remote_identity: NodeId,
    pub remote_capabilities: Vec<Capability>,
    pub remote_name: String,
    pub first_frame_at: std::time::Instant,
}

/// Declared by spec.md §4.6: a bound transport instance performs the encryption handshake, then
/// the protocol handshake, and exposes framed read/write plus `close`. The concrete cryptographic
/// implementation is an external collaborator; this crate only depends on the contract.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs the encryption handshake. `dial_target`, if set, is the identity we expect to
    /// find on the other end (outbound dials with a known target).
    async fn do_enc_handshake(&mut self, private_key: &[u8], dial_target: Option<NodeId>) -> Result<NodeId, String>;

    /// Performs the protocol handshake, exchanging capabilities and name.
    async fn do_proto_handshake(
        &mut self,
        our_name: &str,
        our_capabilities: &[Capability],
        expected_identity: NodeId,
    ) -> Result<ProtocolHandshakeOutput, String>;

    /// Framed read/write, available once both handshakes complete. The sub-protocol runner
    /// (external, spec.md §1) uses these; the core itself never calls them.
    async fn read_frame(&mut self) -> Result<Vec<u8>, String>;
    async fn write_frame(&mut self, data: &[u8]) -> Result<(), String>;

    async fn close(&mut self, reason: Option<String>, identity: Option<NodeId>);
}

/// Factory contract: `newTransport(socket) -> Transport` from spec.md §4.6.
pub trait TransportFactory: Send + Sync {
    fn new_transport(&self, socket: BoxedTransportSocket) -> Box<dyn Transport>;
}

/// Socket factory contract used by the dial scheduler to open outbound connections
/// (`Dialer` in spec.md §6's config surface; defaults to a 15s-timeout TCP dialer).
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: std::net::SocketAddr, timeout: Duration) -> Result<BoxedTransportSocket, String>;
}

/// Default TCP dialer with a configurable connect timeout.
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: std::net::SocketAddr, timeout: Duration) -> Result<BoxedTransportSocket, String> {
        let fut = tokio::net::TcpStream::connect(addr);
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(stream)) => Ok(Box::new(stream)),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err("dial timed out".to_string()),
        }
    }
}

#[cfg(any(test, feature = "test-mocks"))]
pub mod mock {
    //! A scripted `Transport` used by tests to exercise the coordination logic without a real
    //! cryptographic handshake. Each `MockTransport` is pre-loaded with the outcome it should
    //! produce at each phase, mirroring the teacher's in-memory transport test doubles.

    use std::time::Instant;

    use super::*;

    pub enum Outcome<T> {
        Ok(T),
        Err(String),
    }

    pub struct MockTransport {
        pub enc_outcome: Option<Outcome<NodeId>>,
        pub proto_outcome: Option<Outcome<(NodeId, Vec<Capability>, String)>>,
    }

    impl MockTransport {
        pub fn new(enc: Outcome<NodeId>, proto: Outcome<(NodeId, Vec<Capability>, String)>) -> Self {
            Self {
                enc_outcome: Some(enc),
                proto_outcome: Some(proto),
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn do_enc_handshake(
            &mut self,
            _private_key: &[u8],
            _dial_target: Option<NodeId>,
        ) -> Result<NodeId, String> {
            match self.enc_outcome.take() {
                Some(Outcome::Ok(id)) => Ok(id),
                Some(Outcome::Err(e)) => Err(e),
                None => Err("enc handshake already consumed".to_string()),
            }
        }

        async fn do_proto_handshake(
            &mut self,
            _our_name: &str,
            _our_capabilities: &[Capability],
            _expected_identity: NodeId,
        ) -> Result<ProtocolHandshakeOutput, String> {
            match self.proto_outcome.take() {
                Some(Outcome::Ok((id, caps, name))) => Ok(ProtocolHandshakeOutput {
                    remote_identity: id,
                    remote_capabilities: caps,
                    remote_name: name,
                    first_frame_at: Instant::now(),
                }),
                Some(Outcome::Err(e)) => Err(e),
                None => Err("proto handshake already consumed".to_string()),
            }
        }

        async fn read_frame(&mut self) -> Result<Vec<u8>, String> {
            Err("mock transport does not support framed I/O".to_string())
        }

        async fn write_frame(&mut self, _data: &[u8]) -> Result<(), String> {
            Err("mock transport does not support framed I/O".to_string())
        }

        async fn close(&mut self, _reason: Option<String>, _identity: Option<NodeId>) {}
    }
}
