use std::sync::{Arc, Mutex};

use log::*;
use tokio::sync::mpsc;

use crate::{
    config::Config,
    connection::{continuation_pair, ConnectionRecord},
    error::{DisconnectReason, HandshakeError},
    gate::{AddPeerRequest, PostHandshakeRequest},
    identity::NodeId,
    persistence::{NodeObservation, PersistenceSink},
    shutdown::ShutdownSignal,
};

const LOG_TARGET: &str = "overlay_net::handshake";

/// Shared, read-only context handed to every Handshake Runner task (spec.md §4.2). `running` is
/// the mutex-guarded flag the runner consults at step 1 to refuse work after stop (spec.md §5).
pub struct HandshakeContext {
    pub config: Arc<Config>,
    pub self_id: NodeId,
    pub running: Arc<Mutex<bool>>,
    pub posthandshake_tx: mpsc::Sender<PostHandshakeRequest>,
    pub addpeer_tx: mpsc::Sender<AddPeerRequest>,
    pub persistence: Option<Arc<dyn PersistenceSink>>,
    pub quit: ShutdownSignal,
}

/// Outcome of a failed run: the error plus the connection to close, when the runner still owns
/// it. Once checkpoint 2 has handed the connection to the coordinator, there is nothing left to
/// close here — the coordinator closes it on rejection.
type StepResult<T> = Result<T, (HandshakeError, Option<ConnectionRecord>)>;

/// Drives a single connection through the encryption handshake, checkpoint 1, the protocol
/// handshake, and checkpoint 2, exactly as laid out in spec.md §4.2. Every failure closes the
/// socket with an appropriate reason and terminates; nothing here ever panics the caller.
pub async fn run(conn: ConnectionRecord, ctx: Arc<HandshakeContext>) {
    if let Err((err, maybe_conn)) = run_inner(conn, &ctx).await {
        debug!(target: LOG_TARGET, "Handshake ended: {}", err);
        if let Some(mut conn) = maybe_conn {
            let reason = match &err {
                HandshakeError::Rejected(r) => Some(r.to_string()),
                HandshakeError::ServerStopped => Some(DisconnectReason::ServerStopped.to_string()),
                HandshakeError::EncHandshakeFailed(m) | HandshakeError::ProtoHandshakeFailed(m) => Some(m.clone()),
                HandshakeError::RemoteTooManyPeers => Some("remote reported too many peers".to_string()),
            };
            let identity = conn.identity;
            conn.transport.close(reason, identity).await;
        }
    }
}

async fn run_inner(mut conn: ConnectionRecord, ctx: &Arc<HandshakeContext>) -> StepResult<()> {
    // Step 1: refuse new work if the server is stopping.
    if !*ctx.running.lock().unwrap() {
        return Err((HandshakeError::ServerStopped, Some(conn)));
    }

    // Step 2: encryption handshake.
    let identity = match conn.transport.do_enc_handshake(&ctx.config.private_key, conn.dial_target).await {
        Ok(id) => id,
        Err(msg) => return Err((HandshakeError::EncHandshakeFailed(msg), Some(conn))),
    };
    conn.identity = Some(identity);

    // Step 3: verify identity against the dial target, if any.
    if let Some(target) = conn.dial_target {
        if target != identity {
            return Err((HandshakeError::Rejected(DisconnectReason::UnexpectedIdentity), Some(conn)));
        }
    }

    // Step 4: checkpoint 1.
    let (continuation, reply_rx) = continuation_pair();
    let request = PostHandshakeRequest {
        identity,
        flags: conn.flags,
        continuation,
    };
    if let Err(()) = send_checkpoint(ctx.posthandshake_tx.send(request), &ctx.quit).await {
        return Err((HandshakeError::ServerStopped, Some(conn)));
    }
    match recv_checkpoint(reply_rx, &ctx.quit).await {
        None => return Err((HandshakeError::ServerStopped, Some(conn))),
        Some(Err(reason)) => return Err((HandshakeError::Rejected(reason), Some(conn))),
        Some(Ok(flags)) => conn.flags = flags,
    }

    // Step 5: protocol handshake.
    let proto_result = conn
        .transport
        .do_proto_handshake(&ctx.config.name, &ctx.config.protocols, identity)
        .await;
    let proto = match proto_result {
        Ok(proto) => proto,
        Err(err) if err.to_lowercase().contains("too many peers") => {
            // Special case from spec.md §4.2: a too-many-peers disconnect from the remote is
            // recorded via the persistence hook before closing.
            if let Some(sink) = &ctx.persistence {
                sink.record_node_meta_info(
                    identity,
                    fnv1a(identity.as_bytes()),
                    conn.dial_target.is_some(),
                    conn.dial_target.is_none(),
                    true,
                )
                .await;
            }
            return Err((HandshakeError::RemoteTooManyPeers, Some(conn)));
        },
        Err(err) => return Err((HandshakeError::ProtoHandshakeFailed(err), Some(conn))),
    };

    // Step 6: verify protocol handshake identity matches the encryption-handshake identity.
    if proto.remote_identity != identity {
        return Err((HandshakeError::Rejected(DisconnectReason::UnexpectedIdentity), Some(conn)));
    }

    // Step 7: write-through observational metadata. Never blocks the coordinator: this call runs
    // on the handshake runner's own task.
    if let Some(sink) = &ctx.persistence {
        sink.record_node_info(
            identity,
            NodeObservation {
                id_hash: fnv1a(identity.as_bytes()),
                last_connected: chrono::Utc::now(),
                first_seen: chrono::Utc::now(),
                remote_addr: conn.socket_addr.map(|a| a.to_string()),
                local_tcp_port: None,
                remote_tcp_port: conn.socket_addr.map(|a| a.port()),
                capabilities: proto.remote_capabilities.clone(),
                remote_name: Some(proto.remote_name.clone()),
            },
        )
        .await;
    }

    // Step 8: record capabilities and name on the connection.
    conn.capabilities = proto.remote_capabilities;
    conn.remote_name = Some(proto.remote_name);

    // Step 9: checkpoint 2. From here on, `conn` belongs to the coordinator; on rejection the
    // coordinator closes it, not us.
    let (continuation, reply_rx) = continuation_pair();
    let request = AddPeerRequest { conn, continuation };
    if let Err(()) = send_checkpoint(ctx.addpeer_tx.send(request), &ctx.quit).await {
        return Err((HandshakeError::ServerStopped, None));
    }
    match recv_checkpoint(reply_rx, &ctx.quit).await {
        None => Err((HandshakeError::ServerStopped, None)),
        Some(Err(reason)) => Err((HandshakeError::Rejected(reason), None)),
        Some(Ok(())) => Ok(()),
    }
}

async fn send_checkpoint<T>(
    send: impl std::future::Future<Output = Result<(), mpsc::error::SendError<T>>>,
    quit: &ShutdownSignal,
) -> Result<(), ()> {
    let mut quit = quit.clone();
    tokio::select! {
        res = send => res.map_err(|_| ()),
        _ = quit.wait() => Err(()),
    }
}

async fn recv_checkpoint<T>(recv: tokio::sync::oneshot::Receiver<T>, quit: &ShutdownSignal) -> Option<T> {
    let mut quit = quit.clone();
    tokio::select! {
        res = recv => res.ok(),
        _ = quit.wait() => None,
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
