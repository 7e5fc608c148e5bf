use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use log::*;
use tokio::sync::{broadcast, mpsc};

use crate::{
    admission::check_admission,
    config::Config,
    connection::{ConnectionFlags, ConnectionRecord},
    discovery::DiscoveryTable,
    error::DisconnectReason,
    events::Event,
    gate::{AddPeerRequest, PostHandshakeRequest},
    handshake::{self, HandshakeContext},
    identity::{shares_capability, Contact, NodeId},
    peer::{DisconnectRequest, Peer, PeerDropped, PeerInfo, PeerRunnerSpawner},
    scheduler::{DialScheduler, Task, TaskOutcome},
    shutdown::ShutdownSignal,
    transport::{Dialer, TransportFactory},
};

const LOG_TARGET: &str = "overlay_net::coordinator";

/// A read-only inspection closure delivered over `peerOp` (spec.md §4.1). The coordinator invokes
/// it with a `&` reference to the live peer map and discards the boxed closure afterwards; callers
/// never see the map itself.
pub struct PeerOpRequest {
    op: Box<dyn FnOnce(&HashMap<NodeId, Peer>) + Send>,
}

/// Sends `f` over `peer_op_tx` and awaits its result. Returns `None` if the coordinator has
/// already exited (channel closed) — callers treat this the same as an empty/zero read, matching
/// `Peers()`/`PeerCount()`'s documented shutdown behaviour (spec.md §6).
pub async fn peer_op<R, F>(peer_op_tx: &mpsc::Sender<PeerOpRequest>, f: F) -> Option<R>
where
    F: FnOnce(&HashMap<NodeId, Peer>) -> R + Send + 'static,
    R: Send + 'static,
{
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    let request = PeerOpRequest {
        op: Box::new(move |peers| {
            let _ = reply_tx.send(f(peers));
        }),
    };
    if peer_op_tx.send(request).await.is_err() {
        return None;
    }
    reply_rx.await.ok()
}

/// Senders for the coordinator's channel table (spec.md §4.1). Cloned freely by `Server` and
/// handed to Handshake Runners and task workers; the coordinator itself owns the matching
/// receivers.
#[derive(Clone)]
pub struct Handles {
    pub addstatic_tx: mpsc::Sender<Contact>,
    pub removestatic_tx: mpsc::Sender<NodeId>,
    pub peer_op_tx: mpsc::Sender<PeerOpRequest>,
    pub posthandshake_tx: mpsc::Sender<PostHandshakeRequest>,
    pub addpeer_tx: mpsc::Sender<AddPeerRequest>,
    pub taskdone_tx: mpsc::Sender<(Task, TaskOutcome)>,
    pub delpeer_tx: mpsc::Sender<PeerDropped>,
}

/// The sole mutator of the peer map (spec.md §4.1). Everything else reaches it only through the
/// channels captured in `Handles`.
pub struct Coordinator {
    config: Arc<Config>,
    self_id: NodeId,
    peers: HashMap<NodeId, Peer>,
    scheduler: DialScheduler,
    running_dials: usize,
    queued_tasks: Vec<Task>,

    dialer: Arc<dyn Dialer>,
    transport_factory: Arc<dyn TransportFactory>,
    discovery: Arc<dyn DiscoveryTable>,
    peer_runner_spawner: Arc<dyn PeerRunnerSpawner>,
    handshake_ctx: Arc<HandshakeContext>,
    events: broadcast::Sender<Event>,
    running: Arc<Mutex<bool>>,
    quit: ShutdownSignal,

    addstatic_rx: mpsc::Receiver<Contact>,
    removestatic_rx: mpsc::Receiver<NodeId>,
    peer_op_rx: mpsc::Receiver<PeerOpRequest>,
    posthandshake_rx: mpsc::Receiver<PostHandshakeRequest>,
    addpeer_rx: mpsc::Receiver<AddPeerRequest>,
    taskdone_rx: mpsc::Receiver<(Task, TaskOutcome)>,
    delpeer_rx: mpsc::Receiver<PeerDropped>,
    taskdone_tx: mpsc::Sender<(Task, TaskOutcome)>,
    delpeer_tx: mpsc::Sender<PeerDropped>,
}

/// The receiving halves of the channel table, kept apart from `Handles` so callers can build a
/// `HandshakeContext` out of the sender halves before the `Coordinator` itself exists (the
/// context and the coordinator need each other's handles).
pub struct Receivers {
    addstatic_rx: mpsc::Receiver<Contact>,
    removestatic_rx: mpsc::Receiver<NodeId>,
    peer_op_rx: mpsc::Receiver<PeerOpRequest>,
    posthandshake_rx: mpsc::Receiver<PostHandshakeRequest>,
    addpeer_rx: mpsc::Receiver<AddPeerRequest>,
    taskdone_rx: mpsc::Receiver<(Task, TaskOutcome)>,
    delpeer_rx: mpsc::Receiver<PeerDropped>,
}

#[allow(clippy::too_many_arguments)]
impl Coordinator {
    /// Builds the channel table (spec.md §4.1). `max_dial` sizes `taskdone` so completing dial
    /// tasks never block on a momentarily busy coordinator (spec.md §5); every other channel is
    /// unbuffered (capacity 1).
    pub fn channels(max_dial: usize) -> (Handles, Receivers) {
        let (addstatic_tx, addstatic_rx) = mpsc::channel(1);
        let (removestatic_tx, removestatic_rx) = mpsc::channel(1);
        let (peer_op_tx, peer_op_rx) = mpsc::channel(1);
        let (posthandshake_tx, posthandshake_rx) = mpsc::channel(1);
        let (addpeer_tx, addpeer_rx) = mpsc::channel(1);
        let (taskdone_tx, taskdone_rx) = mpsc::channel(max_dial.max(1));
        let (delpeer_tx, delpeer_rx) = mpsc::channel(1);

        let handles = Handles {
            addstatic_tx,
            removestatic_tx,
            peer_op_tx,
            posthandshake_tx,
            addpeer_tx,
            taskdone_tx,
            delpeer_tx,
        };
        let receivers = Receivers {
            addstatic_rx,
            removestatic_rx,
            peer_op_rx,
            posthandshake_rx,
            addpeer_rx,
            taskdone_rx,
            delpeer_rx,
        };
        (handles, receivers)
    }

    pub fn new(
        config: Arc<Config>,
        self_id: NodeId,
        scheduler: DialScheduler,
        dialer: Arc<dyn Dialer>,
        transport_factory: Arc<dyn TransportFactory>,
        discovery: Arc<dyn DiscoveryTable>,
        peer_runner_spawner: Arc<dyn PeerRunnerSpawner>,
        handshake_ctx: Arc<HandshakeContext>,
        events: broadcast::Sender<Event>,
        running: Arc<Mutex<bool>>,
        quit: ShutdownSignal,
        handles: Handles,
        receivers: Receivers,
    ) -> Self {
        Self {
            config,
            self_id,
            peers: HashMap::new(),
            scheduler,
            running_dials: 0,
            queued_tasks: Vec::new(),
            dialer,
            transport_factory,
            discovery,
            peer_runner_spawner,
            handshake_ctx,
            events,
            running,
            quit,
            addstatic_rx: receivers.addstatic_rx,
            removestatic_rx: receivers.removestatic_rx,
            peer_op_rx: receivers.peer_op_rx,
            posthandshake_rx: receivers.posthandshake_rx,
            addpeer_rx: receivers.addpeer_rx,
            taskdone_rx: receivers.taskdone_rx,
            delpeer_rx: receivers.delpeer_rx,
            taskdone_tx: handles.taskdone_tx,
            delpeer_tx: handles.delpeer_tx,
        }
    }

    /// Runs the coordinator loop until `quit` fires, then drains the peer map to empty before
    /// returning (spec.md §4.1 "Shutdown").
    pub async fn run(mut self) {
        self.schedule_tasks().await;

        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut quit = self.quit.clone();

        loop {
            tokio::select! {
                biased;

                _ = quit.wait() => {
                    break;
                },
                Some(contact) = self.addstatic_rx.recv() => {
                    self.scheduler.add_static(contact);
                    self.schedule_tasks().await;
                },
                Some(id) = self.removestatic_rx.recv() => {
                    self.scheduler.remove_static(&id);
                    // Static-set mutation precedes the disconnect call (spec.md §5 "Ordering
                    // guarantees").
                    if let Some(peer) = self.peers.get(&id) {
                        peer.disconnect(DisconnectRequest::Requested).await;
                    }
                },
                Some(request) = self.peer_op_rx.recv() => {
                    (request.op)(&self.peers);
                },
                Some(request) = self.posthandshake_rx.recv() => {
                    self.handle_posthandshake(request);
                },
                Some(request) = self.addpeer_rx.recv() => {
                    self.handle_addpeer(request).await;
                },
                Some((task, outcome)) = self.taskdone_rx.recv() => {
                    self.running_dials = self.running_dials.saturating_sub(1);
                    self.scheduler.task_done(&task, outcome, Instant::now());
                    self.schedule_tasks().await;
                },
                Some(dropped) = self.delpeer_rx.recv() => {
                    self.handle_delpeer(dropped);
                    self.schedule_tasks().await;
                },
                _ = ticker.tick() => {
                    self.schedule_tasks().await;
                },
            }
        }

        self.shutdown_sequence(quit).await;
    }

    fn handle_posthandshake(&self, request: PostHandshakeRequest) {
        let mut flags = request.flags;
        // Trusted elevation happens before the cap check (spec.md §4.1 "Trusted elevation").
        if self.config.trusted_nodes.contains(&request.identity) {
            flags.insert(ConnectionFlags::TRUSTED);
        }
        match check_admission(
            &self.peers,
            self.self_id,
            request.identity,
            flags,
            self.config.max_peers,
            self.config.no_max_peers,
        ) {
            Ok(()) => request.continuation.reply(Ok(flags)),
            Err(reason) => request.continuation.reply(Err(reason)),
        }
    }

    async fn handle_addpeer(&mut self, request: AddPeerRequest) {
        let AddPeerRequest { mut conn, continuation } = request;
        let identity = match conn.identity {
            Some(id) => id,
            None => {
                continuation.reply(Err(DisconnectReason::UnexpectedIdentity));
                conn.transport
                    .close(Some(DisconnectReason::UnexpectedIdentity.to_string()), None)
                    .await;
                return;
            },
        };

        if !shares_capability(&self.config.protocols, &conn.capabilities) {
            continuation.reply(Err(DisconnectReason::UselessPeer));
            conn.transport
                .close(Some(DisconnectReason::UselessPeer.to_string()), Some(identity))
                .await;
            return;
        }

        // Gate 2 re-runs the gate-1 checks because the peer set may have changed between gates
        // (spec.md §4.1).
        if let Err(reason) = check_admission(
            &self.peers,
            self.self_id,
            identity,
            conn.flags,
            self.config.max_peers,
            self.config.no_max_peers,
        ) {
            continuation.reply(Err(reason));
            conn.transport.close(Some(reason.to_string()), Some(identity)).await;
            return;
        }

        let ConnectionRecord {
            transport,
            flags,
            capabilities,
            remote_name,
            ..
        } = conn;
        let name = remote_name.unwrap_or_default();
        let (peer, disconnect_rx) = Peer::new(identity, flags, capabilities, name);
        self.peers.insert(identity, peer);
        let peer_info = PeerInfo::from(self.peers.get(&identity).expect("just inserted"));

        // Peer-map insert and peer-runner launch both precede the continuation reply (spec.md §5
        // "Ordering guarantees"): by the time the runner wakes, inspection queries already observe
        // the new peer.
        self.peer_runner_spawner
            .spawn(peer_info, transport, disconnect_rx, self.delpeer_tx.clone());
        continuation.reply(Ok(()));

        let _ = self.events.send(Event::PeerAdded { peer_id: identity });
    }

    fn handle_delpeer(&mut self, dropped: PeerDropped) {
        self.peers.remove(&dropped.node_id);
        debug!(target: LOG_TARGET, "Peer {} dropped: {:?}", dropped.node_id, dropped.error);
        let _ = self.events.send(Event::PeerDropped {
            peer_id: dropped.node_id,
            error: dropped.error,
        });
    }

    /// Drains queued tasks, asks the scheduler for fresh proposals, and launches as many as
    /// `MaxDial` permits; the remainder is queued for the next iteration (spec.md §4.1
    /// "Scheduling of dial tasks").
    async fn schedule_tasks(&mut self) {
        if self.config.no_dial {
            return;
        }

        let mut tasks = std::mem::take(&mut self.queued_tasks);
        let now = Instant::now();
        let mut fresh = self.scheduler.new_tasks(self.running_dials, &self.peers, now).await;
        tasks.append(&mut fresh);

        let mut remaining = Vec::new();
        for task in tasks {
            if self.running_dials < self.config.max_dial {
                self.running_dials += 1;
                self.spawn_task(task);
            } else {
                remaining.push(task);
            }
        }
        self.queued_tasks = remaining;
    }

    fn spawn_task(&self, task: Task) {
        let taskdone_tx = self.taskdone_tx.clone();
        match task {
            Task::Dial { contact, flags } => {
                let dialer = self.dialer.clone();
                let transport_factory = self.transport_factory.clone();
                let dial_timeout = self.config.dial_timeout;
                let ctx = self.handshake_ctx.clone();
                tokio::spawn(async move {
                    match dialer.dial(contact.addr, dial_timeout).await {
                        Ok(socket) => {
                            let _ = taskdone_tx
                                .send((Task::Dial { contact, flags }, TaskOutcome::DialSucceeded))
                                .await;
                            let transport = transport_factory.new_transport(socket);
                            let mut conn = ConnectionRecord::new(transport, flags, Some(contact.id));
                            conn.socket_addr = Some(contact.addr);
                            handshake::run(conn, ctx).await;
                        },
                        Err(err) => {
                            let structured = crate::error::ConnectionManagerError::DialFailed {
                                node_id: contact.id,
                                reason: err.clone(),
                            };
                            debug!(target: LOG_TARGET, "{}", structured);
                            let _ = taskdone_tx
                                .send((Task::Dial { contact, flags }, TaskOutcome::DialFailed(err)))
                                .await;
                        },
                    }
                });
            },
            Task::Discovery => {
                tokio::spawn(async move {
                    let _ = taskdone_tx.send((Task::Discovery, TaskOutcome::DiscoveryCompleted)).await;
                });
            },
        }
    }

    /// Stops accepting new items, closes discovery, disconnects every current peer with
    /// `Quitting`, then drains `delpeer` until the map is empty (spec.md §4.1 "Shutdown").
    async fn shutdown_sequence(mut self, _quit: ShutdownSignal) {
        *self.running.lock().unwrap() = false;
        self.discovery.close().await;

        // Fan the quitting notice out to every current peer concurrently rather than one at a
        // time, so a slow or stalled peer runner's disconnect channel doesn't delay the rest.
        let disconnects = self.peers.values().map(|peer| peer.disconnect(DisconnectRequest::Quitting));
        futures::future::join_all(disconnects).await;

        // Drain delpeer (plus any late posthandshake/addpeer requests, which now race `quit` and
        // self-destruct on the runner side) until every peer has reported dropped.
        while !self.peers.is_empty() {
            tokio::select! {
                Some(dropped) = self.delpeer_rx.recv() => {
                    self.handle_delpeer(dropped);
                },
                Some(request) = self.posthandshake_rx.recv() => {
                    request.continuation.reply(Err(DisconnectReason::ServerStopped));
                },
                Some(request) = self.addpeer_rx.recv() => {
                    let AddPeerRequest { mut conn, continuation } = request;
                    continuation.reply(Err(DisconnectReason::ServerStopped));
                    let identity = conn.identity;
                    conn.transport
                        .close(Some(DisconnectReason::ServerStopped.to_string()), identity)
                        .await;
                },
                else => break,
            }
        }

        info!(target: LOG_TARGET, "Coordinator shut down with {} peers remaining", self.peers.len());
    }
}
