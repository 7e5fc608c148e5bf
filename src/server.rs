use std::{
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex},
};

use log::*;
use tokio::sync::{broadcast, Mutex};

use crate::{
    acceptor::Acceptor,
    backoff::Backoff,
    config::Config,
    coordinator::{peer_op, Coordinator, Handles},
    discovery::DiscoveryTable,
    error::{ConnectionManagerError, ServerError},
    events::Event,
    handshake::HandshakeContext,
    identity::{Capability, Contact, NodeId},
    peer::{PeerInfo, PeerRunnerSpawner},
    persistence::PersistenceSink,
    scheduler::DialScheduler,
    shutdown::Shutdown,
    transport::{Dialer, TransportFactory},
};

const LOG_TARGET: &str = "overlay_net::server";

/// Observational snapshot returned by `NodeInfo()` (spec.md §6). `version` additionally reports
/// the crate's semantic version, mirroring the teacher's `NodeNetworkInfo` metadata (SPEC_FULL.md
/// §6).
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    pub version: String,
    pub protocols: Vec<Capability>,
    pub listen_addr: Option<SocketAddr>,
}

struct RunningState {
    handles: Handles,
    shutdown: Shutdown,
    coordinator_task: tokio::task::JoinHandle<()>,
    acceptor_task: tokio::task::JoinHandle<Result<(), ConnectionManagerError>>,
}

/// The public Control API (spec.md §6). Constructed once with its collaborators; `Start`/`Stop`
/// may be called repeatedly, each pairing spinning up and tearing down one Coordinator/Acceptor
/// generation.
pub struct Server {
    config: Arc<Config>,
    self_id: NodeId,
    dialer: Arc<dyn Dialer>,
    transport_factory: Arc<dyn TransportFactory>,
    discovery: Arc<dyn DiscoveryTable>,
    persistence: Option<Arc<dyn PersistenceSink>>,
    peer_runner_spawner: Arc<dyn PeerRunnerSpawner>,
    backoff: Arc<dyn Backoff>,
    events_tx: broadcast::Sender<Event>,
    running: Arc<StdMutex<bool>>,
    state: Mutex<Option<RunningState>>,
}

#[allow(clippy::too_many_arguments)]
impl Server {
    pub fn new(
        config: Config,
        self_id: NodeId,
        dialer: Arc<dyn Dialer>,
        transport_factory: Arc<dyn TransportFactory>,
        discovery: Arc<dyn DiscoveryTable>,
        persistence: Option<Arc<dyn PersistenceSink>>,
        peer_runner_spawner: Arc<dyn PeerRunnerSpawner>,
        backoff: Arc<dyn Backoff>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            config: Arc::new(config),
            self_id,
            dialer,
            transport_factory,
            discovery,
            persistence,
            peer_runner_spawner,
            backoff,
            events_tx,
            running: Arc::new(StdMutex::new(false)),
            state: Mutex::new(None),
        }
    }

    /// Idempotent-failure: returns `AlreadyRunning` rather than restarting (spec.md §6).
    pub async fn start(&self) -> Result<(), ServerError> {
        self.config.validate()?;

        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ServerError::ConnectionManager(ConnectionManagerError::AlreadyRunning));
        }

        *self.running.lock().unwrap() = true;

        let shutdown = Shutdown::new();
        let quit = shutdown.to_signal();

        self.discovery.set_fallback_nodes(self.config.bootstrap_nodes.clone());

        let scheduler = DialScheduler::new(
            self.config.static_nodes.clone(),
            self.config.dial_target(),
            self.config.net_restrict.clone(),
            self.config.blacklist.clone(),
            self.discovery.clone(),
            self.backoff.clone(),
        );

        let (handles, receivers) = Coordinator::channels(self.config.max_dial);

        let handshake_ctx = Arc::new(HandshakeContext {
            config: self.config.clone(),
            self_id: self.self_id,
            running: self.running.clone(),
            posthandshake_tx: handles.posthandshake_tx.clone(),
            addpeer_tx: handles.addpeer_tx.clone(),
            persistence: self.persistence.clone(),
            quit: quit.clone(),
        });

        let acceptor = Acceptor::new(self.config.clone(), self.transport_factory.clone());
        let acceptor_ctx = handshake_ctx.clone();
        let acceptor_task = tokio::spawn(acceptor.run(acceptor_ctx));

        let coordinator = Coordinator::new(
            self.config.clone(),
            self.self_id,
            scheduler,
            self.dialer.clone(),
            self.transport_factory.clone(),
            self.discovery.clone(),
            self.peer_runner_spawner.clone(),
            handshake_ctx,
            self.events_tx.clone(),
            self.running.clone(),
            quit,
            handles.clone(),
            receivers,
        );
        let coordinator_task = tokio::spawn(coordinator.run());

        *state = Some(RunningState {
            handles,
            shutdown,
            coordinator_task,
            acceptor_task,
        });

        info!(target: LOG_TARGET, "Started with identity {}", self.self_id);
        Ok(())
    }

    /// Blocks until the coordinator, listener, and all peer runners finish, then closes
    /// persistence (spec.md §6). A no-op if not running.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            return;
        };

        running.shutdown.trigger();

        if let Err(err) = running.coordinator_task.await {
            warn!(target: LOG_TARGET, "Coordinator task panicked during shutdown: {}", err);
        }
        match running.acceptor_task.await {
            Ok(Err(err)) => warn!(target: LOG_TARGET, "Acceptor exited with error: {}", err),
            Err(err) => warn!(target: LOG_TARGET, "Acceptor task panicked during shutdown: {}", err),
            Ok(Ok(())) => {},
        }

        self.discovery.close().await;
        info!(target: LOG_TARGET, "Stopped");
    }

    /// Enqueues to the static-set channel; idempotent, non-blocking under shutdown. Returns
    /// `NotRunning` if the server has never been started or has already been stopped.
    pub async fn add_peer(&self, contact: Contact) -> Result<(), ConnectionManagerError> {
        match self.state.lock().await.as_ref() {
            Some(state) => {
                let _ = state.handles.addstatic_tx.send(contact).await;
                Ok(())
            },
            None => Err(ConnectionManagerError::NotRunning),
        }
    }

    /// Enqueues to the static-set channel; non-blocking under shutdown. Returns `NotRunning` if
    /// the server has never been started or has already been stopped.
    pub async fn remove_peer(&self, id: NodeId) -> Result<(), ConnectionManagerError> {
        match self.state.lock().await.as_ref() {
            Some(state) => {
                let _ = state.handles.removestatic_tx.send(id).await;
                Ok(())
            },
            None => Err(ConnectionManagerError::NotRunning),
        }
    }

    /// During shutdown (or before `Start`) returns an empty list without blocking, per spec.md §6.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let tx = match self.state.lock().await.as_ref() {
            Some(state) => state.handles.peer_op_tx.clone(),
            None => return Vec::new(),
        };
        peer_op(&tx, |peers| peers.values().map(PeerInfo::from).collect())
            .await
            .unwrap_or_default()
    }

    pub async fn peer_count(&self) -> usize {
        let tx = match self.state.lock().await.as_ref() {
            Some(state) => state.handles.peer_op_tx.clone(),
            None => return 0,
        };
        peer_op(&tx, |peers| peers.len()).await.unwrap_or(0)
    }

    /// Returns the discovery-table self while running, or a zeroed node otherwise (spec.md §6).
    pub fn self_id(&self) -> NodeId {
        if *self.running.lock().unwrap() {
            self.discovery.self_id()
        } else {
            NodeId::ZERO
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.self_id,
            name: self.config.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocols: self.config.protocols.clone(),
            listen_addr: self.config.listen_addr,
        }
    }

    /// Sorted ascending by identifier string, per spec.md §6.
    pub async fn peers_info(&self) -> Vec<PeerInfo> {
        let mut peers = self.peers().await;
        peers.sort_by(|a, b| a.node_id.to_hex().cmp(&b.node_id.to_hex()));
        peers
    }

    /// Sorted ascending by identifier string, per spec.md §6. Known nodes beyond current peers
    /// live in the persistence collaborator, which this core does not query back (write-through
    /// hooks only, spec.md §4.6); this reports the nodes presently reachable from config.
    pub fn known_nodes(&self) -> Vec<Contact> {
        let mut nodes = self.config.static_nodes.clone();
        nodes.extend(self.config.bootstrap_nodes.clone());
        nodes.sort_by(|a, b| a.id.to_hex().cmp(&b.id.to_hex()));
        nodes.dedup_by(|a, b| a.id == b.id);
        nodes
    }
}
