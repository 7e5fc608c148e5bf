use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use log::*;

use crate::{
    backoff::Backoff,
    config::NetFilter,
    connection::ConnectionFlags,
    discovery::DiscoveryTable,
    identity::{Contact, NodeId},
    peer::Peer,
};

const LOG_TARGET: &str = "overlay_net::scheduler";

/// A unit of outbound work (spec.md §4.4). A dial task connects to a specific node and hands the
/// resulting socket to the Handshake Runner with `DYN_DIALED` or `STATIC_DIALED`; a discovery
/// task performs a lookup to refresh the candidate pool.
#[derive(Debug, Clone)]
pub enum Task {
    Dial { contact: Contact, flags: ConnectionFlags },
    Discovery,
}

impl Task {
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Task::Dial { contact, .. } => Some(contact.id),
            Task::Discovery => None,
        }
    }
}

/// Reported back to the scheduler via `task_done`.
#[derive(Debug)]
pub enum TaskOutcome {
    DialSucceeded,
    DialFailed(String),
    DiscoveryCompleted,
}

struct Cooldown {
    attempts: usize,
    next_allowed: Instant,
}

/// Proposes dial tasks to maintain a target outbound population, prioritising static/bootstrap
/// nodes and respecting per-destination cooldowns (spec.md §4.4). Owned and driven exclusively by
/// the Coordinator; not shared across tasks.
pub struct DialScheduler {
    static_nodes: HashMap<NodeId, Contact>,
    dial_target: usize,
    net_restrict: Option<Vec<NetFilter>>,
    blacklist: Option<Vec<NetFilter>>,
    discovery: Arc<dyn DiscoveryTable>,
    backoff: Arc<dyn Backoff>,
    /// Destinations with a dial currently in flight, so they aren't proposed twice.
    dialing: HashSet<NodeId>,
    cooldowns: HashMap<NodeId, Cooldown>,
    discovery_in_flight: bool,
}

impl DialScheduler {
    pub fn new(
        static_nodes: Vec<Contact>,
        dial_target: usize,
        net_restrict: Option<Vec<NetFilter>>,
        blacklist: Option<Vec<NetFilter>>,
        discovery: Arc<dyn DiscoveryTable>,
        backoff: Arc<dyn Backoff>,
    ) -> Self {
        Self {
            static_nodes: static_nodes.into_iter().map(|c| (c.id, c)).collect(),
            dial_target,
            net_restrict,
            blacklist,
            discovery,
            backoff,
            dialing: HashSet::new(),
            cooldowns: HashMap::new(),
            discovery_in_flight: false,
        }
    }

    fn allowed(&self, contact: &Contact) -> bool {
        if let Some(allow) = &self.net_restrict {
            if !allow.iter().any(|f| f.matches(&contact.addr)) {
                return false;
            }
        }
        if let Some(deny) = &self.blacklist {
            if deny.iter().any(|f| f.matches(&contact.addr)) {
                return false;
            }
        }
        true
    }

    fn is_in_cooldown(&self, id: &NodeId, now: Instant) -> bool {
        self.cooldowns.get(id).map(|c| c.next_allowed > now).unwrap_or(false)
    }

    /// `newTasks(running, peers, now) -> [task]` from spec.md §4.4: given the number of currently
    /// in-flight dial tasks and the current peer set, propose new dial tasks to reach the target
    /// dynamic-peer count. Static nodes not currently connected are attempted first; dynamic
    /// candidates are then drawn from the discovery table in first-seen order, filtered by the
    /// allow/deny lists and by "currently connected"/"currently dialing".
    pub async fn new_tasks(&mut self, running: usize, peers: &HashMap<NodeId, Peer>, now: Instant) -> Vec<Task> {
        let mut tasks = Vec::new();

        let static_contacts: Vec<Contact> = self.static_nodes.values().copied().collect();
        for contact in static_contacts {
            if peers.contains_key(&contact.id) || self.dialing.contains(&contact.id) || self.is_in_cooldown(&contact.id, now) {
                continue;
            }
            tasks.push(Task::Dial {
                contact,
                flags: ConnectionFlags::STATIC_DIALED,
            });
        }

        let dynamic_connected = peers.values().filter(|p| p.flags.contains(ConnectionFlags::DYN_DIALED)).count();
        let wanted = self
            .dial_target
            .saturating_sub(dynamic_connected)
            .saturating_sub(running);

        let mut found = 0usize;
        // Bound the number of candidates we examine so an exhausted table can't spin forever.
        let probe_limit = wanted.saturating_mul(4).max(8);
        for _ in 0..probe_limit {
            if found >= wanted {
                break;
            }
            match self.discovery.next_candidate().await {
                Some(contact) => {
                    if peers.contains_key(&contact.id)
                        || self.dialing.contains(&contact.id)
                        || self.static_nodes.contains_key(&contact.id)
                        || self.is_in_cooldown(&contact.id, now)
                        || !self.allowed(&contact)
                    {
                        continue;
                    }
                    tasks.push(Task::Dial {
                        contact,
                        flags: ConnectionFlags::DYN_DIALED,
                    });
                    found += 1;
                },
                None => break,
            }
        }

        if found < wanted && !self.discovery_in_flight {
            debug!(target: LOG_TARGET, "Candidate pool low ({} found of {} wanted), scheduling a discovery lookup", found, wanted);
            tasks.push(Task::Discovery);
            self.discovery_in_flight = true;
        }

        for task in &tasks {
            if let Some(id) = task.node_id() {
                self.dialing.insert(id);
            }
        }

        tasks
    }

    /// `taskDone(task, now)` from spec.md §4.4: record completion, update cooldowns from
    /// failures, and allow the next `new_tasks` call to replenish discovery lookups.
    pub fn task_done(&mut self, task: &Task, outcome: TaskOutcome, now: Instant) {
        if let Some(id) = task.node_id() {
            self.dialing.remove(&id);
            match outcome {
                TaskOutcome::DialFailed(ref reason) => {
                    let attempts = self.cooldowns.get(&id).map(|c| c.attempts + 1).unwrap_or(1);
                    let delay = self.backoff.calculate_backoff(attempts);
                    debug!(target: LOG_TARGET, "Dial to {} failed ({}); cooling down for {:?}", id, reason, delay);
                    self.cooldowns.insert(id, Cooldown { attempts, next_allowed: now + delay });
                },
                TaskOutcome::DialSucceeded => {
                    self.cooldowns.remove(&id);
                },
                TaskOutcome::DiscoveryCompleted => {},
            }
        }
        if matches!(task, Task::Discovery) {
            self.discovery_in_flight = false;
        }
    }

    pub fn add_static(&mut self, contact: Contact) {
        self.static_nodes.entry(contact.id).or_insert(contact);
    }

    pub fn remove_static(&mut self, id: &NodeId) {
        self.static_nodes.remove(id);
        self.cooldowns.remove(id);
    }

    pub fn is_static(&self, id: &NodeId) -> bool {
        self.static_nodes.contains_key(id)
    }
}
