//! Worker node registry.
//!
//! Tracks node capabilities, capacity and liveness. Capacity counters are
//! per-resource atomics mutated only through optimistic compare-and-swap
//! reservations, so the dispatch path never takes a registry-wide lock to
//! claim capacity.
//!
//! Every task implicitly needs one unit of the `slots` resource. A node that
//! does not declare a `slots` limit runs any number of tasks at once.

mod client;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use client::NodeClient;

use crate::error::{Error, Result};

/// The resource every task consumes one unit of.
pub const SLOTS: &str = "slots";

/// Registration id of a worker node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh, time-ordered id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Liveness as last reported or inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    /// No heartbeat within the TTL. Receives no work.
    Unreachable,
}

impl HealthStatus {
    /// Lower ranks first.
    fn rank(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unreachable => 2,
        }
    }
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// A node missing heartbeats for this long becomes unreachable and its
    /// tasks are reassigned. Default: 30 seconds.
    pub heartbeat_ttl: Duration,
    /// Unreachable nodes are removed after this much further silence.
    /// Default: 5 minutes.
    pub removal_grace: Duration,
    /// Compare-and-swap attempts per counter before a reservation gives up
    /// with [`Error::ReservationConflict`]. Default: 16.
    pub max_reservation_retries: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl: Duration::from_secs(30),
            removal_grace: Duration::from_secs(300),
            max_reservation_retries: 16,
        }
    }
}

/// Point-in-time view of a registered node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_id: NodeId,
    pub capabilities: BTreeSet<String>,
    pub capacity_limits: BTreeMap<String, u64>,
    /// Capacity currently reserved by dispatched tasks.
    pub current_load: BTreeMap<String, u64>,
    pub health_status: HealthStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_heartbeat: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    /// Task count from the node's last heartbeat.
    pub reported_active_tasks: u32,
    pub succeeded: u64,
    pub failed: u64,
    /// Whether tasks are pushed to the node rather than polled.
    pub push: bool,
}

/// Node-reported status carried by a heartbeat.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    /// `None` keeps the current status, reviving an unreachable node as healthy.
    pub health: Option<HealthStatus>,
    /// Node-side view of its load, recorded for monitoring.
    pub load: BTreeMap<String, u64>,
    pub active_tasks: u32,
}

/// Capacity held on one node for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub node_id: NodeId,
    pub amounts: BTreeMap<String, u64>,
}

/// A node able to run a task, with its ranking inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCandidate {
    pub node_id: NodeId,
    pub health: HealthStatus,
    /// Smallest fraction of any declared limit still free, after the task.
    pub spare_ratio: f64,
    pub success_rate: f64,
    pub push: bool,
}

/// Outcome of [`NodeRegistry::expire`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpiredNodes {
    /// Nodes that just became unreachable; their tasks must be reassigned.
    pub unreachable: Vec<NodeId>,
    /// Nodes dropped from the registry.
    pub removed: Vec<NodeId>,
}

struct NodeState {
    health: HealthStatus,
    last_heartbeat: OffsetDateTime,
    reported_load: BTreeMap<String, u64>,
    reported_active_tasks: u32,
}

struct NodeEntry {
    node_id: NodeId,
    capabilities: BTreeSet<String>,
    limits: BTreeMap<String, u64>,
    load: BTreeMap<String, AtomicU64>,
    registered_at: OffsetDateTime,
    state: Mutex<NodeState>,
    succeeded: AtomicU64,
    failed: AtomicU64,
    client: Option<Arc<dyn NodeClient>>,
}

impl NodeEntry {
    fn state(&self) -> Result<std::sync::MutexGuard<'_, NodeState>> {
        self.state
            .lock()
            .map_err(|_| Error::LockPoisoned("node state"))
    }

    fn health(&self) -> Result<HealthStatus> {
        Ok(self.state()?.health)
    }

    fn can_host(&self, required: &BTreeSet<String>, needs: &BTreeMap<String, u64>) -> bool {
        required.is_subset(&self.capabilities)
            && needs
                .iter()
                .all(|(resource, amount)| *amount == 0 || self.load.contains_key(resource))
    }

    /// Fraction of the tightest declared limit left after taking `needs`,
    /// or `None` if the node lacks the room.
    fn spare_after(&self, needs: &BTreeMap<String, u64>) -> Option<f64> {
        let mut spare: f64 = 1.0;
        for (resource, limit) in &self.limits {
            let load = self
                .load
                .get(resource)
                .map_or(0, |counter| counter.load(Ordering::Acquire));
            let need = needs.get(resource).copied().unwrap_or(0);
            let after = load.checked_add(need)?;
            if after > *limit {
                return None;
            }
            if *limit > 0 {
                spare = spare.min((limit - after) as f64 / *limit as f64);
            }
        }
        Some(spare)
    }

    fn success_rate(&self) -> f64 {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        if succeeded + failed == 0 {
            1.0
        } else {
            succeeded as f64 / (succeeded + failed) as f64
        }
    }

    fn view(&self) -> Result<NodeRegistration> {
        let state = self.state()?;
        Ok(NodeRegistration {
            node_id: self.node_id.clone(),
            capabilities: self.capabilities.clone(),
            capacity_limits: self.limits.clone(),
            current_load: self
                .load
                .iter()
                .map(|(resource, counter)| (resource.clone(), counter.load(Ordering::Acquire)))
                .collect(),
            health_status: state.health,
            last_heartbeat: state.last_heartbeat,
            registered_at: self.registered_at,
            reported_active_tasks: state.reported_active_tasks,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            push: self.client.is_some(),
        })
    }
}

/// Needs plus the implicit slot.
fn with_slot(needs: &BTreeMap<String, u64>) -> BTreeMap<String, u64> {
    let mut needs = needs.clone();
    *needs.entry(SLOTS.to_owned()).or_insert(0) += 1;
    needs
}

/// Registry of worker nodes.
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Arc<NodeEntry>>>,
    config: RegistryConfig,
}

impl NodeRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a polling node. Returns its registration id.
    pub fn register_node(
        &self,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        capacity_limits: BTreeMap<String, u64>,
        now: OffsetDateTime,
    ) -> Result<NodeId> {
        self.insert(capabilities, capacity_limits, None, now)
    }

    /// Register a node that accepts pushed task offers through `client`.
    pub fn register_node_with_client(
        &self,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        capacity_limits: BTreeMap<String, u64>,
        client: Arc<dyn NodeClient>,
        now: OffsetDateTime,
    ) -> Result<NodeId> {
        self.insert(capabilities, capacity_limits, Some(client), now)
    }

    fn insert(
        &self,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        capacity_limits: BTreeMap<String, u64>,
        client: Option<Arc<dyn NodeClient>>,
        now: OffsetDateTime,
    ) -> Result<NodeId> {
        let node_id = NodeId::generate();
        let mut load: BTreeMap<String, AtomicU64> = capacity_limits
            .keys()
            .map(|resource| (resource.clone(), AtomicU64::new(0)))
            .collect();
        load.entry(SLOTS.to_owned())
            .or_insert_with(|| AtomicU64::new(0));

        let entry = NodeEntry {
            node_id: node_id.clone(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            limits: capacity_limits,
            load,
            registered_at: now,
            state: Mutex::new(NodeState {
                health: HealthStatus::Healthy,
                last_heartbeat: now,
                reported_load: BTreeMap::new(),
                reported_active_tasks: 0,
            }),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            client,
        };
        info!(
            node_id = %node_id,
            capabilities = ?entry.capabilities,
            limits = ?entry.limits,
            push = entry.client.is_some(),
            "Node registered"
        );
        self.write()?.insert(node_id.clone(), Arc::new(entry));
        Ok(node_id)
    }

    /// Remove a node. Its reservations die with it.
    pub fn unregister_node(&self, node_id: &NodeId) -> Result<NodeRegistration> {
        let entry = self
            .write()?
            .remove(node_id)
            .ok_or_else(|| Error::UnknownNode(node_id.to_string()))?;
        info!(node_id = %node_id, "Node unregistered");
        entry.view()
    }

    /// Record a heartbeat. Returns `false` for unknown nodes, which must
    /// register again.
    pub fn heartbeat(&self, node_id: &NodeId, heartbeat: Heartbeat, now: OffsetDateTime) -> Result<bool> {
        let Some(entry) = self.entry(node_id)? else {
            debug!(node_id = %node_id, "Heartbeat from unknown node");
            return Ok(false);
        };
        let mut state = entry.state()?;
        let revived = state.health == HealthStatus::Unreachable;
        state.health = match heartbeat.health {
            Some(health) => health,
            None if revived => HealthStatus::Healthy,
            None => state.health,
        };
        state.last_heartbeat = now;
        state.reported_load = heartbeat.load;
        state.reported_active_tasks = heartbeat.active_tasks;
        if revived {
            info!(node_id = %node_id, health = ?state.health, "Node reachable again");
        }
        Ok(true)
    }

    pub fn get(&self, node_id: &NodeId) -> Result<Option<NodeRegistration>> {
        self.entry(node_id)?.map(|entry| entry.view()).transpose()
    }

    /// All registered nodes, by id.
    pub fn nodes(&self) -> Result<Vec<NodeRegistration>> {
        let mut nodes = self
            .read()?
            .values()
            .map(|entry| entry.view())
            .collect::<Result<Vec<_>>>()?;
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    /// Push client of a node, if it registered one.
    pub fn client(&self, node_id: &NodeId) -> Result<Option<Arc<dyn NodeClient>>> {
        Ok(self.entry(node_id)?.and_then(|entry| entry.client.clone()))
    }

    /// Whether `node_id` is registered and reachable.
    pub fn is_available(&self, node_id: &NodeId) -> Result<bool> {
        match self.entry(node_id)? {
            Some(entry) => Ok(entry.health()? != HealthStatus::Unreachable),
            None => Ok(false),
        }
    }

    /// Reachable nodes able to run a task, best first.
    ///
    /// Ranked by health, then spare capacity, then historical success
    /// rate, then node id.
    pub fn find_capable_nodes(
        &self,
        required_capabilities: &BTreeSet<String>,
        resource_needs: &BTreeMap<String, u64>,
    ) -> Result<Vec<NodeCandidate>> {
        let needs = with_slot(resource_needs);
        let nodes = self.read()?;
        let mut candidates = Vec::new();
        for entry in nodes.values() {
            let health = entry.health()?;
            if health == HealthStatus::Unreachable || !entry.can_host(required_capabilities, &needs) {
                continue;
            }
            let Some(spare_ratio) = entry.spare_after(&needs) else {
                continue;
            };
            candidates.push(NodeCandidate {
                node_id: entry.node_id.clone(),
                health,
                spare_ratio,
                success_rate: entry.success_rate(),
                push: entry.client.is_some(),
            });
        }
        candidates.sort_by(|a, b| {
            a.health
                .rank()
                .cmp(&b.health.rank())
                .then(b.spare_ratio.total_cmp(&a.spare_ratio))
                .then(b.success_rate.total_cmp(&a.success_rate))
                .then(a.node_id.cmp(&b.node_id))
        });
        Ok(candidates)
    }

    /// Reserve capacity for one task on `node_id`.
    ///
    /// `Ok(None)` if the node is unreachable, lacks a capability, or lacks
    /// the room. Each counter is claimed with a compare-and-swap loop; if a
    /// later counter cannot be claimed the earlier ones are rolled back.
    pub fn reserve(
        &self,
        node_id: &NodeId,
        required_capabilities: &BTreeSet<String>,
        resource_needs: &BTreeMap<String, u64>,
    ) -> Result<Option<Reservation>> {
        let entry = self
            .entry(node_id)?
            .ok_or_else(|| Error::UnknownNode(node_id.to_string()))?;
        let needs = with_slot(resource_needs);
        if entry.health()? == HealthStatus::Unreachable
            || !entry.can_host(required_capabilities, &needs)
        {
            return Ok(None);
        }

        let mut taken: BTreeMap<String, u64> = BTreeMap::new();
        for (resource, amount) in needs.iter().filter(|(_, amount)| **amount > 0) {
            let Some(counter) = entry.load.get(resource) else {
                rollback(&entry, &taken);
                return Ok(None);
            };
            let limit = entry.limits.get(resource).copied();
            match self.claim(counter, *amount, limit) {
                Ok(true) => {
                    taken.insert(resource.clone(), *amount);
                }
                Ok(false) => {
                    rollback(&entry, &taken);
                    return Ok(None);
                }
                Err(attempts) => {
                    rollback(&entry, &taken);
                    warn!(node_id = %node_id, resource = %resource, attempts, "Reservation conflict");
                    return Err(Error::ReservationConflict {
                        node_id: node_id.to_string(),
                        attempts,
                    });
                }
            }
        }

        debug!(node_id = %node_id, amounts = ?taken, "Capacity reserved");
        Ok(Some(Reservation {
            node_id: node_id.clone(),
            amounts: taken,
        }))
    }

    /// Return reserved capacity. A no-op if the node is gone.
    pub fn release(&self, reservation: &Reservation) -> Result<()> {
        if let Some(entry) = self.entry(&reservation.node_id)? {
            rollback(&entry, &reservation.amounts);
            debug!(node_id = %reservation.node_id, amounts = ?reservation.amounts, "Capacity released");
        }
        Ok(())
    }

    /// Count a finished task towards the node's success rate.
    pub fn record_outcome(&self, node_id: &NodeId, succeeded: bool) -> Result<()> {
        if let Some(entry) = self.entry(node_id)? {
            let counter = if succeeded {
                &entry.succeeded
            } else {
                &entry.failed
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Apply heartbeat TTLs: silent nodes become unreachable, long-silent
    /// unreachable nodes are removed.
    pub fn expire(&self, now: OffsetDateTime) -> Result<ExpiredNodes> {
        let ttl = self.config.heartbeat_ttl;
        let removal = ttl + self.config.removal_grace;
        let mut expired = ExpiredNodes::default();

        let mut nodes = self.write()?;
        for entry in nodes.values() {
            let mut state = entry.state()?;
            let silent = now - state.last_heartbeat;
            if silent > removal && state.health == HealthStatus::Unreachable {
                expired.removed.push(entry.node_id.clone());
            } else if silent > ttl && state.health != HealthStatus::Unreachable {
                state.health = HealthStatus::Unreachable;
                warn!(
                    node_id = %entry.node_id,
                    silent_ms = silent.whole_milliseconds() as i64,
                    "Node missed heartbeats, marked unreachable"
                );
                expired.unreachable.push(entry.node_id.clone());
            }
        }
        for node_id in &expired.removed {
            nodes.remove(node_id);
            info!(node_id = %node_id, "Unreachable node removed");
        }
        expired.unreachable.sort();
        expired.removed.sort();
        Ok(expired)
    }

    /// One compare-and-swap loop. `Err` carries the attempts made.
    fn claim(&self, counter: &AtomicU64, amount: u64, limit: Option<u64>) -> std::result::Result<bool, u32> {
        let max = self.config.max_reservation_retries.max(1);
        let mut current = counter.load(Ordering::Acquire);
        for attempt in 1..=max {
            let Some(next) = current.checked_add(amount) else {
                return Ok(false);
            };
            if limit.is_some_and(|limit| next > limit) {
                return Ok(false);
            }
            match counter.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(true),
                Err(actual) if attempt < max => current = actual,
                Err(_) => break,
            }
        }
        Err(max)
    }

    fn entry(&self, node_id: &NodeId) -> Result<Option<Arc<NodeEntry>>> {
        Ok(self.read()?.get(node_id).cloned())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<NodeId, Arc<NodeEntry>>>> {
        self.nodes
            .read()
            .map_err(|_| Error::LockPoisoned("node registry"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<NodeId, Arc<NodeEntry>>>> {
        self.nodes
            .write()
            .map_err(|_| Error::LockPoisoned("node registry"))
    }
}

fn rollback(entry: &NodeEntry, amounts: &BTreeMap<String, u64>) {
    for (resource, amount) in amounts {
        if let Some(counter) = entry.load.get(resource) {
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(*amount))
            });
        }
    }
}
