//! Resource planning
//!
//! Turns per-pool capacity and the peak demand of the scheduled autoscaler
//! changes into new node pool ceilings. Demand is accumulated concurrently
//! by the per-change tasks; the plan itself is computed once all of them
//! have reported.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::cluster::WorkloadShape;

/// Default number of extra nodes added on top of any needed raise
pub const DEFAULT_SAFETY_MARGIN: i32 = 5;

/// Pods, CPU cores and memory bytes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceVector {
    pub pods: f64,
    pub cpu: f64,
    pub memory: f64,
}

impl ResourceVector {
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            pods: self.pods * factor,
            cpu: self.cpu * factor,
            memory: self.memory * factor,
        }
    }

    fn add(&mut self, other: &ResourceVector) {
        self.pods += other.pods;
        self.cpu += other.cpu;
        self.memory += other.memory;
    }
}

/// What one node of a pool offers, and what the pool offers at its current ceiling
#[derive(Debug, Clone, PartialEq)]
pub struct NodePoolCapacity {
    pub pool: String,
    pub current_max_nodes: i32,
    pub per_node: ResourceVector,
    pub aggregate: ResourceVector,
}

impl NodePoolCapacity {
    pub fn new(pool: impl Into<String>, current_max_nodes: i32, per_node: ResourceVector) -> Self {
        Self {
            pool: pool.into(),
            current_max_nodes,
            aggregate: per_node.scaled(current_max_nodes as f64),
            per_node,
        }
    }
}

/// Peak demand of one change at its desired max replicas
pub fn peak_demand(shape: &WorkloadShape, max_replicas: i32) -> ResourceVector {
    let replicas = max_replicas.max(0) as f64;
    ResourceVector {
        pods: replicas,
        cpu: shape.per_replica_cpu * replicas,
        memory: shape.per_replica_memory * replicas,
    }
}

/// Demand totals per pool, shared by the per-change tasks of one plan run.
///
/// One accumulator is allocated per known pool up front; a single lock
/// guards every update.
pub struct DemandLedger {
    totals: Mutex<HashMap<String, ResourceVector>>,
}

impl DemandLedger {
    pub fn new<I, S>(pools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            totals: Mutex::new(
                pools
                    .into_iter()
                    .map(|p| (p.into(), ResourceVector::default()))
                    .collect(),
            ),
        }
    }

    /// Add `demand` to each of `pools` that the ledger knows about, or to
    /// every pool when `pools` is empty. Returns the pools charged.
    pub fn charge(&self, pools: &[String], demand: ResourceVector) -> Vec<String> {
        let mut totals = match self.totals.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let known: Vec<String> = pools
            .iter()
            .filter(|p| totals.contains_key(p.as_str()))
            .cloned()
            .collect();
        let targets = if known.is_empty() {
            totals.keys().cloned().collect()
        } else {
            known
        };

        for pool in &targets {
            if let Some(total) = totals.get_mut(pool) {
                total.add(&demand);
            }
        }
        targets
    }

    /// Final totals once every task has charged its demand
    pub fn totals(&self) -> HashMap<String, ResourceVector> {
        match self.totals.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Planner settings
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Extra nodes added whenever a pool needs any raise
    pub safety_margin: i32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }
}

/// Planned outcome for one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPlan {
    pub current_max_nodes: i32,
    pub needed_nodes: i32,
    pub new_max_nodes: i32,
}

impl PoolPlan {
    pub fn needs_raise(&self) -> bool {
        self.needed_nodes > 0
    }
}

fn nodes_for(unfulfilled: f64, per_node: f64) -> i32 {
    if unfulfilled <= 0.0 || per_node <= 0.0 {
        return 0;
    }
    (unfulfilled / per_node).ceil() as i32
}

/// Nodes needed to cover `demand` beyond the pool's current ceiling.
///
/// A dimension the pool cannot offer at all (nothing left per node after
/// overhead) never asks for nodes.
pub fn needed_nodes(capacity: &NodePoolCapacity, demand: &ResourceVector) -> i32 {
    let unfulfilled = ResourceVector {
        pods: (demand.pods - capacity.aggregate.pods).max(0.0),
        cpu: (demand.cpu - capacity.aggregate.cpu).max(0.0),
        memory: (demand.memory - capacity.aggregate.memory).max(0.0),
    };

    nodes_for(unfulfilled.pods, capacity.per_node.pods)
        .max(nodes_for(unfulfilled.cpu, capacity.per_node.cpu))
        .max(nodes_for(unfulfilled.memory, capacity.per_node.memory))
}

impl PlannerConfig {
    /// Plan every pool that has a capacity snapshot.
    ///
    /// Pools without recorded demand plan to zero needed nodes.
    pub fn plan(
        &self,
        capacities: &[NodePoolCapacity],
        demand: &HashMap<String, ResourceVector>,
    ) -> BTreeMap<String, PoolPlan> {
        capacities
            .iter()
            .map(|capacity| {
                let pool_demand = demand.get(&capacity.pool).copied().unwrap_or_default();
                let needed = needed_nodes(capacity, &pool_demand);
                let new_max = if needed > 0 {
                    capacity.current_max_nodes + needed + self.safety_margin
                } else {
                    capacity.current_max_nodes
                };
                (
                    capacity.pool.clone(),
                    PoolPlan {
                        current_max_nodes: capacity.current_max_nodes,
                        needed_nodes: needed,
                        new_max_nodes: new_max,
                    },
                )
            })
            .collect()
    }
}
