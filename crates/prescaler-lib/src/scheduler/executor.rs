//! Execute path: raise capacity and autoscaler bounds ahead of an event

use futures::future::{join_all, try_join_all};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::EventRunner;
use crate::cluster::{
    background_overhead, label_selector, pool_capacity, resolve, AutoscalerGateway,
    AutoscalerObject, ClusterApi, WorkloadShape, NODE_POOL_LABEL,
};
use crate::error::{ErrorKind, PrescaleError, Result};
use crate::fleet::NodePool;
use crate::models::{ChangeOutcome, Event, EventStatus, ScheduledAutoscalerChange};
use crate::planner::{peak_demand, DemandLedger, NodePoolCapacity};
use crate::shutdown::{self, ShutdownReceiver};

struct MatchedChange {
    change: ScheduledAutoscalerChange,
    object: AutoscalerObject,
}

/// A matched change with its demand charged and its bounds applied
struct PreparedChange {
    change: ScheduledAutoscalerChange,
    object: AutoscalerObject,
    note: String,
}

impl EventRunner {
    /// Prescale `event`, returning the status it ended in, or `None` when the
    /// run was abandoned because of shutdown.
    pub async fn execute(&self, event: Event, shutdown: ShutdownReceiver) -> Option<EventStatus> {
        if shutdown::is_shutdown(&shutdown) {
            return None;
        }

        self.metrics.inc_events_started("execute");
        self.metrics.inc_in_flight();
        let started = Instant::now();

        let result = self.prescale(&event, &shutdown).await;

        self.metrics.dec_in_flight();
        self.metrics
            .observe_execution_duration(started.elapsed().as_secs_f64());

        let result = match result {
            Ok(()) => self.transition(&event, EventStatus::Prescaled, "").await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Some(EventStatus::Prescaled),
            Err(e) if e.is_cancelled() => {
                info!(
                    event_id = %event.id,
                    event_name = %event.name,
                    "Execution abandoned on shutdown"
                );
                None
            }
            Err(e) => {
                self.fail(&event, &e.to_string()).await;
                Some(EventStatus::Failed)
            }
        }
    }

    async fn prescale(&self, event: &Event, shutdown: &ShutdownReceiver) -> Result<()> {
        self.transition(event, EventStatus::Executing, "").await?;

        shutdown::check(shutdown)?;
        let cluster = self.store.cluster(event.cluster_id).await?;
        let handles = self.connector.connect(&cluster).await?;
        let api = handles.cluster_api.clone();
        let version = self.autoscaler_version(&cluster, api.as_ref()).await?;
        let gateway = AutoscalerGateway::new(api.clone(), cluster.id, version, self.cache.clone());

        shutdown::check(shutdown)?;
        let changes = self.store.changes_for_event(event.id).await?;
        let matched = self.match_changes(event, &gateway, changes).await?;

        shutdown::check(shutdown)?;
        let pools = handles.fleet.node_pools().await?;
        // Every fleet pool is linked to the event before any planning step
        let pool_names: Vec<String> = pools.iter().map(|p| p.name.clone()).collect();
        let records: HashMap<String, _> = self
            .store
            .record_provisioned_pools(event.id, &pool_names)
            .await?
            .into_iter()
            .map(|r| (r.node_pool_name.clone(), r))
            .collect();

        let capacities = self.capacities(api.as_ref(), &pools).await?;
        let ledger = DemandLedger::new(capacities.iter().map(|c| c.pool.clone()));

        let prepared = try_join_all(
            matched
                .into_iter()
                .map(|m| self.prepare(event, api.as_ref(), &ledger, m, shutdown)),
        )
        .await?;

        let plan = self.planner.plan(&capacities, &ledger.totals());

        let mut raises: Vec<(&NodePool, i32)> = Vec::new();
        for (pool_name, pool_plan) in &plan {
            self.logger.log_pool_decision(
                &event.name,
                pool_name,
                pool_plan.current_max_nodes,
                pool_plan.needed_nodes,
                pool_plan.new_max_nodes,
            );
            if !pool_plan.needs_raise() {
                continue;
            }
            if let Some(record) = records.get(pool_name) {
                self.store
                    .set_provisioned_max_nodes(record.id, pool_plan.new_max_nodes)
                    .await?;
            }
            if let Some(pool) = pools.iter().find(|p| &p.name == pool_name) {
                raises.push((pool, pool_plan.new_max_nodes));
            }
        }

        shutdown::check(shutdown)?;
        let fleet = handles.fleet.as_ref();
        try_join_all(
            raises
                .into_iter()
                .map(|(pool, new_max)| self.provisioner.raise_ceiling(fleet, pool, new_max, shutdown)),
        )
        .await?;

        shutdown::check(shutdown)?;
        let (changes, objects): (Vec<_>, Vec<_>) = prepared
            .into_iter()
            .map(|p| ((p.change, p.note), p.object))
            .unzip();
        let results = gateway.update_batch(objects).await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut first_error = None;
        for ((change, note), result) in changes.into_iter().zip(results) {
            match result {
                Ok(_) => outcomes.push(ChangeOutcome::success(change.id, note)),
                Err(e) => {
                    let reason = e.to_string();
                    self.logger
                        .log_change_failed(&event.name, &change.namespace, &change.name, &reason);
                    outcomes.push(ChangeOutcome::failed(change.id, reason));
                    first_error.get_or_insert(e);
                }
            }
        }
        self.store.record_change_outcomes(&outcomes).await?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Pair every change with its live autoscaler.
    ///
    /// Changes without one are marked failed right away. Fails with
    /// [`PrescaleError::NoAutoscalerExists`] when nothing matched.
    async fn match_changes(
        &self,
        event: &Event,
        gateway: &AutoscalerGateway,
        changes: Vec<ScheduledAutoscalerChange>,
    ) -> Result<Vec<MatchedChange>> {
        let namespaces: BTreeSet<String> = changes.iter().map(|c| c.namespace.clone()).collect();
        let listings: HashMap<String, Result<Vec<AutoscalerObject>>> =
            join_all(namespaces.into_iter().map(|namespace| async move {
                let listing = gateway.list_all(&namespace).await;
                (namespace, listing)
            }))
            .await
            .into_iter()
            .collect();

        let mut matched = Vec::new();
        let mut unmatched = Vec::new();

        for change in changes {
            let found = match listings.get(&change.namespace) {
                Some(Ok(objects)) => objects
                    .iter()
                    .find(|o| change.targets(&o.namespace(), &o.name()))
                    .cloned()
                    .ok_or_else(|| PrescaleError::AutoscalerNotFound.to_string()),
                // Only the changes of a namespace that failed to list are lost
                Some(Err(e)) => Err(e.to_string()),
                None => Err(PrescaleError::AutoscalerNotFound.to_string()),
            };

            match found {
                Ok(object) => matched.push(MatchedChange { change, object }),
                Err(reason) => {
                    self.logger
                        .log_change_failed(&event.name, &change.namespace, &change.name, &reason);
                    unmatched.push(ChangeOutcome::failed(change.id, reason));
                }
            }
        }

        if !unmatched.is_empty() {
            self.store.record_change_outcomes(&unmatched).await?;
        }
        if matched.is_empty() {
            return Err(PrescaleError::NoAutoscalerExists);
        }
        Ok(matched)
    }

    /// Capacity of every pool that has a node to sample
    async fn capacities(
        &self,
        api: &dyn ClusterApi,
        pools: &[NodePool],
    ) -> Result<Vec<NodePoolCapacity>> {
        let mut overheads = HashMap::new();
        for pool in pools {
            if !overheads.contains_key(&pool.os) {
                overheads.insert(pool.os, background_overhead(api, pool.os).await?);
            }
        }

        let results = join_all(pools.iter().map(|pool| {
            let overhead = overheads.get(&pool.os).copied().unwrap_or_default();
            async move { (pool, pool_capacity(api, pool, &overhead).await) }
        }))
        .await;

        let mut capacities = Vec::with_capacity(results.len());
        for (pool, result) in results {
            match result {
                Ok(capacity) => capacities.push(capacity),
                Err(PrescaleError::NoNodeInPool(_)) => warn!(
                    pool = %pool.name,
                    "Node pool has no node to sample, excluded from planning"
                ),
                Err(e) => return Err(e),
            }
        }
        Ok(capacities)
    }

    async fn prepare(
        &self,
        event: &Event,
        api: &dyn ClusterApi,
        ledger: &DemandLedger,
        matched: MatchedChange,
        shutdown: &ShutdownReceiver,
    ) -> Result<PreparedChange> {
        shutdown::check(shutdown)?;
        let MatchedChange { change, mut object } = matched;
        let target = object.scale_target_ref();

        let (shape, note) = match resolve(api, &target, &change.namespace).await {
            Ok(shape) => (shape, String::new()),
            Err(e) if e.kind() == ErrorKind::Validation => {
                warn!(
                    event_name = %event.name,
                    namespace = %change.namespace,
                    autoscaler = %change.name,
                    error = %e,
                    "Scale target not understood, assuming it may land on any node pool"
                );
                (
                    WorkloadShape::default(),
                    format!("{}, demand charged to every node pool", e),
                )
            }
            Err(e) => return Err(e),
        };

        let selected = selected_pools(api, &shape).await?;
        let demand = peak_demand(&shape, change.max_replicas);
        let charged = ledger.charge(&selected, demand);
        debug!(
            event_name = %event.name,
            namespace = %change.namespace,
            autoscaler = %change.name,
            pools = ?charged,
            pods = demand.pods,
            cpu = demand.cpu,
            memory = demand.memory,
            "Charged peak demand"
        );

        object.apply_bounds(change.min_replicas, change.max_replicas);
        Ok(PreparedChange {
            change,
            object,
            note,
        })
    }
}

/// Pools holding at least one node that satisfies the workload's node selector
async fn selected_pools(api: &dyn ClusterApi, shape: &WorkloadShape) -> Result<Vec<String>> {
    if shape.node_selector.is_empty() {
        return Ok(Vec::new());
    }

    let selector = label_selector(&shape.node_selector);
    let nodes = api.list_nodes(Some(&selector), None).await?;
    let pools: BTreeSet<String> = nodes
        .iter()
        .filter_map(|n| n.metadata.labels.as_ref()?.get(NODE_POOL_LABEL).cloned())
        .collect();

    Ok(pools.into_iter().collect())
}
