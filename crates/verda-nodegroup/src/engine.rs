//! NodeGroupEngine — the node-group operations the RPC layer exposes.
//!
//! Group size is the number of tracked records in the group. Scale-up
//! records every instance the moment the backend accepts it; scale-down
//! forgets an instance only once the backend confirmed the delete.
//! No lock is held across a backend call. Store writes run on the
//! blocking pool since they may rewrite the snapshot file.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use verda_client::{CreateInstance, VerdaApi};
use verda_core::{parse_provider_id, AppConfig, Contract, LiveInstance, NodeGroupConfig, Pricing};
use verda_state::{InstanceRecord, ReconcileSummary, StateStore};

use crate::error::{EngineError, EngineResult};
use crate::metadata::{MetadataCache, MetadataRefresh};
use crate::startup_script::StartupScriptProvisioner;
use crate::template::{NodeShape, NodeTemplate};

/// Static description of a configured group.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeGroupInfo {
    pub id: String,
    pub min_size: u32,
    pub max_size: u32,
    pub debug: String,
}

/// A cluster node as the autoscaler names it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeRef {
    pub provider_id: String,
    pub name: String,
}

/// One member of a group, as reported by `nodes()`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupNode {
    /// `verda://{instance_id}`.
    pub id: String,
    /// Backend status, `None` when the backend does not list the instance
    /// (yet).
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceRefresh {
    Reconciled(ReconcileSummary),
    /// The instance list could not be fetched; tracked records are unchanged.
    Skipped { error: String },
}

/// What a `refresh()` did. Never an error: failures leave cached state in
/// place and are reported here.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    pub instances: InstanceRefresh,
    pub metadata: MetadataRefresh,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteReport {
    /// Instance ids deleted and untracked.
    pub deleted: Vec<String>,
    /// Nodes without a usable provider id, or tracked under another group.
    pub skipped: usize,
    /// Nodes whose backend delete failed.
    pub failed: usize,
}

pub struct NodeGroupEngine {
    api: Arc<dyn VerdaApi>,
    config: Arc<AppConfig>,
    store: StateStore,
    metadata: MetadataCache,
    scripts: StartupScriptProvisioner,
    /// Creations in flight per group, counted against `max_size`.
    reservations: Mutex<HashMap<String, usize>>,
}

/// Slots a scale-up holds against its group's `max_size` until the
/// instances are tracked. Slots still held are returned on drop.
struct Reservation<'a> {
    table: &'a Mutex<HashMap<String, usize>>,
    group_id: &'a str,
    held: usize,
}

impl Reservation<'_> {
    fn release(&mut self, slots: usize) {
        let slots = slots.min(self.held);
        if slots == 0 {
            return;
        }
        self.held -= slots;
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = table.get_mut(self.group_id) {
            *pending = pending.saturating_sub(slots);
            if *pending == 0 {
                table.remove(self.group_id);
            }
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.release(self.held);
    }
}

impl NodeGroupEngine {
    pub fn new(api: Arc<dyn VerdaApi>, config: AppConfig, store: StateStore) -> Self {
        let metadata = MetadataCache::new(api.clone());
        let scripts = StartupScriptProvisioner::new(api.clone(), config.kubernetes.clone());
        Self {
            api,
            config: Arc::new(config),
            store,
            metadata,
            scripts,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    fn group(&self, group_id: &str) -> EngineResult<&NodeGroupConfig> {
        self.config
            .group(group_id)
            .ok_or_else(|| EngineError::GroupNotFound(group_id.to_string()))
    }

    fn info(group_id: &str, config: &NodeGroupConfig) -> NodeGroupInfo {
        NodeGroupInfo {
            id: group_id.to_string(),
            min_size: config.min_size,
            max_size: config.max_size,
            debug: format!("Verda Group {}", config.instance_type),
        }
    }

    /// Run a store write off the async workers.
    async fn write_store<T, F>(&self, op: F) -> T
    where
        F: FnOnce(StateStore) -> T + Send + 'static,
        T: Default + Send + 'static,
    {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || op(store)).await {
            Ok(value) => value,
            Err(e) => match e.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                Err(e) => {
                    warn!(error = %e, "state store write cancelled");
                    T::default()
                }
            },
        }
    }

    /// Check `max_size` against tracked plus in-flight instances and hold
    /// `requested` slots. Returns the reservation and the size before it.
    fn reserve<'a>(
        &'a self,
        group_id: &'a str,
        config: &NodeGroupConfig,
        requested: usize,
    ) -> EngineResult<(Reservation<'a>, usize)> {
        let mut table = self.reservations.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = table.get(group_id).copied().unwrap_or(0);
        let current = self.store.count_by_group(group_id) + pending;
        let new_target = current + requested;
        if new_target > config.max_size as usize {
            return Err(EngineError::CapacityExceeded {
                max_size: config.max_size,
                requested: new_target,
            });
        }
        *table.entry(group_id.to_string()).or_default() += requested;
        let reservation = Reservation {
            table: &self.reservations,
            group_id,
            held: requested,
        };
        Ok((reservation, current))
    }

    // ── Read paths ─────────────────────────────────────────────────

    pub fn node_groups(&self) -> Vec<NodeGroupInfo> {
        self.config
            .node_groups
            .iter()
            .map(|(id, cfg)| Self::info(id, cfg))
            .collect()
    }

    pub fn target_size(&self, group_id: &str) -> EngineResult<usize> {
        self.group(group_id)?;
        Ok(self.store.count_by_group(group_id))
    }

    /// The group owning a node, or `None` when the node is not managed here.
    pub fn node_group_for_node(&self, node: &NodeRef) -> Option<NodeGroupInfo> {
        let record = self.store.get_by_provider_id(&node.provider_id)?;
        let config = self.config.group(&record.node_group)?;
        Some(Self::info(&record.node_group, config))
    }

    /// Tracked members of a group with their live backend status.
    ///
    /// A failing backend yields an empty list rather than an error.
    pub async fn nodes(&self, group_id: &str) -> EngineResult<Vec<GroupNode>> {
        self.group(group_id)?;
        let tracked = self.store.list_by_group(group_id);

        let live = match self.api.list_instances().await {
            Ok(live) => live,
            Err(e) => {
                warn!(group = %group_id, error = %e, "failed to list instances for group nodes");
                return Ok(Vec::new());
            }
        };
        let statuses: HashMap<String, String> =
            live.into_iter().map(|i| (i.id, i.status)).collect();

        let nodes: Vec<GroupNode> = tracked
            .into_iter()
            .map(|record| GroupNode {
                status: statuses.get(&record.instance_id).cloned(),
                id: record.provider_id,
            })
            .collect();
        debug!(group = %group_id, nodes = nodes.len(), "listed group nodes");
        Ok(nodes)
    }

    /// Hourly price of a group's instance type under its pricing mode.
    pub fn hourly_price(&self, config: &NodeGroupConfig) -> f64 {
        let live = self.metadata.get(&config.instance_type).and_then(|meta| {
            match config.pricing {
                Pricing::DynamicPrice => meta.spot_price,
                Pricing::FixedPrice => meta.on_demand_price,
            }
        });
        live.unwrap_or(config.hourly_price)
    }

    /// Cost of running a node between `start` and `end`. Inverted ranges
    /// cost nothing.
    pub fn node_price(
        &self,
        node: &NodeRef,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<f64> {
        let record = self
            .store
            .get_by_provider_id(&node.provider_id)
            .ok_or_else(|| EngineError::NodeNotFound(node.provider_id.clone()))?;
        let config = self.group(&record.node_group)?;

        let hours = ((end - start).num_milliseconds() as f64 / 3_600_000.0).max(0.0);
        Ok(self.hourly_price(config) * hours)
    }

    /// Node template for scale-from-zero. The shape comes from cached
    /// metadata, falling back to the group's configured `resources`.
    pub fn template_node(&self, group_id: &str) -> EngineResult<NodeTemplate> {
        let config = self.group(group_id)?;
        let shape = match self.metadata.get(&config.instance_type) {
            Some(meta) => NodeShape::from(&meta),
            None => match &config.resources {
                Some(resources) => {
                    debug!(group = %group_id, "no cached metadata, using configured resources");
                    NodeShape::from(resources)
                }
                None => {
                    warn!(group = %group_id, instance_type = %config.instance_type, "no metadata for group");
                    return Err(EngineError::TemplateUnavailable {
                        group: group_id.to_string(),
                        instance_type: config.instance_type.clone(),
                    });
                }
            },
        };
        Ok(NodeTemplate::build(group_id, config, &shape))
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Create `delta` instances, one at a time, stopping at the first
    /// failure. Instances already created are kept and tracked.
    ///
    /// Returns the number of instances created.
    pub async fn increase_size(&self, group_id: &str, delta: i32) -> EngineResult<usize> {
        let config = self.group(group_id)?;
        if delta <= 0 {
            return Err(EngineError::InvalidArgument(format!(
                "delta must be positive, got {delta}"
            )));
        }
        let requested = delta as usize;

        let (mut reservation, current) = self.reserve(group_id, config, requested)?;
        let new_target = current + requested;

        let startup_script_id = match &config.startup_script_id {
            Some(id) => id.clone(),
            None => self.scripts.ensure(group_id, &config.labels).await?,
        };

        info!(group = %group_id, delta, current, target = new_target, "increasing node group");

        let mut created = 0;
        for attempt in 1..=requested {
            let hostname = new_hostname(group_id);
            let request = CreateInstance {
                instance_type: config.instance_type.clone(),
                image: config.image.clone(),
                hostname: hostname.clone(),
                description: format!("Autoscaler node for {group_id}"),
                location: config.location.clone(),
                ssh_key_ids: config.ssh_key_ids.clone(),
                startup_script_id: Some(startup_script_id.clone()),
                contract: config.contract,
                pricing: config.pricing,
                is_spot: config.contract == Contract::Spot,
            };

            match self.api.create_instance(&request).await {
                Ok(instance_id) => {
                    info!(group = %group_id, %instance_id, %hostname, attempt, "created instance");
                    let record = InstanceRecord::creating(instance_id, hostname, group_id);
                    self.write_store(move |store| store.add(record)).await;
                    reservation.release(1);
                    created += 1;
                }
                Err(e) => {
                    warn!(group = %group_id, attempt, requested, error = %e, "failed to create instance, stopping");
                    break;
                }
            }
        }

        if created < requested {
            return Err(EngineError::PartialIncrease { created, requested });
        }
        Ok(created)
    }

    /// Delete nodes by provider id. Each node is handled on its own: a
    /// malformed reference or a failed delete does not stop the rest.
    pub async fn delete_nodes(&self, group_id: &str, nodes: &[NodeRef]) -> EngineResult<DeleteReport> {
        self.group(group_id)?;
        info!(group = %group_id, nodes = nodes.len(), "deleting nodes");

        let mut report = DeleteReport::default();
        for node in nodes {
            let Some(instance_id) = parse_provider_id(&node.provider_id) else {
                warn!(node = %node.name, provider_id = %node.provider_id, "cannot resolve instance id for node, skipping");
                report.skipped += 1;
                continue;
            };
            if let Some(record) = self.store.get(instance_id)
                && record.node_group != group_id
            {
                warn!(
                    group = %group_id,
                    %instance_id,
                    owner = %record.node_group,
                    "node belongs to another group, skipping"
                );
                report.skipped += 1;
                continue;
            }

            match self.api.delete_instance(instance_id).await {
                Ok(()) => {
                    self.untrack(instance_id).await;
                    info!(group = %group_id, %instance_id, node = %node.name, "deleted instance");
                    report.deleted.push(instance_id.to_string());
                }
                Err(e) if e.is_not_found() => {
                    self.untrack(instance_id).await;
                    info!(group = %group_id, %instance_id, node = %node.name, "instance already gone");
                    report.deleted.push(instance_id.to_string());
                }
                Err(e) => {
                    warn!(group = %group_id, %instance_id, node = %node.name, error = %e, "failed to delete instance");
                    report.failed += 1;
                }
            }
        }

        if !report.deleted.is_empty() {
            info!(
                group = %group_id,
                deleted = report.deleted.len(),
                target = self.store.count_by_group(group_id),
                "node group shrunk"
            );
        }
        Ok(report)
    }

    async fn untrack(&self, instance_id: &str) {
        let instance_id = instance_id.to_string();
        self.write_store(move |store| store.remove(&instance_id)).await;
    }

    /// Acknowledge a target decrease. Size follows the tracked records, so
    /// there is nothing to change here.
    pub fn decrease_target_size(&self, group_id: &str, delta: i32) -> EngineResult<()> {
        self.group(group_id)?;
        debug!(group = %group_id, delta, "decrease target size acknowledged");
        Ok(())
    }

    /// Reconcile tracked instances with the backend and refresh metadata.
    pub async fn refresh(&self) -> RefreshReport {
        let instances = match self.api.list_instances().await {
            Ok(list) => {
                let live: Vec<LiveInstance> = list.into_iter().map(LiveInstance::from).collect();
                let config = self.config.clone();
                let summary = self
                    .write_store(move |store| store.reconcile(&live, &config.node_groups))
                    .await;
                InstanceRefresh::Reconciled(summary)
            }
            Err(e) => {
                warn!(error = %e, "failed to list instances, keeping tracked state");
                InstanceRefresh::Skipped {
                    error: e.to_string(),
                }
            }
        };
        let metadata = self.metadata.refresh().await;
        debug!(?instances, ?metadata, "refresh completed");
        RefreshReport { instances, metadata }
    }

    /// Initial refresh before serving.
    pub async fn initialize(&self) -> RefreshReport {
        let report = self.refresh().await;
        info!(
            groups = self.config.node_groups.len(),
            tracked = self.store.len(),
            "node group engine initialized"
        );
        report
    }
}

/// `{group}-{8 hex chars}`.
fn new_hostname(group_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{group_id}-{}", &suffix[..8])
}
