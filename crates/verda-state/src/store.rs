//! StateStore — the instance record table and its reconciliation
//! against the Verda API's live instance list.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use verda_core::{parse_provider_id, LiveInstance, NodeGroupConfig};

use crate::snapshot;
use crate::types::InstanceRecord;

type RecordMap = HashMap<String, InstanceRecord>;

/// Counts of what a reconciliation pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Live instances newly tracked through hostname matching.
    pub adopted: usize,
    /// Tracked records whose instance is gone (or whose group is no longer configured).
    pub removed: usize,
    /// Tracked records whose status or hostname changed.
    pub updated: usize,
    /// Live instances not belonging to any configured group.
    pub ignored: usize,
}

struct SnapshotFile {
    path: PathBuf,
    /// Serializes (read table, write file) pairs so writes land in order.
    write_lock: Mutex<()>,
}

struct Inner {
    records: Mutex<RecordMap>,
    snapshot: Option<SnapshotFile>,
}

/// Thread-safe instance record table.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

impl StateStore {
    /// Create an in-memory store.
    pub fn new() -> Self {
        Self::from_parts(RecordMap::new(), None)
    }

    /// Create a store persisted to a JSON snapshot at `path`.
    ///
    /// Existing snapshot content is loaded; an unreadable snapshot is
    /// logged and the store starts empty.
    pub fn with_snapshot(path: &Path) -> Self {
        let records = match snapshot::load(path) {
            Ok(records) => {
                info!(path = ?path, records = records.len(), "instance snapshot loaded");
                records
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "failed to load instance snapshot, starting empty");
                RecordMap::new()
            }
        };
        let file = SnapshotFile {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        };
        Self::from_parts(records, Some(file))
    }

    fn from_parts(records: RecordMap, snapshot: Option<SnapshotFile>) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(records),
                snapshot,
            }),
        }
    }

    fn records(&self) -> MutexGuard<'_, RecordMap> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get(&self, instance_id: &str) -> Option<InstanceRecord> {
        self.records().get(instance_id).cloned()
    }

    /// Look up a record by `verda://` provider id. Anything else is absent.
    pub fn get_by_provider_id(&self, provider_id: &str) -> Option<InstanceRecord> {
        let instance_id = parse_provider_id(provider_id)?;
        self.get(instance_id)
    }

    /// Records of one group, oldest first.
    pub fn list_by_group(&self, group_id: &str) -> Vec<InstanceRecord> {
        let mut records: Vec<InstanceRecord> = self
            .records()
            .values()
            .filter(|r| r.node_group == group_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        records
    }

    pub fn count_by_group(&self, group_id: &str) -> usize {
        self.records()
            .values()
            .filter(|r| r.node_group == group_id)
            .count()
    }

    pub fn all(&self) -> Vec<InstanceRecord> {
        self.records().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Insert or replace a record by instance id.
    pub fn add(&self, record: InstanceRecord) {
        debug!(
            instance_id = %record.instance_id,
            group = %record.node_group,
            "tracking instance"
        );
        self.records().insert(record.instance_id.clone(), record);
        self.persist();
    }

    /// Stop tracking an instance. Returns whether it was tracked.
    pub fn remove(&self, instance_id: &str) -> bool {
        let existed = self.records().remove(instance_id).is_some();
        if existed {
            debug!(%instance_id, "instance untracked");
            self.persist();
        }
        existed
    }

    /// Reconcile the table with the backend's live instance list.
    ///
    /// Tracked instances missing from `live` are dropped, live instances
    /// whose hostname starts with `{group}-` are adopted, and tracked ones
    /// get their status and hostname refreshed. `created_at` and
    /// `provider_id` are never rewritten.
    pub fn reconcile(
        &self,
        live: &[LiveInstance],
        groups: &BTreeMap<String, NodeGroupConfig>,
    ) -> ReconcileSummary {
        let base = self.records().clone();
        let (next, summary) = plan(&base, live, groups, Utc::now());

        {
            let mut current = self.records();
            let merged = merge_concurrent(&base, next, &current);
            *current = merged;
        }
        self.persist();

        if summary.adopted + summary.removed + summary.updated > 0 {
            info!(
                adopted = summary.adopted,
                removed = summary.removed,
                updated = summary.updated,
                ignored = summary.ignored,
                "instance state reconciled"
            );
        } else {
            debug!(ignored = summary.ignored, "instance state unchanged");
        }
        summary
    }

    fn persist(&self) {
        let Some(file) = &self.inner.snapshot else {
            return;
        };
        let _write = file.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let records = self.records().clone();
        if let Err(e) = snapshot::save(&file.path, &records) {
            warn!(path = ?file.path, error = %e, "failed to write instance snapshot");
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick the node group owning `hostname`: the longest group id `g` such
/// that the hostname starts with `g-`.
pub fn match_group<'a, I>(hostname: &str, groups: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a String>,
{
    groups
        .into_iter()
        .map(String::as_str)
        .filter(|group| {
            hostname
                .strip_prefix(*group)
                .is_some_and(|rest| rest.starts_with('-'))
        })
        .max_by_key(|group| group.len())
}

/// Compute the next table from `base` and the live list.
fn plan(
    base: &RecordMap,
    live: &[LiveInstance],
    groups: &BTreeMap<String, NodeGroupConfig>,
    now: DateTime<Utc>,
) -> (RecordMap, ReconcileSummary) {
    let mut summary = ReconcileSummary::default();
    let mut next = RecordMap::with_capacity(live.len());

    for instance in live {
        match base.get(&instance.id) {
            Some(existing) if groups.contains_key(&existing.node_group) => {
                let mut record = existing.clone();
                if record.status != instance.status || record.hostname != instance.hostname {
                    record.status = instance.status.clone();
                    record.hostname = instance.hostname.clone();
                    summary.updated += 1;
                }
                next.insert(record.instance_id.clone(), record);
            }
            // Tracked under a group that is no longer configured.
            Some(_) => {}
            None => match match_group(&instance.hostname, groups.keys()) {
                Some(group) => {
                    debug!(
                        instance_id = %instance.id,
                        hostname = %instance.hostname,
                        %group,
                        "adopting untracked instance"
                    );
                    let record = InstanceRecord::new(
                        instance.id.clone(),
                        instance.hostname.clone(),
                        group,
                        instance.status.clone(),
                        now,
                    );
                    next.insert(record.instance_id.clone(), record);
                    summary.adopted += 1;
                }
                None => summary.ignored += 1,
            },
        }
    }

    summary.removed = base.keys().filter(|id| !next.contains_key(*id)).count();
    (next, summary)
}

/// Fold mutations made while a pass was computing into its result:
/// records added since `base` was taken are kept, records removed since
/// then stay removed.
fn merge_concurrent(base: &RecordMap, mut next: RecordMap, current: &RecordMap) -> RecordMap {
    for (id, record) in current {
        if !base.contains_key(id) {
            next.insert(id.clone(), record.clone());
        }
    }
    let live_ids: HashSet<&String> = current.keys().collect();
    next.retain(|id, _| !base.contains_key(id) || live_ids.contains(id));
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn group_config() -> NodeGroupConfig {
        NodeGroupConfig {
            instance_type: "1V100.6V".to_string(),
            image: "ubuntu-24.04-cuda".to_string(),
            min_size: 0,
            max_size: 3,
            location: "FIN-01".to_string(),
            ssh_key_ids: vec![],
            startup_script_id: None,
            contract: Default::default(),
            pricing: Default::default(),
            hourly_price: 1.0,
            resources: None,
            labels: Default::default(),
        }
    }

    fn groups(ids: &[&str]) -> BTreeMap<String, NodeGroupConfig> {
        ids.iter()
            .map(|id| (id.to_string(), group_config()))
            .collect()
    }

    fn snapshot_of(store: &StateStore) -> Vec<InstanceRecord> {
        let mut all = store.all();
        all.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        all
    }

    #[test]
    fn add_get_remove() {
        let store = StateStore::new();
        store.add(InstanceRecord::creating("i-1", "gpu-pool-aaaa1111", "gpu-pool"));

        let record = store.get("i-1").unwrap();
        assert_eq!(record.provider_id, "verda://i-1");
        assert_eq!(record.status, "creating");

        assert!(store.remove("i-1"));
        assert!(!store.remove("i-1"));
        assert!(store.get("i-1").is_none());
    }

    #[test]
    fn provider_id_lookup_fails_closed() {
        let store = StateStore::new();
        store.add(InstanceRecord::creating("i-1", "gpu-pool-aaaa1111", "gpu-pool"));

        assert_eq!(store.get_by_provider_id("verda://i-1"), store.get("i-1"));
        assert!(store.get_by_provider_id("i-1").is_none());
        assert!(store.get_by_provider_id("gce://i-1").is_none());
        assert!(store.get_by_provider_id("verda://").is_none());
    }

    #[test]
    fn list_by_group_filters() {
        let store = StateStore::new();
        store.add(InstanceRecord::creating("i-1", "gpu-pool-1", "gpu-pool"));
        store.add(InstanceRecord::creating("i-2", "cpu-pool-1", "cpu-pool"));
        store.add(InstanceRecord::creating("i-3", "gpu-pool-2", "gpu-pool"));

        assert_eq!(store.list_by_group("gpu-pool").len(), 2);
        assert_eq!(store.count_by_group("cpu-pool"), 1);
        assert!(store.list_by_group("missing").is_empty());
    }

    #[test]
    fn reconcile_adopts_matching_and_ignores_foreign() {
        let store = StateStore::new();
        let live = vec![
            LiveInstance::new("i-1", "gpu-pool-aaaa1111", "running"),
            LiveInstance::new("i-2", "someone-elses-box", "running"),
            LiveInstance::new("i-3", "gpu-poolx-1", "running"),
        ];

        let summary = store.reconcile(&live, &groups(&["gpu-pool"]));

        assert_eq!(summary.adopted, 1);
        assert_eq!(summary.ignored, 2);
        let members = store.list_by_group("gpu-pool");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].instance_id, "i-1");
        assert_eq!(members[0].status, "running");
    }

    #[test]
    fn reconcile_removes_vanished_instances() {
        let store = StateStore::new();
        store.add(InstanceRecord::creating("i-1", "gpu-pool-1", "gpu-pool"));
        store.add(InstanceRecord::creating("i-2", "gpu-pool-2", "gpu-pool"));

        let live = vec![LiveInstance::new("i-2", "gpu-pool-2", "running")];
        let summary = store.reconcile(&live, &groups(&["gpu-pool"]));

        assert_eq!(summary.removed, 1);
        assert!(store.get("i-1").is_none());
        assert!(store.get("i-2").is_some());
    }

    #[test]
    fn reconcile_refreshes_status_but_keeps_identity() {
        let store = StateStore::new();
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        store.add(InstanceRecord::new("i-1", "gpu-pool-1", "gpu-pool", "creating", created));

        let live = vec![LiveInstance::new("i-1", "gpu-pool-1-renamed", "running")];
        let summary = store.reconcile(&live, &groups(&["gpu-pool"]));

        assert_eq!(summary.updated, 1);
        let record = store.get("i-1").unwrap();
        assert_eq!(record.status, "running");
        assert_eq!(record.hostname, "gpu-pool-1-renamed");
        assert_eq!(record.created_at, created);
        assert_eq!(record.provider_id, "verda://i-1");
        assert_eq!(record.node_group, "gpu-pool");
    }

    #[test]
    fn reconcile_is_idempotent() {
        let store = StateStore::new();
        store.add(InstanceRecord::creating("i-0", "gpu-pool-0", "gpu-pool"));
        let live = vec![
            LiveInstance::new("i-1", "gpu-pool-1", "running"),
            LiveInstance::new("i-2", "cpu-pool-1", "provisioning"),
            LiveInstance::new("i-3", "stray", "running"),
        ];
        let config = groups(&["gpu-pool", "cpu-pool"]);

        store.reconcile(&live, &config);
        let once = snapshot_of(&store);
        let second = store.reconcile(&live, &config);
        let twice = snapshot_of(&store);

        assert_eq!(once, twice);
        assert_eq!(second, ReconcileSummary { ignored: 1, ..Default::default() });
    }

    #[test]
    fn reconcile_drops_records_of_unconfigured_groups() {
        let store = StateStore::new();
        store.add(InstanceRecord::creating("i-1", "old-pool-1", "old-pool"));

        let live = vec![LiveInstance::new("i-1", "old-pool-1", "running")];
        let summary = store.reconcile(&live, &groups(&["gpu-pool"]));

        assert_eq!(summary.removed, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn longest_group_prefix_wins() {
        let config = groups(&["gpu", "gpu-big"]);
        assert_eq!(match_group("gpu-big-1a2b3c4d", config.keys()), Some("gpu-big"));
        assert_eq!(match_group("gpu-1a2b3c4d", config.keys()), Some("gpu"));
        assert_eq!(match_group("gpubig-1", config.keys()), None);
        assert_eq!(match_group("gpu", config.keys()), None);
    }

    #[test]
    fn concurrent_mutations_survive_the_swap() {
        let mut base = RecordMap::new();
        let old = InstanceRecord::creating("i-old", "gpu-pool-1", "gpu-pool");
        let gone = InstanceRecord::creating("i-gone", "gpu-pool-2", "gpu-pool");
        base.insert(old.instance_id.clone(), old.clone());
        base.insert(gone.instance_id.clone(), gone.clone());

        // The pass saw both instances still live.
        let next = base.clone();

        // Meanwhile one instance was created and one deleted locally.
        let mut current = base.clone();
        current.remove("i-gone");
        let fresh = InstanceRecord::creating("i-new", "gpu-pool-3", "gpu-pool");
        current.insert(fresh.instance_id.clone(), fresh.clone());

        let merged = merge_concurrent(&base, next, &current);
        assert!(merged.contains_key("i-old"));
        assert!(merged.contains_key("i-new"));
        assert!(!merged.contains_key("i-gone"));
    }

    #[test]
    fn snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");

        let store = StateStore::with_snapshot(&path);
        store.add(InstanceRecord::creating("i-1", "gpu-pool-1", "gpu-pool"));
        store.add(InstanceRecord::creating("i-2", "gpu-pool-2", "gpu-pool"));
        store.remove("i-2");

        let reopened = StateStore::with_snapshot(&path);
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get("i-1"), store.get("i-1"));
    }

    #[test]
    fn unreadable_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");
        std::fs::write(&path, "garbage").unwrap();

        let store = StateStore::with_snapshot(&path);
        assert!(store.is_empty());
    }
}
