//! Template node for a group: what a fresh instance would look like to
//! the scheduler, used by the autoscaler for scale-from-zero decisions.

use std::collections::BTreeMap;

use verda_core::{NodeGroupConfig, ResourcesConfig};

use crate::metadata::InstanceTypeMetadata;

pub const GPU_LABEL: &str = "verda.com/gpu";
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

const MAX_PODS: u32 = 110;
const GIB: u64 = 1024 * 1024 * 1024;
const CPU_RESERVED_CAP_MILLIS: u64 = 100;
const MEMORY_RESERVED_FLOOR: u64 = GIB / 2;

/// Hardware shape of an instance type.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeShape {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub gpu_count: u32,
    pub gpu_model: Option<String>,
}

impl From<&InstanceTypeMetadata> for NodeShape {
    fn from(meta: &InstanceTypeMetadata) -> Self {
        Self {
            cpu_cores: meta.cpu_cores,
            memory_gb: meta.memory_gb,
            gpu_count: meta.gpu_count,
            gpu_model: meta.gpu_model.clone(),
        }
    }
}

impl From<&ResourcesConfig> for NodeShape {
    fn from(resources: &ResourcesConfig) -> Self {
        Self {
            cpu_cores: resources.cpu,
            memory_gb: resources.memory_gb,
            gpu_count: resources.gpu_count,
            gpu_model: resources.gpu_model.clone(),
        }
    }
}

/// Kubernetes node skeleton: name, labels and resource quantities as
/// quantity strings (`"6000m"`, `"24696061952"`, `"110"`).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTemplate {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub capacity: BTreeMap<String, String>,
    pub allocatable: BTreeMap<String, String>,
}

impl NodeTemplate {
    pub fn build(group_id: &str, config: &NodeGroupConfig, shape: &NodeShape) -> Self {
        let cpu_millis = u64::from(shape.cpu_cores) * 1000;
        let cpu_reserved = CPU_RESERVED_CAP_MILLIS.min(cpu_millis * 6 / 100);
        let memory_bytes = u64::from(shape.memory_gb) * GIB;
        let memory_reserved = MEMORY_RESERVED_FLOOR.max(memory_bytes * 5 / 100);

        let mut capacity = BTreeMap::from([
            ("cpu".to_string(), format!("{cpu_millis}m")),
            ("memory".to_string(), memory_bytes.to_string()),
            ("pods".to_string(), MAX_PODS.to_string()),
        ]);
        let mut allocatable = BTreeMap::from([
            ("cpu".to_string(), format!("{}m", cpu_millis - cpu_reserved)),
            (
                "memory".to_string(),
                memory_bytes.saturating_sub(memory_reserved).to_string(),
            ),
            ("pods".to_string(), MAX_PODS.to_string()),
        ]);

        let mut labels = BTreeMap::from([
            (INSTANCE_TYPE_LABEL.to_string(), config.instance_type.clone()),
            (ZONE_LABEL.to_string(), config.location.clone()),
        ]);

        if shape.gpu_count > 0 {
            capacity.insert(GPU_RESOURCE.to_string(), shape.gpu_count.to_string());
            allocatable.insert(GPU_RESOURCE.to_string(), shape.gpu_count.to_string());
            let model = shape
                .gpu_model
                .as_deref()
                .map(label_value)
                .unwrap_or_else(|| "true".to_string());
            labels.insert(GPU_LABEL.to_string(), model);
        }

        // Group labels last so operators can override the defaults.
        labels.extend(config.labels.clone());

        Self {
            name: format!("{group_id}-template"),
            labels,
            capacity,
            allocatable,
        }
    }
}

/// Squash free text ("1x Tesla V100 16GB") into a valid label value
/// ("1x-Tesla-V100-16GB").
fn label_value(text: &str) -> String {
    let mapped: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let truncated: String = mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .chars()
        .take(63)
        .collect();
    truncated
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NodeGroupConfig {
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
            hourly_price: 0.89,
            resources: None,
            labels: BTreeMap::from([("workload".to_string(), "training".to_string())]),
        }
    }

    #[test]
    fn cpu_only_shape() {
        let shape = NodeShape {
            cpu_cores: 4,
            memory_gb: 16,
            gpu_count: 0,
            gpu_model: None,
        };
        let template = NodeTemplate::build("cpu-pool", &config(), &shape);

        assert_eq!(template.name, "cpu-pool-template");
        assert_eq!(template.capacity["cpu"], "4000m");
        assert_eq!(template.capacity["memory"], (16 * GIB).to_string());
        assert_eq!(template.capacity["pods"], "110");
        // 6% of 4000m is 240m, capped at 100m.
        assert_eq!(template.allocatable["cpu"], "3900m");
        // 5% of 16 GiB is 0.8 GiB, above the 0.5 GiB floor.
        assert_eq!(
            template.allocatable["memory"],
            (16 * GIB - 16 * GIB * 5 / 100).to_string()
        );
        assert!(!template.capacity.contains_key(GPU_RESOURCE));
        assert!(!template.labels.contains_key(GPU_LABEL));
        assert_eq!(template.labels[ZONE_LABEL], "FIN-01");
        assert_eq!(template.labels[INSTANCE_TYPE_LABEL], "1V100.6V");
        assert_eq!(template.labels["workload"], "training");
    }

    #[test]
    fn small_shape_uses_reservation_floors() {
        let shape = NodeShape {
            cpu_cores: 1,
            memory_gb: 2,
            gpu_count: 0,
            gpu_model: None,
        };
        let template = NodeTemplate::build("tiny", &config(), &shape);
        // 6% of 1000m is 60m.
        assert_eq!(template.allocatable["cpu"], "940m");
        assert_eq!(template.allocatable["memory"], (2 * GIB - GIB / 2).to_string());
    }

    #[test]
    fn gpu_shape_adds_resource_and_label() {
        let shape = NodeShape {
            cpu_cores: 6,
            memory_gb: 23,
            gpu_count: 1,
            gpu_model: Some("1x Tesla V100 16GB".to_string()),
        };
        let template = NodeTemplate::build("gpu-pool", &config(), &shape);

        assert_eq!(template.capacity[GPU_RESOURCE], "1");
        assert_eq!(template.allocatable[GPU_RESOURCE], "1");
        assert_eq!(template.labels[GPU_LABEL], "1x-Tesla-V100-16GB");
    }

    #[test]
    fn group_labels_override_defaults() {
        let mut cfg = config();
        cfg.labels.insert(ZONE_LABEL.to_string(), "custom".to_string());
        let shape = NodeShape {
            cpu_cores: 2,
            memory_gb: 8,
            gpu_count: 0,
            gpu_model: None,
        };
        let template = NodeTemplate::build("g", &cfg, &shape);
        assert_eq!(template.labels[ZONE_LABEL], "custom");
    }
}
