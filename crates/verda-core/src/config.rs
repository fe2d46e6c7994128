//! config.yaml parser and validation for node groups.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Datacenter locations instances may be created in.
pub const ALLOWED_LOCATIONS: &[&str] = &["FIN-01", "FIN-02", "FIN-03", "ICE-01"];

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("node group '{group}': {reason}")]
    InvalidGroup { group: String, reason: String },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub node_groups: BTreeMap<String, NodeGroupConfig>,
    pub kubernetes: KubernetesConfig,
}

/// Cluster join parameters rendered into every startup script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KubernetesConfig {
    pub endpoint: String,
    pub token: String,
    pub ca_hash: String,
}

/// Static node shape, used when the instance-type catalog has no entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcesConfig {
    pub cpu: u32,
    pub memory_gb: u32,
    #[serde(default)]
    pub gpu_count: u32,
    #[serde(default)]
    pub gpu_model: Option<String>,
    #[serde(default)]
    pub gpu_memory_gb: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeGroupConfig {
    pub instance_type: String,
    pub image: String,
    #[serde(default)]
    pub min_size: u32,
    pub max_size: u32,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default)]
    pub ssh_key_ids: Vec<String>,
    /// Pre-provisioned startup script; skips script management when set.
    #[serde(default)]
    pub startup_script_id: Option<String>,
    #[serde(default)]
    pub contract: Contract,
    #[serde(default)]
    pub pricing: Pricing,
    /// Fallback price when the catalog has no live price.
    pub hourly_price: f64,
    #[serde(default)]
    pub resources: Option<ResourcesConfig>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Contract {
    LongTerm,
    #[default]
    PayAsYouGo,
    Spot,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Pricing {
    FixedPrice,
    #[default]
    DynamicPrice,
}

fn default_location() -> String {
    "FIN-01".to_string()
}

impl Contract {
    pub fn as_str(&self) -> &'static str {
        match self {
            Contract::LongTerm => "LONG_TERM",
            Contract::PayAsYouGo => "PAY_AS_YOU_GO",
            Contract::Spot => "SPOT",
        }
    }
}

impl Pricing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pricing::FixedPrice => "FIXED_PRICE",
            Pricing::DynamicPrice => "DYNAMIC_PRICE",
        }
    }
}

impl AppConfig {
    /// Load and validate a config file. `.toml` files are parsed as TOML,
    /// everything else as YAML.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn group(&self, group_id: &str) -> Option<&NodeGroupConfig> {
        self.node_groups.get(group_id)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.node_groups.is_empty() {
            return Err(ConfigError::Invalid("no node groups configured".to_string()));
        }
        if self.kubernetes.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("kubernetes.endpoint is empty".to_string()));
        }
        for (id, group) in &self.node_groups {
            let invalid = |reason: String| ConfigError::InvalidGroup {
                group: id.clone(),
                reason,
            };

            if !is_hostname_prefix(id) {
                return Err(invalid(
                    "id must be lowercase alphanumerics and '-', not starting or ending with '-'"
                        .to_string(),
                ));
            }
            if group.max_size == 0 {
                return Err(invalid("max_size must be greater than 0".to_string()));
            }
            if group.min_size > group.max_size {
                return Err(invalid(format!(
                    "min_size {} exceeds max_size {}",
                    group.min_size, group.max_size
                )));
            }
            if !group.hourly_price.is_finite() || group.hourly_price < 0.0 {
                return Err(invalid(format!(
                    "hourly_price must be a non-negative number, got {}",
                    group.hourly_price
                )));
            }
            if !ALLOWED_LOCATIONS.contains(&group.location.as_str()) {
                return Err(invalid(format!(
                    "invalid location '{}', allowed: {}",
                    group.location,
                    ALLOWED_LOCATIONS.join(", ")
                )));
            }
            if group.instance_type.trim().is_empty() || group.image.trim().is_empty() {
                return Err(invalid("instance_type and image are required".to_string()));
            }
            if let Some(resources) = &group.resources
                && (resources.cpu == 0 || resources.memory_gb == 0)
            {
                return Err(invalid("resources.cpu and resources.memory_gb must be > 0".to_string()));
            }
        }
        Ok(())
    }
}

fn is_hostname_prefix(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('-')
        && !id.ends_with('-')
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
kubernetes:
  endpoint: "10.0.0.1:6443"
  token: "abcdef.0123456789abcdef"
  ca_hash: "sha256:deadbeef"
node_groups:
  gpu-pool:
    instance_type: "1V100.6V"
    image: "ubuntu-24.04-cuda-12.8"
    max_size: 3
    hourly_price: 0.89
    contract: SPOT
    pricing: FIXED_PRICE
    labels:
      workload: training
  cpu-pool:
    instance_type: "CPU.4V.16G"
    image: "ubuntu-24.04"
    min_size: 1
    max_size: 10
    location: FIN-03
    hourly_price: 0.05
"#;

    #[test]
    fn parse_yaml_with_defaults() {
        let config = AppConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(config.node_groups.len(), 2);

        let gpu = config.group("gpu-pool").unwrap();
        assert_eq!(gpu.min_size, 0);
        assert_eq!(gpu.location, "FIN-01");
        assert_eq!(gpu.contract, Contract::Spot);
        assert_eq!(gpu.pricing, Pricing::FixedPrice);
        assert_eq!(gpu.labels.get("workload").map(String::as_str), Some("training"));

        let cpu = config.group("cpu-pool").unwrap();
        assert_eq!(cpu.contract, Contract::PayAsYouGo);
        assert_eq!(cpu.pricing, Pricing::DynamicPrice);
        assert_eq!(cpu.location, "FIN-03");
    }

    #[test]
    fn parse_toml() {
        let toml_str = r#"
[kubernetes]
endpoint = "10.0.0.1:6443"
token = "t"
ca_hash = "sha256:00"

[node_groups.cpu]
instance_type = "CPU.4V.16G"
image = "ubuntu-24.04"
max_size = 2
hourly_price = 0.1
"#;
        let config = AppConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.group("cpu").unwrap().max_size, 2);
    }

    #[test]
    fn rejects_unknown_location() {
        let yaml = YAML.replace("FIN-03", "MARS-01");
        let err = AppConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidGroup { ref group, .. } if group == "cpu-pool"));
    }

    #[test]
    fn rejects_min_above_max() {
        let yaml = YAML.replace("min_size: 1", "min_size: 11");
        assert!(AppConfig::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn rejects_unknown_contract() {
        let yaml = YAML.replace("contract: SPOT", "contract: FOREVER");
        assert!(matches!(
            AppConfig::from_yaml_str(&yaml),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn rejects_group_ids_that_are_not_hostname_prefixes() {
        let yaml = YAML.replace("cpu-pool:", "Cpu_Pool:");
        assert!(AppConfig::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn from_file_picks_parser_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, YAML).unwrap();
        let config = AppConfig::from_file(&path).unwrap();
        assert!(config.group("gpu-pool").is_some());

        let missing = AppConfig::from_file(&dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
