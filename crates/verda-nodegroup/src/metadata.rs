//! Instance-type metadata cache.
//!
//! Holds the hardware shape and hourly prices of every Verda instance
//! type. The mapping is only ever replaced wholesale by [`MetadataCache::refresh`];
//! readers get a shared snapshot and never wait on the backend.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use verda_client::{InstanceType, VerdaApi};

/// Cached facts for one instance type.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceTypeMetadata {
    pub instance_type: String,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub gpu_memory_gb: u32,
    pub gpu_count: u32,
    pub gpu_model: Option<String>,
    pub spot_price: Option<f64>,
    pub on_demand_price: Option<f64>,
}

impl From<&InstanceType> for InstanceTypeMetadata {
    fn from(t: &InstanceType) -> Self {
        Self {
            instance_type: t.instance_type.clone(),
            cpu_cores: t.cpu.number_of_cores,
            memory_gb: t.memory.size_in_gigabytes,
            gpu_memory_gb: t.gpu_memory.size_in_gigabytes,
            gpu_count: t.gpu.number_of_gpus,
            gpu_model: t
                .gpu
                .description
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            spot_price: t.spot_price,
            on_demand_price: t.price_per_hour,
        }
    }
}

pub type MetadataMap = HashMap<String, InstanceTypeMetadata>;

/// Outcome of a refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataRefresh {
    /// The catalog was fetched and installed.
    Updated(usize),
    /// The fetch failed; the previous mapping is still served.
    KeptStale { error: String },
}

pub struct MetadataCache {
    api: Arc<dyn VerdaApi>,
    entries: RwLock<Arc<MetadataMap>>,
}

impl MetadataCache {
    pub fn new(api: Arc<dyn VerdaApi>) -> Self {
        Self {
            api,
            entries: RwLock::new(Arc::new(MetadataMap::new())),
        }
    }

    pub fn get(&self, instance_type: &str) -> Option<InstanceTypeMetadata> {
        self.get_all().get(instance_type).cloned()
    }

    pub fn get_all(&self) -> Arc<MetadataMap> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fetch the catalog and swap it in. Failures keep the old mapping.
    pub async fn refresh(&self) -> MetadataRefresh {
        let types = match self.api.list_instance_types().await {
            Ok(types) => types,
            Err(e) => {
                warn!(error = %e, "failed to refresh instance metadata, keeping cached entries");
                return MetadataRefresh::KeptStale {
                    error: e.to_string(),
                };
            }
        };

        let next: MetadataMap = types
            .iter()
            .map(|t| (t.instance_type.clone(), InstanceTypeMetadata::from(t)))
            .collect();
        let count = next.len();

        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        info!(instance_types = count, "refreshed instance metadata");
        MetadataRefresh::Updated(count)
    }
}
