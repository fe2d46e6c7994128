//! Verda API payloads.

use serde::{Deserialize, Deserializer, Serialize};

use verda_core::{Contract, LiveInstance, Pricing};

/// An instance as returned by `GET /instances`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub location: String,
}

impl From<Instance> for LiveInstance {
    fn from(instance: Instance) -> Self {
        LiveInstance::new(instance.id, instance.hostname, instance.status)
    }
}

/// Body of `POST /instances`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreateInstance {
    pub instance_type: String,
    pub image: String,
    pub hostname: String,
    pub description: String,
    #[serde(rename = "location_code")]
    pub location: String,
    pub ssh_key_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_script_id: Option<String>,
    pub contract: Contract,
    pub pricing: Pricing,
    pub is_spot: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CpuSpec {
    #[serde(default)]
    pub number_of_cores: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SizeSpec {
    #[serde(default)]
    pub size_in_gigabytes: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GpuSpec {
    #[serde(default)]
    pub number_of_gpus: u32,
    #[serde(default)]
    pub description: Option<String>,
}

/// One entry of `GET /instance-types`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceType {
    pub instance_type: String,
    #[serde(default, deserialize_with = "price")]
    pub price_per_hour: Option<f64>,
    #[serde(default, alias = "spot_price_per_hour", deserialize_with = "price")]
    pub spot_price: Option<f64>,
    #[serde(default)]
    pub cpu: CpuSpec,
    #[serde(default)]
    pub memory: SizeSpec,
    #[serde(default)]
    pub gpu: GpuSpec,
    #[serde(default)]
    pub gpu_memory: SizeSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartupScript {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub script: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PriceValue {
    Number(f64),
    Text(String),
}

/// Prices arrive either as JSON numbers or as decimal strings.
fn price<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<PriceValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(PriceValue::Number(n)) => Ok(Some(n)),
        Some(PriceValue::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(PriceValue::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid price '{s}': {e}"))),
    }
}
