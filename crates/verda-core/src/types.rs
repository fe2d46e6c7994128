//! Domain types shared across the provider crates.

use serde::{Deserialize, Serialize};

/// Scheme prefix of every provider id handed to Kubernetes.
pub const PROVIDER_ID_PREFIX: &str = "verda://";

/// Cloud-assigned instance identifier.
pub type InstanceId = String;

/// Node group identifier (a key of `AppConfig::node_groups`).
pub type GroupId = String;

/// Build the externally visible provider id for an instance.
pub fn provider_id(instance_id: &str) -> String {
    format!("{PROVIDER_ID_PREFIX}{instance_id}")
}

/// Extract the instance id from a provider id.
///
/// Returns `None` for anything without the `verda://` prefix or with an
/// empty remainder.
pub fn parse_provider_id(provider_id: &str) -> Option<&str> {
    provider_id
        .strip_prefix(PROVIDER_ID_PREFIX)
        .filter(|id| !id.is_empty())
}

/// An instance as currently reported by the Verda API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveInstance {
    pub id: InstanceId,
    pub hostname: String,
    /// Raw backend status string ("running", "provisioning", ...).
    pub status: String,
}

impl LiveInstance {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            status: status.into(),
        }
    }
}
