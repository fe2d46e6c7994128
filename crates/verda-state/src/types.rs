//! Tracked instance records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use verda_core::{provider_id, GroupId, InstanceId};

/// Status given to records created locally, before the backend reports one.
pub const STATUS_CREATING: &str = "creating";

/// One cloud instance known to belong to a configured node group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    /// `{group_id}-{suffix}`, assigned at creation.
    pub hostname: String,
    pub node_group: GroupId,
    /// `verda://{instance_id}`.
    pub provider_id: String,
    /// Set once; reconciliation never rewrites it.
    pub created_at: DateTime<Utc>,
    /// Raw backend status string.
    pub status: String,
}

impl InstanceRecord {
    pub fn new(
        instance_id: impl Into<String>,
        hostname: impl Into<String>,
        node_group: impl Into<String>,
        status: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let instance_id = instance_id.into();
        Self {
            provider_id: provider_id(&instance_id),
            instance_id,
            hostname: hostname.into(),
            node_group: node_group.into(),
            created_at,
            status: status.into(),
        }
    }

    /// Record for an instance this process just asked the backend to create.
    pub fn creating(
        instance_id: impl Into<String>,
        hostname: impl Into<String>,
        node_group: impl Into<String>,
    ) -> Self {
        Self::new(instance_id, hostname, node_group, STATUS_CREATING, Utc::now())
    }
}
