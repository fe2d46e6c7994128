//! Translation between engine types and externalgrpc messages.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tonic::Status;

use verda_nodegroup::{EngineError, NodeGroupInfo, NodeRef, NodeTemplate};

use crate::proto;
use crate::proto::instance_status::InstanceState;

/// Map a raw Verda status to the autoscaler's instance state. Instances
/// the backend does not list (yet) count as creating.
pub fn instance_state(status: Option<&str>) -> InstanceState {
    let Some(status) = status else {
        return InstanceState::InstanceCreating;
    };
    match status.to_ascii_lowercase().as_str() {
        "running" => InstanceState::InstanceRunning,
        "provisioning" | "offline" | "ordered" | "creating" => InstanceState::InstanceCreating,
        "deleting" => InstanceState::InstanceDeleting,
        _ => InstanceState::Unspecified,
    }
}

/// Engine errors as gRPC status codes.
pub fn to_status(err: EngineError) -> Status {
    let message = err.to_string();
    match err {
        EngineError::GroupNotFound(_) | EngineError::NodeNotFound(_) => Status::not_found(message),
        EngineError::InvalidArgument(_) => Status::invalid_argument(message),
        EngineError::CapacityExceeded { .. } => Status::resource_exhausted(message),
        EngineError::PartialIncrease { .. } => Status::aborted(message),
        EngineError::StartupScript(_) | EngineError::TemplateUnavailable { .. } => {
            Status::internal(message)
        }
    }
}

/// A missing timestamp is the epoch, as protobuf defaults would have it.
pub fn timestamp(time: Option<&proto::KubeTime>) -> Result<DateTime<Utc>, Status> {
    let Some(time) = time else {
        return Ok(DateTime::<Utc>::UNIX_EPOCH);
    };
    let nanos = u32::try_from(time.nanos)
        .map_err(|_| Status::invalid_argument(format!("negative nanos in timestamp: {}", time.nanos)))?;
    DateTime::<Utc>::from_timestamp(time.seconds, nanos)
        .ok_or_else(|| Status::invalid_argument(format!("timestamp out of range: {}s", time.seconds)))
}

pub fn node_group(info: NodeGroupInfo) -> proto::NodeGroup {
    proto::NodeGroup {
        id: info.id,
        min_size: clamp_i32(info.min_size),
        max_size: clamp_i32(info.max_size),
        debug: info.debug,
    }
}

pub fn node_ref(node: Option<proto::ExternalGrpcNode>) -> NodeRef {
    node.map(|n| NodeRef {
        provider_id: n.provider_id,
        name: n.name,
    })
    .unwrap_or_default()
}

fn quantities(values: BTreeMap<String, String>) -> HashMap<String, proto::KubeQuantity> {
    values
        .into_iter()
        .map(|(name, value)| (name, proto::KubeQuantity { string: value }))
        .collect()
}

pub fn kube_node(template: NodeTemplate) -> proto::KubeNode {
    proto::KubeNode {
        metadata: Some(proto::KubeObjectMeta {
            name: template.name,
            labels: template.labels.into_iter().collect(),
        }),
        status: Some(proto::KubeNodeStatus {
            capacity: quantities(template.capacity),
            allocatable: quantities(template.allocatable),
        }),
    }
}

/// Saturating conversion for sizes the wire carries as `int32`.
pub fn clamp_i32<T: TryInto<i32>>(value: T) -> i32 {
    value.try_into().unwrap_or(i32::MAX)
}
