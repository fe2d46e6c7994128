//! CloudProvider gRPC service.
//!
//! Each RPC is one call into the [`NodeGroupEngine`]; this layer only
//! translates messages and maps engine errors to status codes.

use std::sync::Arc;

use prost::Message;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use verda_nodegroup::{NodeGroupEngine, GPU_LABEL};

use crate::convert;
use crate::proto;
use crate::proto::cloud_provider_server::{CloudProvider, CloudProviderServer};

/// gRPC implementation of the externalgrpc cloud provider.
pub struct VerdaCloudProvider {
    engine: Arc<NodeGroupEngine>,
}

impl VerdaCloudProvider {
    pub fn new(engine: Arc<NodeGroupEngine>) -> Self {
        Self { engine }
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> CloudProviderServer<Self> {
        CloudProviderServer::new(self)
    }
}

#[tonic::async_trait]
impl CloudProvider for VerdaCloudProvider {
    async fn node_groups(
        &self,
        _request: Request<proto::NodeGroupsRequest>,
    ) -> Result<Response<proto::NodeGroupsResponse>, Status> {
        let node_groups = self
            .engine
            .node_groups()
            .into_iter()
            .map(convert::node_group)
            .collect();
        Ok(Response::new(proto::NodeGroupsResponse { node_groups }))
    }

    async fn node_group_for_node(
        &self,
        request: Request<proto::NodeGroupForNodeRequest>,
    ) -> Result<Response<proto::NodeGroupForNodeResponse>, Status> {
        let node = convert::node_ref(request.into_inner().node);
        let node_group = match self.engine.node_group_for_node(&node) {
            Some(group) => convert::node_group(group),
            None => {
                debug!(provider_id = %node.provider_id, "node not managed by this provider");
                proto::NodeGroup::default()
            }
        };
        Ok(Response::new(proto::NodeGroupForNodeResponse {
            node_group: Some(node_group),
        }))
    }

    async fn pricing_node_price(
        &self,
        request: Request<proto::PricingNodePriceRequest>,
    ) -> Result<Response<proto::PricingNodePriceResponse>, Status> {
        let req = request.into_inner();
        let start = convert::timestamp(req.start_timestamp.as_ref())?;
        let end = convert::timestamp(req.end_timestamp.as_ref())?;
        let node = convert::node_ref(req.node);

        let price = self
            .engine
            .node_price(&node, start, end)
            .map_err(convert::to_status)?;
        Ok(Response::new(proto::PricingNodePriceResponse { price }))
    }

    async fn gpu_label(
        &self,
        _request: Request<proto::GpuLabelRequest>,
    ) -> Result<Response<proto::GpuLabelResponse>, Status> {
        Ok(Response::new(proto::GpuLabelResponse {
            label: GPU_LABEL.to_string(),
        }))
    }

    async fn cleanup(
        &self,
        _request: Request<proto::CleanupRequest>,
    ) -> Result<Response<proto::CleanupResponse>, Status> {
        info!("cleanup requested");
        Ok(Response::new(proto::CleanupResponse {}))
    }

    async fn refresh(
        &self,
        _request: Request<proto::RefreshRequest>,
    ) -> Result<Response<proto::RefreshResponse>, Status> {
        self.engine.refresh().await;
        Ok(Response::new(proto::RefreshResponse {}))
    }

    async fn node_group_target_size(
        &self,
        request: Request<proto::NodeGroupTargetSizeRequest>,
    ) -> Result<Response<proto::NodeGroupTargetSizeResponse>, Status> {
        let id = request.into_inner().id;
        let size = self.engine.target_size(&id).map_err(convert::to_status)?;
        Ok(Response::new(proto::NodeGroupTargetSizeResponse {
            target_size: convert::clamp_i32(size),
        }))
    }

    async fn node_group_increase_size(
        &self,
        request: Request<proto::NodeGroupIncreaseSizeRequest>,
    ) -> Result<Response<proto::NodeGroupIncreaseSizeResponse>, Status> {
        let req = request.into_inner();
        self.engine
            .increase_size(&req.id, req.delta)
            .await
            .map_err(convert::to_status)?;
        Ok(Response::new(proto::NodeGroupIncreaseSizeResponse {}))
    }

    async fn node_group_delete_nodes(
        &self,
        request: Request<proto::NodeGroupDeleteNodesRequest>,
    ) -> Result<Response<proto::NodeGroupDeleteNodesResponse>, Status> {
        let req = request.into_inner();
        let nodes: Vec<_> = req
            .nodes
            .into_iter()
            .map(|n| convert::node_ref(Some(n)))
            .collect();
        self.engine
            .delete_nodes(&req.id, &nodes)
            .await
            .map_err(convert::to_status)?;
        Ok(Response::new(proto::NodeGroupDeleteNodesResponse {}))
    }

    async fn node_group_decrease_target_size(
        &self,
        request: Request<proto::NodeGroupDecreaseTargetSizeRequest>,
    ) -> Result<Response<proto::NodeGroupDecreaseTargetSizeResponse>, Status> {
        let req = request.into_inner();
        self.engine
            .decrease_target_size(&req.id, req.delta)
            .map_err(convert::to_status)?;
        Ok(Response::new(proto::NodeGroupDecreaseTargetSizeResponse {}))
    }

    async fn node_group_nodes(
        &self,
        request: Request<proto::NodeGroupNodesRequest>,
    ) -> Result<Response<proto::NodeGroupNodesResponse>, Status> {
        let id = request.into_inner().id;
        let instances = self
            .engine
            .nodes(&id)
            .await
            .map_err(convert::to_status)?
            .into_iter()
            .map(|node| proto::Instance {
                status: Some(proto::InstanceStatus {
                    instance_state: convert::instance_state(node.status.as_deref()).into(),
                    error_info: None,
                }),
                id: node.id,
            })
            .collect();
        Ok(Response::new(proto::NodeGroupNodesResponse { instances }))
    }

    async fn node_group_template_node_info(
        &self,
        request: Request<proto::NodeGroupTemplateNodeInfoRequest>,
    ) -> Result<Response<proto::NodeGroupTemplateNodeInfoResponse>, Status> {
        let id = request.into_inner().id;
        let template = self.engine.template_node(&id).map_err(convert::to_status)?;
        let node = convert::kube_node(template);
        let node_bytes = node.encode_to_vec();
        Ok(Response::new(proto::NodeGroupTemplateNodeInfoResponse {
            node_info: Some(node),
            node_bytes,
        }))
    }
}
