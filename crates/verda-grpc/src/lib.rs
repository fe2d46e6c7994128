//! verda-grpc — the cluster-autoscaler externalgrpc `CloudProvider`
//! service backed by a [`verda_nodegroup::NodeGroupEngine`].
//!
//! # Architecture
//!
//! ```text
//! cluster-autoscaler ──gRPC (optionally mTLS)──► VerdaCloudProvider
//!                                                  ├── convert (messages, status codes)
//!                                                  └── NodeGroupEngine
//! ```
//!
//! RPCs not declared in `proto/externalgrpc.proto` (GetOptions, PodPrice,
//! GPU types) are answered with `UNIMPLEMENTED` by tonic.

pub mod convert;
pub mod server;
pub mod tls;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("clusterautoscaler.cloudprovider.v1.externalgrpc");
}

pub use server::VerdaCloudProvider;
pub use tls::{load_server_tls, TlsFiles};
