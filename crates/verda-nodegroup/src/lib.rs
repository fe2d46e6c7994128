//! verda-nodegroup — node-group lifecycle on top of the Verda API.
//!
//! # Architecture
//!
//! ```text
//! NodeGroupEngine
//!   ├── StateStore (verda-state)      tracked instances, size = record count
//!   ├── MetadataCache                 instance-type shape and prices
//!   ├── StartupScriptProvisioner      per-group join script, reused by content
//!   └── VerdaApi (verda-client)       list / create / delete instances
//! ```
//!
//! Read paths (`nodes`, `refresh`) absorb backend failures and keep serving
//! cached state. Mutating paths (`increase_size`, `delete_nodes`) report
//! them.

pub mod engine;
pub mod error;
pub mod metadata;
pub mod startup_script;
pub mod template;

pub use engine::{
    DeleteReport, GroupNode, InstanceRefresh, NodeGroupEngine, NodeGroupInfo, NodeRef,
    RefreshReport,
};
pub use error::{EngineError, EngineResult};
pub use metadata::{InstanceTypeMetadata, MetadataCache, MetadataRefresh};
pub use startup_script::StartupScriptProvisioner;
pub use template::{NodeShape, NodeTemplate, GPU_LABEL};
