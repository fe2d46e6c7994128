//! verda-core — shared types for the Verda cloud provider.
//!
//! Holds the static node-group configuration (`config.yaml`) and the
//! small domain types every other crate speaks: provider ids and the
//! live instance view reported by the Verda API.

pub mod config;
pub mod types;

pub use config::{
    AppConfig, ConfigError, ConfigResult, Contract, KubernetesConfig, NodeGroupConfig, Pricing,
    ResourcesConfig,
};
pub use types::*;
