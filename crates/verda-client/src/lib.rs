//! verda-client — access to the Verda cloud API.
//!
//! [`VerdaApi`] is the seam the node-group engine talks to. [`VerdaClient`]
//! implements it over HTTPS with OAuth2 client credentials; the `testing`
//! feature adds an in-memory [`testing::FakeVerda`] with failure injection.

pub mod error;
pub mod http;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use async_trait::async_trait;

pub use error::{ClientError, ClientResult};
pub use http::{Credentials, VerdaClient, DEFAULT_API_URL};
pub use types::{
    CpuSpec, CreateInstance, GpuSpec, Instance, InstanceType, SizeSpec, StartupScript,
};

/// Operations the provider needs from the Verda backend.
#[async_trait]
pub trait VerdaApi: Send + Sync {
    /// All instances of the account, in any state.
    async fn list_instances(&self) -> ClientResult<Vec<Instance>>;

    /// Deploy one instance. Returns the new instance id.
    async fn create_instance(&self, request: &CreateInstance) -> ClientResult<String>;

    /// Issue the `delete` action for an instance.
    async fn delete_instance(&self, instance_id: &str) -> ClientResult<()>;

    /// The instance-type catalog with hardware shape and prices.
    async fn list_instance_types(&self) -> ClientResult<Vec<InstanceType>>;

    async fn list_startup_scripts(&self) -> ClientResult<Vec<StartupScript>>;

    /// Create a startup script. Returns its id.
    async fn create_startup_script(&self, name: &str, script: &str) -> ClientResult<String>;

    async fn delete_startup_script(&self, script_id: &str) -> ClientResult<()>;
}
