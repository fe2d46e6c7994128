//! Per-group boot scripts that join new instances to the cluster.
//!
//! Scripts are named `k8s-verda-init-{group}` and compared by content:
//! an identical script is reused, a stale one is replaced, a missing one
//! is created. Calling [`StartupScriptProvisioner::ensure`] on every
//! scale-up never accumulates duplicates.

use std::collections::BTreeMap;
use std::sync::Arc;

use askama::Template;
use tracing::{debug, info, warn};

use verda_client::VerdaApi;
use verda_core::KubernetesConfig;

use crate::error::{EngineError, EngineResult};

#[derive(Template)]
#[template(path = "verda_init.sh", escape = "none")]
struct InitScript<'a> {
    k8s_endpoint: &'a str,
    k8s_token: &'a str,
    k8s_ca_hash: &'a str,
    labels: &'a str,
}

pub fn script_name(group_id: &str) -> String {
    format!("k8s-verda-init-{group_id}")
}

/// `k=v,k2=v2`, the format kubelet's `--node-labels` expects.
fn label_list(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub struct StartupScriptProvisioner {
    api: Arc<dyn VerdaApi>,
    kubernetes: KubernetesConfig,
}

impl StartupScriptProvisioner {
    pub fn new(api: Arc<dyn VerdaApi>, kubernetes: KubernetesConfig) -> Self {
        Self { api, kubernetes }
    }

    pub fn render(&self, labels: &BTreeMap<String, String>) -> EngineResult<String> {
        let labels = label_list(labels);
        InitScript {
            k8s_endpoint: &self.kubernetes.endpoint,
            k8s_token: &self.kubernetes.token,
            k8s_ca_hash: &self.kubernetes.ca_hash,
            labels: &labels,
        }
        .render()
        .map_err(|e| EngineError::StartupScript(format!("render failed: {e}")))
    }

    /// Make sure the group's script exists with the current content and
    /// return its id.
    ///
    /// If replacing an outdated script fails, the outdated id is returned:
    /// booting with an old script beats not booting at all.
    pub async fn ensure(
        &self,
        group_id: &str,
        labels: &BTreeMap<String, String>,
    ) -> EngineResult<String> {
        let name = script_name(group_id);
        let content = self.render(labels)?;

        let scripts = self
            .api
            .list_startup_scripts()
            .await
            .map_err(|e| EngineError::StartupScript(format!("listing scripts: {e}")))?;

        let Some(existing) = scripts.into_iter().find(|s| s.name == name) else {
            info!(script = %name, "creating startup script");
            return self
                .api
                .create_startup_script(&name, &content)
                .await
                .map_err(|e| EngineError::StartupScript(format!("creating '{name}': {e}")));
        };

        if existing.script == content {
            debug!(script = %name, id = %existing.id, "startup script up to date");
            return Ok(existing.id);
        }

        info!(script = %name, id = %existing.id, "replacing outdated startup script");
        let replaced = match self.api.delete_startup_script(&existing.id).await {
            Ok(()) => self.api.create_startup_script(&name, &content).await,
            Err(e) => Err(e),
        };
        match replaced {
            Ok(id) => Ok(id),
            Err(e) => {
                warn!(script = %name, id = %existing.id, error = %e, "failed to replace startup script, using the existing one");
                Ok(existing.id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verda_client::testing::FakeVerda;

    fn kubernetes() -> KubernetesConfig {
        KubernetesConfig {
            endpoint: "10.0.0.1:6443".to_string(),
            token: "abcdef.0123456789abcdef".to_string(),
            ca_hash: "sha256:deadbeef".to_string(),
        }
    }

    fn labels() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("workload".to_string(), "training".to_string()),
            ("tier".to_string(), "gpu".to_string()),
        ])
    }

    #[test]
    fn render_fills_join_parameters() {
        let provisioner = StartupScriptProvisioner::new(Arc::new(FakeVerda::new()), kubernetes());
        let script = provisioner.render(&labels()).unwrap();

        assert!(script.starts_with("#!/usr/bin/env bash"));
        assert!(script.contains("K8S_ENDPOINT=\"10.0.0.1:6443\""));
        assert!(script.contains("K8S_TOKEN=\"abcdef.0123456789abcdef\""));
        assert!(script.contains("K8S_CA_HASH=\"sha256:deadbeef\""));
        assert!(script.contains("NODE_LABELS=\"tier=gpu,workload=training\""));
    }

    #[tokio::test]
    async fn creates_missing_script_once() {
        let fake = Arc::new(FakeVerda::new());
        let provisioner = StartupScriptProvisioner::new(fake.clone(), kubernetes());

        let first = provisioner.ensure("gpu-pool", &labels()).await.unwrap();
        let second = provisioner.ensure("gpu-pool", &labels()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fake.script_creates(), 1);
        assert_eq!(fake.scripts().len(), 1);
        assert_eq!(fake.scripts()[0].name, "k8s-verda-init-gpu-pool");
    }

    #[tokio::test]
    async fn outdated_script_is_replaced() {
        let fake = Arc::new(FakeVerda::new().with_script(
            "old",
            "k8s-verda-init-gpu-pool",
            "#!/bin/sh\necho stale\n",
        ));
        let provisioner = StartupScriptProvisioner::new(fake.clone(), kubernetes());

        let id = provisioner.ensure("gpu-pool", &labels()).await.unwrap();

        assert_ne!(id, "old");
        assert_eq!(fake.script_deletes(), 1);
        let scripts = fake.scripts();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].id, id);
    }

    #[tokio::test]
    async fn failed_replace_falls_back_to_existing_id() {
        let fake = Arc::new(FakeVerda::new().with_script(
            "old",
            "k8s-verda-init-gpu-pool",
            "#!/bin/sh\necho stale\n",
        ));
        fake.set_fail_script_delete(true);
        let provisioner = StartupScriptProvisioner::new(fake.clone(), kubernetes());

        let id = provisioner.ensure("gpu-pool", &labels()).await.unwrap();
        assert_eq!(id, "old");
        assert_eq!(fake.script_creates(), 0);
    }

    #[tokio::test]
    async fn listing_failure_is_an_error() {
        let fake = Arc::new(FakeVerda::new());
        fake.set_fail_script_list(true);
        let provisioner = StartupScriptProvisioner::new(fake, kubernetes());

        assert!(matches!(
            provisioner.ensure("gpu-pool", &labels()).await,
            Err(EngineError::StartupScript(_))
        ));
    }

    #[tokio::test]
    async fn other_groups_scripts_are_left_alone() {
        let fake = Arc::new(FakeVerda::new().with_script("cpu", "k8s-verda-init-cpu-pool", "x"));
        let provisioner = StartupScriptProvisioner::new(fake.clone(), kubernetes());

        provisioner.ensure("gpu-pool", &labels()).await.unwrap();
        assert_eq!(fake.script_deletes(), 0);
        assert_eq!(fake.scripts().len(), 2);
    }
}
