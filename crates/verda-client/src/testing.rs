//! In-memory Verda backend for tests.
//!
//! `FakeVerda` keeps instances, instance types and startup scripts in a
//! mutex-guarded table and can be told to fail specific calls.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ClientError, ClientResult};
use crate::types::{CreateInstance, Instance, InstanceType, StartupScript};
use crate::VerdaApi;

/// Status the fake gives freshly created instances.
pub const FAKE_CREATED_STATUS: &str = "ordered";

#[derive(Default)]
struct FakeState {
    instances: Vec<Instance>,
    instance_types: Vec<InstanceType>,
    scripts: Vec<StartupScript>,
    next_id: u64,
    create_delay: Option<Duration>,

    create_calls: usize,
    created: Vec<CreateInstance>,
    deleted: Vec<String>,
    list_calls: usize,
    script_creates: usize,
    script_deletes: usize,

    fail_create_from: Option<usize>,
    fail_list: bool,
    fail_instance_types: bool,
    fail_deletes: HashSet<String>,
    fail_script_list: bool,
    fail_script_create: bool,
    fail_script_delete: bool,
}

fn injected(what: &str) -> ClientError {
    ClientError::Api {
        status: 500,
        body: format!("injected failure: {what}"),
    }
}

#[derive(Default)]
pub struct FakeVerda {
    state: Mutex<FakeState>,
}

impl FakeVerda {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Seeding ────────────────────────────────────────────────────

    pub fn with_instance(self, id: &str, hostname: &str, status: &str) -> Self {
        self.state().instances.push(Instance {
            id: id.to_string(),
            hostname: hostname.to_string(),
            status: status.to_string(),
            ..Default::default()
        });
        self
    }

    pub fn with_instance_type(self, instance_type: InstanceType) -> Self {
        self.state().instance_types.push(instance_type);
        self
    }

    pub fn with_script(self, id: &str, name: &str, script: &str) -> Self {
        self.state().scripts.push(StartupScript {
            id: id.to_string(),
            name: name.to_string(),
            script: script.to_string(),
        });
        self
    }

    /// Set the backend status of every instance.
    pub fn set_all_statuses(&self, status: &str) {
        for instance in &mut self.state().instances {
            instance.status = status.to_string();
        }
    }

    /// Remove an instance as if it had been deleted out of band.
    pub fn forget_instance(&self, id: &str) {
        self.state().instances.retain(|i| i.id != id);
    }

    pub fn set_instance_types(&self, instance_types: Vec<InstanceType>) {
        self.state().instance_types = instance_types;
    }

    /// Make every create call take `delay` before it answers.
    pub fn set_create_delay(&self, delay: Duration) {
        self.state().create_delay = Some(delay);
    }

    // ── Failure injection ──────────────────────────────────────────

    /// Fail the `call`-th create call (1-based) and every one after it.
    pub fn fail_create_from(&self, call: usize) {
        self.state().fail_create_from = Some(call);
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.state().fail_list = fail;
    }

    pub fn set_fail_instance_types(&self, fail: bool) {
        self.state().fail_instance_types = fail;
    }

    pub fn fail_delete_of(&self, instance_id: &str) {
        self.state().fail_deletes.insert(instance_id.to_string());
    }

    pub fn set_fail_script_list(&self, fail: bool) {
        self.state().fail_script_list = fail;
    }

    pub fn set_fail_script_create(&self, fail: bool) {
        self.state().fail_script_create = fail;
    }

    pub fn set_fail_script_delete(&self, fail: bool) {
        self.state().fail_script_delete = fail;
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn instances(&self) -> Vec<Instance> {
        self.state().instances.clone()
    }

    pub fn scripts(&self) -> Vec<StartupScript> {
        self.state().scripts.clone()
    }

    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    /// Successful create requests, in order.
    pub fn created(&self) -> Vec<CreateInstance> {
        self.state().created.clone()
    }

    /// Successfully deleted instance ids, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub fn script_creates(&self) -> usize {
        self.state().script_creates
    }

    pub fn script_deletes(&self) -> usize {
        self.state().script_deletes
    }
}

#[async_trait]
impl VerdaApi for FakeVerda {
    async fn list_instances(&self) -> ClientResult<Vec<Instance>> {
        let mut state = self.state();
        state.list_calls += 1;
        if state.fail_list {
            return Err(injected("list instances"));
        }
        Ok(state.instances.clone())
    }

    async fn create_instance(&self, request: &CreateInstance) -> ClientResult<String> {
        let delay = self.state().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.create_calls += 1;
        if state
            .fail_create_from
            .is_some_and(|from| state.create_calls >= from)
        {
            return Err(injected("create instance"));
        }
        state.next_id += 1;
        let id = format!("inst-{}", state.next_id);
        state.instances.push(Instance {
            id: id.clone(),
            hostname: request.hostname.clone(),
            status: FAKE_CREATED_STATUS.to_string(),
            instance_type: request.instance_type.clone(),
            location: request.location.clone(),
        });
        state.created.push(request.clone());
        Ok(id)
    }

    async fn delete_instance(&self, instance_id: &str) -> ClientResult<()> {
        let mut state = self.state();
        if state.fail_deletes.contains(instance_id) {
            return Err(injected("delete instance"));
        }
        let before = state.instances.len();
        state.instances.retain(|i| i.id != instance_id);
        if state.instances.len() == before {
            return Err(ClientError::Api {
                status: 404,
                body: format!("instance {instance_id} not found"),
            });
        }
        state.deleted.push(instance_id.to_string());
        Ok(())
    }

    async fn list_instance_types(&self) -> ClientResult<Vec<InstanceType>> {
        let state = self.state();
        if state.fail_instance_types {
            return Err(injected("list instance types"));
        }
        Ok(state.instance_types.clone())
    }

    async fn list_startup_scripts(&self) -> ClientResult<Vec<StartupScript>> {
        let state = self.state();
        if state.fail_script_list {
            return Err(injected("list scripts"));
        }
        Ok(state.scripts.clone())
    }

    async fn create_startup_script(&self, name: &str, script: &str) -> ClientResult<String> {
        let mut state = self.state();
        if state.fail_script_create {
            return Err(injected("create script"));
        }
        state.script_creates += 1;
        state.next_id += 1;
        let id = format!("script-{}", state.next_id);
        state.scripts.push(StartupScript {
            id: id.clone(),
            name: name.to_string(),
            script: script.to_string(),
        });
        Ok(id)
    }

    async fn delete_startup_script(&self, script_id: &str) -> ClientResult<()> {
        let mut state = self.state();
        if state.fail_script_delete {
            return Err(injected("delete script"));
        }
        state.script_deletes += 1;
        state.scripts.retain(|s| s.id != script_id);
        Ok(())
    }
}
