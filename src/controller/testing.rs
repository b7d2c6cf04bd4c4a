//! In-memory stand-ins for the cluster used by the controller tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints};
use kube::api::WatchEvent;
use kube::error::ErrorResponse;
use kube::ResourceExt;
use serde_json::json;

use crate::controller::client::{ClusterClient, EndpointsEvents};
use crate::controller::objects::{self, ClusterObject, MetadataApi, ObjectKind};
use crate::controller::readiness::{HealthProbe, ReadinessTimeouts};
use crate::controller::{Context, PipelineRun, SecretAuth, SecretAuthSpec, SecretAuthStatus};
use crate::vault::SecretStore;
use crate::{Error, Result};

pub fn secret_auth(namespace: &str, name: &str, workflow_id: &str, workflow_run_id: &str) -> SecretAuth {
    let mut secret_auth = SecretAuth::new(name, SecretAuthSpec {
        workflow_id: workflow_id.to_string(),
        workflow_run_id: workflow_run_id.to_string(),
    });
    secret_auth.metadata.namespace = Some(namespace.to_string());
    secret_auth
}

/// A SecretAuth as it looks after provisioning.
pub fn provisioned(namespace: &str, name: &str, workflow_id: &str, workflow_run_id: &str) -> SecretAuth {
    let mut secret_auth = secret_auth(namespace, name, workflow_id, workflow_run_id);
    let base = objects::resource_name(&secret_auth.spec, None);
    let metadata_service = objects::metadata_service_name(&secret_auth.spec);
    secret_auth.status = Some(SecretAuthStatus {
        service_account: base.clone(),
        role: base.clone(),
        role_binding: base.clone(),
        metadata_service_pod: metadata_service.clone(),
        metadata_service_service: metadata_service,
        config_map: base,
        vault_policy: namespace.to_string(),
        vault_auth_role: namespace.to_string(),
    });
    secret_auth
}

/// A PipelineRun whose `Succeeded` condition has the given status.
pub fn pipeline_run(namespace: &str, name: &str, succeeded: &str) -> PipelineRun {
    serde_json::from_value(json!({
        "apiVersion": "tekton.dev/v1alpha1",
        "kind": "PipelineRun",
        "metadata": { "name": name, "namespace": namespace },
        "spec": {},
        "status": { "conditions": [{ "type": "Succeeded", "status": succeeded }] }
    }))
    .unwrap()
}

pub fn context<C: ClusterClient + 'static>(
    cluster: Arc<C>,
    secrets: impl SecretStore + 'static,
    probe: impl HealthProbe + 'static,
) -> Arc<Context> {
    Arc::new(Context {
        cluster,
        secrets: Arc::new(secrets),
        probe: Arc::new(probe),
        metadata_api_image: "metadata-api:test".to_string(),
        readiness: ReadinessTimeouts::default(),
    })
}

fn api_error(code: u16, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

type Key = (String, String);

#[derive(Default)]
struct Cluster {
    secret_auths: BTreeMap<Key, SecretAuth>,
    pipeline_runs: BTreeMap<Key, PipelineRun>,
    objects: BTreeMap<(ObjectKind, String, String), ClusterObject>,
    fail_next_create: HashSet<ObjectKind>,
    deletions: Vec<(ObjectKind, String)>,
    events: Vec<String>,
    mutations: usize,
    conflicts: usize,
    status_writes: usize,
}

/// Keeps objects in maps and follows the create-or-get and delete contracts of the real client.
/// Endpoints of any service are reported ready straight away.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<Cluster>,
}

impl FakeCluster {
    fn state(&self) -> std::sync::MutexGuard<'_, Cluster> {
        self.state.lock().unwrap()
    }

    pub fn insert_secret_auth(&self, mut secret_auth: SecretAuth) {
        secret_auth.metadata.resource_version = Some("1".to_string());
        let key = (secret_auth.namespace().unwrap(), secret_auth.name_any());
        self.state().secret_auths.insert(key, secret_auth);
    }

    /// Inserts a provisioned SecretAuth together with the objects it owns.
    pub fn insert_provisioned(&self, secret_auth: SecretAuth) {
        let ns = secret_auth.namespace().unwrap();
        let spec = secret_auth.spec.clone();
        let api = MetadataApi {
            image: "metadata-api:test".into(),
            vault_addr: "http://vault:8200".into(),
            vault_engine_mount: "nebula".into(),
        };
        let service_account = objects::resource_name(&spec, None);
        for object in [
            ClusterObject::ServiceAccount(objects::service_account(&ns, &spec)),
            ClusterObject::Role(objects::role(&ns, &spec)),
            ClusterObject::RoleBinding(objects::role_binding(&ns, &spec)),
            ClusterObject::Pod(objects::metadata_api_pod(&ns, &spec, &service_account, &api)),
            ClusterObject::Service(objects::metadata_api_service(&ns, &spec)),
            ClusterObject::ConfigMap(objects::workflow_config_map(&ns, &spec, "svc")),
        ] {
            self.insert_object(object);
        }
        self.insert_secret_auth(secret_auth);
    }

    pub fn insert_object(&self, object: ClusterObject) {
        let key = (object.kind(), object.namespace().to_string(), object.name().to_string());
        self.state().objects.insert(key, object);
    }

    pub fn insert_pipeline_run(&self, pipeline_run: PipelineRun) {
        let key = (pipeline_run.namespace().unwrap(), pipeline_run.name_any());
        self.state().pipeline_runs.insert(key, pipeline_run);
    }

    pub fn fail_next_create(&self, kind: ObjectKind) {
        self.state().fail_next_create.insert(kind);
    }

    pub fn secret_auth(&self, namespace: &str, name: &str) -> Option<SecretAuth> {
        self.state().secret_auths.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn contains(&self, kind: ObjectKind, namespace: &str, name: &str) -> bool {
        self.state().objects.contains_key(&(kind, namespace.to_string(), name.to_string()))
    }

    pub fn object_count(&self, namespace: &str) -> usize {
        self.state().objects.keys().filter(|(_, ns, _)| ns == namespace).count()
    }

    pub fn deletions(&self) -> Vec<(ObjectKind, String)> {
        self.state().deletions.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    pub fn mutations(&self) -> usize {
        self.state().mutations
    }

    pub fn conflicts(&self) -> usize {
        self.state().conflicts
    }

    pub fn status_writes(&self) -> usize {
        self.state().status_writes
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_secret_auth(&self, namespace: &str, name: &str) -> Result<Option<SecretAuth>> {
        Ok(self.secret_auth(namespace, name))
    }

    async fn list_secret_auths(&self, namespace: &str) -> Result<Vec<SecretAuth>> {
        Ok(self
            .state()
            .secret_auths
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, sa)| sa.clone())
            .collect())
    }

    async fn replace_secret_auth_status(&self, secret_auth: &SecretAuth) -> Result<SecretAuth> {
        let mut state = self.state();
        state.mutations += 1;
        let key = (secret_auth.namespace().unwrap(), secret_auth.name_any());
        let Some(current) = state.secret_auths.get_mut(&key) else {
            return Err(api_error(404, "NotFound"));
        };
        if current.metadata.resource_version != secret_auth.metadata.resource_version {
            return Err(api_error(409, "Conflict"));
        }

        let version = current
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        current.status = secret_auth.status.clone();
        current.metadata.resource_version = Some((version + 1).to_string());
        let updated = current.clone();
        state.status_writes += 1;
        Ok(updated)
    }

    async fn delete_secret_auth(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.mutations += 1;
        state.secret_auths.remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn get_pipeline_run(&self, namespace: &str, name: &str) -> Result<Option<PipelineRun>> {
        Ok(self.state().pipeline_runs.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn create_or_get(&self, object: ClusterObject) -> Result<ClusterObject> {
        let mut state = self.state();
        state.mutations += 1;
        if state.fail_next_create.remove(&object.kind()) {
            return Err(api_error(500, "InternalError"));
        }

        let key = (object.kind(), object.namespace().to_string(), object.name().to_string());
        if let Some(existing) = state.objects.get(&key) {
            let existing = existing.clone();
            state.conflicts += 1;
            return Ok(existing);
        }
        state.objects.insert(key, object.clone());
        Ok(object)
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.mutations += 1;
        state.objects.remove(&(kind, namespace.to_string(), name.to_string()));
        state.deletions.push((kind, name.to_string()));
        Ok(())
    }

    async fn watch_endpoints(&self, _namespace: &str, _name: &str, _timeout: Duration) -> Result<EndpointsEvents> {
        let ready = Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.1".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        };
        Ok(futures::stream::iter([Ok(WatchEvent::Modified(ready))]).boxed())
    }

    async fn publish_event(&self, _secret_auth: &SecretAuth, reason: &str, _note: String) -> Result<()> {
        self.state().events.push(reason.to_string());
        Ok(())
    }
}
