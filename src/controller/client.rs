use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{DeleteParams, ListParams, PostParams, WatchEvent, WatchParams};
use kube::error::ErrorResponse;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::controller::objects::{ClusterObject, ObjectKind};
use crate::controller::{PipelineRun, SecretAuth, CONTROLLER_NAME};
use crate::{Error, Result};

pub type EndpointsEvents = BoxStream<'static, Result<WatchEvent<Endpoints>>>;

/// Cluster API access needed by the controller. Mutations are idempotent: creating an object
/// that exists returns the existing one and deleting a missing object succeeds.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_secret_auth(&self, namespace: &str, name: &str) -> Result<Option<SecretAuth>>;

    async fn list_secret_auths(&self, namespace: &str) -> Result<Vec<SecretAuth>>;

    /// Writes the status of `secret_auth`. Fails with a conflict if the object changed since
    /// it was read.
    async fn replace_secret_auth_status(&self, secret_auth: &SecretAuth) -> Result<SecretAuth>;

    async fn delete_secret_auth(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_pipeline_run(&self, namespace: &str, name: &str) -> Result<Option<PipelineRun>>;

    async fn create_or_get(&self, object: ClusterObject) -> Result<ClusterObject>;

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()>;

    /// Watches a single Endpoints object. The server closes the stream after `timeout`.
    async fn watch_endpoints(&self, namespace: &str, name: &str, timeout: Duration) -> Result<EndpointsEvents>;

    async fn publish_event(&self, secret_auth: &SecretAuth, reason: &str, note: String) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    reporter: Reporter,
}

impl KubeClusterClient {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        KubeClusterClient { client, reporter }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(CONTROLLER_NAME.to_string()),
        ..Default::default()
    }
}

fn is_status(e: &kube::Error, status: u16) -> bool {
    matches!(e, kube::Error::Api(ErrorResponse { code, .. }) if *code == status)
}

async fn create_or_get<K>(api: Api<K>, object: K) -> Result<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = object.meta().name.clone().unwrap_or_default();
    match api.create(&post_params(), &object).await {
        Ok(created) => Ok(created),
        Err(e) if is_status(&e, 409) => {
            debug!(name = %name, "Object already exists, using it");
            Ok(api.get(&name).await?)
        }
        Err(e) => Err(e.into()),
    }
}

async fn delete_if_present<K>(api: Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) if is_status(&e, 404) => {
            debug!(name, "Object is already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_secret_auth(&self, namespace: &str, name: &str) -> Result<Option<SecretAuth>> {
        Ok(self.namespaced::<SecretAuth>(namespace).get_opt(name).await?)
    }

    async fn list_secret_auths(&self, namespace: &str) -> Result<Vec<SecretAuth>> {
        let list = self.namespaced::<SecretAuth>(namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn replace_secret_auth_status(&self, secret_auth: &SecretAuth) -> Result<SecretAuth> {
        let namespace = secret_auth.meta().namespace.as_deref().unwrap_or_default();
        let name = secret_auth.meta().name.as_deref().unwrap_or_default();
        let data = serde_json::to_vec(secret_auth)?;
        Ok(self.namespaced::<SecretAuth>(namespace).replace_status(name, &post_params(), data).await?)
    }

    async fn delete_secret_auth(&self, namespace: &str, name: &str) -> Result<()> {
        delete_if_present(self.namespaced::<SecretAuth>(namespace), name).await
    }

    async fn get_pipeline_run(&self, namespace: &str, name: &str) -> Result<Option<PipelineRun>> {
        Ok(self.namespaced::<PipelineRun>(namespace).get_opt(name).await?)
    }

    async fn create_or_get(&self, object: ClusterObject) -> Result<ClusterObject> {
        let namespace = object.namespace().to_string();
        let ns = &namespace[..];
        Ok(match object {
            ClusterObject::ServiceAccount(o) => ClusterObject::ServiceAccount(create_or_get(self.namespaced(ns), o).await?),
            ClusterObject::Role(o) => ClusterObject::Role(create_or_get(self.namespaced(ns), o).await?),
            ClusterObject::RoleBinding(o) => ClusterObject::RoleBinding(create_or_get(self.namespaced(ns), o).await?),
            ClusterObject::Pod(o) => ClusterObject::Pod(create_or_get(self.namespaced(ns), o).await?),
            ClusterObject::Service(o) => ClusterObject::Service(create_or_get(self.namespaced(ns), o).await?),
            ClusterObject::ConfigMap(o) => ClusterObject::ConfigMap(create_or_get(self.namespaced(ns), o).await?),
        })
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()> {
        match kind {
            ObjectKind::ServiceAccount => delete_if_present(self.namespaced::<ServiceAccount>(namespace), name).await,
            ObjectKind::Role => delete_if_present(self.namespaced::<Role>(namespace), name).await,
            ObjectKind::RoleBinding => delete_if_present(self.namespaced::<RoleBinding>(namespace), name).await,
            ObjectKind::Pod => delete_if_present(self.namespaced::<Pod>(namespace), name).await,
            ObjectKind::Service => delete_if_present(self.namespaced::<Service>(namespace), name).await,
            ObjectKind::ConfigMap => delete_if_present(self.namespaced::<ConfigMap>(namespace), name).await,
        }
    }

    async fn watch_endpoints(&self, namespace: &str, name: &str, timeout: Duration) -> Result<EndpointsEvents> {
        let params = WatchParams::default()
            .fields(&format!("metadata.name={name}"))
            .timeout(timeout.as_secs() as u32);
        let events = self.namespaced::<Endpoints>(namespace).watch(&params, "0").await?;
        Ok(events.map_err(Error::from).boxed())
    }

    async fn publish_event(&self, secret_auth: &SecretAuth, reason: &str, note: String) -> Result<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), secret_auth.object_ref(&()));
        recorder.publish(Event {
            action: reason.into(),
            reason: reason.into(),
            note: Some(note),
            secondary: None,
            type_: EventType::Normal,
        }).await?;
        Ok(())
    }
}
