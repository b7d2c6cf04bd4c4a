//! Cluster objects provisioned for a SecretAuth. Names derive only from the workflow run ID so
//! a retry after a crash finds the objects created by the previous attempt.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, HTTPGetAction, Pod, PodSpec, Probe, Service, ServiceAccount,
    ServicePort, ServiceSpec,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;

use crate::controller::SecretAuthSpec;

pub const NAME_PREFIX: &str = "workflow-run";
pub const METADATA_SERVICE_NAME: &str = "workflow-metadata-api";
pub const METADATA_API_COMMAND: &str = "/usr/bin/nebula-metadata-api";
pub const METADATA_API_PORT: i32 = 7000;
pub const METADATA_API_URL_KEY: &str = "metadata-api-url";
pub const HEALTH_PATH: &str = "/healthz";

pub const LABEL_WORKFLOW_RUN_ID: &str = "workflow-run-id";
pub const LABEL_WORKFLOW_ID: &str = "workflow-id";

/// `workflow-run-<workflowRunID>`, or `workflow-run-<workflowRunID>-<suffix>`.
pub fn resource_name(spec: &SecretAuthSpec, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) => format!("{NAME_PREFIX}-{}-{suffix}", spec.workflow_run_id),
        None => format!("{NAME_PREFIX}-{}", spec.workflow_run_id),
    }
}

pub fn metadata_service_name(spec: &SecretAuthSpec) -> String {
    resource_name(spec, Some(METADATA_SERVICE_NAME))
}

pub fn labels(spec: &SecretAuthSpec) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_WORKFLOW_RUN_ID.to_string(), spec.workflow_run_id.clone()),
        (LABEL_WORKFLOW_ID.to_string(), spec.workflow_id.clone()),
    ])
}

/// In-cluster base URL of a Service.
pub fn service_url(service: &str, namespace: &str) -> String {
    format!("http://{service}.{namespace}.svc")
}

pub fn health_url(service: &str, namespace: &str) -> String {
    format!("{}{HEALTH_PATH}", service_url(service, namespace))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    ServiceAccount,
    Role,
    RoleBinding,
    Pod,
    Service,
    ConfigMap,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug)]
pub enum ClusterObject {
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    Pod(Pod),
    Service(Service),
    ConfigMap(ConfigMap),
}

impl ClusterObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ClusterObject::ServiceAccount(_) => ObjectKind::ServiceAccount,
            ClusterObject::Role(_) => ObjectKind::Role,
            ClusterObject::RoleBinding(_) => ObjectKind::RoleBinding,
            ClusterObject::Pod(_) => ObjectKind::Pod,
            ClusterObject::Service(_) => ObjectKind::Service,
            ClusterObject::ConfigMap(_) => ObjectKind::ConfigMap,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ClusterObject::ServiceAccount(o) => o.meta(),
            ClusterObject::Role(o) => o.meta(),
            ClusterObject::RoleBinding(o) => o.meta(),
            ClusterObject::Pod(o) => o.meta(),
            ClusterObject::Service(o) => o.meta(),
            ClusterObject::ConfigMap(o) => o.meta(),
        }
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }
}

/// Everything the metadata API pod is launched with besides the workflow itself.
#[derive(Clone, Debug)]
pub struct MetadataApi {
    pub image: String,
    pub vault_addr: String,
    pub vault_engine_mount: String,
}

fn meta(namespace: &str, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

pub fn service_account(namespace: &str, spec: &SecretAuthSpec) -> ServiceAccount {
    ServiceAccount {
        metadata: meta(namespace, resource_name(spec, None), labels(spec)),
        ..Default::default()
    }
}

/// Read access to ConfigMaps in the workflow's namespace.
pub fn role(namespace: &str, spec: &SecretAuthSpec) -> Role {
    Role {
        metadata: meta(namespace, resource_name(spec, None), labels(spec)),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["configmaps".to_string()]),
            verbs: vec!["list".to_string(), "watch".to_string(), "get".to_string()],
            ..Default::default()
        }]),
    }
}

pub fn role_binding(namespace: &str, spec: &SecretAuthSpec) -> RoleBinding {
    let name = resource_name(spec, None);
    RoleBinding {
        metadata: meta(namespace, name.clone(), labels(spec)),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

pub fn metadata_api_pod(namespace: &str, spec: &SecretAuthSpec, service_account: &str, api: &MetadataApi) -> Pod {
    let name = metadata_service_name(spec);
    let mut pod_labels = labels(spec);
    pod_labels.insert("app".to_string(), name.clone());

    let args: [&str; 13] = [
        METADATA_API_COMMAND,
        "-bind-addr",
        &format!(":{METADATA_API_PORT}"),
        "-vault-addr",
        &api.vault_addr,
        "-vault-role",
        namespace,
        "-workflow-id",
        &spec.workflow_id,
        "-vault-engine-mount",
        &api.vault_engine_mount,
        "-namespace",
        namespace,
    ];

    Pod {
        metadata: meta(namespace, name.clone(), pod_labels),
        spec: Some(PodSpec {
            containers: vec![Container {
                name,
                image: Some(api.image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                command: Some(args.map(str::to_string).to_vec()),
                ports: Some(vec![ContainerPort {
                    name: Some("http".to_string()),
                    container_port: METADATA_API_PORT,
                    ..Default::default()
                }]),
                readiness_probe: Some(Probe {
                    http_get: Some(HTTPGetAction {
                        path: Some(HEALTH_PATH.to_string()),
                        port: IntOrString::Int(METADATA_API_PORT),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            service_account_name: Some(service_account.to_string()),
            restart_policy: Some("OnFailure".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn metadata_api_service(namespace: &str, spec: &SecretAuthSpec) -> Service {
    let name = metadata_service_name(spec);
    Service {
        metadata: meta(namespace, name.clone(), labels(spec)),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port: 80,
                target_port: Some(IntOrString::Int(METADATA_API_PORT)),
                ..Default::default()
            }]),
            selector: Some(BTreeMap::from([("app".to_string(), name)])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Tells task pods where their metadata API lives.
pub fn workflow_config_map(namespace: &str, spec: &SecretAuthSpec, service: &str) -> ConfigMap {
    ConfigMap {
        metadata: meta(namespace, resource_name(spec, None), labels(spec)),
        data: Some(BTreeMap::from([(
            METADATA_API_URL_KEY.to_string(),
            service_url(service, namespace),
        )])),
        ..Default::default()
    }
}
