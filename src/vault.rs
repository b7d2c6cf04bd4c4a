//! Secret store access: a Vault policy per workflow namespace, and a Kubernetes auth role
//! binding the workflow run's service account to it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Writes policy `name` granting read access to the secrets of `workflow_id`.
    async fn write_policy(&self, name: &str, workflow_id: &str) -> Result<()>;

    /// Writes role `name` letting `service_account` in `bound_namespace` log in with policy `name`.
    async fn write_role(&self, name: &str, service_account: &str, bound_namespace: &str) -> Result<()>;

    async fn delete_role(&self, name: &str) -> Result<()>;

    async fn delete_policy(&self, name: &str) -> Result<()>;

    fn address(&self) -> String;

    fn engine_mount(&self) -> String;
}

#[derive(Clone, Debug)]
pub struct VaultConfig {
    pub addr: String,
    pub token: String,
    pub engine_mount: String,
    pub auth_mount: String,
    pub role_ttl: String,
}

pub struct VaultClient {
    http: reqwest::Client,
    config: VaultConfig,
}

impl VaultClient {
    pub fn new(config: VaultConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(VaultClient { http, config })
    }

    async fn send(&self, method: Method, path: String, body: Option<Value>) -> Result<()> {
        let url = format!("{}/v1/{}", self.config.addr.trim_end_matches('/'), path);
        let mut request = self
            .http
            .request(method.clone(), url)
            .header(VAULT_TOKEN_HEADER, &self.config.token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let status = request.send().await?.status();
        debug!(%method, path = %path, %status, "Vault responded");
        if status.is_success() || (method == Method::DELETE && status == StatusCode::NOT_FOUND) {
            return Ok(());
        }
        Err(Error::SecretStoreError {
            method: method.to_string(),
            path,
            status: status.as_u16(),
        })
    }

    fn role_path(&self, name: &str) -> String {
        format!("auth/{}/role/{}", self.config.auth_mount, name)
    }
}

/// Read access to one workflow's secrets in the KV v2 engine mounted at `engine_mount`.
pub fn workflow_policy(engine_mount: &str, workflow_id: &str) -> String {
    format!(
        r#"path "{engine_mount}/data/workflows/{workflow_id}/*" {{
  capabilities = ["read"]
}}

path "{engine_mount}/metadata/workflows/{workflow_id}/*" {{
  capabilities = ["list"]
}}
"#
    )
}

#[async_trait]
impl SecretStore for VaultClient {
    #[instrument(skip(self))]
    async fn write_policy(&self, name: &str, workflow_id: &str) -> Result<()> {
        let policy = workflow_policy(&self.config.engine_mount, workflow_id);
        self.send(Method::PUT, format!("sys/policy/{name}"), Some(json!({ "policy": policy }))).await
    }

    #[instrument(skip(self))]
    async fn write_role(&self, name: &str, service_account: &str, bound_namespace: &str) -> Result<()> {
        let role = json!({
            "bound_service_account_names": [service_account],
            "bound_service_account_namespaces": [bound_namespace],
            "policies": [name],
            "ttl": self.config.role_ttl,
        });
        self.send(Method::POST, self.role_path(name), Some(role)).await
    }

    #[instrument(skip(self))]
    async fn delete_role(&self, name: &str) -> Result<()> {
        self.send(Method::DELETE, self.role_path(name), None).await
    }

    #[instrument(skip(self))]
    async fn delete_policy(&self, name: &str) -> Result<()> {
        self.send(Method::DELETE, format!("sys/policy/{name}"), None).await
    }

    fn address(&self) -> String {
        self.config.addr.clone()
    }

    fn engine_mount(&self) -> String {
        self.config.engine_mount.clone()
    }
}
