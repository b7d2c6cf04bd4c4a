use std::time::Duration;

use clap::Parser;

use crate::workqueue::DEFAULT_MAX_RETRIES;

/// Command line and environment configuration of the controller process.
#[derive(Parser, Debug, Clone)]
#[command(name = "secretauthctl", about = "Provisions per-workflow-run secret access for SecretAuth resources")]
pub struct Config {
    /// Image running the workflow metadata API next to each workflow run.
    #[arg(long, env = "METADATA_SERVICE_IMAGE")]
    pub metadata_service_image: String,

    /// Address of the Vault server, handed to the metadata API as well.
    #[arg(long, env = "VAULT_ADDR", default_value = "http://vault:8200")]
    pub vault_addr: String,

    #[arg(long, env = "VAULT_TOKEN", hide_env_values = true)]
    pub vault_token: String,

    /// Mount path of the KV v2 engine holding workflow secrets.
    #[arg(long, env = "VAULT_ENGINE_MOUNT", default_value = "nebula")]
    pub vault_engine_mount: String,

    /// Mount path of the Kubernetes auth method.
    #[arg(long, env = "VAULT_AUTH_MOUNT", default_value = "kubernetes")]
    pub vault_auth_mount: String,

    #[arg(long, default_value = "24h")]
    pub vault_role_ttl: String,

    /// Worker count for each of the two queues.
    #[arg(long, default_value_t = 2)]
    pub workers: usize,

    /// Handler attempts per key before it is dropped.
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Time allowed for the metadata API health check to pass.
    #[arg(long, default_value_t = 10)]
    pub health_timeout_secs: u64,
}

impl Config {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}
