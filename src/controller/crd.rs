use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "SecretAuth", group = "nebula.puppet.com", version = "v1", namespaced)]
#[kube(status = "SecretAuthStatus")]
pub struct SecretAuthSpec {
    #[serde(rename = "workflowID")]
    pub workflow_id: String,
    #[serde(rename = "workflowRunID")]
    pub workflow_run_id: String,
}

/// Names of everything provisioned for a SecretAuth. Written once, all fields together.
#[derive(Serialize, Deserialize, Clone, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretAuthStatus {
    pub service_account: String,
    pub role: String,
    pub role_binding: String,
    pub metadata_service_pod: String,
    pub metadata_service_service: String,
    pub config_map: String,
    pub vault_policy: String,
    pub vault_auth_role: String,
}

impl SecretAuthStatus {
    pub fn is_provisioned(&self) -> bool {
        !self.service_account.is_empty()
    }
}

impl SecretAuth {
    pub fn is_provisioned(&self) -> bool {
        self.status.as_ref().map(SecretAuthStatus::is_provisioned).unwrap_or(false)
    }
}

/// The parts of a Tekton PipelineRun this controller reads.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "PipelineRun", group = "tekton.dev", version = "v1alpha1", namespaced)]
#[kube(status = "PipelineRunStatus")]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

pub const CONDITION_SUCCEEDED: &str = "Succeeded";

impl PipelineRun {
    pub fn succeeded_condition(&self) -> Option<&Condition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == CONDITION_SUCCEEDED)
    }

    /// A run is done once its `Succeeded` condition is no longer `Unknown`. Failed and
    /// cancelled runs count as done.
    pub fn is_done(&self) -> bool {
        self.succeeded_condition()
            .map(|c| c.status == "True" || c.status == "False")
            .unwrap_or(false)
    }
}
