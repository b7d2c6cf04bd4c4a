use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::controller::objects::ObjectKind;
use crate::controller::{split_key, Context, SecretAuth};
use crate::{Error, Result, StepExt};

/// Tears down every provisioned SecretAuth in the namespace of a finished PipelineRun.
///
/// The whole namespace is cleaned up, not only what belongs to the finished run: a namespace
/// is expected to host a single workflow run at a time.
#[instrument(skip(ctx))]
pub(in crate::controller) async fn reconcile_pipeline_run(key: String, ctx: Arc<Context>) -> Result<()> {
    let (ns, name) = split_key(&key)?;

    info!("Syncing PipelineRun change \"{}\" in {}", name, ns);
    let Some(pipeline_run) = ctx.cluster.get_pipeline_run(ns, name).await.step("get pipeline run")? else {
        // TODO: SecretAuths of a PipelineRun deleted before it finished are never torn down.
        debug!("PipelineRun \"{}\" in {} no longer exists", name, ns);
        return Ok(());
    };

    if !pipeline_run.is_done() {
        debug!("PipelineRun \"{}\" in {} is still running", name, ns);
        return Ok(());
    }

    let secret_auths = ctx.cluster.list_secret_auths(ns).await.step("list secret auths")?;
    for secret_auth in secret_auths {
        if !secret_auth.is_provisioned() {
            debug!("SecretAuth \"{}\" in {} is not provisioned, skipping", secret_auth.name_any(), ns);
            continue;
        }
        secret_auth.tear_down(&ctx).await?;
    }

    info!("Done syncing PipelineRun change \"{}\" in {}", name, ns);
    Ok(())
}

impl ObjectKind {
    fn delete_step(self) -> &'static str {
        match self {
            ObjectKind::Pod => "delete metadata service pod",
            ObjectKind::Service => "delete metadata service",
            ObjectKind::ServiceAccount => "delete service account",
            ObjectKind::ConfigMap => "delete config map",
            ObjectKind::RoleBinding => "delete role binding",
            ObjectKind::Role => "delete role",
        }
    }
}

impl SecretAuth {
    #[instrument(skip(self, ctx), fields(name = self.metadata.name, namespace = self.metadata.namespace))]
    pub(in crate::controller) async fn tear_down(&self, ctx: &Context) -> Result<()> {
        let ns = self.namespace().ok_or_else(|| Error::MissingField(self.name_any(), "namespace"))?;
        let name = self.name_any();
        let Some(status) = self.status.as_ref() else {
            return Ok(());
        };

        info!("Deleting resources created for SecretAuth \"{}\" in {}", name, ns);
        let owned = [
            (ObjectKind::Pod, &status.metadata_service_pod),
            (ObjectKind::Service, &status.metadata_service_service),
            (ObjectKind::ServiceAccount, &status.service_account),
            (ObjectKind::ConfigMap, &status.config_map),
            (ObjectKind::RoleBinding, &status.role_binding),
            (ObjectKind::Role, &status.role),
        ];
        for (kind, object_name) in owned {
            if object_name.is_empty() {
                warn!("SecretAuth \"{}\" in {} records no {} name, skipping its deletion", name, ns, kind);
                continue;
            }
            ctx.cluster.delete(kind, &ns, object_name).await.step(kind.delete_step())?;
        }

        if !status.vault_auth_role.is_empty() {
            ctx.secrets.delete_role(&status.vault_auth_role).await.step("delete vault role")?;
        }
        if !status.vault_policy.is_empty() {
            ctx.secrets.delete_policy(&status.vault_policy).await.step("delete vault policy")?;
        }

        ctx.cluster.delete_secret_auth(&ns, &name).await.step("delete secret auth")?;

        let note = format!("Secret access for workflow run {} was revoked", self.spec.workflow_run_id);
        if let Err(e) = ctx.cluster.publish_event(self, "TornDown", note).await {
            warn!("Failed to publish event for SecretAuth \"{}\": {:?}", name, e);
        }
        Ok(())
    }
}
