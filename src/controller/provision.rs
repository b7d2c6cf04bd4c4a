use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::controller::objects::{self, ClusterObject, MetadataApi};
use crate::controller::readiness::wait_until_ready;
use crate::controller::{split_key, Context, SecretAuth, SecretAuthStatus};
use crate::{Error, Result, StepExt};

#[instrument(skip(ctx))]
pub(in crate::controller) async fn reconcile_secret_auth(key: String, ctx: Arc<Context>) -> Result<()> {
    let (ns, name) = split_key(&key)?;

    info!("Syncing SecretAuth \"{}\" in {}", name, ns);
    let Some(secret_auth) = ctx.cluster.get_secret_auth(ns, name).await.step("get secret auth")? else {
        debug!("SecretAuth \"{}\" in {} no longer exists", name, ns);
        return Ok(());
    };

    // Status is only ever written once everything exists, so any status means we are done.
    if secret_auth.is_provisioned() {
        info!("Resources for SecretAuth \"{}\" in {} have already been created. Nothing to do.", name, ns);
        return Ok(());
    }

    secret_auth.provision(&ctx).await?;
    info!("Done syncing SecretAuth \"{}\" in {}", name, ns);
    Ok(())
}

impl SecretAuth {
    #[instrument(skip(self, ctx), fields(name = self.metadata.name, namespace = self.metadata.namespace))]
    pub(in crate::controller) async fn provision(&self, ctx: &Context) -> Result<SecretAuthStatus> {
        let ns = self.namespace().ok_or_else(|| Error::MissingField(self.name_any(), "namespace"))?;
        let ns = ns.as_str();
        let spec = &self.spec;
        let cluster = ctx.cluster.as_ref();

        info!("Creating service account for workflow {}", spec.workflow_id);
        let service_account = cluster
            .create_or_get(ClusterObject::ServiceAccount(objects::service_account(ns, spec)))
            .await
            .step("create service account")?;

        info!("Writing vault read only access policy for workflow {}", spec.workflow_id);
        ctx.secrets.write_policy(ns, &spec.workflow_id).await.step("write vault policy")?;

        info!("Enabling vault access for the service account of workflow {}", spec.workflow_id);
        ctx.secrets
            .write_role(ns, service_account.name(), ns)
            .await
            .step("write vault role")?;

        let role = cluster
            .create_or_get(ClusterObject::Role(objects::role(ns, spec)))
            .await
            .step("create role")?;
        let role_binding = cluster
            .create_or_get(ClusterObject::RoleBinding(objects::role_binding(ns, spec)))
            .await
            .step("create role binding")?;

        info!("Creating metadata service for workflow {}", spec.workflow_id);
        let metadata_api = MetadataApi {
            image: ctx.metadata_api_image.clone(),
            vault_addr: ctx.secrets.address(),
            vault_engine_mount: ctx.secrets.engine_mount(),
        };
        let pod = cluster
            .create_or_get(ClusterObject::Pod(objects::metadata_api_pod(
                ns,
                spec,
                service_account.name(),
                &metadata_api,
            )))
            .await
            .step("create metadata service pod")?;
        let service = cluster
            .create_or_get(ClusterObject::Service(objects::metadata_api_service(ns, spec)))
            .await
            .step("create metadata service")?;
        let config_map = cluster
            .create_or_get(ClusterObject::ConfigMap(objects::workflow_config_map(ns, spec, service.name())))
            .await
            .step("create config map")?;

        info!("Waiting for metadata service of workflow {} to become ready", spec.workflow_id);
        wait_until_ready(cluster, ctx.probe.as_ref(), ns, service.name(), ctx.readiness)
            .await
            .step("wait for metadata service")?;
        info!("Metadata service of workflow {} is ready", spec.workflow_id);

        let status = SecretAuthStatus {
            service_account: service_account.name().to_string(),
            role: role.name().to_string(),
            role_binding: role_binding.name().to_string(),
            metadata_service_pod: pod.name().to_string(),
            metadata_service_service: service.name().to_string(),
            config_map: config_map.name().to_string(),
            vault_policy: ns.to_string(),
            vault_auth_role: ns.to_string(),
        };
        self.update_status(ctx, status.clone()).await?;

        Ok(status)
    }

    async fn update_status(&self, ctx: &Context, new_status: SecretAuthStatus) -> Result<()> {
        info!("Updating status of SecretAuth for workflow {}", self.spec.workflow_id);
        let mut updated = self.clone();
        updated.status = Some(new_status);
        let updated = ctx
            .cluster
            .replace_secret_auth_status(&updated)
            .await
            .step("update secret auth status")?;

        let note = format!("Secret access for workflow run {} is ready", self.spec.workflow_run_id);
        if let Err(e) = ctx.cluster.publish_event(&updated, "Provisioned", note).await {
            warn!("Failed to publish event for SecretAuth \"{}\": {:?}", self.name_any(), e);
        }
        Ok(())
    }
}
