use std::future::Future;
use std::sync::Arc;

use futures::{FutureExt, Stream, StreamExt};
use kube::api::ListParams;
use kube::runtime::events::Reporter;
use kube::runtime::watcher::{self, watcher};
use kube::{Api, Client, ResourceExt};
use tracing::{error, info, warn};

pub use crd::*;

use crate::config::Config;
use crate::controller::client::{ClusterClient, KubeClusterClient};
use crate::controller::provision::reconcile_secret_auth;
use crate::controller::readiness::{HealthProbe, HttpHealthProbe, ReadinessTimeouts};
use crate::controller::teardown::reconcile_pipeline_run;
use crate::vault::{SecretStore, VaultClient, VaultConfig};
use crate::workqueue::WorkQueue;
use crate::{Error, Result};

pub mod client;
mod crd;
pub mod objects;
mod provision;
pub mod readiness;
mod teardown;
#[cfg(test)]
mod testing;

pub const CONTROLLER_NAME: &str = "secretauthctl";

pub struct State {
    pub config: Config,
}

impl State {
    fn to_context(&self, client: Client, reporter: Reporter) -> Result<Arc<Context>> {
        let vault = VaultClient::new(VaultConfig {
            addr: self.config.vault_addr.clone(),
            token: self.config.vault_token.clone(),
            engine_mount: self.config.vault_engine_mount.clone(),
            auth_mount: self.config.vault_auth_mount.clone(),
            role_ttl: self.config.vault_role_ttl.clone(),
        })?;

        Ok(Arc::new(Context {
            cluster: Arc::new(KubeClusterClient::new(client, reporter)),
            secrets: Arc::new(vault),
            probe: Arc::new(HttpHealthProbe::new()?),
            metadata_api_image: self.config.metadata_service_image.clone(),
            readiness: ReadinessTimeouts {
                health: self.config.health_timeout(),
                ..Default::default()
            },
        }))
    }
}

/// Shared by all workers of both queues. The clients are safe for concurrent use.
pub struct Context {
    pub cluster: Arc<dyn ClusterClient>,
    pub secrets: Arc<dyn SecretStore>,
    pub probe: Arc<dyn HealthProbe>,
    pub metadata_api_image: String,
    pub readiness: ReadinessTimeouts,
}

/// Splits a `namespace/name` queue key.
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok((ns, name)),
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}

pub fn object_key<K: ResourceExt>(object: &K) -> Option<String> {
    Some(format!("{}/{}", object.namespace()?, object.meta().name.as_ref()?))
}

fn unprovisioned_key(secret_auth: &SecretAuth) -> Option<String> {
    if secret_auth.is_provisioned() {
        return None;
    }
    object_key(secret_auth)
}

/// Keys to enqueue for a SecretAuth watch event: objects still waiting to be provisioned.
/// Provisioned ones are skipped, which also drops the echo of our own status write.
pub fn secret_auth_event_keys(event: watcher::Event<SecretAuth>) -> Vec<String> {
    match event {
        watcher::Event::Applied(secret_auth) => unprovisioned_key(&secret_auth).into_iter().collect(),
        watcher::Event::Restarted(secret_auths) => secret_auths.iter().filter_map(unprovisioned_key).collect(),
        watcher::Event::Deleted(_) => vec![],
    }
}

/// Keys to enqueue for a PipelineRun watch event. Relists are enqueued too: a run may have
/// finished while the controller was down or the watch was desynced.
pub fn pipeline_run_event_keys(event: watcher::Event<PipelineRun>) -> Vec<String> {
    match event {
        watcher::Event::Applied(pipeline_run) => object_key(&pipeline_run).into_iter().collect(),
        watcher::Event::Restarted(pipeline_runs) => pipeline_runs.iter().filter_map(object_key).collect(),
        watcher::Event::Deleted(_) => vec![],
    }
}

fn watch_keys<K, F>(api: Api<K>, to_keys: F) -> impl Stream<Item = String> + Send + 'static
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + 'static,
    K::DynamicType: Default,
    F: Fn(watcher::Event<K>) -> Vec<String> + Send + 'static,
{
    watcher(api, watcher::Config::default())
        .filter_map(move |event| {
            let keys = match event {
                Ok(event) => Some(to_keys(event)),
                Err(e) => {
                    warn!("Watch failed, it will be restarted: {e}");
                    None
                }
            };
            futures::future::ready(keys)
        })
        .flat_map(futures::stream::iter)
}

/// Owns the SecretAuth and PipelineRun queues and feeds them from key streams.
pub struct Controller {
    ctx: Arc<Context>,
    secret_auths: Arc<WorkQueue>,
    pipeline_runs: Arc<WorkQueue>,
    workers: usize,
}

impl Controller {
    pub fn new(ctx: Arc<Context>, workers: usize, max_retries: u32) -> Self {
        Controller {
            ctx,
            secret_auths: Arc::new(WorkQueue::new("SecretAuths", max_retries)),
            pipeline_runs: Arc::new(WorkQueue::new("PipelineRuns", max_retries)),
            workers,
        }
    }

    /// Processes keys from both streams until `stop` completes. In-flight work is finished
    /// before this returns.
    pub async fn run<S, P>(self, secret_auth_keys: S, pipeline_run_keys: P, stop: impl Future<Output = ()> + Send + 'static)
    where
        S: Stream<Item = String> + Send + 'static,
        P: Stream<Item = String> + Send + 'static,
    {
        let feeders = [
            tokio::spawn(feed(secret_auth_keys, Arc::clone(&self.secret_auths))),
            tokio::spawn(feed(pipeline_run_keys, Arc::clone(&self.pipeline_runs))),
        ];

        let stop = stop.boxed().shared();
        let secret_auth_ctx = Arc::clone(&self.ctx);
        let pipeline_run_ctx = Arc::clone(&self.ctx);
        tokio::join!(
            Arc::clone(&self.secret_auths).run(
                self.workers,
                move |key| reconcile_secret_auth(key, Arc::clone(&secret_auth_ctx)),
                stop.clone(),
            ),
            Arc::clone(&self.pipeline_runs).run(
                self.workers,
                move |key| reconcile_pipeline_run(key, Arc::clone(&pipeline_run_ctx)),
                stop,
            ),
        );

        for feeder in feeders {
            feeder.abort();
        }
    }
}

async fn feed(keys: impl Stream<Item = String>, queue: Arc<WorkQueue>) {
    futures::pin_mut!(keys);
    while let Some(key) = keys.next().await {
        queue.add(key);
    }
    info!(queue = queue.name(), "Event source ended");
}

/// Completes on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub async fn run(state: State) -> Result<()> {
    let client = Client::try_default().await?;
    let secret_auths = Api::<SecretAuth>::all(client.clone());
    let pipeline_runs = Api::<PipelineRun>::all(client.clone());
    let reporter = Reporter {
        controller: CONTROLLER_NAME.into(),
        instance: std::env::var("CONTROLLER_POD_NAME").ok(),
    };

    // Verify that we can access the CRDs. If we can't, this usually means that
    // the CRD is not installed. (Could also be a permissions issue.)
    if let Err(e) = secret_auths.list(&ListParams::default().limit(1)).await {
        error!("CRD SecretAuth is not queryable; {e:?}. Is the CRD installed?");
        return Err(e.into());
    }
    if let Err(e) = pipeline_runs.list(&ListParams::default().limit(1)).await {
        error!("CRD PipelineRun is not queryable; {e:?}. Is Tekton installed?");
        return Err(e.into());
    }

    let context = state.to_context(client, reporter)?;
    let controller = Controller::new(context, state.config.workers, state.config.max_retries);
    controller
        .run(
            watch_keys(secret_auths, secret_auth_event_keys),
            watch_keys(pipeline_runs, pipeline_run_event_keys),
            shutdown_signal(),
        )
        .await;

    info!("Controller stopped");
    Ok(())
}
