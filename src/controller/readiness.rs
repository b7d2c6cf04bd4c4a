//! Waits for a freshly created metadata API Service to actually serve traffic.
//!
//! An Endpoints object listing the pod does not mean packets sent to the Service are already
//! forwarded to it, so after the Endpoints object is ready the health endpoint is polled
//! through the Service until it answers 200.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::WatchEvent;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::controller::client::ClusterClient;
use crate::controller::objects::health_url;
use crate::{Error, ReadinessPhase, Result};

pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(750);

/// Slack on top of the server side watch timeout before the watch is abandoned client side.
const WATCH_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadinessTimeouts {
    pub endpoints: Duration,
    pub health: Duration,
}

impl Default for ReadinessTimeouts {
    fn default() -> Self {
        ReadinessTimeouts {
            endpoints: Duration::from_secs(30),
            health: Duration::from_secs(10),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Sends a GET to `url` and returns the response status.
    async fn probe(&self, url: &str) -> Result<u16>;
}

pub struct HttpHealthProbe {
    http: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(2)).build()?;
        Ok(HttpHealthProbe { http })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str) -> Result<u16> {
        Ok(self.http.get(url).send().await?.status().as_u16())
    }
}

pub fn has_ready_address(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .iter()
        .flatten()
        .any(|subset| subset.addresses.as_ref().map_or(false, |a| !a.is_empty()))
}

/// Watches the Endpoints object of `service` until it lists an address.
///
/// `Added` events count as well as `Modified` ones: a retry starts after the pod may already
/// be ready, and then the watch only ever reports the existing object as added.
#[instrument(skip(cluster))]
pub async fn wait_for_endpoints(cluster: &dyn ClusterClient, namespace: &str, service: &str, limit: Duration) -> Result<()> {
    let mut events = cluster.watch_endpoints(namespace, service, limit).await?;

    let ready = timeout(limit + WATCH_GRACE, async {
        while let Some(event) = events.try_next().await? {
            match event {
                // Added is what a retry sees when the pod became ready during an earlier attempt.
                WatchEvent::Added(endpoints) | WatchEvent::Modified(endpoints) => {
                    if has_ready_address(&endpoints) {
                        return Ok(true);
                    }
                    debug!("Endpoints have no ready address yet");
                }
                WatchEvent::Error(e) => return Err(Error::KubeError(kube::Error::Api(e))),
                WatchEvent::Deleted(_) | WatchEvent::Bookmark(_) => {}
            }
        }
        Ok(false)
    })
    .await;

    match ready {
        Ok(Ok(true)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Ok(Ok(false)) | Err(_) => Err(Error::ReadinessTimeout {
            service: service.to_string(),
            phase: ReadinessPhase::Endpoints,
            timeout: limit,
        }),
    }
}

/// Polls the health endpoint of `service` until it answers 200.
#[instrument(skip(probe))]
pub async fn wait_for_health(probe: &dyn HealthProbe, namespace: &str, service: &str, limit: Duration) -> Result<()> {
    let url = health_url(service, namespace);

    let poll = async {
        loop {
            sleep(HEALTH_POLL_INTERVAL).await;
            match probe.probe(&url).await {
                Ok(200) => return,
                Ok(status) => info!(status, "Metadata API answered with an unexpected status"),
                Err(e) => info!("Probing the metadata API failed: {e}"),
            }
        }
    };

    timeout(limit, poll).await.map_err(|_| Error::ReadinessTimeout {
        service: service.to_string(),
        phase: ReadinessPhase::Health,
        timeout: limit,
    })
}

pub async fn wait_until_ready(
    cluster: &dyn ClusterClient,
    probe: &dyn HealthProbe,
    namespace: &str,
    service: &str,
    timeouts: ReadinessTimeouts,
) -> Result<()> {
    wait_for_endpoints(cluster, namespace, service, timeouts.endpoints).await?;
    wait_for_health(probe, namespace, service, timeouts.health).await
}
