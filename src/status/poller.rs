//! Status Poller
//!
//! Liveness and resource probes for hosts, run over the registry's `status`
//! lane so a failing probe never disturbs a terminal's connection. Results
//! are cached per host; a failed probe reports offline / no metrics instead
//! of an error.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::metrics::{parse_metrics, HostMetrics, METRICS_COMMAND};
use crate::config::HostStore;
use crate::session::{Purpose, SessionRegistry};
use crate::ssh::{ConnectionHandle, HostConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Online,
    Offline,
}

#[derive(Debug, Default, Clone)]
struct CachedProbe {
    status: Option<(HostStatus, Instant)>,
    metrics: Option<(Option<HostMetrics>, Instant)>,
}

pub struct StatusPoller {
    registry: Arc<SessionRegistry>,
    hosts: Arc<dyn HostStore>,
    ttl: Duration,
    exec_timeout: Duration,
    cache: DashMap<String, CachedProbe>,
}

/// Registry session id used for a host's probes
pub fn status_session_id(host_id: &str) -> String {
    format!("status:{}", host_id)
}

impl StatusPoller {
    pub fn new(
        registry: Arc<SessionRegistry>,
        hosts: Arc<dyn HostStore>,
        ttl: Duration,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            hosts,
            ttl,
            exec_timeout,
            cache: DashMap::new(),
        }
    }

    pub async fn get_status(&self, host_id: &str) -> HostStatus {
        if let Some(status) = self.cached_status(host_id) {
            return status;
        }

        let status = match self
            .with_handle(host_id, |handle| async move { handle.is_alive().await })
            .await
        {
            Some(true) => HostStatus::Online,
            _ => HostStatus::Offline,
        };

        self.cache.entry(host_id.to_string()).or_default().status = Some((status, Instant::now()));
        status
    }

    pub async fn get_metrics(&self, host_id: &str) -> Option<HostMetrics> {
        if let Some(metrics) = self.cached_metrics(host_id) {
            return metrics;
        }

        let exec_timeout = self.exec_timeout;
        let metrics = self
            .with_handle(host_id, |handle| async move {
                match handle.exec(METRICS_COMMAND, exec_timeout).await {
                    Ok(output) => parse_metrics(&String::from_utf8_lossy(&output.stdout)),
                    Err(e) => {
                        debug!("Metrics probe on {} failed: {}", handle.label(), e);
                        None
                    }
                }
            })
            .await
            .flatten();

        let now = Instant::now();
        let mut cached = self.cache.entry(host_id.to_string()).or_default();
        cached.metrics = Some((metrics, now));
        if metrics.is_some() {
            // A successful exec proves the host is up
            cached.status = Some((HostStatus::Online, now));
        }
        metrics
    }

    /// Drop cached results for `host_id`, or for every host.
    pub fn invalidate(&self, host_id: Option<&str>) {
        match host_id {
            Some(id) => {
                self.cache.remove(id);
            }
            None => self.cache.clear(),
        }
    }

    fn cached_status(&self, host_id: &str) -> Option<HostStatus> {
        let cached = self.cache.get(host_id)?;
        let (status, at) = cached.status?;
        (at.elapsed() < self.ttl).then_some(status)
    }

    fn cached_metrics(&self, host_id: &str) -> Option<Option<HostMetrics>> {
        let cached = self.cache.get(host_id)?;
        let (metrics, at) = cached.metrics?;
        (at.elapsed() < self.ttl).then_some(metrics)
    }

    /// Run `probe` on a status lease for `host_id`. `None` if no connection
    /// could be had.
    async fn with_handle<F, Fut, T>(&self, host_id: &str, probe: F) -> Option<T>
    where
        F: FnOnce(Arc<ConnectionHandle>) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let config: HostConfig = match self.hosts.get_host(host_id).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Status probe for {} skipped: {}", host_id, e);
                return None;
            }
        };

        let session_id = status_session_id(host_id);
        let handle = match self
            .registry
            .acquire(&session_id, &config, Purpose::Status)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                debug!("Status probe for {} could not connect: {}", host_id, e);
                return None;
            }
        };

        let result = probe(handle).await;

        if let Err(e) = self.registry.release(&session_id, Purpose::Status) {
            warn!("Failed to release status lease for {}: {}", host_id, e);
        }
        Some(result)
    }
}
