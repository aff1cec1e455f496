//! Node discovery: static list, DNS SRV records, or a labelled
//! orchestrator query.
//!
//! All three modes share one surface: an initial synchronous discovery at
//! `start`, a background re-discovery loop, and membership events emitted
//! exactly once per transition. Every discovered endpoint is validated with
//! a liveness probe before it is surfaced; an endpoint that stops answering
//! probes simply drops out of the discovered set and is reported removed.

use std::collections::BTreeMap;

use futures::{StreamExt, stream};
use llm::provider::NodeProvider;
use tokio::sync::{
    Mutex,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::ClusterError;

/// A worker endpoint surfaced by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredNode {
    /// Stable node identifier.
    pub id: String,
    /// Base URL of the node's API.
    pub url: Url,
}

/// Membership change. Fired exactly once per transition.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A new node appeared and answered its liveness probe.
    Added(DiscoveredNode),
    /// A known node moved to a new URL.
    Updated(DiscoveredNode),
    /// A node disappeared from discovery.
    Removed(String),
}

/// Validation parallelism for a discovery round.
const VALIDATION_CONCURRENCY: usize = 8;

/// Node discovery with periodic re-discovery.
pub struct Discovery {
    config: config::DiscoveryConfig,
    llm_config: config::LlmConfig,
    known: Mutex<BTreeMap<String, Url>>,
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Discovery {
    /// Build discovery for the configured mode. The llm config supplies the
    /// probe path and auth used for endpoint validation.
    pub fn new(config: config::DiscoveryConfig, llm_config: config::LlmConfig) -> Self {
        Self {
            config,
            llm_config,
            known: Mutex::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Run the initial discovery synchronously and spawn the re-discovery
    /// loop. Fails when zero discovered endpoints answer their probe.
    pub async fn start(self: &std::sync::Arc<Self>) -> Result<(Vec<DiscoveredNode>, UnboundedReceiver<DiscoveryEvent>), ClusterError> {
        let initial = self.discover_validated().await?;

        if initial.is_empty() {
            return Err(ClusterError::Discovery(
                "no discovered worker node answered its liveness probe".to_string(),
            ));
        }

        {
            let mut known = self.known.lock().await;
            for node in &initial {
                known.insert(node.id.clone(), node.url.clone());
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let discovery = std::sync::Arc::clone(self);
        let handle = tokio::spawn(async move {
            discovery.rediscovery_loop(tx).await;
        });
        *self.task.lock().await = Some(handle);

        Ok((initial, rx))
    }

    /// Cancel the re-discovery loop and join it.
    pub async fn stop(&self) {
        self.cancel.cancel();

        if let Some(handle) = self.task.lock().await.take()
            && let Err(error) = handle.await
        {
            log::warn!("Discovery task ended abnormally: {error}");
        }
    }

    async fn rediscovery_loop(&self, events: UnboundedSender<DiscoveryEvent>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.config.interval) => {}
            }

            let discovered = match self.discover_validated().await {
                Ok(discovered) => discovered,
                Err(error) => {
                    // A failed round keeps the previous membership; workers
                    // that are actually down fail health checks regardless.
                    log::warn!("Re-discovery round failed: {error}");
                    continue;
                }
            };

            let mut known = self.known.lock().await;
            let mut next = BTreeMap::new();

            for node in discovered {
                match known.remove(&node.id) {
                    None => {
                        let _ = events.send(DiscoveryEvent::Added(node.clone()));
                    }
                    Some(previous_url) if previous_url != node.url => {
                        let _ = events.send(DiscoveryEvent::Updated(node.clone()));
                    }
                    Some(_) => {}
                }
                next.insert(node.id, node.url);
            }

            // Whatever is left in `known` was not re-discovered.
            for (id, _) in std::mem::take(&mut *known) {
                let _ = events.send(DiscoveryEvent::Removed(id));
            }

            *known = next;
        }
    }

    async fn discover_validated(&self) -> Result<Vec<DiscoveredNode>, ClusterError> {
        let endpoints = self.discover().await?;
        Ok(self.validate(endpoints).await)
    }

    async fn discover(&self) -> Result<Vec<DiscoveredNode>, ClusterError> {
        match self.config.mode {
            config::DiscoveryMode::Static => Ok(self
                .config
                .static_nodes
                .iter()
                .map(|node| DiscoveredNode {
                    id: node.id.clone(),
                    url: node.url.clone(),
                })
                .collect()),
            config::DiscoveryMode::DnsSrv => {
                let Some(dns) = &self.config.dns_srv else {
                    return Err(ClusterError::Discovery("dns_srv mode without parameters".to_string()));
                };
                discover_dns_srv(dns).await
            }
            config::DiscoveryMode::ServiceLabel => {
                let Some(labels) = &self.config.service_label else {
                    return Err(ClusterError::Discovery(
                        "service_label mode without parameters".to_string(),
                    ));
                };
                discover_service_label(labels).await
            }
        }
    }

    /// Probe each endpoint; only responders are surfaced. Discovering the
    /// same endpoint twice in one round is collapsed to one entry.
    async fn validate(&self, endpoints: Vec<DiscoveredNode>) -> Vec<DiscoveredNode> {
        let mut deduplicated = BTreeMap::new();
        for endpoint in endpoints {
            deduplicated.entry(endpoint.id.clone()).or_insert(endpoint);
        }

        let probe_timeout = self.config.probe_timeout;
        let llm_config = &self.llm_config;

        let mut validated: Vec<DiscoveredNode> = stream::iter(deduplicated.into_values())
            .map(|endpoint| async move {
                let provider = NodeProvider::new(endpoint.id.clone(), &endpoint.url, llm_config);

                match provider.probe(probe_timeout).await {
                    Ok(_) => Some(endpoint),
                    Err(error) => {
                        log::debug!("Discovered endpoint {} failed validation: {error}", endpoint.id);
                        None
                    }
                }
            })
            .buffer_unordered(VALIDATION_CONCURRENCY)
            .filter_map(|validated| async move { validated })
            .collect()
            .await;

        validated.sort_by(|a, b| a.id.cmp(&b.id));
        validated
    }
}

async fn discover_dns_srv(config: &config::DnsSrvDiscoveryConfig) -> Result<Vec<DiscoveredNode>, ClusterError> {
    let resolver = hickory_resolver::Resolver::builder_tokio()
        .map_err(|error| ClusterError::Discovery(format!("failed to read system resolver configuration: {error}")))?
        .build();

    let lookup = resolver
        .srv_lookup(&config.service)
        .await
        .map_err(|error| ClusterError::Discovery(format!("SRV lookup for `{}` failed: {error}", config.service)))?;

    let mut nodes = Vec::new();

    for record in lookup.iter() {
        let host = record.target().to_utf8();
        let host = host.trim_end_matches('.');
        let port = record.port();

        let raw = format!("{}://{host}:{port}", config.scheme);
        match Url::parse(&raw) {
            Ok(url) => nodes.push(DiscoveredNode {
                id: format!("{host}:{port}"),
                url,
            }),
            Err(error) => log::warn!("Skipping SRV record with unusable target `{raw}`: {error}"),
        }
    }

    Ok(nodes)
}

/// Response item of the orchestrator endpoint listing.
#[derive(Debug, serde::Deserialize)]
struct LabeledEndpoint {
    id: String,
    url: Url,
}

async fn discover_service_label(config: &config::ServiceLabelDiscoveryConfig) -> Result<Vec<DiscoveredNode>, ClusterError> {
    let response = llm::http_client()
        .get(config.endpoint.clone())
        .query(&[("label", config.label.as_str())])
        .send()
        .await
        .map_err(|error| ClusterError::Discovery(format!("orchestrator query failed: {error}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ClusterError::Discovery(format!(
            "orchestrator query returned {status}"
        )));
    }

    let endpoints: Vec<LabeledEndpoint> = response
        .json()
        .await
        .map_err(|error| ClusterError::Discovery(format!("unparseable orchestrator response: {error}")))?;

    Ok(endpoints
        .into_iter()
        .map(|endpoint| DiscoveredNode {
            id: endpoint.id,
            url: endpoint.url,
        })
        .collect())
}
