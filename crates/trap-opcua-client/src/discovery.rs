// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Endpoint discovery.
//!
//! [`EndpointDiscoverer`] crawls discovery servers breadth first. Each hop
//! asks one server for its endpoints and for further discovery URLs:
//!
//! 1. `GetEndpoints`, skipping discovery servers
//! 2. `FindServersOnNetwork`, best effort (legacy servers lack it)
//! 3. `FindServers`
//!
//! Discovery URLs are normalized and visited at most once, so servers that
//! reference each other do not loop.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::retry::RetryConfig;
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, OpcUaError, OpcUaResult};
use crate::types::SecurityMode;

// =============================================================================
// Descriptions
// =============================================================================

/// OPC UA application type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    /// A server.
    #[default]
    Server,
    /// A client.
    Client,
    /// Both client and server.
    ClientAndServer,
    /// A discovery server (LDS/GDS).
    DiscoveryServer,
}

/// Description of an OPC UA application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ApplicationDescription {
    /// Application URI.
    pub application_uri: String,
    /// Human readable name.
    #[serde(default)]
    pub application_name: String,
    /// Application type.
    #[serde(default)]
    pub application_type: ApplicationType,
    /// Discovery URLs of the application.
    #[serde(default)]
    pub discovery_urls: Vec<String>,
}

/// Endpoint as reported by `GetEndpoints`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescription {
    /// Reported endpoint URL.
    pub endpoint_url: String,
    /// Message security mode.
    pub security_mode: SecurityMode,
    /// Security policy URI.
    pub security_policy_uri: String,
    /// Server hosting the endpoint.
    pub server: ApplicationDescription,
    /// DER encoded server certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_certificate: Option<Vec<u8>>,
    /// Relative security level.
    #[serde(default)]
    pub security_level: u8,
}

/// Server registered with a multicast discovery server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerOnNetwork {
    /// Record id.
    pub record_id: u32,
    /// Server name.
    pub server_name: String,
    /// Discovery URL of the server.
    pub discovery_url: String,
    /// Capability identifiers, e.g. `DA` or `HD`.
    #[serde(default)]
    pub server_capabilities: Vec<String>,
}

/// Endpoint found by a crawl.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveredEndpoint {
    /// Reported description.
    pub description: EndpointDescription,
    /// Endpoint URL reachable from here, host taken from the discovery URL.
    pub accessible_endpoint_url: String,
    /// Capabilities advertised for the discovering hop.
    pub capabilities: BTreeSet<String>,
}

// =============================================================================
// Discovery client traits
// =============================================================================

/// Short-lived client for the discovery services of one server.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Calls `GetEndpoints`.
    async fn get_endpoints(
        &self,
        endpoint_url: &str,
        locales: &[String],
    ) -> OpcUaResult<Vec<EndpointDescription>>;

    /// Calls `FindServersOnNetwork`.
    async fn find_servers_on_network(
        &self,
        starting_record_id: u32,
        max_records: u32,
    ) -> OpcUaResult<Vec<ServerOnNetwork>>;

    /// Calls `FindServers`.
    async fn find_servers(
        &self,
        endpoint_url: &str,
        locales: &[String],
    ) -> OpcUaResult<Vec<ApplicationDescription>>;

    /// Closes the client.
    async fn close(&self);
}

/// Opens discovery clients.
#[async_trait]
pub trait DiscoveryConnector: Send + Sync {
    /// Opens a client for `url` with the given operation timeout.
    async fn open(&self, url: &str, timeout: Duration) -> OpcUaResult<Box<dyn DiscoveryClient>>;
}

// =============================================================================
// DiscoveryStats
// =============================================================================

/// Statistics of an [`EndpointDiscoverer`].
#[derive(Debug, Default)]
pub struct DiscoveryStats {
    hops_attempted: AtomicU64,
    hops_failed: AtomicU64,
    endpoints_found: AtomicU64,
    find_servers_on_network_failures: AtomicU64,
}

impl DiscoveryStats {
    /// Creates new statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of hops attempted.
    pub fn hops_attempted(&self) -> u64 {
        self.hops_attempted.load(Ordering::Relaxed)
    }

    /// Returns the number of hops that failed after all attempts.
    pub fn hops_failed(&self) -> u64 {
        self.hops_failed.load(Ordering::Relaxed)
    }

    /// Returns the number of endpoints found.
    pub fn endpoints_found(&self) -> u64 {
        self.endpoints_found.load(Ordering::Relaxed)
    }

    /// Returns the number of swallowed `FindServersOnNetwork` failures.
    pub fn find_servers_on_network_failures(&self) -> u64 {
        self.find_servers_on_network_failures.load(Ordering::Relaxed)
    }
}

// =============================================================================
// EndpointDiscoverer
// =============================================================================

/// Result of one hop.
#[derive(Debug, Default)]
struct Hop {
    endpoints: Vec<DiscoveredEndpoint>,
    candidates: Vec<(String, Vec<String>)>,
}

/// Breadth-first endpoint crawler.
pub struct EndpointDiscoverer {
    connector: Arc<dyn DiscoveryConnector>,
    config: DiscoveryConfig,
    stats: DiscoveryStats,
}

impl EndpointDiscoverer {
    /// Creates a discoverer.
    pub fn new(connector: Arc<dyn DiscoveryConnector>, config: DiscoveryConfig) -> Self {
        Self {
            connector,
            config,
            stats: DiscoveryStats::new(),
        }
    }

    /// Discovery statistics.
    pub fn stats(&self) -> &DiscoveryStats {
        &self.stats
    }

    /// Crawls from `discovery_url` and returns every endpoint found.
    ///
    /// Hops that keep failing are skipped; if none succeeds the result is
    /// empty. Only cancellation and an unparseable start URL are errors.
    pub async fn find_endpoints(
        &self,
        discovery_url: &str,
        locales: &[String],
        cancel: &CancellationToken,
    ) -> OpcUaResult<HashSet<DiscoveredEndpoint>> {
        let start = normalize_discovery_url(discovery_url, self.config.default_port)
            .map_err(OpcUaError::discovery)?;

        let mut visited = HashSet::from([start.clone()]);
        let mut queue = VecDeque::from([(start, Vec::<String>::new())]);
        let mut results = HashSet::new();
        let retry = RetryConfig::no_backoff(self.config.max_discovery_attempts);

        while let Some((url, capabilities)) = queue.pop_front() {
            if cancel.is_cancelled() {
                return Err(OpcUaError::cancelled("find_endpoints"));
            }

            self.stats.hops_attempted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(url = %url, "Finding endpoints");

            let started = tokio::time::Instant::now();
            let (hop_url, hop_capabilities) = (url.as_str(), capabilities.as_slice());
            let hop = retry
                .run(cancel, move |_| {
                    self.hop(hop_url, hop_capabilities, locales, cancel)
                })
                .await;

            let hop = match hop {
                Ok(hop) => hop,
                Err((error, _)) if error.is_cancelled() => {
                    return Err(OpcUaError::cancelled("find_endpoints"));
                }
                Err((error, attempts)) => {
                    self.stats.hops_failed.fetch_add(1, Ordering::Relaxed);
                    let error = DiscoveryError::hop_failed(url.as_str(), attempts, error.to_string());
                    tracing::warn!(
                        url = %url,
                        attempts = attempts,
                        error = %error,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Discovery hop failed, abandoning branch"
                    );
                    continue;
                }
            };

            tracing::debug!(
                url = %url,
                endpoints = hop.endpoints.len(),
                candidates = hop.candidates.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Discovery hop completed"
            );

            for endpoint in hop.endpoints {
                if results.insert(endpoint) {
                    self.stats.endpoints_found.fetch_add(1, Ordering::Relaxed);
                }
            }
            for (candidate, capabilities) in hop.candidates {
                if visited.insert(candidate.clone()) {
                    queue.push_back((candidate, capabilities));
                }
            }
        }

        tracing::info!(
            discovery_url = discovery_url,
            endpoints = results.len(),
            hops = visited.len(),
            "Endpoint discovery finished"
        );
        Ok(results)
    }

    async fn hop(
        &self,
        url: &str,
        capabilities: &[String],
        locales: &[String],
        cancel: &CancellationToken,
    ) -> OpcUaResult<Hop> {
        let timeout = self.config.hop_timeout;
        let work = async {
            let client = self.connector.open(url, timeout).await?;
            let result = self.query(client.as_ref(), url, capabilities, locales).await;
            client.close().await;
            result
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OpcUaError::cancelled("discovery_hop")),
            result = tokio::time::timeout(timeout, work) => match result {
                Ok(result) => result,
                Err(_) => Err(OpcUaError::operation_timeout("discovery_hop", timeout)),
            },
        }
    }

    async fn query(
        &self,
        client: &dyn DiscoveryClient,
        url: &str,
        capabilities: &[String],
        locales: &[String],
    ) -> OpcUaResult<Hop> {
        let mut hop = Hop::default();

        let endpoints = client.get_endpoints(url, locales).await?;
        if endpoints.is_empty() {
            tracing::debug!(url = url, "No endpoints at discovery URL");
            return Ok(hop);
        }

        let host = Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_string));
        let capabilities: BTreeSet<String> = capabilities.iter().cloned().collect();
        hop.endpoints = endpoints
            .into_iter()
            .filter(|endpoint| endpoint.server.application_type != ApplicationType::DiscoveryServer)
            .map(|description| DiscoveredEndpoint {
                accessible_endpoint_url: accessible_url(&description.endpoint_url, host.as_deref()),
                description,
                capabilities: capabilities.clone(),
            })
            .collect();

        let hop_port = Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.port())
            .unwrap_or(self.config.default_port);

        match client.find_servers_on_network(0, 1000).await {
            Ok(servers) => {
                for server in servers {
                    match normalize_discovery_url(&server.discovery_url, hop_port) {
                        Ok(candidate) => hop.candidates.push((candidate, server.server_capabilities)),
                        Err(error) => {
                            tracing::debug!(url = url, error = %error, "Skipping network server");
                        }
                    }
                }
            }
            Err(error) if error.is_cancelled() => return Err(error),
            Err(error) => {
                self.stats
                    .find_servers_on_network_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    url = url,
                    error = %error,
                    "FindServersOnNetwork not supported, continuing"
                );
            }
        }

        let servers = client.find_servers(url, locales).await?;
        for discovery_url in servers.iter().flat_map(|server| &server.discovery_urls) {
            match normalize_discovery_url(discovery_url, hop_port) {
                Ok(candidate) => hop.candidates.push((candidate, Vec::new())),
                Err(error) => {
                    tracing::debug!(url = url, error = %error, "Skipping discovery URL");
                }
            }
        }

        Ok(hop)
    }
}

impl fmt::Debug for EndpointDiscoverer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDiscoverer")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// URL helpers
// =============================================================================

/// Normalizes a discovery URL for deduplication.
///
/// Lowercases scheme and host, trims `.` from the host and `/` from the
/// path, and applies `default_port` when none is given.
pub fn normalize_discovery_url(url: &str, default_port: u16) -> Result<String, DiscoveryError> {
    let parsed = Url::parse(url.trim()).map_err(|e| DiscoveryError::invalid_url(url, e.to_string()))?;
    let host = parsed
        .host_str()
        .map(|host| host.trim_matches('.').to_lowercase())
        .filter(|host| !host.is_empty())
        .ok_or_else(|| DiscoveryError::invalid_url(url, "missing host"))?;
    let port = parsed.port().unwrap_or(default_port);
    let path = parsed.path().trim_matches('/');

    let mut normalized = format!("{}://{}:{}", parsed.scheme(), host, port);
    if !path.is_empty() {
        normalized.push('/');
        normalized.push_str(path);
    }
    Ok(normalized)
}

/// Replaces the host of `endpoint_url` with `host`.
fn accessible_url(endpoint_url: &str, host: Option<&str>) -> String {
    let Some(host) = host else {
        return endpoint_url.to_string();
    };
    match Url::parse(endpoint_url) {
        Ok(mut parsed) => match parsed.set_host(Some(host)) {
            Ok(()) => parsed.to_string(),
            Err(_) => endpoint_url.to_string(),
        },
        Err(_) => endpoint_url.to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_default_port() {
        assert_eq!(
            normalize_discovery_url("opc.tcp://PLC1", 4840).unwrap(),
            "opc.tcp://plc1:4840"
        );
        assert_eq!(
            normalize_discovery_url("opc.tcp://plc1:4841/", 4840).unwrap(),
            "opc.tcp://plc1:4841"
        );
    }

    #[test]
    fn test_normalize_trims_host_and_path() {
        assert_eq!(
            normalize_discovery_url("OPC.TCP://plc1.:4840/UA/Server/", 4840).unwrap(),
            "opc.tcp://plc1:4840/UA/Server"
        );
        assert_eq!(
            normalize_discovery_url("opc.tcp://plc1:4840/ua", 4840).unwrap(),
            normalize_discovery_url("opc.tcp://PLC1/ua/", 4840).unwrap()
        );
    }

    #[test]
    fn test_normalize_invalid() {
        assert!(normalize_discovery_url("not a url", 4840).is_err());
    }

    #[test]
    fn test_accessible_url_replaces_host() {
        assert_eq!(
            accessible_url("opc.tcp://internal-name:4840/server", Some("10.0.0.5")),
            "opc.tcp://10.0.0.5:4840/server"
        );
        assert_eq!(accessible_url("opc.tcp://a:1", None), "opc.tcp://a:1");
    }

    #[test]
    fn test_discovered_endpoint_json() {
        let endpoint = DiscoveredEndpoint {
            description: EndpointDescription {
                endpoint_url: "opc.tcp://plc1:4840".to_string(),
                security_mode: SecurityMode::None,
                security_policy_uri: "http://opcfoundation.org/UA/SecurityPolicy#None".to_string(),
                server: ApplicationDescription {
                    application_uri: "urn:plc1".to_string(),
                    application_type: ApplicationType::ClientAndServer,
                    ..Default::default()
                },
                server_certificate: None,
                security_level: 0,
            },
            accessible_endpoint_url: "opc.tcp://10.0.0.5:4840".to_string(),
            capabilities: BTreeSet::from(["DA".to_string()]),
        };

        let json = serde_json::to_value(&endpoint).unwrap();
        assert_eq!(json["description"]["server"]["application_type"], "client_and_server");
        assert_eq!(json["capabilities"][0], "DA");
        assert!(json["description"].get("server_certificate").is_none());
    }
}
