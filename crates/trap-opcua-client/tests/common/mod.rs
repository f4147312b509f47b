// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Shared mocks for the integration tests.
//!
//! [`MockServer`] plays the server side of every session opened through a
//! [`MockConnector`]. It counts service calls and keeps the publish sinks
//! so tests can push values.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use trap_opcua_client::client::{
    ConnectRequest, ConnectedTransport, CreatedSubscription, MonitoredItemCreateRequest,
    MonitoredItemCreateResult, MonitoredItemModifyRequest, MonitoredItemModifyResult,
    PublishMessage, SessionConnector, UaTransport,
};
use trap_opcua_client::discovery::{
    ApplicationDescription, ApplicationType, DiscoveryClient, DiscoveryConnector,
    EndpointDescription, ServerOnNetwork,
};
use trap_opcua_client::{
    Credential, MonitoringMode, NodeId, OpcUaError, OpcUaResult, SecurityMode, StatusCode,
    SubscriptionConfig,
};

// =============================================================================
// MockServer
// =============================================================================

/// Server-side state shared by every mock session.
#[derive(Default)]
pub struct MockServer {
    pub connects: AtomicU32,
    pub closes: AtomicU32,
    pub keep_alives: AtomicU32,
    pub activations: AtomicU32,
    pub create_subscription_calls: AtomicU32,
    pub modify_subscription_calls: AtomicU32,
    pub delete_subscription_calls: AtomicU32,
    pub publishing_mode_calls: AtomicU32,
    pub create_item_calls: AtomicU32,
    pub modify_item_calls: AtomicU32,
    pub monitoring_mode_calls: AtomicU32,
    pub delete_item_calls: AtomicU32,

    pub created_items: AtomicU32,
    pub modified_items: AtomicU32,
    pub deleted_items: AtomicU32,
    pub create_requests: Mutex<Vec<MonitoredItemCreateRequest>>,

    pub fail_connect: AtomicBool,
    pub hang_connect: AtomicBool,
    pub fail_keep_alive: AtomicBool,
    pub server_certificate: Mutex<Option<Vec<u8>>>,
    pub bad_nodes: Mutex<HashSet<NodeId>>,

    /// While set, item creates wait for `create_release` after signalling
    /// `create_entered`.
    pub hold_creates: AtomicBool,
    pub create_entered: Notify,
    pub create_release: Notify,

    next_subscription_id: AtomicU32,
    next_item_id: AtomicU32,
    sinks: Mutex<HashMap<u32, mpsc::Sender<PublishMessage>>>,
    publishing: Mutex<HashMap<u32, bool>>,
    modes: Mutex<HashMap<u32, MonitoringMode>>,
    log: Mutex<Vec<String>>,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }

    pub fn with_certificate(self: &Arc<Self>, certificate: Vec<u8>) -> Arc<Self> {
        *self.server_certificate.lock().unwrap() = Some(certificate);
        Arc::clone(self)
    }

    pub fn reject_node(&self, node_id: NodeId) {
        self.bad_nodes.lock().unwrap().insert(node_id);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }

    pub fn is_publishing(&self, subscription_id: u32) -> bool {
        self.publishing
            .lock()
            .unwrap()
            .get(&subscription_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn mode_of(&self, monitored_item_id: u32) -> Option<MonitoringMode> {
        self.modes.lock().unwrap().get(&monitored_item_id).copied()
    }

    /// Server subscription ids currently alive, sorted.
    pub fn subscription_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.sinks.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Pushes a publish response to the given server subscription.
    pub async fn publish(&self, subscription_id: u32, message: PublishMessage) {
        let sink = self.sinks.lock().unwrap().get(&subscription_id).cloned();
        if let Some(sink) = sink {
            let _ = sink.send(message).await;
        }
    }
}

// =============================================================================
// MockConnector / MockTransport
// =============================================================================

/// Opens mock sessions against a [`MockServer`].
pub struct MockConnector {
    pub server: Arc<MockServer>,
    pub requests: Mutex<Vec<ConnectRequest>>,
}

impl MockConnector {
    pub fn new(server: Arc<MockServer>) -> Arc<Self> {
        Arc::new(Self {
            server,
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn connect(&self, request: &ConnectRequest) -> OpcUaResult<ConnectedTransport> {
        self.requests.lock().unwrap().push(request.clone());
        self.server.connects.fetch_add(1, Ordering::SeqCst);
        if self.server.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.server.fail_connect.load(Ordering::SeqCst) {
            return Err(OpcUaError::transport("connection refused"));
        }

        let server_certificate = self.server.server_certificate.lock().unwrap().clone();
        Ok(ConnectedTransport {
            transport: Arc::new(MockTransport {
                server: Arc::clone(&self.server),
                closed: AtomicBool::new(false),
            }),
            server_certificate,
        })
    }
}

/// One mock session.
pub struct MockTransport {
    server: Arc<MockServer>,
    closed: AtomicBool,
}

impl MockTransport {
    fn ensure_open(&self) -> OpcUaResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OpcUaError::transport("session closed"));
        }
        Ok(())
    }

    fn status_for(&self, node_id: &NodeId) -> StatusCode {
        if self.server.bad_nodes.lock().unwrap().contains(node_id) {
            StatusCode::BAD_NODE_ID_UNKNOWN
        } else {
            StatusCode::GOOD
        }
    }
}

#[async_trait]
impl UaTransport for MockTransport {
    async fn keep_alive(&self) -> OpcUaResult<()> {
        self.server.keep_alives.fetch_add(1, Ordering::SeqCst);
        if self.server.fail_keep_alive.load(Ordering::SeqCst) {
            return Err(OpcUaError::transport("keep-alive timed out"));
        }
        self.ensure_open()
    }

    async fn activate_identity(&self, _credential: &Credential) -> OpcUaResult<()> {
        self.ensure_open()?;
        self.server.activations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> OpcUaResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn create_subscription(
        &self,
        config: &SubscriptionConfig,
        publishing_enabled: bool,
        sink: mpsc::Sender<PublishMessage>,
    ) -> OpcUaResult<CreatedSubscription> {
        self.ensure_open()?;
        self.server
            .create_subscription_calls
            .fetch_add(1, Ordering::SeqCst);
        let subscription_id = self.server.next_subscription_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.server.sinks.lock().unwrap().insert(subscription_id, sink);
        self.server
            .publishing
            .lock()
            .unwrap()
            .insert(subscription_id, publishing_enabled);
        Ok(CreatedSubscription {
            subscription_id,
            revised_publishing_interval: config.publishing_interval,
            revised_keep_alive_count: config.keep_alive_count,
            revised_lifetime_count: config.lifetime_count,
        })
    }

    async fn modify_subscription(
        &self,
        _subscription_id: u32,
        _config: &SubscriptionConfig,
    ) -> OpcUaResult<()> {
        self.ensure_open()?;
        self.server
            .modify_subscription_calls
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_publishing_mode(&self, subscription_id: u32, enabled: bool) -> OpcUaResult<()> {
        self.ensure_open()?;
        self.server.publishing_mode_calls.fetch_add(1, Ordering::SeqCst);
        self.server
            .publishing
            .lock()
            .unwrap()
            .insert(subscription_id, enabled);
        Ok(())
    }

    async fn delete_subscription(&self, subscription_id: u32) -> OpcUaResult<()> {
        self.ensure_open()?;
        self.server
            .delete_subscription_calls
            .fetch_add(1, Ordering::SeqCst);
        self.server.sinks.lock().unwrap().remove(&subscription_id);
        Ok(())
    }

    async fn create_monitored_items(
        &self,
        _subscription_id: u32,
        items: &[MonitoredItemCreateRequest],
    ) -> OpcUaResult<Vec<MonitoredItemCreateResult>> {
        self.ensure_open()?;
        self.server.create_item_calls.fetch_add(1, Ordering::SeqCst);
        self.server
            .record(format!("create_monitored_items begin {}", items.len()));
        if self.server.hold_creates.load(Ordering::SeqCst) {
            self.server.create_entered.notify_one();
            self.server.create_release.notified().await;
        }
        self.server
            .create_requests
            .lock()
            .unwrap()
            .extend(items.iter().cloned());
        let results: Vec<MonitoredItemCreateResult> = items
            .iter()
            .map(|request| {
                let status = self.status_for(&request.node_id);
                if status.is_bad() {
                    return MonitoredItemCreateResult::bad(status);
                }
                self.server.created_items.fetch_add(1, Ordering::SeqCst);
                let id = self.server.next_item_id.fetch_add(1, Ordering::SeqCst) + 1;
                self.server
                    .modes
                    .lock()
                    .unwrap()
                    .insert(id, request.monitoring_mode);
                MonitoredItemCreateResult::good(id, request)
            })
            .collect();
        self.server
            .record(format!("create_monitored_items end {}", items.len()));
        Ok(results)
    }

    async fn modify_monitored_items(
        &self,
        _subscription_id: u32,
        items: &[MonitoredItemModifyRequest],
    ) -> OpcUaResult<Vec<MonitoredItemModifyResult>> {
        self.ensure_open()?;
        self.server.modify_item_calls.fetch_add(1, Ordering::SeqCst);
        self.server
            .modified_items
            .fetch_add(items.len() as u32, Ordering::SeqCst);
        Ok(items
            .iter()
            .map(|request| MonitoredItemModifyResult {
                status: StatusCode::GOOD,
                revised_sampling_interval: request.sampling_interval,
                revised_queue_size: request.queue_size,
            })
            .collect())
    }

    async fn set_monitoring_mode(
        &self,
        _subscription_id: u32,
        mode: MonitoringMode,
        monitored_item_ids: &[u32],
    ) -> OpcUaResult<Vec<StatusCode>> {
        self.ensure_open()?;
        self.server.monitoring_mode_calls.fetch_add(1, Ordering::SeqCst);
        let mut modes = self.server.modes.lock().unwrap();
        for id in monitored_item_ids {
            modes.insert(*id, mode);
        }
        Ok(vec![StatusCode::GOOD; monitored_item_ids.len()])
    }

    async fn delete_monitored_items(
        &self,
        _subscription_id: u32,
        monitored_item_ids: &[u32],
    ) -> OpcUaResult<Vec<StatusCode>> {
        self.ensure_open()?;
        self.server.delete_item_calls.fetch_add(1, Ordering::SeqCst);
        self.server
            .deleted_items
            .fetch_add(monitored_item_ids.len() as u32, Ordering::SeqCst);
        let mut modes = self.server.modes.lock().unwrap();
        for id in monitored_item_ids {
            modes.remove(id);
        }
        Ok(vec![StatusCode::GOOD; monitored_item_ids.len()])
    }
}

// =============================================================================
// Mock discovery
// =============================================================================

/// One simulated discovery server.
#[derive(Debug, Clone, Default)]
pub struct MockDiscoveryServer {
    pub endpoints: Vec<EndpointDescription>,
    pub network_servers: Vec<ServerOnNetwork>,
    pub supports_network: bool,
    pub discovery_urls: Vec<String>,
    pub failures_before_success: u32,
}

impl MockDiscoveryServer {
    pub fn new() -> Self {
        Self {
            supports_network: true,
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, url: &str, application_type: ApplicationType) -> Self {
        self.endpoints.push(endpoint(url, application_type));
        self
    }

    pub fn with_discovery_url(mut self, url: &str) -> Self {
        self.discovery_urls.push(url.to_string());
        self
    }

    pub fn with_network_server(mut self, url: &str, capabilities: &[&str]) -> Self {
        self.network_servers.push(ServerOnNetwork {
            record_id: self.network_servers.len() as u32,
            server_name: url.to_string(),
            discovery_url: url.to_string(),
            server_capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn without_network_support(mut self) -> Self {
        self.supports_network = false;
        self
    }

    pub fn failing(mut self, times: u32) -> Self {
        self.failures_before_success = times;
        self
    }
}

pub fn endpoint(url: &str, application_type: ApplicationType) -> EndpointDescription {
    EndpointDescription {
        endpoint_url: url.to_string(),
        security_mode: SecurityMode::None,
        security_policy_uri: "http://opcfoundation.org/UA/SecurityPolicy#None".to_string(),
        server: ApplicationDescription {
            application_uri: format!("urn:{url}"),
            application_name: url.to_string(),
            application_type,
            discovery_urls: vec![url.to_string()],
        },
        server_certificate: None,
        security_level: 0,
    }
}

/// Network of discovery servers keyed by normalized URL.
#[derive(Default)]
pub struct MockDiscovery {
    servers: Mutex<HashMap<String, MockDiscoveryServer>>,
    opens: Mutex<HashMap<String, u32>>,
    pub delay: Mutex<Option<Duration>>,
}

impl MockDiscovery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, url: &str, server: MockDiscoveryServer) {
        self.servers.lock().unwrap().insert(url.to_string(), server);
    }

    pub fn opens(&self, url: &str) -> u32 {
        self.opens.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> u32 {
        self.opens.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl DiscoveryConnector for MockDiscovery {
    async fn open(&self, url: &str, _timeout: Duration) -> OpcUaResult<Box<dyn DiscoveryClient>> {
        let attempt = {
            let mut opens = self.opens.lock().unwrap();
            let count = opens.entry(url.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let server = self.servers.lock().unwrap().get(url).cloned();
        match server {
            Some(server) if attempt > server.failures_before_success => {
                Ok(Box::new(MockDiscoveryClient { server }))
            }
            Some(_) => Err(OpcUaError::transport("discovery server busy")),
            None => Err(OpcUaError::transport(format!("no route to {url}"))),
        }
    }
}

struct MockDiscoveryClient {
    server: MockDiscoveryServer,
}

#[async_trait]
impl DiscoveryClient for MockDiscoveryClient {
    async fn get_endpoints(
        &self,
        _endpoint_url: &str,
        _locales: &[String],
    ) -> OpcUaResult<Vec<EndpointDescription>> {
        Ok(self.server.endpoints.clone())
    }

    async fn find_servers_on_network(
        &self,
        _starting_record_id: u32,
        _max_records: u32,
    ) -> OpcUaResult<Vec<ServerOnNetwork>> {
        if !self.server.supports_network {
            return Err(OpcUaError::transport("BadServiceUnsupported"));
        }
        Ok(self.server.network_servers.clone())
    }

    async fn find_servers(
        &self,
        _endpoint_url: &str,
        _locales: &[String],
    ) -> OpcUaResult<Vec<ApplicationDescription>> {
        Ok(vec![ApplicationDescription {
            application_uri: "urn:lds".to_string(),
            application_name: "lds".to_string(),
            application_type: ApplicationType::DiscoveryServer,
            discovery_urls: self.server.discovery_urls.clone(),
        }])
    }

    async fn close(&self) {}
}
