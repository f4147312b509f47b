// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! OPC UA transport abstraction layer.
//!
//! The engine does not speak the binary protocol itself. A [`SessionConnector`]
//! opens sessions and hands back a [`UaTransport`] that performs the services
//! the engine needs: keep-alive, identity activation, and the subscription and
//! monitored item service sets. Tests plug in mocks at this seam.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::certificate::ClientCertificate;
use crate::error::OpcUaResult;
use crate::types::{
    AttributeId, ConnectionModel, Credential, DataValue, MonitoringFilter, MonitoringMode, NodeId,
    StatusCode, SubscriptionConfig, Variant,
};

// =============================================================================
// ConnectivityState
// =============================================================================

/// Connectivity of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    /// No session is open yet.
    #[default]
    Disconnected,

    /// A session is being established.
    Connecting,

    /// The session is open and serving calls.
    Ready,

    /// The endpoint could not be reached.
    NotReachable,

    /// The server certificate was rejected.
    NoTrust,

    /// A fatal error marked the session broken.
    Error,

    /// The session was closed.
    Closed,
}

impl ConnectivityState {
    /// Returns `true` if calls can be served right now.
    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns `true` if a connection attempt is in progress.
    #[inline]
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting)
    }

    /// Returns `true` if the last attempt failed.
    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::NotReachable | Self::NoTrust | Self::Error)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready => write!(f, "Ready"),
            Self::NotReachable => write!(f, "NotReachable"),
            Self::NoTrust => write!(f, "NoTrust"),
            Self::Error => write!(f, "Error"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// =============================================================================
// Connect
// =============================================================================

/// Everything a connector needs to open one session.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Endpoint, security and identity.
    pub connection: ConnectionModel,

    /// Client certificate, present for signed or encrypted endpoints.
    pub client_certificate: Option<ClientCertificate>,

    /// Requested session timeout.
    pub session_timeout: Duration,

    /// Session name shown on the server.
    pub session_name: String,
}

/// A freshly opened session.
pub struct ConnectedTransport {
    /// Service interface of the session.
    pub transport: Arc<dyn UaTransport>,

    /// DER encoded server certificate, if the endpoint presented one.
    pub server_certificate: Option<Vec<u8>>,
}

impl fmt::Debug for ConnectedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedTransport")
            .field(
                "server_certificate",
                &self.server_certificate.as_ref().map(Vec::len),
            )
            .finish_non_exhaustive()
    }
}

/// Opens sessions against endpoints.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Connects and activates the identity in `request.connection`.
    async fn connect(&self, request: &ConnectRequest) -> OpcUaResult<ConnectedTransport>;
}

// =============================================================================
// Subscription Service Set
// =============================================================================

/// Server-revised parameters of a created subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedSubscription {
    /// Server-assigned subscription id.
    pub subscription_id: u32,

    /// Publishing interval granted by the server.
    pub revised_publishing_interval: Duration,

    /// Keep-alive count granted by the server.
    pub revised_keep_alive_count: u32,

    /// Lifetime count granted by the server.
    pub revised_lifetime_count: u32,
}

/// One value delivered in a publish response.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemValue {
    /// Client handle of the monitored item.
    pub client_handle: u32,

    /// The value.
    pub value: DataValue,
}

impl ItemValue {
    /// Creates an item value.
    pub fn new(client_handle: u32, value: DataValue) -> Self {
        Self {
            client_handle,
            value,
        }
    }
}

/// One event delivered in a publish response.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemEvent {
    /// Client handle of the event item.
    pub client_handle: u32,

    /// Field values in the order of the item's select clauses.
    pub fields: Vec<Variant>,
}

impl ItemEvent {
    /// Creates an item event.
    pub fn new(client_handle: u32, fields: Vec<Variant>) -> Self {
        Self {
            client_handle,
            fields,
        }
    }
}

/// A publish response routed to one server subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    /// Server sequence number.
    pub sequence_number: u32,

    /// Time the server sent the message.
    pub publish_time: DateTime<Utc>,

    /// Data changes.
    pub values: Vec<ItemValue>,

    /// Events.
    pub events: Vec<ItemEvent>,
}

impl PublishMessage {
    /// Creates a data change message.
    pub fn data_change(sequence_number: u32, values: Vec<ItemValue>) -> Self {
        Self {
            sequence_number,
            publish_time: Utc::now(),
            values,
            events: Vec::new(),
        }
    }

    /// Creates an event notification message.
    pub fn event(sequence_number: u32, events: Vec<ItemEvent>) -> Self {
        Self {
            events,
            ..Self::data_change(sequence_number, Vec::new())
        }
    }

    /// Creates a keep-alive message.
    pub fn keep_alive(sequence_number: u32) -> Self {
        Self::data_change(sequence_number, Vec::new())
    }

    /// Returns `true` if the message carries neither values nor events.
    #[inline]
    pub fn is_keep_alive(&self) -> bool {
        self.values.is_empty() && self.events.is_empty()
    }
}

// =============================================================================
// Monitored Item Service Set
// =============================================================================

/// Parameters for creating one monitored item.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemCreateRequest {
    /// Node to monitor.
    pub node_id: NodeId,
    /// Attribute to monitor.
    pub attribute_id: AttributeId,
    /// Client handle used in notifications.
    pub client_handle: u32,
    /// Initial monitoring mode.
    pub monitoring_mode: MonitoringMode,
    /// Requested sampling interval.
    pub sampling_interval: Duration,
    /// Requested server queue size.
    pub queue_size: u32,
    /// Overflow policy.
    pub discard_oldest: bool,
    /// Data change or event filter.
    pub filter: MonitoringFilter,
}

/// Result of creating one monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoredItemCreateResult {
    /// Per-item status.
    pub status: StatusCode,
    /// Server-assigned id; meaningless when `status` is bad.
    pub monitored_item_id: u32,
    /// Sampling interval granted by the server.
    pub revised_sampling_interval: Duration,
    /// Queue size granted by the server.
    pub revised_queue_size: u32,
}

impl MonitoredItemCreateResult {
    /// Creates a good result echoing the requested parameters.
    pub fn good(monitored_item_id: u32, request: &MonitoredItemCreateRequest) -> Self {
        Self {
            status: StatusCode::GOOD,
            monitored_item_id,
            revised_sampling_interval: request.sampling_interval,
            revised_queue_size: request.queue_size,
        }
    }

    /// Creates a failed result.
    pub fn bad(status: StatusCode) -> Self {
        Self {
            status,
            monitored_item_id: 0,
            revised_sampling_interval: Duration::ZERO,
            revised_queue_size: 0,
        }
    }
}

/// Parameters for modifying one monitored item.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemModifyRequest {
    /// Server-assigned id.
    pub monitored_item_id: u32,
    /// Client handle; unchanged by a modify.
    pub client_handle: u32,
    /// Requested sampling interval.
    pub sampling_interval: Duration,
    /// Requested server queue size.
    pub queue_size: u32,
    /// Overflow policy.
    pub discard_oldest: bool,
    /// Data change or event filter.
    pub filter: MonitoringFilter,
}

/// Result of modifying one monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoredItemModifyResult {
    /// Per-item status.
    pub status: StatusCode,
    /// Sampling interval granted by the server.
    pub revised_sampling_interval: Duration,
    /// Queue size granted by the server.
    pub revised_queue_size: u32,
}

// =============================================================================
// UaTransport Trait
// =============================================================================

/// Services of one open session.
///
/// All per-item operations return one status per request, in request order.
/// A returned `Err` means the whole service call failed.
#[async_trait]
pub trait UaTransport: Send + Sync {
    // =========================================================================
    // Session
    // =========================================================================

    /// Pings the server to keep the session alive.
    async fn keep_alive(&self) -> OpcUaResult<()>;

    /// Re-activates the session under a different identity.
    async fn activate_identity(&self, credential: &Credential) -> OpcUaResult<()>;

    /// Closes the session. Further calls fail.
    async fn close(&self) -> OpcUaResult<()>;

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Creates a server subscription. Publish responses for it go to `sink`
    /// until it is deleted or the session closes.
    async fn create_subscription(
        &self,
        config: &SubscriptionConfig,
        publishing_enabled: bool,
        sink: mpsc::Sender<PublishMessage>,
    ) -> OpcUaResult<CreatedSubscription>;

    /// Changes the parameters of a server subscription.
    async fn modify_subscription(
        &self,
        subscription_id: u32,
        config: &SubscriptionConfig,
    ) -> OpcUaResult<()>;

    /// Enables or disables publishing.
    async fn set_publishing_mode(&self, subscription_id: u32, enabled: bool) -> OpcUaResult<()>;

    /// Deletes a server subscription.
    async fn delete_subscription(&self, subscription_id: u32) -> OpcUaResult<()>;

    // =========================================================================
    // Monitored Items
    // =========================================================================

    /// Creates monitored items.
    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: &[MonitoredItemCreateRequest],
    ) -> OpcUaResult<Vec<MonitoredItemCreateResult>>;

    /// Modifies monitored items.
    async fn modify_monitored_items(
        &self,
        subscription_id: u32,
        items: &[MonitoredItemModifyRequest],
    ) -> OpcUaResult<Vec<MonitoredItemModifyResult>>;

    /// Sets the monitoring mode of monitored items.
    async fn set_monitoring_mode(
        &self,
        subscription_id: u32,
        mode: MonitoringMode,
        monitored_item_ids: &[u32],
    ) -> OpcUaResult<Vec<StatusCode>>;

    /// Deletes monitored items.
    async fn delete_monitored_items(
        &self,
        subscription_id: u32,
        monitored_item_ids: &[u32],
    ) -> OpcUaResult<Vec<StatusCode>>;
}

// =============================================================================
// Tests
// =============================================================================
