// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! OPC UA client session and subscription engine for TRAP gateway.
//!
//! This crate manages the client side of OPC UA connectivity for the TRAP
//! industrial protocol gateway. The secure channel itself stays behind the
//! [`client::SessionConnector`] and [`client::UaTransport`] traits.
//!
//! # Features
//!
//! - Session pooling keyed by endpoint, security and identity
//! - Prioritized, cancellable service calls with per-call timeouts
//! - Subscription reconciliation of desired monitored items
//! - Value and event monitored items with bounded queues
//! - An ordered publish path
//! - Breadth-first endpoint discovery
//!
//! # Error Handling
//!
//! ```text
//! OpcUaError
//! ├── Connection    - Transport and endpoint issues
//! ├── Session       - Session lifecycle errors
//! ├── Security      - Certificate trust and identity errors
//! ├── Discovery     - Discovery hop failures
//! ├── Subscription  - Subscription and monitored item errors
//! ├── Configuration - Invalid settings
//! ├── Timeout       - Connect and operation timeouts
//! └── Cancelled     - Caller cancellation
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use trap_opcua_client::client::{SessionPool, SubscriptionManager};
//! use trap_opcua_client::config::ConfigLoader;
//!
//! let config = ConfigLoader::new().load("opcua.yaml")?;
//! let pool = SessionPool::start(
//!     config.session.clone(),
//!     config.pool.clone(),
//!     connector,
//!     certificates,
//! );
//! let manager = SubscriptionManager::new(pool, config.subscription.clone());
//!
//! let subscription = manager.get_or_create_subscription(&model);
//! subscription.apply(items, subscription_config, &cancel).await?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod certificate;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{
    ConfigurationError, ConnectionError, DiscoveryError, ErrorCode, ErrorSeverity, OpcUaError,
    OpcUaResult, SecurityError, SessionError, SubscriptionError, TimeoutError,
};

pub use types::{
    AttributeId, ConnectionModel, Credential, CredentialType, DataChangeFilter, DataValue,
    EndpointKey, EndpointModel, EventFilter, MonitoredItemModel, MonitoringFilter, MonitoringMode,
    NodeId, NodeIdentifier, SecurityMode, SecurityPolicy, SimpleAttributeOperand, StatusCode,
    SubscriptionConfig, SubscriptionKey, SubscriptionModel, TimestampsToReturn, Variant,
};

pub use certificate::{CertificateProvider, ClientCertificate, MemoryCertificateProvider};
pub use config::{ConfigLoader, EngineConfig};
pub use discovery::{DiscoveredEndpoint, EndpointDiscoverer};
