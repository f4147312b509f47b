// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Sessions, pooling and subscriptions.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    SubscriptionManager                          │
//! │            (one Subscription per SubscriptionKey)               │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       SessionPool                               │
//! │      (one ClientSession per EndpointKey, eviction sweeper)      │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      ClientSession                              │
//! │       (priority call queue, processor task, keep-alive)         │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              SessionConnector / UaTransport                     │
//! │               (secure channel library boundary)                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Publish messages flow back from the transport through a per-subscription
//! pump into [`MonitoredItem`] queues and out to [`SubscriptionListener`]s.
//!
//! # Examples
//!
//! ```rust,ignore
//! use trap_opcua_client::client::{CallOptions, SessionPool};
//!
//! let pool = SessionPool::start(session_config, pool_config, connector, certificates);
//!
//! let created = pool
//!     .execute(&connection, CallOptions::new("create_subscription"), |transport| async move {
//!         transport.create_subscription(&config, false, sink).await
//!     })
//!     .await?;
//! ```

pub mod manager;
pub mod pool;
pub mod publish;
pub mod queue;
pub mod retry;
pub mod session;
pub mod subscription;
pub mod transport;

pub use manager::SubscriptionManager;
pub use pool::{PoolStats, SessionPool};
pub use publish::{
    ChannelListener, ListenerEvent, MessageType, MonitoredItemEvent, SequenceTracker,
    SubscriptionListener, SubscriptionNotification, SubscriptionStats,
};
pub use queue::{EventField, MonitoredItem, MonitoredItemNotification, MonitoredItemQueue};
pub use retry::{RetryConfig, RetryStrategy};
pub use session::{
    default_exception_handler, BoxFuture, CallOptions, ClientSession, ExceptionHandler,
    ScheduleOutcome, ServiceCall, SessionStats,
};
pub use subscription::{ApplyOutcome, Subscription, SubscriptionState};
pub use transport::{
    ConnectRequest, ConnectedTransport, ConnectivityState, CreatedSubscription, ItemEvent, ItemValue,
    MonitoredItemCreateRequest, MonitoredItemCreateResult, MonitoredItemModifyRequest,
    MonitoredItemModifyResult, PublishMessage, SessionConnector, UaTransport,
};
