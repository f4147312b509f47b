// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Subscription state machine and monitored item reconciliation.
//!
//! A [`Subscription`] owns the desired set of monitored items for one
//! logical subscription and converges the server towards it. All server
//! traffic goes through scheduled calls on a pooled [`ClientSession`].
//!
//! # State Machine
//!
//! ```text
//!              enable            activate
//! Disabled ───────────► Enabled ──────────► Active
//!    ▲                     │                 │  ▲
//!    │ failure             │      deactivate ▼  │ activate
//!    └─────────────────────┴─────────────── Inactive
//!
//! any state ── close ──► Closed
//! ```
//!
//! # Reconciliation
//!
//! `apply` diffs the desired items against the applied set, keyed by
//! node and attribute:
//!
//! - desired only: created
//! - applied only: deleted
//! - both, with changed sampling, queue or filter: modified in place
//!
//! Client handles survive modifies and recreates, so listeners can keep
//! correlating values across reconnects.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::client::pool::SessionPool;
use crate::client::publish::{
    run_pump, PublishContext, SubscriptionListener, SubscriptionNotification, SubscriptionStats,
};
use crate::client::queue::MonitoredItem;
use crate::client::session::{CallOptions, ClientSession};
use crate::client::transport::{
    MonitoredItemCreateRequest, MonitoredItemModifyRequest, UaTransport,
};
use crate::config::SubscriptionDefaults;
use crate::error::{OpcUaError, OpcUaResult, SubscriptionError};
use crate::types::{
    desired_item_set, MonitoredItemKey, MonitoredItemModel, MonitoringMode, StatusCode,
    SubscriptionConfig, SubscriptionKey, SubscriptionModel,
};

// =============================================================================
// SubscriptionState
// =============================================================================

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Not on the server, or the last operation failed.
    #[default]
    Disabled,

    /// Created on the server with items disabled.
    Enabled,

    /// Publishing, items in their desired mode.
    Active,

    /// Not publishing, reporting items sampling.
    Inactive,

    /// Closed; terminal.
    Closed,
}

impl SubscriptionState {
    /// Returns `true` if the server-side subscription exists.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled | Self::Active | Self::Inactive)
    }

    /// Returns `true` if publishing.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns `true` once closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    fn phase(&self) -> Phase {
        match self {
            Self::Active => Phase::Activate,
            Self::Inactive => Phase::Deactivate,
            Self::Disabled | Self::Enabled | Self::Closed => Phase::Enable,
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "Disabled"),
            Self::Enabled => write!(f, "Enabled"),
            Self::Active => write!(f, "Active"),
            Self::Inactive => write!(f, "Inactive"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Target the reconciler drives monitoring and publishing modes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Enable,
    Activate,
    Deactivate,
}

impl Phase {
    fn target_mode(self, desired: MonitoringMode) -> MonitoringMode {
        match (self, desired) {
            (Self::Enable, _) => MonitoringMode::Disabled,
            (Self::Activate, mode) => mode,
            (Self::Deactivate, MonitoringMode::Reporting) => MonitoringMode::Sampling,
            (Self::Deactivate, mode) => mode,
        }
    }

    fn publishing(self) -> bool {
        matches!(self, Self::Activate)
    }

    fn state(self) -> SubscriptionState {
        match self {
            Self::Enable => SubscriptionState::Enabled,
            Self::Activate => SubscriptionState::Active,
            Self::Deactivate => SubscriptionState::Inactive,
        }
    }
}

// =============================================================================
// ApplyOutcome
// =============================================================================

/// What a reconciliation changed on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// Items created.
    pub created: usize,
    /// Items deleted.
    pub deleted: usize,
    /// Items modified in place.
    pub modified: usize,
    /// Items whose monitoring mode changed.
    pub mode_changes: usize,
    /// Per-item failures.
    pub failed: usize,
}

impl ApplyOutcome {
    /// Returns `true` if nothing was touched on the server.
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

// =============================================================================
// Subscription
// =============================================================================

struct ServerSubscription {
    session: Arc<ClientSession>,
    subscription_id: u32,
    config: SubscriptionConfig,
    publishing_enabled: bool,
    pump_stop: CancellationToken,
}

struct SubscriptionInner {
    desired: BTreeMap<MonitoredItemKey, MonitoredItemModel>,
    config: SubscriptionConfig,
    server: Option<ServerSubscription>,
    applied: BTreeMap<MonitoredItemKey, Arc<MonitoredItem>>,
    /// Items of a lost session, kept with their handles until recreated.
    recreate: BTreeMap<MonitoredItemKey, Arc<MonitoredItem>>,
}

/// A logical subscription reconciled onto a pooled session.
pub struct Subscription {
    key: SubscriptionKey,
    pool: Arc<SessionPool>,
    channel_capacity: usize,
    inner: Mutex<SubscriptionInner>,
    context: Arc<PublishContext>,
    state: watch::Sender<SubscriptionState>,
    connection_retry_count: AtomicU32,
    next_handle: AtomicU32,
    good_nodes: AtomicUsize,
    bad_nodes: AtomicUsize,
}

impl Subscription {
    /// Creates a disabled subscription with no items.
    pub fn new(
        model: &SubscriptionModel,
        pool: Arc<SessionPool>,
        defaults: &SubscriptionDefaults,
    ) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Disabled);
        Self {
            key: model.key(),
            pool,
            channel_capacity: defaults.notification_channel_capacity.max(1),
            inner: Mutex::new(SubscriptionInner {
                desired: BTreeMap::new(),
                config: defaults.config.clone(),
                server: None,
                applied: BTreeMap::new(),
                recreate: BTreeMap::new(),
            }),
            context: Arc::new(PublishContext::new(model.id.clone())),
            state,
            connection_retry_count: AtomicU32::new(0),
            next_handle: AtomicU32::new(1),
            good_nodes: AtomicUsize::new(0),
            bad_nodes: AtomicUsize::new(0),
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Reconciles the server against `items` and `config`.
    ///
    /// The session is taken from the pool. Monitoring and publishing modes
    /// follow the current state; a disabled subscription becomes enabled.
    pub async fn apply(
        &self,
        items: impl IntoIterator<Item = MonitoredItemModel>,
        config: SubscriptionConfig,
        cancel: &CancellationToken,
    ) -> OpcUaResult<ApplyOutcome> {
        let mut inner = self.inner.lock().await;
        self.ensure_open()?;

        inner.desired = desired_item_set(items);
        inner.config = config;

        let session = match self.pool.get_or_create_session(&self.key.connection) {
            Ok(session) => session,
            Err(error) => {
                self.mark_failed(&error);
                return Err(error);
            }
        };

        let phase = self.state().phase();
        self.converge(&mut inner, &session, phase, cancel).await
    }

    /// Creates the server subscription and its items, items disabled.
    pub async fn enable(
        &self,
        session: &Arc<ClientSession>,
        cancel: &CancellationToken,
    ) -> OpcUaResult<ApplyOutcome> {
        let mut inner = self.inner.lock().await;
        self.ensure_open()?;
        self.converge(&mut inner, session, Phase::Enable, cancel)
            .await
    }

    /// Turns publishing on and items to their desired mode.
    pub async fn activate(
        &self,
        session: &Arc<ClientSession>,
        cancel: &CancellationToken,
    ) -> OpcUaResult<ApplyOutcome> {
        let mut inner = self.inner.lock().await;
        self.ensure_open()?;
        self.converge(&mut inner, session, Phase::Activate, cancel)
            .await
    }

    /// Turns publishing off and reporting items to sampling.
    pub async fn deactivate(
        &self,
        session: &Arc<ClientSession>,
        cancel: &CancellationToken,
    ) -> OpcUaResult<ApplyOutcome> {
        let mut inner = self.inner.lock().await;
        self.ensure_open()?;
        self.converge(&mut inner, session, Phase::Deactivate, cancel)
            .await
    }

    /// Last known value of every applied item.
    pub fn snapshot(&self) -> OpcUaResult<SubscriptionNotification> {
        self.ensure_open()?;
        Ok(self.context.snapshot())
    }

    /// Deletes the server subscription and drops all items. Idempotent.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if self.state().is_closed() {
            return;
        }

        if let Some(server) = inner.server.take() {
            server.pump_stop.cancel();
            if server.session.is_usable() {
                let subscription_id = server.subscription_id;
                let result = server
                    .session
                    .call(CallOptions::new("delete_subscription"), move |transport| async move {
                        transport.delete_subscription(subscription_id).await
                    })
                    .await;
                if let Err(error) = result {
                    tracing::debug!(
                        subscription = %self.key,
                        error = %error,
                        "Failed to delete server subscription"
                    );
                }
            }
        }

        inner.applied.clear();
        inner.recreate.clear();
        inner.desired.clear();
        self.context.clear_items();
        self.update_node_counts(&inner);
        self.set_state(SubscriptionState::Closed);
        tracing::info!(subscription = %self.key, "Subscription closed");
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        self.context.add_listener(listener);
    }

    /// Unregisters a listener. Returns `true` if it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn SubscriptionListener>) -> bool {
        self.context.remove_listener(listener)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Identity of the subscription.
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Logical id.
    pub fn id(&self) -> &str {
        &self.key.id
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Watches state changes.
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Recreates after a session change.
    pub fn connection_retry_count(&self) -> u32 {
        self.connection_retry_count.load(Ordering::Acquire)
    }

    /// Last assigned notification sequence number.
    pub fn sequence_number(&self) -> u32 {
        self.context.sequence_number()
    }

    /// Applied items, ordered by client handle.
    pub fn monitored_items(&self) -> Vec<Arc<MonitoredItem>> {
        self.context.item_list()
    }

    /// Items reporting with a good status.
    pub fn number_of_good_nodes(&self) -> usize {
        self.good_nodes.load(Ordering::Relaxed)
    }

    /// Desired items that failed or are not on the server.
    pub fn number_of_bad_nodes(&self) -> usize {
        self.bad_nodes.load(Ordering::Relaxed)
    }

    /// Subscription statistics.
    pub fn stats(&self) -> &SubscriptionStats {
        self.context.stats()
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    fn ensure_open(&self) -> OpcUaResult<()> {
        if self.state().is_closed() {
            return Err(OpcUaError::subscription_closed(self.key.id.clone()));
        }
        Ok(())
    }

    fn set_state(&self, state: SubscriptionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(
                subscription = %self.key,
                from = %previous,
                to = %state,
                "Subscription state changed"
            );
        }
    }

    fn mark_failed(&self, error: &OpcUaError) {
        self.context.stats().record_apply(false);
        self.set_state(SubscriptionState::Disabled);
        error.log(&format!("reconcile subscription {}", self.key));
    }

    async fn converge(
        &self,
        inner: &mut SubscriptionInner,
        session: &Arc<ClientSession>,
        phase: Phase,
        cancel: &CancellationToken,
    ) -> OpcUaResult<ApplyOutcome> {
        let result = self.reconcile(inner, session, phase, cancel).await;
        self.update_node_counts(inner);

        match result {
            Ok(outcome) => {
                self.context.stats().record_apply(true);
                self.set_state(phase.state());
                tracing::debug!(
                    subscription = %self.key,
                    session_id = session.id(),
                    created = outcome.created,
                    deleted = outcome.deleted,
                    modified = outcome.modified,
                    mode_changes = outcome.mode_changes,
                    failed = outcome.failed,
                    "Subscription reconciled"
                );
                Ok(outcome)
            }
            Err(error) => {
                self.mark_failed(&error);
                Err(error)
            }
        }
    }

    async fn reconcile(
        &self,
        inner: &mut SubscriptionInner,
        session: &Arc<ClientSession>,
        phase: Phase,
        cancel: &CancellationToken,
    ) -> OpcUaResult<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        self.context.configure(
            inner.config.timestamps_to_return,
            inner.config.publish_limit(),
        );

        self.forget_lost_session(inner, session).await;
        let subscription_id = self.ensure_server_subscription(inner, session, cancel).await?;

        // Lost items no longer desired have nothing left on the server.
        let dropped: Vec<Arc<MonitoredItem>> = {
            let desired = &inner.desired;
            let mut dropped = Vec::new();
            inner.recreate.retain(|key, item| {
                let keep = desired.contains_key(key);
                if !keep {
                    dropped.push(Arc::clone(item));
                }
                keep
            });
            dropped
        };
        for item in dropped {
            self.context.remove_item(item.client_handle());
            outcome.deleted += 1;
        }

        // Deletes
        let to_delete: Vec<(MonitoredItemKey, Arc<MonitoredItem>)> = inner
            .applied
            .iter()
            .filter(|(key, _)| !inner.desired.contains_key(*key))
            .map(|(key, item)| (key.clone(), Arc::clone(item)))
            .collect();
        if !to_delete.is_empty() {
            let ids: Vec<u32> = to_delete.iter().map(|(_, item)| item.monitored_item_id()).collect();
            let results = self
                .call(session, "delete_monitored_items", cancel, move |transport| async move {
                    transport.delete_monitored_items(subscription_id, &ids).await
                })
                .await?;

            for (index, (key, item)) in to_delete.into_iter().enumerate() {
                if let Some(status) = results.get(index).filter(|status| status.is_bad()) {
                    tracing::debug!(
                        subscription = %self.key,
                        client_handle = item.client_handle(),
                        status = %status,
                        "Server reported delete failure, dropping item"
                    );
                }
                inner.applied.remove(&key);
                self.context.remove_item(item.client_handle());
                outcome.deleted += 1;
            }
        }

        // Modifies and local-only changes
        let mut to_modify = Vec::new();
        for (key, desired) in &inner.desired {
            let Some(item) = inner.applied.get(key) else {
                continue;
            };
            item.update_local(desired);
            if item.model().needs_modify(desired) {
                to_modify.push((Arc::clone(item), desired.clone()));
            }
        }
        if !to_modify.is_empty() {
            let requests: Vec<MonitoredItemModifyRequest> = to_modify
                .iter()
                .map(|(item, model)| MonitoredItemModifyRequest {
                    monitored_item_id: item.monitored_item_id(),
                    client_handle: item.client_handle(),
                    sampling_interval: model.sampling_interval,
                    queue_size: model.queue_size,
                    discard_oldest: model.discard_oldest,
                    filter: model.monitoring_filter(),
                })
                .collect();
            let expected = requests.len();
            let results = self
                .call(session, "modify_monitored_items", cancel, move |transport| async move {
                    transport.modify_monitored_items(subscription_id, &requests).await
                })
                .await?;
            check_result_count("modify_monitored_items", expected, results.len())?;

            for ((item, model), result) in to_modify.into_iter().zip(results) {
                if result.status.is_bad() {
                    self.item_failed(&item, result.status, &mut outcome).await;
                } else {
                    item.mark_modified(model);
                    outcome.modified += 1;
                }
            }
        }

        // Creates
        let to_create: Vec<(Arc<MonitoredItem>, bool)> = inner
            .desired
            .iter()
            .filter(|(key, _)| !inner.applied.contains_key(*key))
            .map(|(key, model)| match inner.recreate.get(key) {
                Some(item) => {
                    item.mark_modified(model.clone());
                    (Arc::clone(item), true)
                }
                None => (
                    Arc::new(MonitoredItem::new(self.next_client_handle(), model.clone())),
                    false,
                ),
            })
            .collect();
        if !to_create.is_empty() {
            let requests: Vec<MonitoredItemCreateRequest> = to_create
                .iter()
                .map(|(item, _)| {
                    let model = item.model();
                    let filter = model.monitoring_filter();
                    MonitoredItemCreateRequest {
                        node_id: model.node_id,
                        attribute_id: model.attribute_id,
                        client_handle: item.client_handle(),
                        monitoring_mode: phase.target_mode(model.monitoring_mode),
                        sampling_interval: model.sampling_interval,
                        queue_size: model.queue_size,
                        discard_oldest: model.discard_oldest,
                        filter,
                    }
                })
                .collect();
            let modes: Vec<MonitoringMode> = requests.iter().map(|r| r.monitoring_mode).collect();

            // Registered first so values racing the response are not lost.
            for (item, _) in &to_create {
                self.context.insert_item(Arc::clone(item));
            }

            let expected = requests.len();
            let results = self
                .call(session, "create_monitored_items", cancel, move |transport| async move {
                    transport.create_monitored_items(subscription_id, &requests).await
                })
                .await;
            let results = match results.and_then(|results| {
                check_result_count("create_monitored_items", expected, results.len())?;
                Ok(results)
            }) {
                Ok(results) => results,
                Err(error) => {
                    // Recreated items stay registered for the next attempt.
                    for (item, recreated) in &to_create {
                        if !recreated {
                            self.context.remove_item(item.client_handle());
                        }
                    }
                    return Err(error);
                }
            };

            for (((item, _), mode), result) in to_create.into_iter().zip(modes).zip(results) {
                let key = item.model().key();
                inner.recreate.remove(&key);
                if result.status.is_bad() {
                    self.context.remove_item(item.client_handle());
                    self.item_failed(&item, result.status, &mut outcome).await;
                    continue;
                }
                item.mark_created(result.monitored_item_id, mode);
                inner.applied.insert(key, item);
                outcome.created += 1;
            }
        }

        // Monitoring modes of items that were already applied
        let mut by_mode: BTreeMap<MonitoringMode, Vec<Arc<MonitoredItem>>> = BTreeMap::new();
        for (key, item) in &inner.applied {
            let Some(desired) = inner.desired.get(key) else {
                continue;
            };
            let target = phase.target_mode(desired.monitoring_mode);
            if item.mode() != target {
                by_mode.entry(target).or_default().push(Arc::clone(item));
            }
        }
        for (mode, items) in by_mode {
            let ids: Vec<u32> = items.iter().map(|item| item.monitored_item_id()).collect();
            let results = self
                .call(session, "set_monitoring_mode", cancel, move |transport| async move {
                    transport.set_monitoring_mode(subscription_id, mode, &ids).await
                })
                .await?;

            for (index, item) in items.iter().enumerate() {
                match results.get(index) {
                    Some(status) if status.is_bad() => {
                        self.item_failed(item, *status, &mut outcome).await;
                    }
                    _ => {
                        item.set_mode(mode);
                        outcome.mode_changes += 1;
                    }
                }
            }
        }

        // Publishing
        let publishing = phase.publishing() && !inner.desired.is_empty();
        if let Some(server) = inner.server.as_mut() {
            if server.publishing_enabled != publishing {
                self.call(session, "set_publishing_mode", cancel, move |transport| async move {
                    transport.set_publishing_mode(subscription_id, publishing).await
                })
                .await?;
                server.publishing_enabled = publishing;
            }
        }

        Ok(outcome)
    }

    /// Drops server state hosted by a session other than `session`.
    ///
    /// The applied items move to the recreate set, still registered for
    /// snapshots, until a create on the new session succeeds. Their client
    /// handles survive any number of failed attempts.
    async fn forget_lost_session(&self, inner: &mut SubscriptionInner, session: &Arc<ClientSession>) {
        let lost = inner
            .server
            .as_ref()
            .is_some_and(|server| server.session.id() != session.id());
        if !lost {
            return;
        }

        if let Some(server) = inner.server.take() {
            server.pump_stop.cancel();
            tracing::info!(
                subscription = %self.key,
                old_session_id = server.session.id(),
                new_session_id = session.id(),
                items = inner.applied.len(),
                "Session changed, recreating subscription"
            );
        }

        let lost_items = std::mem::take(&mut inner.applied);
        for (key, item) in lost_items {
            item.reset_server_state();
            inner.recreate.insert(key, item);
        }

        let epoch = self.connection_retry_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.context.stats().record_recreate();
        self.context.reset_sequence(epoch).await;
    }

    async fn ensure_server_subscription(
        &self,
        inner: &mut SubscriptionInner,
        session: &Arc<ClientSession>,
        cancel: &CancellationToken,
    ) -> OpcUaResult<u32> {
        if let Some(server) = inner.server.as_mut() {
            let subscription_id = server.subscription_id;
            if server.config.needs_modify(&inner.config) {
                let config = inner.config.clone();
                self.call(session, "modify_subscription", cancel, move |transport| async move {
                    transport.modify_subscription(subscription_id, &config).await
                })
                .await?;
            }
            server.config = inner.config.clone();
            return Ok(subscription_id);
        }

        let (sink, messages) = mpsc::channel(self.channel_capacity);
        let config = inner.config.clone();
        let created = self
            .call(session, "create_subscription", cancel, move |transport| async move {
                transport.create_subscription(&config, false, sink).await
            })
            .await?;

        let pump_stop = CancellationToken::new();
        tokio::spawn(run_pump(
            Arc::clone(&self.context),
            messages,
            pump_stop.clone(),
        ));

        tracing::info!(
            subscription = %self.key,
            session_id = session.id(),
            subscription_id = created.subscription_id,
            revised_publishing_interval_ms = created.revised_publishing_interval.as_millis() as u64,
            "Server subscription created"
        );

        inner.server = Some(ServerSubscription {
            session: Arc::clone(session),
            subscription_id: created.subscription_id,
            config: inner.config.clone(),
            publishing_enabled: false,
            pump_stop,
        });
        Ok(created.subscription_id)
    }

    async fn item_failed(&self, item: &MonitoredItem, status: StatusCode, outcome: &mut ApplyOutcome) {
        item.set_status(status);
        outcome.failed += 1;

        let node_id = item.model().node_id;
        tracing::warn!(
            subscription = %self.key,
            client_handle = item.client_handle(),
            node_id = %node_id,
            status = %status,
            "Monitored item operation failed"
        );
        self.context
            .item_changed(item.client_handle(), node_id, status)
            .await;
    }

    async fn call<T, F, Fut>(
        &self,
        session: &ClientSession,
        operation: &'static str,
        cancel: &CancellationToken,
        call: F,
    ) -> OpcUaResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn UaTransport>) -> Fut + Send + 'static,
        Fut: Future<Output = OpcUaResult<T>> + Send + 'static,
    {
        session
            .call(CallOptions::new(operation).with_cancel(cancel.clone()), call)
            .await
    }

    fn next_client_handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn update_node_counts(&self, inner: &SubscriptionInner) {
        let good = inner
            .applied
            .values()
            .filter(|item| item.status().is_good() && item.mode() == MonitoringMode::Reporting)
            .count();
        let healthy = inner
            .applied
            .values()
            .filter(|item| !item.status().is_bad())
            .count();
        self.good_nodes.store(good, Ordering::Relaxed);
        self.bad_nodes
            .store(inner.desired.len().saturating_sub(healthy), Ordering::Relaxed);
    }
}

fn check_result_count(service: &'static str, expected: usize, actual: usize) -> OpcUaResult<()> {
    if expected != actual {
        return Err(OpcUaError::subscription(SubscriptionError::service_failed(
            service,
            format!("expected {expected} results, got {actual}"),
        )));
    }
    Ok(())
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("connection_retry_count", &self.connection_retry_count())
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.try_lock() {
            if let Some(server) = &inner.server {
                server.pump_stop.cancel();
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_target_modes() {
        use MonitoringMode::*;

        assert_eq!(Phase::Enable.target_mode(Reporting), Disabled);
        assert_eq!(Phase::Activate.target_mode(Reporting), Reporting);
        assert_eq!(Phase::Activate.target_mode(Sampling), Sampling);
        assert_eq!(Phase::Deactivate.target_mode(Reporting), Sampling);
        assert_eq!(Phase::Deactivate.target_mode(Disabled), Disabled);
    }

    #[test]
    fn test_state_phase_mapping() {
        assert_eq!(SubscriptionState::Disabled.phase(), Phase::Enable);
        assert_eq!(SubscriptionState::Active.phase(), Phase::Activate);
        assert_eq!(SubscriptionState::Inactive.phase(), Phase::Deactivate);
        assert_eq!(Phase::Deactivate.state(), SubscriptionState::Inactive);
        assert!(Phase::Activate.publishing());
        assert!(!Phase::Deactivate.publishing());
    }

    #[test]
    fn test_state_predicates() {
        assert!(SubscriptionState::Inactive.is_enabled());
        assert!(!SubscriptionState::Disabled.is_enabled());
        assert!(SubscriptionState::Active.is_active());
        assert!(SubscriptionState::Closed.is_closed());
        assert_eq!(SubscriptionState::Inactive.to_string(), "Inactive");
    }

    #[test]
    fn test_apply_outcome() {
        assert!(ApplyOutcome::default().is_noop());
        let outcome = ApplyOutcome {
            created: 1,
            ..Default::default()
        };
        assert!(!outcome.is_noop());
    }

    #[test]
    fn test_check_result_count() {
        assert!(check_result_count("create_monitored_items", 2, 2).is_ok());
        assert!(check_result_count("create_monitored_items", 2, 1).is_err());
    }
}
