// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Publish path from server publish responses to listeners.
//!
//! Each server subscription gets a pump task reading [`PublishMessage`]s from
//! a bounded channel. The pump queues values and events on their monitored items,
//! drains every ready item into sequence-numbered notifications and awaits
//! each listener in turn, which keeps delivery ordered and lets a slow
//! listener apply backpressure.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::queue::{MonitoredItem, MonitoredItemNotification};
use crate::client::transport::PublishMessage;
use crate::types::{NodeId, StatusCode, TimestampsToReturn};

// =============================================================================
// Notifications
// =============================================================================

/// Kind of notification batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Full state of every item.
    KeyFrame,
    /// Changes since the last publish cycle.
    #[default]
    DeltaFrame,
}

/// A sequence-numbered batch of value changes and events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionNotification {
    /// Logical subscription id.
    pub subscription_id: String,

    /// Sequence number, strictly increasing within an epoch.
    pub sequence_number: u32,

    /// Connection retry count when the batch was produced.
    pub epoch: u32,

    /// Batch kind.
    pub message_type: MessageType,

    /// Publish time.
    pub timestamp: DateTime<Utc>,

    /// The changes.
    pub notifications: Vec<MonitoredItemNotification>,
}

impl SubscriptionNotification {
    /// Returns `true` if the batch carries no values.
    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }
}

/// Status change of a monitored item, e.g. a failed create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredItemEvent {
    /// Logical subscription id.
    pub subscription_id: String,
    /// Client handle of the item.
    pub client_handle: u32,
    /// Monitored node.
    pub node_id: NodeId,
    /// New status.
    pub status: StatusCode,
}

// =============================================================================
// SubscriptionListener
// =============================================================================

/// Receives notifications from subscriptions.
#[async_trait]
pub trait SubscriptionListener: Send + Sync {
    /// Called with each notification batch.
    async fn on_subscription_change(&self, notification: SubscriptionNotification);

    /// Called when a monitored item's status changes.
    async fn on_monitored_item_change(&self, _event: MonitoredItemEvent) {
        // Default: no-op
    }

    /// Called when sequence numbers restart after the subscription was
    /// recreated on a new session.
    async fn on_sequence_reset(&self, _subscription_id: &str, _epoch: u32) {
        // Default: no-op
    }
}

/// Event forwarded by a [`ChannelListener`].
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    /// A notification batch.
    Notification(SubscriptionNotification),
    /// A monitored item status change.
    ItemChanged(MonitoredItemEvent),
    /// Sequence numbers restarted.
    SequenceReset {
        /// Logical subscription id.
        subscription_id: String,
        /// New epoch.
        epoch: u32,
    },
}

/// A channel-based listener.
///
/// Sends wait for capacity, so a full channel slows the publish pump.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: mpsc::Sender<ListenerEvent>,
}

impl ChannelListener {
    /// Creates a new channel listener.
    pub fn new(sender: mpsc::Sender<ListenerEvent>) -> Self {
        Self { sender }
    }

    /// Creates a new channel listener with a receiver.
    pub fn with_channel(capacity: usize) -> (Self, mpsc::Receiver<ListenerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    async fn forward(&self, event: ListenerEvent) {
        if self.sender.send(event).await.is_err() {
            tracing::trace!("Listener channel closed, dropping event");
        }
    }
}

#[async_trait]
impl SubscriptionListener for ChannelListener {
    async fn on_subscription_change(&self, notification: SubscriptionNotification) {
        self.forward(ListenerEvent::Notification(notification)).await;
    }

    async fn on_monitored_item_change(&self, event: MonitoredItemEvent) {
        self.forward(ListenerEvent::ItemChanged(event)).await;
    }

    async fn on_sequence_reset(&self, subscription_id: &str, epoch: u32) {
        self.forward(ListenerEvent::SequenceReset {
            subscription_id: subscription_id.to_string(),
            epoch,
        })
        .await;
    }
}

// =============================================================================
// SequenceTracker
// =============================================================================

/// Local sequence numbering plus server gap detection.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    current: u32,
    last_server: Option<u32>,
}

impl SequenceTracker {
    /// Creates a tracker starting at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next local sequence number. Skips 0 on wrap.
    pub fn next(&mut self) -> u32 {
        self.current = self.current.wrapping_add(1);
        if self.current == 0 {
            self.current = 1;
        }
        self.current
    }

    /// Last assigned local sequence number.
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Records a server sequence number and returns how many were skipped.
    ///
    /// Repeated or older numbers count as no gap.
    pub fn observe_server(&mut self, sequence_number: u32) -> u32 {
        let gap = match self.last_server {
            Some(last) => {
                let expected = if last == u32::MAX { 1 } else { last + 1 };
                let distance = sequence_number.wrapping_sub(expected);
                if distance < u32::MAX / 2 {
                    distance
                } else {
                    return 0;
                }
            }
            None => 0,
        };
        self.last_server = Some(sequence_number);
        gap
    }

    /// Restarts local numbering and forgets the server position.
    pub fn reset(&mut self) {
        self.current = 0;
        self.last_server = None;
    }
}

// =============================================================================
// SubscriptionStats
// =============================================================================

/// Statistics for one subscription.
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    notifications_sent: AtomicU64,
    values_published: AtomicU64,
    keep_alives: AtomicU64,
    missing_sequence_numbers: AtomicU64,
    unknown_handles: AtomicU64,
    applies: AtomicU64,
    apply_failures: AtomicU64,
    recreates: AtomicU64,
}

impl SubscriptionStats {
    /// Creates new subscription statistics.
    pub fn new() -> Self {
        Self::default()
    }

    fn record_notification(&self, values: usize) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
        self.values_published
            .fetch_add(values as u64, Ordering::Relaxed);
    }

    fn record_keep_alive(&self) {
        self.keep_alives.fetch_add(1, Ordering::Relaxed);
    }

    fn record_missing(&self, count: u32) {
        self.missing_sequence_numbers
            .fetch_add(u64::from(count), Ordering::Relaxed);
    }

    fn record_unknown_handle(&self) {
        self.unknown_handles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_apply(&self, ok: bool) {
        self.applies.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.apply_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_recreate(&self) {
        self.recreates.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of notification batches delivered.
    pub fn notifications_sent(&self) -> u64 {
        self.notifications_sent.load(Ordering::Relaxed)
    }

    /// Returns the number of values delivered.
    pub fn values_published(&self) -> u64 {
        self.values_published.load(Ordering::Relaxed)
    }

    /// Returns the number of keep-alive messages received.
    pub fn keep_alives(&self) -> u64 {
        self.keep_alives.load(Ordering::Relaxed)
    }

    /// Returns the number of server sequence numbers never received.
    pub fn missing_sequence_numbers(&self) -> u64 {
        self.missing_sequence_numbers.load(Ordering::Relaxed)
    }

    /// Returns the number of values for unknown client handles.
    pub fn unknown_handles(&self) -> u64 {
        self.unknown_handles.load(Ordering::Relaxed)
    }

    /// Returns the number of reconciliations.
    pub fn applies(&self) -> u64 {
        self.applies.load(Ordering::Relaxed)
    }

    /// Returns the number of failed reconciliations.
    pub fn apply_failures(&self) -> u64 {
        self.apply_failures.load(Ordering::Relaxed)
    }

    /// Returns the number of recreates after a session change.
    pub fn recreates(&self) -> u64 {
        self.recreates.load(Ordering::Relaxed)
    }
}

// =============================================================================
// PublishContext
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct PublishSettings {
    timestamps: TimestampsToReturn,
    limit: usize,
}

/// State shared between a subscription and its publish pump.
pub(crate) struct PublishContext {
    subscription_id: String,
    items: RwLock<BTreeMap<u32, Arc<MonitoredItem>>>,
    sequence: Mutex<SequenceTracker>,
    listeners: RwLock<Vec<Arc<dyn SubscriptionListener>>>,
    settings: RwLock<PublishSettings>,
    epoch: AtomicU32,
    stats: SubscriptionStats,
}

impl PublishContext {
    pub(crate) fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            items: RwLock::new(BTreeMap::new()),
            sequence: Mutex::new(SequenceTracker::new()),
            listeners: RwLock::new(Vec::new()),
            settings: RwLock::new(PublishSettings {
                timestamps: TimestampsToReturn::Both,
                limit: usize::MAX,
            }),
            epoch: AtomicU32::new(0),
            stats: SubscriptionStats::new(),
        }
    }

    pub(crate) fn stats(&self) -> &SubscriptionStats {
        &self.stats
    }

    pub(crate) fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn sequence_number(&self) -> u32 {
        self.sequence.lock().current()
    }

    pub(crate) fn configure(&self, timestamps: TimestampsToReturn, limit: usize) {
        *self.settings.write() = PublishSettings { timestamps, limit };
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn remove_listener(&self, listener: &Arc<dyn SubscriptionListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
        listeners.len() != before
    }

    fn listeners(&self) -> Vec<Arc<dyn SubscriptionListener>> {
        self.listeners.read().clone()
    }

    // =========================================================================
    // Items
    // =========================================================================

    pub(crate) fn insert_item(&self, item: Arc<MonitoredItem>) {
        self.items.write().insert(item.client_handle(), item);
    }

    pub(crate) fn remove_item(&self, client_handle: u32) {
        self.items.write().remove(&client_handle);
    }

    pub(crate) fn clear_items(&self) {
        self.items.write().clear();
    }

    pub(crate) fn item_list(&self) -> Vec<Arc<MonitoredItem>> {
        self.items.read().values().cloned().collect()
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Restarts numbering under a new epoch and tells the listeners.
    pub(crate) async fn reset_sequence(&self, epoch: u32) {
        self.sequence.lock().reset();
        self.epoch.store(epoch, Ordering::Release);
        tracing::info!(
            subscription_id = %self.subscription_id,
            epoch = epoch,
            "Subscription sequence reset"
        );
        for listener in self.listeners() {
            listener.on_sequence_reset(&self.subscription_id, epoch).await;
        }
    }

    pub(crate) async fn item_changed(&self, client_handle: u32, node_id: NodeId, status: StatusCode) {
        let event = MonitoredItemEvent {
            subscription_id: self.subscription_id.clone(),
            client_handle,
            node_id,
            status,
        };
        for listener in self.listeners() {
            listener.on_monitored_item_change(event.clone()).await;
        }
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Handles one publish response.
    pub(crate) async fn process(&self, message: PublishMessage) {
        if message.is_keep_alive() {
            self.stats.record_keep_alive();
            return;
        }

        let gap = self.sequence.lock().observe_server(message.sequence_number);
        if gap > 0 {
            self.stats.record_missing(gap);
            tracing::warn!(
                subscription_id = %self.subscription_id,
                sequence_number = message.sequence_number,
                missing = gap,
                "Publish sequence gap detected"
            );
        }

        {
            let items = self.items.read();
            for value in message.values {
                match items.get(&value.client_handle) {
                    Some(item) => {
                        item.queue_value(value.value);
                    }
                    None => self.unknown_handle(value.client_handle),
                }
            }
            for event in message.events {
                match items.get(&event.client_handle) {
                    Some(item) => {
                        item.queue_event(event.fields, message.publish_time);
                    }
                    None => self.unknown_handle(event.client_handle),
                }
            }
        }

        self.publish_ready(message.publish_time).await;
    }

    fn unknown_handle(&self, client_handle: u32) {
        self.stats.record_unknown_handle();
        tracing::debug!(
            subscription_id = %self.subscription_id,
            client_handle = client_handle,
            "Notification for unknown client handle"
        );
    }

    /// Drains ready items into as many batches as the publish limit needs.
    async fn publish_ready(&self, timestamp: DateTime<Utc>) {
        let settings = *self.settings.read();
        let items = self.item_list();

        loop {
            let mut notifications = Vec::new();
            let mut more = false;
            for item in &items {
                let remaining = settings.limit.saturating_sub(notifications.len());
                more |= item.publish(remaining, settings.timestamps, &mut notifications);
            }

            if notifications.is_empty() {
                break;
            }

            let notification = SubscriptionNotification {
                subscription_id: self.subscription_id.clone(),
                sequence_number: self.sequence.lock().next(),
                epoch: self.epoch(),
                message_type: MessageType::DeltaFrame,
                timestamp,
                notifications,
            };
            self.deliver(notification).await;

            if !more {
                break;
            }
        }
    }

    async fn deliver(&self, notification: SubscriptionNotification) {
        self.stats.record_notification(notification.notifications.len());
        tracing::trace!(
            subscription_id = %self.subscription_id,
            sequence_number = notification.sequence_number,
            values = notification.notifications.len(),
            "Delivering notification"
        );

        let listeners = self.listeners();
        if let Some((last, rest)) = listeners.split_last() {
            for listener in rest {
                listener.on_subscription_change(notification.clone()).await;
            }
            last.on_subscription_change(notification).await;
        }
    }

    /// Last known value of every item, without consuming queued values.
    pub(crate) fn snapshot(&self) -> SubscriptionNotification {
        let timestamps = self.settings.read().timestamps;
        SubscriptionNotification {
            subscription_id: self.subscription_id.clone(),
            sequence_number: self.sequence_number(),
            epoch: self.epoch(),
            message_type: MessageType::KeyFrame,
            timestamp: Utc::now(),
            notifications: self
                .item_list()
                .iter()
                .map(|item| item.last_notification(timestamps))
                .collect(),
        }
    }
}

impl fmt::Debug for PublishContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishContext")
            .field("subscription_id", &self.subscription_id)
            .field("items", &self.items.read().len())
            .field("listeners", &self.listeners.read().len())
            .finish_non_exhaustive()
    }
}

/// Feeds publish responses for one server subscription into `context`.
pub(crate) async fn run_pump(
    context: Arc<PublishContext>,
    mut messages: mpsc::Receiver<PublishMessage>,
    stop: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = stop.cancelled() => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        context.process(message).await;
    }

    tracing::debug!(
        subscription_id = %context.subscription_id,
        "Publish pump stopped"
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::{ItemEvent, ItemValue};
    use crate::types::{DataValue, EventFilter, MonitoredItemModel, MonitoringMode, Variant};

    fn item(handle: u32, node: u32) -> Arc<MonitoredItem> {
        let model = MonitoredItemModel::new(NodeId::numeric(2, node)).with_queue(10, true);
        let item = Arc::new(MonitoredItem::new(handle, model));
        item.mark_created(handle + 100, MonitoringMode::Reporting);
        item
    }

    fn data(handle: u32, v: i32) -> ItemValue {
        ItemValue::new(handle, DataValue::new(Variant::Int32(v)))
    }

    #[test]
    fn test_sequence_tracker_numbering() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.current(), 0);
        assert_eq!(tracker.next(), 1);
        assert_eq!(tracker.next(), 2);
        tracker.reset();
        assert_eq!(tracker.next(), 1);
    }

    #[test]
    fn test_sequence_tracker_gaps() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe_server(10), 0);
        assert_eq!(tracker.observe_server(11), 0);
        assert_eq!(tracker.observe_server(14), 2);
        // Replays are not gaps.
        assert_eq!(tracker.observe_server(12), 0);
        assert_eq!(tracker.observe_server(u32::MAX), 0);
        assert_eq!(tracker.observe_server(1), 0);
    }

    #[tokio::test]
    async fn test_process_delivers_in_order() {
        let context = PublishContext::new("group-1");
        let (listener, mut rx) = ChannelListener::with_channel(16);
        context.add_listener(Arc::new(listener));
        context.insert_item(item(1, 10));
        context.insert_item(item(2, 20));

        context
            .process(PublishMessage::data_change(1, vec![data(2, 5), data(1, 7)]))
            .await;
        context
            .process(PublishMessage::data_change(2, vec![data(1, 8)]))
            .await;

        let ListenerEvent::Notification(first) = rx.recv().await.unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(first.sequence_number, 1);
        assert_eq!(first.message_type, MessageType::DeltaFrame);
        let handles: Vec<u32> = first.notifications.iter().map(|n| n.client_handle).collect();
        assert_eq!(handles, vec![1, 2]);

        let ListenerEvent::Notification(second) = rx.recv().await.unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(second.sequence_number, 2);
        assert_eq!(second.notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_limit_splits_batches() {
        let context = PublishContext::new("group-1");
        let (listener, mut rx) = ChannelListener::with_channel(16);
        context.add_listener(Arc::new(listener));
        context.configure(TimestampsToReturn::Both, 2);
        context.insert_item(item(1, 10));

        let values = (0..5).map(|v| data(1, v)).collect();
        context.process(PublishMessage::data_change(1, values)).await;

        let mut sizes = Vec::new();
        while let Ok(ListenerEvent::Notification(n)) = rx.try_recv() {
            sizes.push(n.notifications.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_keep_alive_and_gap_stats() {
        let context = PublishContext::new("group-1");
        context.insert_item(item(1, 10));

        context.process(PublishMessage::keep_alive(1)).await;
        context
            .process(PublishMessage::data_change(1, vec![data(1, 1)]))
            .await;
        context
            .process(PublishMessage::data_change(4, vec![data(1, 2), data(9, 0)]))
            .await;

        assert_eq!(context.stats().keep_alives(), 1);
        assert_eq!(context.stats().missing_sequence_numbers(), 2);
        assert_eq!(context.stats().unknown_handles(), 1);
        assert_eq!(context.stats().notifications_sent(), 2);
    }

    #[tokio::test]
    async fn test_reset_sequence_signals_listeners() {
        let context = PublishContext::new("group-1");
        let (listener, mut rx) = ChannelListener::with_channel(16);
        context.add_listener(Arc::new(listener));
        context.insert_item(item(1, 10));

        context
            .process(PublishMessage::data_change(7, vec![data(1, 1)]))
            .await;
        context.reset_sequence(1).await;
        context
            .process(PublishMessage::data_change(1, vec![data(1, 2)]))
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(
            &events[1],
            ListenerEvent::SequenceReset { epoch: 1, .. }
        ));
        let ListenerEvent::Notification(after) = &events[2] else {
            panic!("expected notification");
        };
        assert_eq!(after.sequence_number, 1);
        assert_eq!(after.epoch, 1);
        // The new server numbering is not a gap.
        assert_eq!(context.stats().missing_sequence_numbers(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_is_key_frame() {
        let context = PublishContext::new("group-1");
        context.insert_item(item(1, 10));
        context.insert_item(item(2, 20));
        context
            .process(PublishMessage::data_change(1, vec![data(1, 42)]))
            .await;

        let snapshot = context.snapshot();
        assert_eq!(snapshot.message_type, MessageType::KeyFrame);
        assert_eq!(snapshot.sequence_number, 1);
        assert_eq!(snapshot.notifications.len(), 2);
        assert_eq!(snapshot.notifications[0].value.value, Variant::Int32(42));
        assert_eq!(
            snapshot.notifications[1].value.status,
            StatusCode::BAD_WAITING_FOR_INITIAL_DATA
        );
    }

    #[tokio::test]
    async fn test_process_routes_events() {
        let context = PublishContext::new("group-1");
        let (listener, mut rx) = ChannelListener::with_channel(16);
        context.add_listener(Arc::new(listener));
        context.insert_item(item(1, 10));
        let model = MonitoredItemModel::event(
            NodeId::numeric(0, 2253),
            EventFilter::fields(&["Message", "Severity"]),
        );
        let events = Arc::new(MonitoredItem::new(2, model));
        events.mark_created(200, MonitoringMode::Reporting);
        context.insert_item(events);

        let mut message = PublishMessage::event(
            1,
            vec![
                ItemEvent::new(2, vec![Variant::String("Door open".into()), Variant::UInt32(300)]),
                ItemEvent::new(8, vec![Variant::Null]),
            ],
        );
        message.values.push(data(1, 5));
        context.process(message).await;

        let ListenerEvent::Notification(batch) = rx.recv().await.unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(batch.notifications.len(), 2);
        assert!(!batch.notifications[0].is_event());
        let event = &batch.notifications[1];
        assert_eq!(event.client_handle, 2);
        assert_eq!(event.event_fields[0].name, "Message");
        assert_eq!(event.event_fields[1].value, Variant::UInt32(300));
        assert_eq!(context.stats().unknown_handles(), 1);
        assert_eq!(context.stats().keep_alives(), 0);
    }

    #[tokio::test]
    async fn test_pump_stops_when_sender_dropped() {
        let context = Arc::new(PublishContext::new("group-1"));
        let (tx, rx) = mpsc::channel(4);
        let pump = tokio::spawn(run_pump(Arc::clone(&context), rx, CancellationToken::new()));

        tx.send(PublishMessage::keep_alive(1)).await.unwrap();
        drop(tx);
        pump.await.unwrap();
        assert_eq!(context.stats().keep_alives(), 1);
    }
}
