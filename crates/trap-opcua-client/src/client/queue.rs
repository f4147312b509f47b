// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Per monitored item value queue.
//!
//! Values arriving in publish responses are filtered and queued here, then
//! drained by the owning subscription's publish cycle. Events share the
//! queue; their fields travel as an array value until they are published.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{
    DataChangeFilter, DataValue, MonitoredItemModel, MonitoringMode, NodeId, StatusCode,
    TimestampsToReturn, Variant,
};

// =============================================================================
// MonitoredItemQueue
// =============================================================================

/// Bounded queue of `(value, error)` pairs for one monitored item.
#[derive(Debug)]
pub struct MonitoredItemQueue {
    queue_size: usize,
    discard_oldest: bool,
    filter: DataChangeFilter,
    last_value: Option<DataValue>,
    last_error: Option<StatusCode>,
    queue: Option<VecDeque<(DataValue, Option<StatusCode>)>>,
    ready_to_publish: bool,
    overflow_count: u64,
}

impl MonitoredItemQueue {
    /// Creates a queue. A size of 0 or 1 keeps only the latest value.
    pub fn new(queue_size: u32, discard_oldest: bool, filter: DataChangeFilter) -> Self {
        let queue_size = queue_size as usize;
        Self {
            queue_size,
            discard_oldest,
            filter,
            last_value: None,
            last_error: None,
            queue: (queue_size > 1).then(|| VecDeque::with_capacity(queue_size)),
            ready_to_publish: false,
            overflow_count: 0,
        }
    }

    /// Creates a queue sized for `model`.
    pub fn for_model(model: &MonitoredItemModel) -> Self {
        Self::new(model.queue_size, model.discard_oldest, model.data_change_filter)
    }

    /// Applies new queue parameters after a modify.
    ///
    /// Buffered values survive; on shrink the discard policy decides which go.
    pub fn reconfigure(&mut self, queue_size: u32, discard_oldest: bool, filter: DataChangeFilter) {
        let queue_size = queue_size as usize;
        self.filter = filter;
        self.discard_oldest = discard_oldest;
        self.queue_size = queue_size;

        if queue_size <= 1 {
            self.queue = None;
            return;
        }

        if self.queue.is_none() {
            let mut queue = VecDeque::with_capacity(queue_size);
            // The single slot's unpublished value carries over.
            if self.ready_to_publish {
                if let Some(value) = self.last_value.clone() {
                    queue.push_back((value, self.last_error));
                }
            }
            self.queue = Some(queue);
        }

        let Some(queue) = self.queue.as_mut() else {
            return;
        };
        while queue.len() > queue_size {
            if discard_oldest {
                queue.pop_front();
            } else {
                queue.pop_back();
            }
        }
    }

    /// Queues a value.
    ///
    /// `error` overrides the status of `value`. Returns `false` if the
    /// filter dropped the value.
    pub fn queue_value(
        &mut self,
        value: DataValue,
        error: Option<StatusCode>,
        ignore_filters: bool,
    ) -> bool {
        let mut value = value;
        if let Some(status) = error {
            value.status = status;
        }

        let changed = ignore_filters
            || value.status.is_bad()
            || self.filter.is_changed(self.last_value.as_ref(), &value);
        if !changed {
            return false;
        }

        self.last_value = Some(value.clone());
        self.last_error = error;

        if let Some(queue) = self.queue.as_mut() {
            let full = queue.len() >= self.queue_size;
            if full {
                self.overflow_count += 1;
                tracing::debug!(
                    queue_size = self.queue_size,
                    discard_oldest = self.discard_oldest,
                    overflow_count = self.overflow_count,
                    "Monitored item queue overflow"
                );
            }
            match (full, self.discard_oldest) {
                (true, true) => {
                    queue.pop_front();
                    queue.push_back((value, error));
                }
                // Discard newest: the buffered values stay, the incoming one is dropped.
                (true, false) => {}
                (false, _) => queue.push_back((value, error)),
            }
        }

        self.ready_to_publish = true;
        true
    }

    /// Moves up to `max` values into `out`.
    ///
    /// Returns `true` if values remain for the next cycle.
    pub fn publish(
        &mut self,
        max: usize,
        timestamps: TimestampsToReturn,
        out: &mut Vec<DataValue>,
    ) -> bool {
        if !self.ready_to_publish || max == 0 {
            return self.ready_to_publish;
        }

        match self.queue.as_mut() {
            Some(queue) => {
                let count = queue.len().min(max);
                out.extend(
                    queue
                        .drain(..count)
                        .map(|(value, _)| strip_timestamps(value, timestamps)),
                );
                self.ready_to_publish = !queue.is_empty();
            }
            None => {
                if let Some(value) = self.last_value.clone() {
                    out.push(strip_timestamps(value, timestamps));
                }
                self.ready_to_publish = false;
            }
        }

        self.ready_to_publish
    }

    /// Last value accepted by the filter.
    pub fn last_value(&self) -> Option<&DataValue> {
        self.last_value.as_ref()
    }

    /// Error status that accompanied the last value.
    pub fn last_error(&self) -> Option<StatusCode> {
        self.last_error
    }

    /// Returns `true` if a publish would emit values.
    pub fn is_ready(&self) -> bool {
        self.ready_to_publish
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        match &self.queue {
            Some(queue) => queue.len(),
            None => usize::from(self.ready_to_publish),
        }
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of values discarded on overflow.
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }
}

fn strip_timestamps(mut value: DataValue, timestamps: TimestampsToReturn) -> DataValue {
    if !timestamps.includes_source() {
        value.source_timestamp = None;
    }
    if !timestamps.includes_server() {
        value.server_timestamp = None;
    }
    value
}

// =============================================================================
// MonitoredItemNotification
// =============================================================================

/// One selected field of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventField {
    /// Field name from the select clause.
    pub name: String,
    /// Field value.
    pub value: Variant,
}

/// One value change or event delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemNotification {
    /// Client handle of the item.
    pub client_handle: u32,
    /// Monitored node.
    pub node_id: NodeId,
    /// Display name, if configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// The value. For events, carries status and timestamps only.
    pub value: DataValue,
    /// Selected fields, for event items.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_fields: Vec<EventField>,
}

impl MonitoredItemNotification {
    /// Returns `true` if this notification reports an event.
    pub fn is_event(&self) -> bool {
        !self.event_fields.is_empty()
    }
}

/// What a notification needs from the item model.
struct Labels {
    node_id: NodeId,
    display_name: Option<String>,
    field_names: Option<Vec<String>>,
}

impl Labels {
    fn of(model: &MonitoredItemModel) -> Self {
        Self {
            node_id: model.node_id.clone(),
            display_name: model.display_name.clone(),
            field_names: model.event_filter.as_ref().map(|filter| filter.field_names()),
        }
    }

    fn notification(&self, client_handle: u32, mut value: DataValue) -> MonitoredItemNotification {
        let mut event_fields = Vec::new();
        if let Some(names) = &self.field_names {
            // Trailing fields the item did not select are dropped.
            if let Variant::Array(fields) = std::mem::take(&mut value.value) {
                event_fields = names
                    .iter()
                    .cloned()
                    .zip(fields)
                    .map(|(name, value)| EventField { name, value })
                    .collect();
            }
        }
        MonitoredItemNotification {
            client_handle,
            node_id: self.node_id.clone(),
            display_name: self.display_name.clone(),
            value,
            event_fields,
        }
    }
}

// =============================================================================
// MonitoredItem
// =============================================================================

/// Server-side view of an item, updated by reconciliation.
#[derive(Debug, Clone)]
struct ItemState {
    model: MonitoredItemModel,
    monitored_item_id: u32,
    mode: MonitoringMode,
    status: StatusCode,
}

/// Runtime state of one applied monitored item.
///
/// Shared between reconciliation, which updates the server view, and the
/// publish pump, which feeds the queue.
#[derive(Debug)]
pub struct MonitoredItem {
    client_handle: u32,
    state: Mutex<ItemState>,
    queue: Mutex<MonitoredItemQueue>,
    skip_next: AtomicBool,
    values_received: AtomicU32,
}

impl MonitoredItem {
    /// Creates an item that is not yet known to the server.
    pub fn new(client_handle: u32, model: MonitoredItemModel) -> Self {
        let queue = MonitoredItemQueue::for_model(&model);
        let skip_next = model.skip_first;
        Self {
            client_handle,
            state: Mutex::new(ItemState {
                model,
                monitored_item_id: 0,
                mode: MonitoringMode::Disabled,
                status: StatusCode::BAD_WAITING_FOR_INITIAL_DATA,
            }),
            queue: Mutex::new(queue),
            skip_next: AtomicBool::new(skip_next),
            values_received: AtomicU32::new(0),
        }
    }

    /// Client handle; stable for the life of the item.
    pub fn client_handle(&self) -> u32 {
        self.client_handle
    }

    /// Applied configuration.
    pub fn model(&self) -> MonitoredItemModel {
        self.state.lock().model.clone()
    }

    /// Server-assigned id, 0 until created.
    pub fn monitored_item_id(&self) -> u32 {
        self.state.lock().monitored_item_id
    }

    /// Current server monitoring mode.
    pub fn mode(&self) -> MonitoringMode {
        self.state.lock().mode
    }

    /// Status of the last service result for the item.
    pub fn status(&self) -> StatusCode {
        self.state.lock().status
    }

    /// Records a successful create.
    pub(crate) fn mark_created(&self, monitored_item_id: u32, mode: MonitoringMode) {
        let mut state = self.state.lock();
        state.monitored_item_id = monitored_item_id;
        state.mode = mode;
        state.status = StatusCode::GOOD;
        self.skip_next.store(state.model.skip_first, Ordering::Release);
    }

    /// Records a successful modify with the new configuration.
    pub(crate) fn mark_modified(&self, model: MonitoredItemModel) {
        self.queue.lock().reconfigure(
            model.queue_size,
            model.discard_oldest,
            model.data_change_filter,
        );
        let mut state = self.state.lock();
        state.model = model;
        state.status = StatusCode::GOOD;
    }

    /// Records a monitoring mode change.
    pub(crate) fn set_mode(&self, mode: MonitoringMode) {
        self.state.lock().mode = mode;
    }

    /// Records a per-item failure.
    pub(crate) fn set_status(&self, status: StatusCode) {
        self.state.lock().status = status;
    }

    /// Updates fields that need no server call.
    pub(crate) fn update_local(&self, desired: &MonitoredItemModel) {
        let mut state = self.state.lock();
        state.model.display_name = desired.display_name.clone();
        state.model.monitoring_mode = desired.monitoring_mode;
        state.model.skip_first = desired.skip_first;
    }

    /// Forgets server state after the hosting session was lost.
    pub(crate) fn reset_server_state(&self) {
        let mut state = self.state.lock();
        state.monitored_item_id = 0;
        state.mode = MonitoringMode::Disabled;
    }

    /// Feeds a value from a publish response.
    pub fn queue_value(&self, value: DataValue) -> bool {
        self.values_received.fetch_add(1, Ordering::Relaxed);
        if self.skip_next.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.queue.lock().queue_value(value, None, false)
    }

    /// Feeds an event from a publish response.
    ///
    /// Events bypass the data change filter.
    pub fn queue_event(&self, fields: Vec<Variant>, time: DateTime<Utc>) -> bool {
        self.values_received.fetch_add(1, Ordering::Relaxed);
        let value = DataValue {
            value: Variant::Array(fields),
            status: StatusCode::GOOD,
            source_timestamp: None,
            server_timestamp: Some(time),
        };
        self.queue.lock().queue_value(value, None, true)
    }

    /// Appends up to `max` notifications to `out`. Returns `true` if more remain.
    pub fn publish(
        &self,
        max: usize,
        timestamps: TimestampsToReturn,
        out: &mut Vec<MonitoredItemNotification>,
    ) -> bool {
        let mut values = Vec::new();
        let more = self.queue.lock().publish(max, timestamps, &mut values);
        if values.is_empty() {
            return more;
        }

        let labels = Labels::of(&self.state.lock().model);
        out.extend(
            values
                .into_iter()
                .map(|value| labels.notification(self.client_handle, value)),
        );
        more
    }

    /// Last known value as a notification, for snapshots.
    pub fn last_notification(&self, timestamps: TimestampsToReturn) -> MonitoredItemNotification {
        let value = self
            .queue
            .lock()
            .last_value()
            .cloned()
            .map(|value| strip_timestamps(value, timestamps));
        let state = self.state.lock();
        let value = value.unwrap_or_else(|| DataValue {
            status: if state.status.is_bad() {
                state.status
            } else {
                StatusCode::BAD_WAITING_FOR_INITIAL_DATA
            },
            ..DataValue::default()
        });
        Labels::of(&state.model).notification(self.client_handle, value)
    }

    /// Values received from the server, including filtered ones.
    pub fn values_received(&self) -> u32 {
        self.values_received.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeadbandSettings, EventFilter};

    fn value(v: i32) -> DataValue {
        DataValue::new(Variant::Int32(v))
    }

    fn drain(queue: &mut MonitoredItemQueue) -> Vec<Variant> {
        let mut out = Vec::new();
        queue.publish(usize::MAX, TimestampsToReturn::Both, &mut out);
        out.into_iter().map(|v| v.value).collect()
    }

    #[test]
    fn test_discard_oldest_keeps_newest() {
        let mut queue = MonitoredItemQueue::new(3, true, DataChangeFilter::default());
        for i in 1..=4 {
            assert!(queue.queue_value(value(i), None, false));
        }

        assert_eq!(queue.overflow_count(), 1);
        assert_eq!(
            drain(&mut queue),
            vec![Variant::Int32(2), Variant::Int32(3), Variant::Int32(4)]
        );
    }

    #[test]
    fn test_discard_newest_keeps_oldest() {
        let mut queue = MonitoredItemQueue::new(3, false, DataChangeFilter::default());
        for i in 1..=4 {
            assert!(queue.queue_value(value(i), None, false));
        }

        assert_eq!(queue.overflow_count(), 1);
        assert_eq!(queue.last_value().map(|v| v.value.clone()), Some(Variant::Int32(4)));
        assert_eq!(
            drain(&mut queue),
            vec![Variant::Int32(1), Variant::Int32(2), Variant::Int32(3)]
        );
    }

    #[test]
    fn test_single_slot_replaces() {
        let mut queue = MonitoredItemQueue::new(1, true, DataChangeFilter::default());
        queue.queue_value(value(1), None, false);
        queue.queue_value(value(2), None, false);

        assert_eq!(queue.len(), 1);
        assert_eq!(drain(&mut queue), vec![Variant::Int32(2)]);
        assert!(!queue.is_ready());
        assert!(drain(&mut queue).is_empty());
    }

    #[test]
    fn test_unchanged_value_dropped() {
        let mut queue = MonitoredItemQueue::new(4, true, DataChangeFilter::default());
        assert!(queue.queue_value(value(5), None, false));
        assert!(!queue.queue_value(value(5), None, false));
        assert!(queue.queue_value(value(5), None, true));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_deadband_filter() {
        let filter = DataChangeFilter {
            deadband: DeadbandSettings::absolute(1.5),
            ..Default::default()
        };
        let mut queue = MonitoredItemQueue::new(1, true, filter);
        assert!(queue.queue_value(value(10), None, false));
        assert!(!queue.queue_value(value(11), None, false));
        assert!(queue.queue_value(value(12), None, false));
    }

    #[test]
    fn test_error_overrides_status() {
        let mut queue = MonitoredItemQueue::new(1, true, DataChangeFilter::default());
        queue.queue_value(value(1), Some(StatusCode::BAD_COMMUNICATION_ERROR), false);

        assert_eq!(
            queue.last_value().unwrap().status,
            StatusCode::BAD_COMMUNICATION_ERROR
        );
        assert_eq!(queue.last_error(), Some(StatusCode::BAD_COMMUNICATION_ERROR));
        // A bad value is reported again even if identical.
        assert!(queue.queue_value(value(1), Some(StatusCode::BAD_COMMUNICATION_ERROR), false));
    }

    #[test]
    fn test_publish_limit_reports_remaining() {
        let mut queue = MonitoredItemQueue::new(5, true, DataChangeFilter::default());
        for i in 0..5 {
            queue.queue_value(value(i), None, false);
        }

        let mut out = Vec::new();
        assert!(queue.publish(2, TimestampsToReturn::Both, &mut out));
        assert_eq!(out.len(), 2);
        assert!(!queue.publish(10, TimestampsToReturn::Both, &mut out));
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn test_publish_strips_timestamps() {
        let mut queue = MonitoredItemQueue::new(1, true, DataChangeFilter::default());
        queue.queue_value(value(1), None, false);

        let mut out = Vec::new();
        queue.publish(1, TimestampsToReturn::Server, &mut out);
        assert!(out[0].source_timestamp.is_none());
        assert!(out[0].server_timestamp.is_some());
        // The stored value keeps both.
        assert!(queue.last_value().unwrap().source_timestamp.is_some());
    }

    #[test]
    fn test_reconfigure_shrinks_with_policy() {
        let mut queue = MonitoredItemQueue::new(4, true, DataChangeFilter::default());
        for i in 1..=4 {
            queue.queue_value(value(i), None, false);
        }
        queue.reconfigure(2, true, DataChangeFilter::default());
        assert_eq!(drain(&mut queue), vec![Variant::Int32(3), Variant::Int32(4)]);

        queue.reconfigure(1, true, DataChangeFilter::default());
        queue.queue_value(value(9), None, false);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_reconfigure_grow_keeps_unpublished_value() {
        let mut queue = MonitoredItemQueue::new(1, true, DataChangeFilter::default());
        queue.queue_value(value(7), None, false);

        queue.reconfigure(4, true, DataChangeFilter::default());
        assert!(queue.is_ready());
        assert_eq!(queue.len(), 1);
        queue.queue_value(value(8), None, false);
        assert_eq!(drain(&mut queue), vec![Variant::Int32(7), Variant::Int32(8)]);

        // Nothing pending: the grown queue starts empty.
        let mut queue = MonitoredItemQueue::new(1, true, DataChangeFilter::default());
        queue.queue_value(value(1), None, false);
        drain(&mut queue);
        queue.reconfigure(4, true, DataChangeFilter::default());
        assert!(queue.is_empty());
        assert!(drain(&mut queue).is_empty());
    }

    #[test]
    fn test_monitored_item_skip_first() {
        let model = MonitoredItemModel {
            skip_first: true,
            ..MonitoredItemModel::new(NodeId::numeric(2, 1))
        };
        let item = MonitoredItem::new(3, model);
        item.mark_created(100, MonitoringMode::Reporting);

        assert!(!item.queue_value(value(1)));
        assert!(item.queue_value(value(2)));
        assert_eq!(item.values_received(), 2);

        let mut out = Vec::new();
        item.publish(usize::MAX, TimestampsToReturn::Neither, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].client_handle, 3);
        assert_eq!(out[0].value.value, Variant::Int32(2));
        assert!(out[0].value.server_timestamp.is_none());
    }

    #[test]
    fn test_event_item_publishes_named_fields() {
        let model = MonitoredItemModel::event(
            NodeId::numeric(0, 2253),
            EventFilter::fields(&["Message", "Severity"]),
        );
        let item = MonitoredItem::new(4, model);
        item.mark_created(40, MonitoringMode::Reporting);

        let fields = || {
            vec![
                Variant::String("Overtemp".into()),
                Variant::UInt32(700),
                // Event type appended to the request clauses.
                Variant::Int32(2041),
            ]
        };
        // Identical events are both reported.
        assert!(item.queue_event(fields(), Utc::now()));
        assert!(item.queue_event(fields(), Utc::now()));

        let mut out = Vec::new();
        item.publish(usize::MAX, TimestampsToReturn::Both, &mut out);
        assert_eq!(out.len(), 2);
        assert!(out[0].is_event());
        assert_eq!(out[0].value.value, Variant::Null);
        assert!(out[0].value.server_timestamp.is_some());
        let names: Vec<&str> = out[0].event_fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Message", "Severity"]);
        assert_eq!(out[1].event_fields[1].value, Variant::UInt32(700));
    }

    #[test]
    fn test_event_item_last_notification() {
        let model = MonitoredItemModel::event(NodeId::numeric(0, 2253), EventFilter::fields(&["Message"]));
        let item = MonitoredItem::new(1, model);
        let before = item.last_notification(TimestampsToReturn::Both);
        assert!(!before.is_event());
        assert_eq!(before.value.status, StatusCode::BAD_WAITING_FOR_INITIAL_DATA);

        item.queue_event(vec![Variant::String("Started".into())], Utc::now());
        let after = item.last_notification(TimestampsToReturn::Neither);
        assert_eq!(after.event_fields[0].value, Variant::String("Started".into()));
        assert!(after.value.server_timestamp.is_none());
    }

    #[test]
    fn test_last_notification_before_data() {
        let item = MonitoredItem::new(1, MonitoredItemModel::new(NodeId::numeric(2, 5)));
        let notification = item.last_notification(TimestampsToReturn::Both);
        assert_eq!(notification.value.status, StatusCode::BAD_WAITING_FOR_INITIAL_DATA);
        assert_eq!(notification.node_id, NodeId::numeric(2, 5));
    }
}
