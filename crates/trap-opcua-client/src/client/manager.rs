// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Subscription lifecycle management.
//!
//! [`SubscriptionManager`] owns every [`Subscription`] and guarantees a
//! single instance per [`SubscriptionKey`].
//!
//! # Example
//!
//! ```rust,ignore
//! use trap_opcua_client::client::SubscriptionManager;
//!
//! let manager = SubscriptionManager::new(pool, defaults);
//! let subscription = manager.get_or_create_subscription(&model);
//!
//! subscription.apply(items, config, &cancel).await?;
//! subscription.activate(&session, &cancel).await?;
//!
//! manager.dispose_subscription(&subscription).await;
//! ```

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::client::pool::SessionPool;
use crate::client::subscription::Subscription;
use crate::config::SubscriptionDefaults;
use crate::types::{SubscriptionKey, SubscriptionModel};

/// Keyed owner of subscriptions.
pub struct SubscriptionManager {
    subscriptions: DashMap<SubscriptionKey, Arc<Subscription>>,
    pool: Arc<SessionPool>,
    defaults: SubscriptionDefaults,
}

impl SubscriptionManager {
    /// Creates an empty manager on top of `pool`.
    pub fn new(pool: Arc<SessionPool>, defaults: SubscriptionDefaults) -> Self {
        Self {
            subscriptions: DashMap::new(),
            pool,
            defaults,
        }
    }

    /// Returns the subscription for `model`, creating it if needed.
    ///
    /// A closed subscription still in the map is replaced.
    pub fn get_or_create_subscription(&self, model: &SubscriptionModel) -> Arc<Subscription> {
        let key = model.key();
        if let Some(existing) = self.subscriptions.get(&key) {
            if !existing.state().is_closed() {
                return Arc::clone(existing.value());
            }
        }

        match self.subscriptions.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().state().is_closed() {
                    let replacement = self.create(model);
                    entry.insert(Arc::clone(&replacement));
                    replacement
                } else {
                    Arc::clone(entry.get())
                }
            }
            Entry::Vacant(entry) => {
                let created = self.create(model);
                entry.insert(Arc::clone(&created));
                created
            }
        }
    }

    fn create(&self, model: &SubscriptionModel) -> Arc<Subscription> {
        tracing::debug!(subscription = %model.key(), "Creating subscription");
        Arc::new(Subscription::new(
            model,
            Arc::clone(&self.pool),
            &self.defaults,
        ))
    }

    /// Removes `subscription` if it is still registered, then closes it.
    pub async fn dispose_subscription(&self, subscription: &Arc<Subscription>) {
        let removed = self
            .subscriptions
            .remove_if(subscription.key(), |_, current| {
                Arc::ptr_eq(current, subscription)
            });
        if removed.is_none() {
            tracing::debug!(
                subscription = %subscription.key(),
                "Disposing subscription that is no longer registered"
            );
        }
        subscription.close().await;
    }

    /// Returns the subscription for `key`, if any.
    pub fn subscription(&self, key: &SubscriptionKey) -> Option<Arc<Subscription>> {
        self.subscriptions
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns all registered keys.
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Returns the number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Returns `true` if no subscriptions are registered.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// The pool the subscriptions run on.
    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Closes and removes every subscription.
    pub async fn close_all(&self) {
        let keys = self.keys();
        let count = keys.len();
        for key in keys {
            if let Some((_, subscription)) = self.subscriptions.remove(&key) {
                subscription.close().await;
            }
        }
        tracing::info!(closed = count, "All subscriptions closed");
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}
