// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session pool keyed by endpoint, security and identity.
//!
//! Callers never hold sessions directly. They hand a service call to
//! [`SessionPool::execute`], which routes it to the pooled session for the
//! connection and replaces sessions that reject calls. A background sweeper
//! closes sessions that stay idle past the session timeout.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::certificate::CertificateProvider;
use crate::client::session::{CallOptions, ClientSession, ScheduleOutcome};
use crate::client::transport::{SessionConnector, UaTransport};
use crate::config::{PoolConfig, SessionConfig};
use crate::error::{OpcUaError, OpcUaResult, SessionError};
use crate::types::{ConnectionModel, EndpointKey};

// =============================================================================
// PoolStats
// =============================================================================

/// Statistics for the session pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    sessions_created: AtomicU64,
    sessions_evicted: AtomicU64,
    sessions_replaced: AtomicU64,
    rejected_schedules: AtomicU64,
}

impl PoolStats {
    /// Creates new pool statistics.
    pub fn new() -> Self {
        Self::default()
    }

    fn record_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_evicted(&self) {
        self.sessions_evicted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_replaced(&self) {
        self.sessions_replaced.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.rejected_schedules.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of sessions created.
    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::Relaxed)
    }

    /// Returns the number of sessions closed for inactivity.
    pub fn sessions_evicted(&self) -> u64 {
        self.sessions_evicted.load(Ordering::Relaxed)
    }

    /// Returns the number of broken or retired sessions replaced.
    pub fn sessions_replaced(&self) -> u64 {
        self.sessions_replaced.load(Ordering::Relaxed)
    }

    /// Returns the number of rejected schedule attempts.
    pub fn rejected_schedules(&self) -> u64 {
        self.rejected_schedules.load(Ordering::Relaxed)
    }
}

// =============================================================================
// SessionPool
// =============================================================================

/// Pool of client sessions.
///
/// At most one session exists per [`EndpointKey`] at a time.
pub struct SessionPool {
    sessions: DashMap<EndpointKey, Arc<ClientSession>>,
    session_config: SessionConfig,
    pool_config: PoolConfig,
    connector: Arc<dyn SessionConnector>,
    certificates: Arc<dyn CertificateProvider>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stats: PoolStats,
}

impl SessionPool {
    /// Creates a pool and starts the eviction sweeper.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(
        session_config: SessionConfig,
        pool_config: PoolConfig,
        connector: Arc<dyn SessionConnector>,
        certificates: Arc<dyn CertificateProvider>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            sessions: DashMap::new(),
            session_config,
            pool_config,
            connector,
            certificates,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
            stats: PoolStats::new(),
        });

        let sweeper = tokio::spawn(Self::sweep(
            Arc::downgrade(&pool),
            pool.shutdown.child_token(),
            pool.pool_config.eviction_interval,
        ));
        *pool.sweeper.lock() = Some(sweeper);

        tracing::info!(
            eviction_interval_ms = pool.pool_config.eviction_interval.as_millis() as u64,
            session_timeout_ms = pool.session_config.session_timeout.as_millis() as u64,
            "Session pool started"
        );
        pool
    }

    async fn sweep(pool: Weak<Self>, shutdown: CancellationToken, period: std::time::Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(pool) = pool.upgrade() else {
                        break;
                    };
                    let evicted = pool.evict_inactive().await;
                    if evicted > 0 {
                        tracing::debug!(evicted = evicted, remaining = pool.len(), "Pool sweep");
                    }
                }
            }
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Runs a service call on the pooled session for `connection`.
    ///
    /// A session that rejects the call is removed and replaced, and the call
    /// is offered to the replacement. The result of a scheduled call is
    /// returned as-is.
    pub async fn execute<T, F, Fut>(
        &self,
        connection: &ConnectionModel,
        options: CallOptions,
        call: F,
    ) -> OpcUaResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn UaTransport>) -> Fut + Send + 'static,
        Fut: Future<Output = OpcUaResult<T>> + Send + 'static,
    {
        let key = EndpointKey::from(connection);
        let mut call = call;

        loop {
            if options.cancel.is_cancelled() {
                return Err(OpcUaError::cancelled(options.operation));
            }
            self.ensure_running()?;

            let session = self.entry(&key, connection);
            match session.try_schedule_service_call(options.clone(), call) {
                ScheduleOutcome::Scheduled(handle) => return handle.await,
                ScheduleOutcome::Rejected(returned) => {
                    call = returned;
                    self.stats.record_rejected();
                    tracing::debug!(
                        session_id = session.id(),
                        endpoint = %key,
                        operation = options.operation,
                        "Session rejected call, replacing"
                    );
                    self.discard(&key, &session);
                }
            }
        }
    }

    /// Returns a usable session for `connection`, creating one if needed.
    pub fn get_or_create_session(
        &self,
        connection: &ConnectionModel,
    ) -> OpcUaResult<Arc<ClientSession>> {
        let key = EndpointKey::from(connection);
        loop {
            self.ensure_running()?;
            let session = self.entry(&key, connection);
            if session.is_usable() {
                return Ok(session);
            }
            self.discard(&key, &session);
        }
    }

    /// Returns the pooled session for `key`, if any.
    pub fn session(&self, key: &EndpointKey) -> Option<Arc<ClientSession>> {
        self.sessions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn entry(&self, key: &EndpointKey, connection: &ConnectionModel) -> Arc<ClientSession> {
        if let Some(existing) = self.sessions.get(key) {
            return Arc::clone(existing.value());
        }

        let entry = self.sessions.entry(key.clone()).or_insert_with(|| {
            self.stats.record_created();
            Arc::new(ClientSession::new(
                connection.clone(),
                self.session_config.clone(),
                Arc::clone(&self.connector),
                Arc::clone(&self.certificates),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Removes `session` if it still owns `key` and closes it in the background.
    fn discard(&self, key: &EndpointKey, session: &Arc<ClientSession>) {
        let removed = self
            .sessions
            .remove_if(key, |_, current| Arc::ptr_eq(current, session));
        if let Some((_, session)) = removed {
            self.stats.record_replaced();
            tokio::spawn(async move { session.close().await });
        }
    }

    fn ensure_running(&self) -> OpcUaResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(OpcUaError::session(SessionError::PoolShutdown));
        }
        Ok(())
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Closes and removes every inactive session. Returns how many.
    pub async fn evict_inactive(&self) -> usize {
        let retired: Vec<(EndpointKey, Arc<ClientSession>)> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().try_retire_if_inactive())
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut evicted = 0;
        for (key, session) in retired {
            if self.evict(&key, &session).await {
                evicted += 1;
            }
        }
        evicted
    }

    /// Closes and removes the session for `key` if it is inactive.
    pub async fn evict_if_inactive(&self, key: &EndpointKey) -> bool {
        let Some(session) = self.session(key) else {
            return false;
        };
        if !session.try_retire_if_inactive() {
            return false;
        }
        self.evict(key, &session).await
    }

    async fn evict(&self, key: &EndpointKey, session: &Arc<ClientSession>) -> bool {
        let removed = self
            .sessions
            .remove_if(key, |_, current| Arc::ptr_eq(current, session));
        let Some((_, session)) = removed else {
            return false;
        };

        session.close().await;
        self.stats.record_evicted();
        tracing::info!(
            session_id = session.id(),
            endpoint = %key,
            "Evicted inactive session"
        );
        true
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Connection retries of the pooled session for `connection`.
    pub fn number_of_connection_retries(&self, connection: &ConnectionModel) -> u32 {
        self.session(&EndpointKey::from(connection))
            .map(|session| session.number_of_connection_retries())
            .unwrap_or(0)
    }

    /// Returns `true` if the pooled session for `connection` is connected.
    pub fn is_connection_ok(&self, connection: &ConnectionModel) -> bool {
        self.session(&EndpointKey::from(connection))
            .is_some_and(|session| session.state().is_ready())
    }

    /// Returns all pooled keys.
    pub fn keys(&self) -> Vec<EndpointKey> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Returns the number of pooled sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if no sessions are pooled.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Pool statistics.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stops the sweeper and closes every session.
    ///
    /// Later calls to [`execute`](Self::execute) fail with
    /// [`SessionError::PoolShutdown`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            if let Err(error) = sweeper.await {
                tracing::warn!(error = %error, "Pool sweeper ended abnormally");
            }
        }

        let keys = self.keys();
        for key in keys {
            if let Some((_, session)) = self.sessions.remove(&key) {
                session.close().await;
            }
        }

        tracing::info!("Session pool shut down");
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("sessions", &self.sessions.len())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}
