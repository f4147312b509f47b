// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Pooled client session and its service-call scheduler.
//!
//! A [`ClientSession`] owns one connection to one endpoint and a priority
//! queue of service calls. A single processor task connects lazily, runs the
//! calls one at a time and keeps the connection alive while idle.
//!
//! # Call lifecycle
//!
//! ```text
//! try_schedule_service_call ──► queue (priority, FIFO) ──► processor
//!        pending += 1                                        │
//!                                                            ▼
//!                                  connect ─► identity ─► call (timeout, cancel)
//!                                                            │
//!                              pending -= 1, last_activity ◄─┘
//! ```
//!
//! A failure the call's exception handler rejects marks the session broken.
//! Broken or closing sessions reject new calls, which tells the pool to
//! replace them.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::certificate::{thumbprint, CertificateProvider};
use crate::client::transport::{
    ConnectRequest, ConnectedTransport, ConnectivityState, SessionConnector, UaTransport,
};
use crate::config::SessionConfig;
use crate::error::{OpcUaError, OpcUaResult, SecurityError, SessionError, TimeoutError};
use crate::types::{ConnectionModel, Credential, EndpointKey};

/// Boxed future used at the type-erased call boundary.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Decides whether a failed call leaves the session usable.
///
/// Returning `true` keeps the session; `false` marks it broken.
pub type ExceptionHandler = Arc<dyn Fn(&OpcUaError) -> bool + Send + Sync>;

/// Handler that keeps the session unless the error is session fatal.
pub fn default_exception_handler() -> ExceptionHandler {
    Arc::new(|error: &OpcUaError| !error.is_session_fatal())
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// CallOptions
// =============================================================================

/// Per-call scheduling options.
#[derive(Clone)]
pub struct CallOptions {
    /// Operation name used in errors and logs.
    pub operation: &'static str,

    /// Higher runs first; equal priorities run in submission order.
    pub priority: i32,

    /// Deadline for the call itself; the session default when `None`.
    pub timeout: Option<Duration>,

    /// Identity to run the call under instead of the connection's own.
    pub elevation: Option<Credential>,

    /// Caller cancellation.
    pub cancel: CancellationToken,

    /// Failure classification.
    pub exception_handler: ExceptionHandler,
}

impl CallOptions {
    /// Creates options with default priority, timeout and handler.
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            priority: 0,
            timeout: None,
            elevation: None,
            cancel: CancellationToken::new(),
            exception_handler: default_exception_handler(),
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Runs the call under an elevated identity.
    pub fn with_elevation(mut self, credential: Credential) -> Self {
        self.elevation = Some(credential);
        self
    }

    /// Sets the cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the exception handler.
    pub fn with_exception_handler(mut self, handler: ExceptionHandler) -> Self {
        self.exception_handler = handler;
        self
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("operation", &self.operation)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("elevated", &self.elevation.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Queued Calls
// =============================================================================

/// Queue order: priority descending, then sequence ascending.
type QueueKey = (Reverse<i32>, u64);

type ErasedCall<T> =
    Box<dyn FnOnce(Arc<dyn UaTransport>) -> BoxFuture<'static, OpcUaResult<T>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallOutcome {
    Succeeded,
    Failed { fatal: bool },
    TimedOut { fatal: bool },
    Cancelled,
}

impl CallOutcome {
    fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Failed { fatal: true } | Self::TimedOut { fatal: true }
        )
    }
}

/// A finished call whose result is handed over only after bookkeeping.
struct Completion {
    outcome: CallOutcome,
    deliver: Box<dyn FnOnce() + Send>,
}

trait PendingCall: Send {
    fn operation(&self) -> &'static str;

    fn elevation(&self) -> Option<&Credential>;

    fn is_cancelled(&self) -> bool;

    fn cancel_token(&self) -> CancellationToken;

    fn run(self: Box<Self>, transport: Arc<dyn UaTransport>) -> BoxFuture<'static, Completion>;

    fn fail(self: Box<Self>, error: OpcUaError) -> Completion;
}

struct TypedCall<T> {
    call: ErasedCall<T>,
    options: CallOptions,
    timeout: Duration,
    reply: oneshot::Sender<OpcUaResult<T>>,
}

impl<T: Send + 'static> TypedCall<T> {
    fn complete(
        options: &CallOptions,
        reply: oneshot::Sender<OpcUaResult<T>>,
        result: OpcUaResult<T>,
    ) -> Completion {
        let outcome = match &result {
            Ok(_) => CallOutcome::Succeeded,
            Err(e) if e.is_cancelled() => CallOutcome::Cancelled,
            Err(e) => {
                let fatal = !(options.exception_handler)(e);
                if e.is_timeout() {
                    CallOutcome::TimedOut { fatal }
                } else {
                    CallOutcome::Failed { fatal }
                }
            }
        };

        Completion {
            outcome,
            deliver: Box::new(move || {
                // The caller may have stopped waiting.
                let _ = reply.send(result);
            }),
        }
    }
}

impl<T: Send + 'static> PendingCall for TypedCall<T> {
    fn operation(&self) -> &'static str {
        self.options.operation
    }

    fn elevation(&self) -> Option<&Credential> {
        self.options.elevation.as_ref()
    }

    fn is_cancelled(&self) -> bool {
        self.options.cancel.is_cancelled()
    }

    fn cancel_token(&self) -> CancellationToken {
        self.options.cancel.clone()
    }

    fn run(self: Box<Self>, transport: Arc<dyn UaTransport>) -> BoxFuture<'static, Completion> {
        Box::pin(async move {
            let TypedCall {
                call,
                options,
                timeout,
                reply,
            } = *self;

            let result = tokio::select! {
                biased;
                _ = options.cancel.cancelled() => Err(OpcUaError::cancelled(options.operation)),
                result = tokio::time::timeout(timeout, call(transport)) => match result {
                    Ok(result) => result,
                    Err(_) => Err(OpcUaError::operation_timeout(options.operation, timeout)),
                },
            };

            Self::complete(&options, reply, result)
        })
    }

    fn fail(self: Box<Self>, error: OpcUaError) -> Completion {
        let TypedCall { options, reply, .. } = *self;
        Self::complete(&options, reply, Err(error))
    }
}

#[derive(Default)]
struct CallQueue {
    calls: BTreeMap<QueueKey, Box<dyn PendingCall>>,
    next_seq: u64,
    pending: usize,
    last_activity: Option<Instant>,
    retired: bool,
}

impl CallQueue {
    fn touch(&mut self) {
        self.last_activity = Some(Instant::now());
    }

    fn idle_for(&self, now: Instant) -> Duration {
        self.last_activity
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default()
    }
}

// =============================================================================
// ScheduleOutcome / ServiceCall
// =============================================================================

/// Result of trying to schedule a call.
pub enum ScheduleOutcome<T, F> {
    /// The session accepted the call.
    Scheduled(ServiceCall<T>),

    /// The session is broken or closing; the call is handed back untouched.
    Rejected(F),
}

impl<T, F> ScheduleOutcome<T, F> {
    /// Returns `true` if the call was accepted.
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled(_))
    }
}

impl<T, F> fmt::Debug for ScheduleOutcome<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled(_) => f.write_str("Scheduled"),
            Self::Rejected(_) => f.write_str("Rejected"),
        }
    }
}

/// Handle to a scheduled call. Await it for the result.
///
/// Cancelling the call's token withdraws it if it has not started yet;
/// a running call observes the token itself.
pub struct ServiceCall<T> {
    receiver: oneshot::Receiver<OpcUaResult<T>>,
    cancel: CancellationToken,
    session: Weak<SessionShared>,
    key: QueueKey,
    operation: &'static str,
}

impl<T> fmt::Debug for ServiceCall<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCall")
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> IntoFuture for ServiceCall<T> {
    type Output = OpcUaResult<T>;
    type IntoFuture = BoxFuture<'static, OpcUaResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let ServiceCall {
                mut receiver,
                cancel,
                session,
                key,
                operation,
            } = self;

            tokio::select! {
                result = &mut receiver => {
                    result.unwrap_or_else(|_| Err(OpcUaError::session_closed()))
                }
                _ = cancel.cancelled() => {
                    let withdrawn = session
                        .upgrade()
                        .is_some_and(|shared| shared.withdraw(key));
                    if withdrawn {
                        Err(OpcUaError::cancelled(operation))
                    } else {
                        receiver
                            .await
                            .unwrap_or_else(|_| Err(OpcUaError::cancelled(operation)))
                    }
                }
            }
        })
    }
}

// =============================================================================
// SessionStats
// =============================================================================

/// Statistics for one session.
#[derive(Debug, Default)]
pub struct SessionStats {
    calls_scheduled: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
    calls_timed_out: AtomicU64,
    calls_cancelled: AtomicU64,
    connects: AtomicU64,
    activations: AtomicU64,
    keep_alives: AtomicU64,
    keep_alive_failures: AtomicU64,
}

impl SessionStats {
    /// Creates new session statistics.
    pub fn new() -> Self {
        Self::default()
    }

    fn record_scheduled(&self) {
        self.calls_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, outcome: CallOutcome) {
        let counter = match outcome {
            CallOutcome::Succeeded => &self.calls_succeeded,
            CallOutcome::Failed { .. } => &self.calls_failed,
            CallOutcome::TimedOut { .. } => &self.calls_timed_out,
            CallOutcome::Cancelled => &self.calls_cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    fn record_activation(&self) {
        self.activations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_keep_alive(&self, ok: bool) {
        self.keep_alives.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.keep_alive_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the number of accepted calls.
    pub fn calls_scheduled(&self) -> u64 {
        self.calls_scheduled.load(Ordering::Relaxed)
    }

    /// Returns the number of successful calls.
    pub fn calls_succeeded(&self) -> u64 {
        self.calls_succeeded.load(Ordering::Relaxed)
    }

    /// Returns the number of failed calls.
    pub fn calls_failed(&self) -> u64 {
        self.calls_failed.load(Ordering::Relaxed)
    }

    /// Returns the number of calls that hit their timeout.
    pub fn calls_timed_out(&self) -> u64 {
        self.calls_timed_out.load(Ordering::Relaxed)
    }

    /// Returns the number of cancelled calls.
    pub fn calls_cancelled(&self) -> u64 {
        self.calls_cancelled.load(Ordering::Relaxed)
    }

    /// Returns the number of successful connects.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Returns the number of identity activations.
    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    /// Returns the number of keep-alives sent.
    pub fn keep_alives(&self) -> u64 {
        self.keep_alives.load(Ordering::Relaxed)
    }

    /// Returns the number of failed keep-alives.
    pub fn keep_alive_failures(&self) -> u64 {
        self.keep_alive_failures.load(Ordering::Relaxed)
    }
}

// =============================================================================
// SessionShared
// =============================================================================

struct SessionShared {
    id: u64,
    key: EndpointKey,
    connection: ConnectionModel,
    config: SessionConfig,
    connector: Arc<dyn SessionConnector>,
    certificates: Arc<dyn CertificateProvider>,
    queue: Mutex<CallQueue>,
    wakeup: Notify,
    broken: AtomicBool,
    state: watch::Sender<ConnectivityState>,
    connection_retries: AtomicU32,
    shutdown: CancellationToken,
    stats: SessionStats,
}

impl SessionShared {
    fn set_state(&self, state: ConnectivityState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(
                session_id = self.id,
                endpoint = %self.key,
                from = %previous,
                to = %state,
                "Session state changed"
            );
        }
    }

    fn withdraw(&self, key: QueueKey) -> bool {
        let mut queue = self.queue.lock();
        if queue.calls.remove(&key).is_none() {
            return false;
        }
        queue.pending = queue.pending.saturating_sub(1);
        queue.touch();
        drop(queue);

        self.stats.record_outcome(CallOutcome::Cancelled);
        true
    }

    fn pop(&self) -> Option<Box<dyn PendingCall>> {
        self.queue.lock().calls.pop_first().map(|(_, call)| call)
    }

    fn finish(&self, completion: Completion) {
        {
            let mut queue = self.queue.lock();
            queue.pending = queue.pending.saturating_sub(1);
            queue.touch();
        }
        self.stats.record_outcome(completion.outcome);

        if completion.outcome.is_fatal() {
            self.mark_broken();
        }

        (completion.deliver)();
    }

    fn finish_aborted(&self) {
        let mut queue = self.queue.lock();
        queue.pending = queue.pending.saturating_sub(1);
        queue.touch();
    }

    fn mark_broken(&self) {
        if self.broken.swap(true, Ordering::AcqRel) || self.shutdown.is_cancelled() {
            return;
        }
        tracing::warn!(
            session_id = self.id,
            endpoint = %self.key,
            "Session marked broken"
        );
        if !self.state.borrow().is_failed() {
            self.set_state(ConnectivityState::Error);
        }
    }

    async fn connect_request(&self) -> OpcUaResult<ConnectRequest> {
        let client_certificate = if self.connection.endpoint.security_mode.requires_certificate() {
            Some(self.certificates.get_or_create_client_certificate().await?)
        } else {
            None
        };

        Ok(ConnectRequest {
            connection: self.connection.clone(),
            client_certificate,
            session_timeout: self.config.session_timeout,
            session_name: format!("trap-opcua-client-{}", self.id),
        })
    }

    async fn verify_server_certificate(&self, connected: &ConnectedTransport) -> OpcUaResult<()> {
        if !self.connection.endpoint.security_mode.requires_certificate() {
            return Ok(());
        }
        let Some(certificate) = connected.server_certificate.as_deref() else {
            return Ok(());
        };

        if self.certificates.is_trusted_peer(certificate).await? {
            return Ok(());
        }

        if self.config.auto_accept_untrusted_certificates {
            tracing::warn!(
                session_id = self.id,
                endpoint = %self.key,
                thumbprint = %thumbprint(certificate),
                "Auto-accepting untrusted server certificate"
            );
            return self.certificates.add_trusted_peer(certificate).await;
        }

        Err(OpcUaError::security(SecurityError::certificate_not_trusted(
            self.key.url(),
        )))
    }
}

// =============================================================================
// Processor
// =============================================================================

struct ActiveConnection {
    transport: Arc<dyn UaTransport>,
    identity: Credential,
}

enum Idle {
    Shutdown,
    Wake,
    KeepAlive,
}

/// Single consumer of the call queue. Owns the connection.
struct Processor {
    shared: Arc<SessionShared>,
    active: Option<ActiveConnection>,
}

impl Processor {
    async fn run(mut self) {
        let shared = Arc::clone(&self.shared);

        while !shared.shutdown.is_cancelled() {
            if let Some(call) = shared.pop() {
                self.dispatch(call).await;
                continue;
            }

            let idle = tokio::select! {
                _ = shared.shutdown.cancelled() => Idle::Shutdown,
                _ = shared.wakeup.notified() => Idle::Wake,
                _ = tokio::time::sleep(shared.config.keep_alive_interval), if self.active.is_some() => {
                    Idle::KeepAlive
                }
            };

            match idle {
                Idle::Shutdown => break,
                Idle::Wake => {}
                Idle::KeepAlive => self.keep_alive().await,
            }
        }

        self.drain().await;
    }

    async fn dispatch(&mut self, call: Box<dyn PendingCall>) {
        let shared = Arc::clone(&self.shared);

        if call.is_cancelled() {
            let operation = call.operation();
            shared.finish(call.fail(OpcUaError::cancelled(operation)));
            return;
        }

        // Connecting can take several attempts; the caller may give up meanwhile.
        let operation = call.operation();
        let cancel = call.cancel_token();
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.ensure_connected() => Some(result),
        };
        let transport = match connected {
            Some(Ok(transport)) => transport,
            Some(Err(error)) => {
                shared.finish(call.fail(error));
                return;
            }
            None => {
                if self.active.is_none() && shared.state.borrow().is_transitioning() {
                    shared.set_state(ConnectivityState::Disconnected);
                }
                tracing::debug!(
                    session_id = shared.id,
                    operation = operation,
                    "Call cancelled while connecting"
                );
                shared.finish(call.fail(OpcUaError::cancelled(operation)));
                return;
            }
        };

        let identity = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OpcUaError::cancelled(operation)),
            result = self.ensure_identity(call.elevation()) => result,
        };
        if let Err(error) = identity {
            shared.finish(call.fail(error));
            return;
        }

        let completion = tokio::select! {
            completion = call.run(transport) => Some(completion),
            _ = shared.shutdown.cancelled() => None,
        };

        match completion {
            Some(completion) => shared.finish(completion),
            None => shared.finish_aborted(),
        }
    }

    async fn ensure_connected(&mut self) -> OpcUaResult<Arc<dyn UaTransport>> {
        if let Some(active) = &self.active {
            return Ok(Arc::clone(&active.transport));
        }

        let shared = Arc::clone(&self.shared);
        shared.set_state(ConnectivityState::Connecting);

        let request = match shared.connect_request().await {
            Ok(request) => request,
            Err(error) => {
                shared.set_state(ConnectivityState::Error);
                return Err(error);
            }
        };

        let connect_timeout = shared.config.operation_timeout;
        let result = shared
            .config
            .reconnect
            .run(&shared.shutdown, |attempt| {
                if attempt > 0 {
                    shared.connection_retries.fetch_add(1, Ordering::Relaxed);
                }
                let connect = shared.connector.connect(&request);
                async move {
                    tokio::time::timeout(connect_timeout, connect)
                        .await
                        .unwrap_or_else(|_| {
                            Err(OpcUaError::timeout(TimeoutError::connection(connect_timeout)))
                        })
                }
            })
            .await;

        let connected = match result {
            Ok(connected) => connected,
            Err((error, attempts)) => {
                tracing::warn!(
                    session_id = shared.id,
                    endpoint = %shared.key,
                    attempts = attempts,
                    error = %error,
                    "Failed to connect session"
                );
                shared.set_state(match &error {
                    OpcUaError::Security(_) => ConnectivityState::NoTrust,
                    _ => ConnectivityState::NotReachable,
                });
                return Err(error);
            }
        };

        if let Err(error) = shared.verify_server_certificate(&connected).await {
            tracing::warn!(
                session_id = shared.id,
                endpoint = %shared.key,
                error = %error,
                "Server certificate rejected"
            );
            if let Err(close_error) = connected.transport.close().await {
                tracing::debug!(error = %close_error, "Failed to close rejected transport");
            }
            shared.set_state(ConnectivityState::NoTrust);
            return Err(error);
        }

        shared.stats.record_connect();
        shared.set_state(ConnectivityState::Ready);
        tracing::info!(
            session_id = shared.id,
            endpoint = %shared.key,
            "Session connected"
        );

        let transport = Arc::clone(&connected.transport);
        self.active = Some(ActiveConnection {
            transport: connected.transport,
            identity: shared.connection.credential_or_anonymous(),
        });
        Ok(transport)
    }

    async fn ensure_identity(&mut self, elevation: Option<&Credential>) -> OpcUaResult<()> {
        let desired = elevation
            .cloned()
            .unwrap_or_else(|| self.shared.connection.credential_or_anonymous());
        let Some(active) = self.active.as_mut() else {
            return Err(OpcUaError::not_connected());
        };
        if active.identity == desired {
            return Ok(());
        }

        active
            .transport
            .activate_identity(&desired)
            .await
            .map_err(|e| OpcUaError::session(SessionError::activation_failed(e.to_string())))?;

        tracing::debug!(
            session_id = self.shared.id,
            credential_type = ?desired.credential_type(),
            "Session identity activated"
        );
        active.identity = desired;
        self.shared.stats.record_activation();
        Ok(())
    }

    async fn keep_alive(&mut self) {
        let result = match &self.active {
            Some(active) => active.transport.keep_alive().await,
            None => return,
        };

        match result {
            Ok(()) => self.shared.stats.record_keep_alive(true),
            Err(error) => {
                self.shared.stats.record_keep_alive(false);
                let retries = self.shared.connection_retries.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    session_id = self.shared.id,
                    endpoint = %self.shared.key,
                    connection_retries = retries,
                    error = %error,
                    "Keep-alive failed, dropping connection"
                );
                if let Some(active) = self.active.take() {
                    if let Err(close_error) = active.transport.close().await {
                        tracing::debug!(error = %close_error, "Failed to close stale transport");
                    }
                }
                self.shared.set_state(ConnectivityState::NotReachable);
            }
        }
    }

    async fn drain(mut self) {
        let remaining: Vec<_> = {
            let mut queue = self.shared.queue.lock();
            queue.retired = true;
            std::mem::take(&mut queue.calls).into_values().collect()
        };

        for call in remaining {
            self.shared.finish(call.fail(OpcUaError::session_closed()));
        }

        if let Some(active) = self.active.take() {
            if let Err(error) = active.transport.close().await {
                tracing::debug!(
                    session_id = self.shared.id,
                    error = %error,
                    "Failed to close transport"
                );
            }
        }

        self.shared.set_state(ConnectivityState::Closed);
        tracing::debug!(session_id = self.shared.id, "Session processor stopped");
    }
}

// =============================================================================
// ClientSession
// =============================================================================

/// A pooled session to one endpoint.
pub struct ClientSession {
    shared: Arc<SessionShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    /// Creates a session and starts its processor task.
    ///
    /// Nothing is opened until the first call. Must be called within a
    /// Tokio runtime.
    pub fn new(
        connection: ConnectionModel,
        config: SessionConfig,
        connector: Arc<dyn SessionConnector>,
        certificates: Arc<dyn CertificateProvider>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Disconnected);
        let shared = Arc::new(SessionShared {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            key: EndpointKey::from(&connection),
            connection,
            config,
            connector,
            certificates,
            queue: Mutex::new(CallQueue {
                last_activity: Some(Instant::now()),
                ..CallQueue::default()
            }),
            wakeup: Notify::new(),
            broken: AtomicBool::new(false),
            state,
            connection_retries: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
            stats: SessionStats::new(),
        });

        tracing::debug!(session_id = shared.id, endpoint = %shared.key, "Session created");

        let processor = Processor {
            shared: Arc::clone(&shared),
            active: None,
        };
        let worker = tokio::spawn(processor.run());

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Queues a service call.
    ///
    /// Returns [`ScheduleOutcome::Rejected`] with the call untouched if the
    /// session is broken, retired or closing.
    pub fn try_schedule_service_call<T, F, Fut>(
        &self,
        options: CallOptions,
        call: F,
    ) -> ScheduleOutcome<T, F>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn UaTransport>) -> Fut + Send + 'static,
        Fut: Future<Output = OpcUaResult<T>> + Send + 'static,
    {
        let shared = &self.shared;
        let mut queue = shared.queue.lock();
        if queue.retired || shared.broken.load(Ordering::Acquire) || shared.shutdown.is_cancelled()
        {
            return ScheduleOutcome::Rejected(call);
        }

        let key = (Reverse(options.priority), queue.next_seq);
        queue.next_seq += 1;
        queue.pending += 1;
        queue.touch();

        let (reply, receiver) = oneshot::channel();
        let cancel = options.cancel.clone();
        let operation = options.operation;
        let erased: ErasedCall<T> =
            Box::new(move |transport| -> BoxFuture<'static, OpcUaResult<T>> {
                Box::pin(call(transport))
            });
        queue.calls.insert(
            key,
            Box::new(TypedCall {
                call: erased,
                timeout: options.timeout.unwrap_or(shared.config.operation_timeout),
                options,
                reply,
            }),
        );
        drop(queue);

        shared.stats.record_scheduled();
        shared.wakeup.notify_one();

        ScheduleOutcome::Scheduled(ServiceCall {
            receiver,
            cancel,
            session: Arc::downgrade(shared),
            key,
            operation,
        })
    }

    /// Schedules a call and awaits it, mapping rejection to an error.
    pub async fn call<T, F, Fut>(&self, options: CallOptions, call: F) -> OpcUaResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn UaTransport>) -> Fut + Send + 'static,
        Fut: Future<Output = OpcUaResult<T>> + Send + 'static,
    {
        match self.try_schedule_service_call(options, call) {
            ScheduleOutcome::Scheduled(handle) => handle.await,
            ScheduleOutcome::Rejected(_) if self.is_broken() => {
                Err(OpcUaError::session(SessionError::Broken {
                    session_id: self.id(),
                }))
            }
            ScheduleOutcome::Rejected(_) => Err(OpcUaError::session_closed()),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Returns `true` if no call is pending and the session has been idle
    /// longer than the session timeout.
    pub fn is_inactive(&self) -> bool {
        let queue = self.shared.queue.lock();
        queue.pending == 0 && queue.idle_for(Instant::now()) > self.shared.config.session_timeout
    }

    /// Retires the session if it is inactive.
    ///
    /// The check and the retire happen under the queue lock, so a call
    /// scheduled concurrently either lands before (and keeps the session) or
    /// is rejected.
    pub fn try_retire_if_inactive(&self) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.retired {
            return true;
        }
        if queue.pending == 0 && queue.idle_for(Instant::now()) > self.shared.config.session_timeout
        {
            queue.retired = true;
            return true;
        }
        false
    }

    /// Stops the processor, fails queued calls and closes the transport.
    ///
    /// Idempotent.
    pub async fn close(&self) {
        self.shared.queue.lock().retired = true;
        self.shared.shutdown.cancel();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(error) = worker.await {
                tracing::warn!(
                    session_id = self.shared.id,
                    error = %error,
                    "Session processor ended abnormally"
                );
            }
            tracing::debug!(session_id = self.shared.id, endpoint = %self.shared.key, "Session closed");
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Process-unique session id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Pool key of the session.
    pub fn endpoint_key(&self) -> &EndpointKey {
        &self.shared.key
    }

    /// Connection the session was created for.
    pub fn connection(&self) -> &ConnectionModel {
        &self.shared.connection
    }

    /// Current connectivity.
    pub fn state(&self) -> ConnectivityState {
        *self.shared.state.borrow()
    }

    /// Watches connectivity changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.shared.state.subscribe()
    }

    /// Calls queued or running.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().pending
    }

    /// Time of the last schedule or completion.
    pub fn last_activity(&self) -> Option<Instant> {
        self.shared.queue.lock().last_activity
    }

    /// Returns `true` once a fatal error was seen.
    pub fn is_broken(&self) -> bool {
        self.shared.broken.load(Ordering::Acquire)
    }

    /// Returns `true` if new calls would be accepted.
    pub fn is_usable(&self) -> bool {
        !self.is_broken() && !self.shared.shutdown.is_cancelled() && !self.shared.queue.lock().retired
    }

    /// Reconnects and failed keep-alives since creation.
    pub fn number_of_connection_retries(&self) -> u32 {
        self.shared.connection_retries.load(Ordering::Relaxed)
    }

    /// Session statistics.
    pub fn stats(&self) -> &SessionStats {
        &self.shared.stats
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.shared.id)
            .field("endpoint", &self.shared.key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================
