// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Error types for the OPC UA client engine.
//!
//! Every public operation returns [`OpcUaResult`]. Errors are grouped by the
//! component that produced them, and each group knows whether it is worth
//! retrying and whether it should condemn the session that produced it.
//!
//! # Error Categories
//!
//! ```text
//! OpcUaError
//! ├── Connection    - Transport and endpoint issues
//! ├── Session       - Session lifecycle and pool errors
//! ├── Security      - Certificate trust and authentication
//! ├── Discovery     - Discovery crawl failures
//! ├── Subscription  - Subscription and monitored item errors
//! ├── Configuration - Invalid settings or identifiers
//! ├── Timeout       - Operation deadlines
//! └── Cancelled     - Caller-requested cancellation
//! ```
//!
//! # Examples
//!
//! ```
//! use trap_opcua_client::error::{OpcUaError, ConnectionError};
//!
//! let error = OpcUaError::connection(ConnectionError::refused("opc.tcp://plc1:4840"));
//!
//! assert!(error.is_retryable());
//! assert!(error.is_session_fatal());
//! assert_eq!(error.error_code().to_string(), "UA-0101");
//! ```

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

// =============================================================================
// OpcUaError - Main Error Type
// =============================================================================

/// The main error type for the OPC UA client engine.
#[derive(Debug, Error)]
pub enum OpcUaError {
    /// Connection-related errors.
    #[error("{0}")]
    Connection(#[from] ConnectionError),

    /// Session lifecycle errors.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Security and authentication errors.
    #[error("{0}")]
    Security(#[from] SecurityError),

    /// Discovery errors.
    #[error("{0}")]
    Discovery(#[from] DiscoveryError),

    /// Subscription and monitoring errors.
    #[error("{0}")]
    Subscription(#[from] SubscriptionError),

    /// Configuration errors.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// Timeout errors.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),

    /// The operation was cancelled by the caller.
    #[error("Operation '{operation}' was cancelled")]
    Cancelled {
        /// Name of the cancelled operation.
        operation: String,
    },
}

impl OpcUaError {
    // =========================================================================
    // Factory Methods
    // =========================================================================

    /// Creates a connection error.
    #[inline]
    pub fn connection(error: ConnectionError) -> Self {
        Self::Connection(error)
    }

    /// Creates a session error.
    #[inline]
    pub fn session(error: SessionError) -> Self {
        Self::Session(error)
    }

    /// Creates a security error.
    #[inline]
    pub fn security(error: SecurityError) -> Self {
        Self::Security(error)
    }

    /// Creates a discovery error.
    #[inline]
    pub fn discovery(error: DiscoveryError) -> Self {
        Self::Discovery(error)
    }

    /// Creates a subscription error.
    #[inline]
    pub fn subscription(error: SubscriptionError) -> Self {
        Self::Subscription(error)
    }

    /// Creates a configuration error.
    #[inline]
    pub fn configuration(error: ConfigurationError) -> Self {
        Self::Configuration(error)
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(error: TimeoutError) -> Self {
        Self::Timeout(error)
    }

    /// Creates a cancellation outcome for the named operation.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    // =========================================================================
    // Convenience Factory Methods
    // =========================================================================

    /// Creates a not connected error.
    pub fn not_connected() -> Self {
        Self::Connection(ConnectionError::NotConnected)
    }

    /// Creates a transport failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Connection(ConnectionError::transport(message))
    }

    /// Creates an operation timeout.
    pub fn operation_timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout(TimeoutError::operation(operation, duration))
    }

    /// Creates a session closed error.
    pub fn session_closed() -> Self {
        Self::Session(SessionError::Closed)
    }

    /// Creates a subscription closed error.
    pub fn subscription_closed(id: impl Into<String>) -> Self {
        Self::Subscription(SubscriptionError::closed(id))
    }

    // =========================================================================
    // Error Properties
    // =========================================================================

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_retryable(),
            Self::Session(e) => e.is_retryable(),
            Self::Security(e) => e.is_retryable(),
            Self::Discovery(e) => e.is_retryable(),
            Self::Subscription(e) => e.is_retryable(),
            Self::Timeout(_) => true,
            Self::Configuration(_) | Self::Cancelled { .. } => false,
        }
    }

    /// Returns `true` if the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns `true` if the operation ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns `true` if a session that produced this error can no longer be
    /// used and must be replaced.
    ///
    /// Timeouts, cancellations and per-request faults leave the session usable.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Security(_) => true,
            Self::Session(e) => e.is_fatal(),
            Self::Discovery(_)
            | Self::Subscription(_)
            | Self::Configuration(_)
            | Self::Timeout(_)
            | Self::Cancelled { .. } => false,
        }
    }

    /// Returns the severity level of this error.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Connection(e) => e.severity(),
            Self::Session(e) => e.severity(),
            Self::Security(_) => ErrorSeverity::Error,
            Self::Discovery(_) => ErrorSeverity::Warning,
            Self::Subscription(e) => e.severity(),
            Self::Timeout(_) => ErrorSeverity::Warning,
            Self::Configuration(_) => ErrorSeverity::Critical,
            Self::Cancelled { .. } => ErrorSeverity::Info,
        }
    }

    /// Short category name used as a log field.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Session(_) => "session",
            Self::Security(_) => "security",
            Self::Discovery(_) => "discovery",
            Self::Subscription(_) => "subscription",
            Self::Configuration(_) => "configuration",
            Self::Timeout(_) => "timeout",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Returns a unique error code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Connection(e) => e.error_code(),
            Self::Session(e) => e.error_code(),
            Self::Security(e) => e.error_code(),
            Self::Discovery(e) => e.error_code(),
            Self::Subscription(e) => e.error_code(),
            Self::Configuration(e) => e.error_code(),
            Self::Timeout(e) => e.error_code(),
            Self::Cancelled { .. } => ErrorCode::new(8, 1),
        }
    }

    /// Logs this error at the level matching its severity.
    pub fn log(&self, context: &str) {
        let code = self.error_code();
        let category = self.category();
        match self.severity().to_tracing_level() {
            Level::ERROR => {
                tracing::error!(error_code = %code, category, context, "{self}")
            }
            Level::WARN => tracing::warn!(error_code = %code, category, context, "{self}"),
            _ => tracing::debug!(error_code = %code, category, context, "{self}"),
        }
    }
}

// =============================================================================
// ConnectionError
// =============================================================================

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connection refused.
    #[error("Connection refused to '{endpoint}'")]
    Refused {
        /// Target endpoint.
        endpoint: String,
    },

    /// Not connected.
    #[error("Not connected to OPC UA server")]
    NotConnected,

    /// Failure reported by the transport library.
    #[error("Transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
    },
}

impl ConnectionError {
    /// Creates a connection refused error.
    pub fn refused(endpoint: impl Into<String>) -> Self {
        Self::Refused {
            endpoint: endpoint.into(),
        }
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// The next attempt reconnects, so every transport failure is retryable.
    pub fn is_retryable(&self) -> bool {
        true
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::NotConnected => ErrorSeverity::Warning,
            Self::Refused { .. } | Self::Transport { .. } => ErrorSeverity::Error,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Refused { .. } => ErrorCode::new(1, 1),
            Self::NotConnected => ErrorCode::new(1, 2),
            Self::Transport { .. } => ErrorCode::new(1, 3),
        }
    }

}

// =============================================================================
// SessionError
// =============================================================================

/// Session lifecycle and pool errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session creation failed.
    #[error("Failed to create session: {message}")]
    CreationFailed {
        /// Error message.
        message: String,
    },

    /// Identity activation failed.
    #[error("Failed to activate session identity: {message}")]
    ActivationFailed {
        /// Error message.
        message: String,
    },

    /// Session was marked broken by a fatal error.
    #[error("Session {session_id} is broken")]
    Broken {
        /// Session id.
        session_id: u64,
    },

    /// Session has been closed.
    #[error("Session closed")]
    Closed,

    /// Session pool has been shut down.
    #[error("Session pool has been shut down")]
    PoolShutdown,
}

impl SessionError {
    /// Creates a session creation failed error.
    pub fn creation_failed(message: impl Into<String>) -> Self {
        Self::CreationFailed {
            message: message.into(),
        }
    }

    /// Creates an identity activation failed error.
    pub fn activation_failed(message: impl Into<String>) -> Self {
        Self::ActivationFailed {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::PoolShutdown)
    }

    /// Returns `true` if the session must be replaced.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CreationFailed { .. } | Self::Broken { .. } | Self::Closed
        )
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Closed | Self::Broken { .. } => ErrorSeverity::Warning,
            Self::PoolShutdown => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::CreationFailed { .. } => ErrorCode::new(2, 1),
            Self::ActivationFailed { .. } => ErrorCode::new(2, 2),
            Self::Broken { .. } => ErrorCode::new(2, 3),
            Self::Closed => ErrorCode::new(2, 4),
            Self::PoolShutdown => ErrorCode::new(2, 5),
        }
    }

}

// =============================================================================
// SecurityError
// =============================================================================

/// Certificate trust and authentication errors.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// The server certificate is not trusted.
    #[error("Server certificate for '{endpoint}' is not trusted")]
    CertificateNotTrusted {
        /// Endpoint presenting the certificate.
        endpoint: String,
    },

    /// The certificate could not be used.
    #[error("Invalid certificate: {message}")]
    CertificateInvalid {
        /// Error message.
        message: String,
    },

    /// A secure endpoint was requested but no client certificate exists.
    #[error("No client certificate available")]
    NoClientCertificate,

}

impl SecurityError {
    /// Creates an untrusted certificate error.
    pub fn certificate_not_trusted(endpoint: impl Into<String>) -> Self {
        Self::CertificateNotTrusted {
            endpoint: endpoint.into(),
        }
    }

    /// Creates an invalid certificate error.
    pub fn certificate_invalid(message: impl Into<String>) -> Self {
        Self::CertificateInvalid {
            message: message.into(),
        }
    }

    /// Security errors require operator action.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::CertificateNotTrusted { .. } => ErrorCode::new(3, 1),
            Self::CertificateInvalid { .. } => ErrorCode::new(3, 2),
            Self::NoClientCertificate => ErrorCode::new(3, 3),
        }
    }

}

// =============================================================================
// DiscoveryError
// =============================================================================

/// Discovery crawl errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A discovery hop failed after all attempts.
    #[error("Discovery of '{url}' failed after {attempts} attempt(s): {message}")]
    HopFailed {
        /// Discovery URL.
        url: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last error message.
        message: String,
    },

    /// The discovery URL could not be parsed.
    #[error("Invalid discovery URL '{url}': {reason}")]
    InvalidUrl {
        /// The URL.
        url: String,
        /// Reason.
        reason: String,
    },
}

impl DiscoveryError {
    /// Creates a hop failure.
    pub fn hop_failed(url: impl Into<String>, attempts: u32, message: impl Into<String>) -> Self {
        Self::HopFailed {
            url: url.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::HopFailed { .. })
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::HopFailed { .. } => ErrorCode::new(4, 1),
            Self::InvalidUrl { .. } => ErrorCode::new(4, 2),
        }
    }
}

// =============================================================================
// SubscriptionError
// =============================================================================

/// Subscription and monitored item errors.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The subscription has been closed.
    #[error("Subscription '{id}' is closed")]
    Closed {
        /// Subscription id.
        id: String,
    },

    /// Server-side subscription creation failed.
    #[error("Failed to create subscription: {message}")]
    CreationFailed {
        /// Error message.
        message: String,
    },

    /// A subscription service returned a bad status.
    #[error("Subscription service '{service}' failed: {message}")]
    ServiceFailed {
        /// Service name.
        service: &'static str,
        /// Error message.
        message: String,
    },
}

impl SubscriptionError {
    /// Creates a closed error.
    pub fn closed(id: impl Into<String>) -> Self {
        Self::Closed { id: id.into() }
    }

    /// Creates a creation failed error.
    pub fn creation_failed(message: impl Into<String>) -> Self {
        Self::CreationFailed {
            message: message.into(),
        }
    }

    /// Creates a service failure.
    pub fn service_failed(service: &'static str, message: impl Into<String>) -> Self {
        Self::ServiceFailed {
            service,
            message: message.into(),
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Closed { .. })
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Closed { .. } => ErrorSeverity::Info,
            Self::CreationFailed { .. } | Self::ServiceFailed { .. } => ErrorSeverity::Error,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Closed { .. } => ErrorCode::new(5, 1),
            Self::CreationFailed { .. } => ErrorCode::new(5, 2),
            Self::ServiceFailed { .. } => ErrorCode::new(5, 3),
        }
    }
}

// =============================================================================
// ConfigurationError
// =============================================================================

/// Configuration and identifier errors.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Invalid node id string.
    #[error("Invalid node ID '{node_id}': {reason}")]
    InvalidNodeId {
        /// The node id text.
        node_id: String,
        /// Reason.
        reason: String,
    },

    /// Unknown security mode.
    #[error("Invalid security mode: '{mode}'")]
    InvalidSecurityMode {
        /// The mode text.
        mode: String,
    },

    /// Unknown security policy.
    #[error("Invalid security policy: '{policy}'")]
    InvalidSecurityPolicy {
        /// The policy text.
        policy: String,
    },

    /// A field has an invalid value.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Reason.
        reason: String,
    },

    /// A configuration document failed to parse.
    #[error("Failed to parse {}: {message}", path.as_deref().unwrap_or("configuration"))]
    Parse {
        /// Source path, if loaded from a file.
        path: Option<String>,
        /// Parser message.
        message: String,
        /// Line number when reported by the parser.
        line: Option<usize>,
    },

    /// A configuration file could not be read.
    #[error("Failed to read '{path}': {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A required field is missing.
    #[error("Missing required field: '{field}'")]
    MissingField {
        /// Field name.
        field: String,
    },
}

impl ConfigurationError {
    /// Creates an invalid node id error.
    pub fn invalid_node_id(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidNodeId {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid security mode error.
    pub fn invalid_security_mode(mode: impl Into<String>) -> Self {
        Self::InvalidSecurityMode { mode: mode.into() }
    }

    /// Creates an invalid security policy error.
    pub fn invalid_security_policy(policy: impl Into<String>) -> Self {
        Self::InvalidSecurityPolicy {
            policy: policy.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a parse error.
    pub fn parse(path: Option<String>, message: impl Into<String>, line: Option<usize>) -> Self {
        Self::Parse {
            path,
            message: message.into(),
            line,
        }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidNodeId { .. } => ErrorCode::new(6, 1),
            Self::InvalidSecurityMode { .. } => ErrorCode::new(6, 2),
            Self::InvalidSecurityPolicy { .. } => ErrorCode::new(6, 3),
            Self::InvalidValue { .. } => ErrorCode::new(6, 4),
            Self::Parse { .. } => ErrorCode::new(6, 5),
            Self::Io { .. } => ErrorCode::new(6, 6),
            Self::MissingField { .. } => ErrorCode::new(6, 7),
        }
    }
}

// =============================================================================
// TimeoutError
// =============================================================================

/// Deadline errors.
#[derive(Debug, Error)]
pub enum TimeoutError {
    /// A scheduled operation exceeded its timeout.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Operation {
        /// Operation name.
        operation: String,
        /// Timeout duration.
        duration: Duration,
    },

    /// Connecting to the server exceeded its timeout.
    #[error("Connection timed out after {duration:?}")]
    Connection {
        /// Timeout duration.
        duration: Duration,
    },
}

impl TimeoutError {
    /// Creates an operation timeout.
    pub fn operation(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Operation {
            operation: operation.into(),
            duration,
        }
    }

    /// Creates a connection timeout.
    pub fn connection(duration: Duration) -> Self {
        Self::Connection { duration }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Operation { .. } => ErrorCode::new(7, 1),
            Self::Connection { .. } => ErrorCode::new(7, 2),
        }
    }
}

// =============================================================================
// ErrorSeverity
// =============================================================================

/// Error severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    /// Informational - no action required.
    Info,
    /// Warning - action may be required.
    Warning,
    /// Error - action required, but recoverable.
    Error,
    /// Critical - immediate action required.
    Critical,
}

impl ErrorSeverity {
    /// Tracing level used when logging at this severity.
    pub fn to_tracing_level(self) -> Level {
        match self {
            Self::Info => Level::DEBUG,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// ErrorCode
// =============================================================================

/// Structured error code.
///
/// Format: `UA-XXYY` where XX is category and YY is specific error.
///
/// Categories:
/// - 1: Connection
/// - 2: Session
/// - 3: Security
/// - 4: Discovery
/// - 5: Subscription
/// - 6: Configuration
/// - 7: Timeout
/// - 8: Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    /// Category (1-8).
    pub category: u8,
    /// Specific error within category.
    pub code: u8,
}

impl ErrorCode {
    /// Creates a new error code.
    pub const fn new(category: u8, code: u8) -> Self {
        Self { category, code }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UA-{:02X}{:02X}", self.category, self.code)
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Result type for OPC UA client operations.
pub type OpcUaResult<T> = Result<T, OpcUaError>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(OpcUaError::connection(ConnectionError::refused("opc.tcp://localhost:4840")).is_retryable());
        assert!(OpcUaError::not_connected().is_retryable());
        assert!(OpcUaError::operation_timeout("read", Duration::from_secs(1)).is_retryable());
        assert!(!OpcUaError::security(SecurityError::NoClientCertificate).is_retryable());
        assert!(!OpcUaError::session(SessionError::PoolShutdown).is_retryable());
        assert!(!OpcUaError::subscription_closed("s1").is_retryable());
        assert!(!OpcUaError::discovery(DiscoveryError::invalid_url("x", "no scheme")).is_retryable());
        assert!(!OpcUaError::configuration(ConfigurationError::missing_field("url")).is_retryable());
    }

    #[test]
    fn test_session_fatal_classification() {
        assert!(OpcUaError::transport("reset").is_session_fatal());
        assert!(OpcUaError::session_closed().is_session_fatal());
        assert!(OpcUaError::security(SecurityError::certificate_not_trusted("x")).is_session_fatal());

        assert!(!OpcUaError::operation_timeout("read", Duration::from_secs(1)).is_session_fatal());
        assert!(!OpcUaError::cancelled("read").is_session_fatal());
        assert!(!OpcUaError::subscription(SubscriptionError::service_failed(
            "CreateMonitoredItems",
            "BadNodeIdUnknown"
        ))
        .is_session_fatal());
        assert!(!OpcUaError::session(SessionError::PoolShutdown).is_session_fatal());
        assert!(!OpcUaError::session(SessionError::activation_failed("denied")).is_session_fatal());
    }

    #[test]
    fn test_cancelled_is_distinct() {
        let error = OpcUaError::cancelled("execute");
        assert!(error.is_cancelled());
        assert!(!error.is_retryable());
        assert!(!error.is_timeout());
        assert_eq!(error.severity(), ErrorSeverity::Info);
        assert!(error.to_string().contains("execute"));
        assert_eq!(error.category(), "cancelled");
        assert_eq!(error.error_code().to_string(), "UA-0801");
    }

    #[test]
    fn test_connect_timeout() {
        let error = OpcUaError::timeout(TimeoutError::connection(Duration::from_secs(10)));
        assert!(error.is_timeout());
        assert_eq!(error.severity(), ErrorSeverity::Warning);
        assert_eq!(error.error_code().to_string(), "UA-0702");
        assert_eq!(error.to_string(), "Connection timed out after 10s");
    }

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::new(1, 1).to_string(), "UA-0101");
        assert_eq!(ErrorCode::new(6, 12).to_string(), "UA-060C");
        assert_eq!(
            OpcUaError::discovery(DiscoveryError::hop_failed("opc.tcp://a:4840", 3, "x"))
                .error_code()
                .to_string(),
            "UA-0401"
        );
        assert_eq!(OpcUaError::transport("reset").error_code().to_string(), "UA-0103");
        assert_eq!(
            OpcUaError::subscription(SubscriptionError::service_failed("Publish", "x"))
                .error_code()
                .to_string(),
            "UA-0503"
        );
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Critical > ErrorSeverity::Info);
        assert_eq!(ErrorSeverity::Warning.to_string(), "warning");
        assert_eq!(ErrorSeverity::Info.to_tracing_level(), Level::DEBUG);
        assert_eq!(ErrorSeverity::Critical.to_tracing_level(), Level::ERROR);
    }
}
