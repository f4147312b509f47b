// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Core data model of the client engine.
//!
//! - **NodeId**: OPC UA node identifiers with parsing
//! - **SecurityMode/Policy, Credential**: endpoint security and identity
//! - **EndpointKey**: structural identity used to pool sessions
//! - **Variant, DataValue, StatusCode**: sampled values
//! - **DataChangeFilter**: trigger and deadband evaluation
//! - **EventFilter**: event fields selected by browse path
//! - **MonitoredItemModel, SubscriptionConfig, SubscriptionModel**: desired subscription state
//!
//! # Examples
//!
//! ```
//! use trap_opcua_client::types::{ConnectionModel, EndpointKey, NodeId, SecurityMode};
//!
//! let node: NodeId = "ns=2;s=Line1.Temperature".parse().unwrap();
//! assert_eq!(node.namespace_index, 2);
//!
//! let a = ConnectionModel::new("opc.tcp://PLC1:4840/");
//! let b = ConnectionModel::new("opc.tcp://plc1:4840");
//! assert_eq!(EndpointKey::from(&a), EndpointKey::from(&b));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigurationError, OpcUaError};

// =============================================================================
// NodeId
// =============================================================================

/// OPC UA Node Identifier.
///
/// A namespace index plus a numeric, string, GUID or opaque identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    /// Namespace index (0 = OPC UA standard namespace).
    pub namespace_index: u16,

    /// The node identifier.
    pub identifier: NodeIdentifier,
}

impl NodeId {
    /// Creates a numeric node ID.
    #[inline]
    pub fn numeric(namespace_index: u16, value: u32) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Numeric(value),
        }
    }

    /// Creates a string node ID.
    #[inline]
    pub fn string(namespace_index: u16, value: impl Into<String>) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::String(value.into()),
        }
    }

    /// Creates a GUID node ID.
    #[inline]
    pub fn guid(namespace_index: u16, value: Uuid) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Guid(value),
        }
    }

    /// Creates an opaque node ID.
    #[inline]
    pub fn opaque(namespace_index: u16, value: Vec<u8>) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Opaque(value),
        }
    }

    /// Returns the null node id (`i=0`).
    pub fn null() -> Self {
        Self::numeric(0, 0)
    }

    /// Returns `true` if this is the null node id.
    pub fn is_null(&self) -> bool {
        self.namespace_index == 0 && self.identifier == NodeIdentifier::Numeric(0)
    }

    /// Formats the node id in the standard `ns=X;T=V` notation.
    pub fn to_opc_string(&self) -> String {
        if self.namespace_index == 0 {
            self.identifier.to_string()
        } else {
            format!("ns={};{}", self.namespace_index, self.identifier)
        }
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_opc_string())
    }
}

impl FromStr for NodeId {
    type Err = OpcUaError;

    /// Parses `ns=2;i=1001`, `ns=2;s=Name`, `ns=2;g=<uuid>`, `ns=2;b=<base64>`
    /// or the same forms without a namespace prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: String| {
            OpcUaError::configuration(ConfigurationError::invalid_node_id(s, reason))
        };

        let (namespace_index, identifier_part) = match s.strip_prefix("ns=") {
            Some(rest) => {
                let (ns, id) = rest
                    .split_once(';')
                    .ok_or_else(|| invalid("Missing identifier after namespace".into()))?;
                let ns: u16 = ns
                    .parse()
                    .map_err(|_| invalid("Invalid namespace index".into()))?;
                (ns, id)
            }
            None => (0, s),
        };

        let identifier = if let Some(id) = identifier_part.strip_prefix("i=") {
            NodeIdentifier::Numeric(
                id.parse()
                    .map_err(|_| invalid("Invalid numeric identifier".into()))?,
            )
        } else if let Some(id) = identifier_part.strip_prefix("s=") {
            NodeIdentifier::String(id.to_string())
        } else if let Some(id) = identifier_part.strip_prefix("g=") {
            NodeIdentifier::Guid(
                Uuid::parse_str(id).map_err(|e| invalid(format!("Invalid GUID: {e}")))?,
            )
        } else if let Some(id) = identifier_part.strip_prefix("b=") {
            NodeIdentifier::Opaque(
                BASE64
                    .decode(id)
                    .map_err(|e| invalid(format!("Invalid base64: {e}")))?,
            )
        } else {
            return Err(invalid(
                "Unknown identifier type. Expected i=, s=, g=, or b=".into(),
            ));
        };

        Ok(Self {
            namespace_index,
            identifier,
        })
    }
}

/// The identifier part of a [`NodeId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum NodeIdentifier {
    /// Numeric identifier.
    Numeric(u32),
    /// String identifier.
    String(String),
    /// GUID identifier.
    Guid(Uuid),
    /// Opaque identifier.
    Opaque(Vec<u8>),
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "i={v}"),
            Self::String(v) => write!(f, "s={v}"),
            Self::Guid(v) => write!(f, "g={v}"),
            Self::Opaque(v) => write!(f, "b={}", BASE64.encode(v)),
        }
    }
}

// =============================================================================
// AttributeId
// =============================================================================

/// Node attributes that can be monitored.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AttributeId {
    /// Node id attribute.
    NodeId,
    /// Browse name attribute.
    BrowseName,
    /// Display name attribute.
    DisplayName,
    /// Description attribute.
    Description,
    /// Event notifier attribute.
    EventNotifier,
    /// Value attribute.
    #[default]
    Value,
    /// Data type attribute.
    DataType,
    /// Access level attribute.
    AccessLevel,
    /// Minimum sampling interval attribute.
    MinimumSamplingInterval,
}

impl AttributeId {
    /// Returns the OPC UA numeric value.
    pub const fn value(&self) -> u32 {
        match self {
            Self::NodeId => 1,
            Self::BrowseName => 3,
            Self::DisplayName => 4,
            Self::Description => 5,
            Self::EventNotifier => 12,
            Self::Value => 13,
            Self::DataType => 14,
            Self::AccessLevel => 17,
            Self::MinimumSamplingInterval => 19,
        }
    }
}

// =============================================================================
// Security
// =============================================================================

/// OPC UA message security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Messages are neither signed nor encrypted.
    #[default]
    None,
    /// Messages are signed.
    Sign,
    /// Messages are signed and encrypted.
    SignAndEncrypt,
}

impl SecurityMode {
    /// Returns `true` if this mode needs a client certificate.
    #[inline]
    pub const fn requires_certificate(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Returns the display name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Sign => "Sign",
            Self::SignAndEncrypt => "SignAndEncrypt",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SecurityMode {
    type Err = OpcUaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "none" | "nosecurity" => Ok(Self::None),
            "sign" | "signed" => Ok(Self::Sign),
            "signandencrypt" | "signencrypt" | "encrypted" => Ok(Self::SignAndEncrypt),
            _ => Err(OpcUaError::configuration(
                ConfigurationError::invalid_security_mode(s),
            )),
        }
    }
}

/// OPC UA security policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityPolicy {
    /// No security policy.
    #[default]
    None,
    /// Basic256Sha256.
    Basic256Sha256,
    /// Aes128Sha256RsaOaep.
    Aes128Sha256RsaOaep,
    /// Aes256Sha256RsaPss.
    Aes256Sha256RsaPss,
}

impl SecurityPolicy {
    /// Returns the OPC UA policy URI.
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
            Self::Basic256Sha256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256",
            Self::Aes128Sha256RsaOaep => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep"
            }
            Self::Aes256Sha256RsaPss => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss"
            }
        }
    }

    /// Creates from a policy URI.
    pub fn from_uri(uri: &str) -> Option<Self> {
        let (_, fragment) = uri.rsplit_once('#')?;
        match fragment {
            "None" => Some(Self::None),
            "Basic256Sha256" => Some(Self::Basic256Sha256),
            "Aes128_Sha256_RsaOaep" => Some(Self::Aes128Sha256RsaOaep),
            "Aes256_Sha256_RsaPss" => Some(Self::Aes256Sha256RsaPss),
            _ => Option::None,
        }
    }

    /// Returns the short name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Basic256Sha256 => "Basic256Sha256",
            Self::Aes128Sha256RsaOaep => "Aes128Sha256RsaOaep",
            Self::Aes256Sha256RsaPss => "Aes256Sha256RsaPss",
        }
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SecurityPolicy {
    type Err = OpcUaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(policy) = Self::from_uri(s) {
            return Ok(policy);
        }

        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "none" => Ok(Self::None),
            "basic256sha256" => Ok(Self::Basic256Sha256),
            "aes128sha256rsaoaep" | "aes128" => Ok(Self::Aes128Sha256RsaOaep),
            "aes256sha256rsapss" | "aes256" => Ok(Self::Aes256Sha256RsaPss),
            _ => Err(OpcUaError::configuration(
                ConfigurationError::invalid_security_policy(s),
            )),
        }
    }
}

// =============================================================================
// Credential
// =============================================================================

/// Kind of user identity presented to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    /// Anonymous.
    #[default]
    None,
    /// Username and password.
    UserName,
    /// X.509 certificate.
    X509Certificate,
    /// Issued token.
    Token,
}

/// User identity presented to the server.
///
/// `Debug` never prints secret material.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// Anonymous.
    #[default]
    None,

    /// Username and password.
    UserName {
        /// The username.
        user: String,
        /// The password.
        password: String,
    },

    /// X.509 certificate with its private key, both DER encoded.
    X509Certificate {
        /// Certificate bytes.
        certificate: Vec<u8>,
        /// Private key bytes.
        private_key: Vec<u8>,
    },

    /// Issued token.
    Token {
        /// Token bytes.
        token: Vec<u8>,
    },
}

impl Credential {
    /// Creates a username/password credential.
    pub fn user_name(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::UserName {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Returns the credential type.
    pub const fn credential_type(&self) -> CredentialType {
        match self {
            Self::None => CredentialType::None,
            Self::UserName { .. } => CredentialType::UserName,
            Self::X509Certificate { .. } => CredentialType::X509Certificate,
            Self::Token { .. } => CredentialType::Token,
        }
    }

    /// Returns `true` for the anonymous identity.
    #[inline]
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("Credential::None"),
            Self::UserName { user, .. } => f
                .debug_struct("Credential::UserName")
                .field("user", user)
                .field("password", &"***")
                .finish(),
            Self::X509Certificate { certificate, .. } => f
                .debug_struct("Credential::X509Certificate")
                .field("certificate_len", &certificate.len())
                .finish_non_exhaustive(),
            Self::Token { token } => f
                .debug_struct("Credential::Token")
                .field("token_len", &token.len())
                .finish(),
        }
    }
}

// =============================================================================
// Endpoint / Connection
// =============================================================================

/// An endpoint: network address plus security configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointModel {
    /// Endpoint URL, e.g. `opc.tcp://plc1:4840`.
    pub url: String,

    /// Message security mode.
    #[serde(default)]
    pub security_mode: SecurityMode,

    /// Security policy.
    #[serde(default)]
    pub security_policy: SecurityPolicy,
}

impl EndpointModel {
    /// Creates an endpoint without security.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            security_mode: SecurityMode::None,
            security_policy: SecurityPolicy::None,
        }
    }
}

/// Endpoint plus the identity used on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionModel {
    /// The endpoint.
    pub endpoint: EndpointModel,

    /// User identity. `None` means anonymous.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
}

impl ConnectionModel {
    /// Creates an anonymous connection without security.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            endpoint: EndpointModel::new(url),
            credential: None,
        }
    }

    /// Sets the security mode and policy.
    pub fn with_security(mut self, mode: SecurityMode, policy: SecurityPolicy) -> Self {
        self.endpoint.security_mode = mode;
        self.endpoint.security_policy = policy;
        self
    }

    /// Sets the user identity.
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Returns the user identity, anonymous when absent.
    pub fn credential_or_anonymous(&self) -> Credential {
        self.credential.clone().unwrap_or_default()
    }
}

/// Structural identity of a pooled session.
///
/// An absent credential and [`Credential::None`] produce the same key.
/// The URL is normalized: scheme and host lowercased, trailing `/` removed,
/// and port 4840 made explicit for `opc.tcp` URLs without one.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    url: String,
    security_mode: SecurityMode,
    security_policy: SecurityPolicy,
    credential: Credential,
}

impl EndpointKey {
    /// Returns the normalized URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the security mode.
    pub fn security_mode(&self) -> SecurityMode {
        self.security_mode
    }

    /// Returns the credential type.
    pub fn credential_type(&self) -> CredentialType {
        self.credential.credential_type()
    }
}

impl From<&ConnectionModel> for EndpointKey {
    fn from(connection: &ConnectionModel) -> Self {
        Self {
            url: normalize_endpoint_url(&connection.endpoint.url),
            security_mode: connection.endpoint.security_mode,
            security_policy: connection.endpoint.security_policy,
            credential: connection.credential_or_anonymous(),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}/{}/{:?}]",
            self.url,
            self.security_mode,
            self.security_policy,
            self.credential.credential_type()
        )
    }
}

impl fmt::Debug for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointKey({self})")
    }
}

/// Default port of the `opc.tcp` scheme.
pub const DEFAULT_OPC_TCP_PORT: u16 = 4840;

fn normalize_endpoint_url(url: &str) -> String {
    let url = url.trim();
    let Ok(parsed) = url::Url::parse(url) else {
        return url.trim_end_matches('/').to_lowercase();
    };

    // opc.tcp is not a special scheme, so the parser keeps the host's case.
    let mut normalized = format!(
        "{}://{}",
        parsed.scheme(),
        parsed.host_str().unwrap_or_default().to_lowercase()
    );
    let port = match (parsed.port(), parsed.scheme()) {
        (Some(port), _) => Some(port),
        (None, "opc.tcp") => Some(DEFAULT_OPC_TCP_PORT),
        (None, _) => None,
    };
    if let Some(port) = port {
        normalized.push_str(&format!(":{port}"));
    }
    normalized.push_str(parsed.path().trim_end_matches('/'));
    normalized
}

// =============================================================================
// StatusCode
// =============================================================================

/// OPC UA status code.
///
/// The top two bits carry severity: `00` good, `01` uncertain, `10` bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

impl StatusCode {
    /// Good.
    pub const GOOD: Self = Self(0x0000_0000);
    /// Uncertain.
    pub const UNCERTAIN: Self = Self(0x4000_0000);
    /// Bad.
    pub const BAD: Self = Self(0x8000_0000);
    /// BadUnexpectedError.
    pub const BAD_UNEXPECTED_ERROR: Self = Self(0x8001_0000);
    /// BadCommunicationError.
    pub const BAD_COMMUNICATION_ERROR: Self = Self(0x8005_0000);
    /// BadTimeout.
    pub const BAD_TIMEOUT: Self = Self(0x800A_0000);
    /// BadNodeIdUnknown.
    pub const BAD_NODE_ID_UNKNOWN: Self = Self(0x8034_0000);
    /// BadAttributeIdInvalid.
    pub const BAD_ATTRIBUTE_ID_INVALID: Self = Self(0x8035_0000);
    /// BadMonitoredItemIdInvalid.
    pub const BAD_MONITORED_ITEM_ID_INVALID: Self = Self(0x8042_0000);
    /// BadMonitoredItemFilterUnsupported.
    pub const BAD_FILTER_NOT_ALLOWED: Self = Self(0x8045_0000);
    /// BadSubscriptionIdInvalid.
    pub const BAD_SUBSCRIPTION_ID_INVALID: Self = Self(0x8028_0000);
    /// BadWaitingForInitialData.
    pub const BAD_WAITING_FOR_INITIAL_DATA: Self = Self(0x8032_0000);

    /// Returns `true` for a good status.
    #[inline]
    pub const fn is_good(&self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    /// Returns `true` for an uncertain status.
    #[inline]
    pub const fn is_uncertain(&self) -> bool {
        self.0 & 0xC000_0000 == 0x4000_0000
    }

    /// Returns `true` for a bad status.
    #[inline]
    pub const fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Returns the symbolic name of well-known codes.
    pub fn name(&self) -> String {
        let known = match *self {
            Self::GOOD => "Good",
            Self::UNCERTAIN => "Uncertain",
            Self::BAD => "Bad",
            Self::BAD_UNEXPECTED_ERROR => "BadUnexpectedError",
            Self::BAD_COMMUNICATION_ERROR => "BadCommunicationError",
            Self::BAD_TIMEOUT => "BadTimeout",
            Self::BAD_NODE_ID_UNKNOWN => "BadNodeIdUnknown",
            Self::BAD_ATTRIBUTE_ID_INVALID => "BadAttributeIdInvalid",
            Self::BAD_MONITORED_ITEM_ID_INVALID => "BadMonitoredItemIdInvalid",
            Self::BAD_FILTER_NOT_ALLOWED => "BadFilterNotAllowed",
            Self::BAD_SUBSCRIPTION_ID_INVALID => "BadSubscriptionIdInvalid",
            Self::BAD_WAITING_FOR_INITIAL_DATA => "BadWaitingForInitialData",
            _ => return format!("0x{:08X}", self.0),
        };
        known.to_string()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

// =============================================================================
// Variant / DataValue
// =============================================================================

/// A sampled OPC UA value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Variant {
    /// No value.
    #[default]
    Null,
    /// Boolean.
    Boolean(bool),
    /// 32-bit signed integer.
    Int32(i32),
    /// 32-bit unsigned integer.
    UInt32(u32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit unsigned integer.
    UInt64(u64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit double.
    Double(f64),
    /// String.
    String(String),
    /// Date/time.
    DateTime(DateTime<Utc>),
    /// Byte string.
    ByteString(Vec<u8>),
    /// Array of values.
    Array(Vec<Variant>),
}

impl Variant {
    /// Returns the value as `f64` if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(v) => Some(*v as f64),
            Self::UInt32(v) => Some(*v as f64),
            Self::Int64(v) => Some(*v as f64),
            Self::UInt64(v) => Some(*v as f64),
            Self::Float(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns `true` for [`Variant::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "\"{v}\""),
            Self::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Self::ByteString(v) => write!(f, "{}", BASE64.encode(v)),
            Self::Array(v) => write!(f, "[{} items]", v.len()),
        }
    }
}

/// A value with its quality and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataValue {
    /// The value.
    pub value: Variant,
    /// Quality.
    #[serde(default)]
    pub status: StatusCode,
    /// Timestamp assigned by the data source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Timestamp assigned by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    /// Creates a good value with both timestamps set to now.
    pub fn new(value: Variant) -> Self {
        let now = Utc::now();
        Self {
            value,
            status: StatusCode::GOOD,
            source_timestamp: Some(now),
            server_timestamp: Some(now),
        }
    }

    /// Sets the status code.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Sets the source timestamp.
    pub fn with_source_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.source_timestamp = Some(timestamp);
        self
    }
}

// =============================================================================
// Data Change Filter
// =============================================================================

/// What constitutes a change for a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataChangeTrigger {
    /// Report status changes only.
    Status,
    /// Report status or value changes.
    #[default]
    StatusValue,
    /// Report status, value or source timestamp changes.
    StatusValueTimestamp,
}

/// Deadband applied to numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeadbandSettings {
    /// No deadband.
    #[default]
    None,

    /// Report when the change exceeds an absolute value.
    Absolute {
        /// Absolute change threshold.
        value: f64,
    },

    /// Report when the change exceeds a percentage of the EU range.
    Percent {
        /// Percentage of the engineering unit range (0-100).
        percent: f64,
        /// Low end of the EU range.
        low: f64,
        /// High end of the EU range.
        high: f64,
    },
}

impl DeadbandSettings {
    /// Creates an absolute deadband.
    pub fn absolute(value: f64) -> Self {
        Self::Absolute { value }
    }

    /// Creates a percent deadband over the given range.
    pub fn percent(percent: f64, low: f64, high: f64) -> Self {
        Self::Percent { percent, low, high }
    }

    /// Returns the absolute threshold a change must exceed, if any.
    pub fn threshold(&self) -> Option<f64> {
        match *self {
            Self::None => None,
            Self::Absolute { value } => Some(value),
            Self::Percent { percent, low, high } => Some(percent / 100.0 * (high - low).abs()),
        }
    }
}

/// Data change filter of a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct DataChangeFilter {
    /// Change trigger.
    #[serde(default)]
    pub trigger: DataChangeTrigger,
    /// Deadband.
    #[serde(default)]
    pub deadband: DeadbandSettings,
}

impl DataChangeFilter {
    /// Returns `true` if `current` differs from `last` enough to be reported.
    ///
    /// A missing previous value always counts as a change.
    pub fn is_changed(&self, last: Option<&DataValue>, current: &DataValue) -> bool {
        let Some(last) = last else {
            return true;
        };

        if last.status != current.status {
            return true;
        }

        if self.trigger == DataChangeTrigger::Status {
            return false;
        }

        if self.trigger == DataChangeTrigger::StatusValueTimestamp
            && last.source_timestamp != current.source_timestamp
        {
            return true;
        }

        self.value_changed(&last.value, &current.value)
    }

    fn value_changed(&self, last: &Variant, current: &Variant) -> bool {
        match (self.deadband.threshold(), last.as_f64(), current.as_f64()) {
            (Some(threshold), Some(a), Some(b)) => (b - a).abs() > threshold,
            _ => last != current,
        }
    }
}

/// Which timestamps a subscriber wants in notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimestampsToReturn {
    /// Source timestamp only.
    Source,
    /// Server timestamp only.
    Server,
    /// Both timestamps.
    #[default]
    Both,
    /// Neither timestamp.
    Neither,
}

impl TimestampsToReturn {
    /// Returns `true` if the source timestamp is kept.
    pub const fn includes_source(&self) -> bool {
        matches!(self, Self::Source | Self::Both)
    }

    /// Returns `true` if the server timestamp is kept.
    pub const fn includes_server(&self) -> bool {
        matches!(self, Self::Server | Self::Both)
    }
}

// =============================================================================
// Event Filter
// =============================================================================

/// Numeric id of `BaseEventType` in namespace 0.
pub const BASE_EVENT_TYPE: u32 = 2041;

fn base_event_type() -> NodeId {
    NodeId::numeric(0, BASE_EVENT_TYPE)
}

/// An event field addressed by browse path from an event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimpleAttributeOperand {
    /// Event type the path starts from.
    #[serde(default = "base_event_type")]
    pub type_definition_id: NodeId,

    /// Browse names from the event type to the field.
    pub browse_path: Vec<String>,

    /// Name reported in notifications. Defaults to the joined browse path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl SimpleAttributeOperand {
    /// Selects a field of `BaseEventType`, e.g. `["Severity"]`.
    pub fn base_event(browse_path: &[&str]) -> Self {
        Self {
            type_definition_id: base_event_type(),
            browse_path: browse_path.iter().map(|name| (*name).to_string()).collect(),
            display_name: None,
        }
    }

    /// Sets the reported name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Name of the field in notifications.
    pub fn field_name(&self) -> String {
        match &self.display_name {
            Some(name) => name.clone(),
            None => self.browse_path.join("/"),
        }
    }

    fn is_event_type(&self) -> bool {
        self.type_definition_id == base_event_type()
            && self.browse_path.first().map(String::as_str) == Some("EventType")
    }
}

/// Selects which fields of which events an event item reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct EventFilter {
    /// Fields reported with every event, in order.
    #[serde(default)]
    pub select_clauses: Vec<SimpleAttributeOperand>,

    /// Only events of this type or its subtypes are reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<NodeId>,
}

impl EventFilter {
    /// Creates a filter selecting `BaseEventType` fields by name.
    pub fn fields(names: &[&str]) -> Self {
        Self {
            select_clauses: names
                .iter()
                .map(|name| SimpleAttributeOperand::base_event(&[name]))
                .collect(),
            event_type: None,
        }
    }

    /// Restricts the filter to one event type.
    pub fn of_type(mut self, event_type: NodeId) -> Self {
        self.event_type = Some(event_type);
        self
    }

    /// Clauses sent to the server.
    ///
    /// The event type is always selected so the server can match it; when
    /// the caller did not ask for it, it is appended after the reported
    /// fields and never shows up in notifications.
    pub fn request_clauses(&self) -> Vec<SimpleAttributeOperand> {
        let mut clauses = self.select_clauses.clone();
        if !clauses.iter().any(SimpleAttributeOperand::is_event_type) {
            clauses.push(SimpleAttributeOperand::base_event(&["EventType"]));
        }
        clauses
    }

    /// Names of the reported fields, in select order.
    pub fn field_names(&self) -> Vec<String> {
        self.select_clauses
            .iter()
            .map(SimpleAttributeOperand::field_name)
            .collect()
    }
}

/// Filter sent with a monitored item service request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitoringFilter {
    /// Value item.
    DataChange(DataChangeFilter),
    /// Event item.
    Event(EventFilter),
}

// =============================================================================
// MonitoringMode
// =============================================================================

/// OPC UA monitoring mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringMode {
    /// Neither sampling nor reporting.
    Disabled,
    /// Sampling, not reporting.
    Sampling,
    /// Sampling and reporting.
    #[default]
    Reporting,
}

impl fmt::Display for MonitoringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "disabled",
            Self::Sampling => "sampling",
            Self::Reporting => "reporting",
        })
    }
}

// =============================================================================
// MonitoredItemModel
// =============================================================================

/// Identity of a monitored item within a subscription.
pub type MonitoredItemKey = (NodeId, AttributeId);

/// Desired configuration of one monitored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemModel {
    /// Node to monitor.
    pub node_id: NodeId,

    /// Attribute to monitor.
    #[serde(default)]
    pub attribute_id: AttributeId,

    /// Display name reported with notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Sampling interval.
    #[serde(default = "default_sampling_interval", with = "humantime_serde")]
    pub sampling_interval: Duration,

    /// Server-side queue size.
    #[serde(default = "default_queue_size")]
    pub queue_size: u32,

    /// Discard the oldest value on overflow.
    #[serde(default = "default_true")]
    pub discard_oldest: bool,

    /// Desired monitoring mode when the subscription is active.
    #[serde(default)]
    pub monitoring_mode: MonitoringMode,

    /// Data change filter. Ignored by event items.
    #[serde(default)]
    pub data_change_filter: DataChangeFilter,

    /// Event filter; present only on event items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_filter: Option<EventFilter>,

    /// Drop the first value after the item is created.
    #[serde(default)]
    pub skip_first: bool,
}

fn default_sampling_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_queue_size() -> u32 {
    1
}

/// Queue size of event items created with [`MonitoredItemModel::event`].
pub const DEFAULT_EVENT_QUEUE_SIZE: u32 = 100;

fn default_true() -> bool {
    true
}

impl MonitoredItemModel {
    /// Creates a value monitored item with default parameters.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            attribute_id: AttributeId::Value,
            display_name: None,
            sampling_interval: default_sampling_interval(),
            queue_size: default_queue_size(),
            discard_oldest: true,
            monitoring_mode: MonitoringMode::Reporting,
            data_change_filter: DataChangeFilter::default(),
            event_filter: None,
            skip_first: false,
        }
    }

    /// Creates an event item on the event notifier of `node_id`.
    ///
    /// Servers push events as they occur, so the sampling interval is zero
    /// and the queue holds a burst of events between publish cycles.
    pub fn event(node_id: NodeId, filter: EventFilter) -> Self {
        Self {
            attribute_id: AttributeId::EventNotifier,
            sampling_interval: Duration::ZERO,
            queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            event_filter: Some(filter),
            ..Self::new(node_id)
        }
    }

    /// Returns `true` for event items.
    pub fn is_event(&self) -> bool {
        self.event_filter.is_some()
    }

    /// Filter to send with create and modify requests.
    ///
    /// Event filters carry [`EventFilter::request_clauses`].
    pub fn monitoring_filter(&self) -> MonitoringFilter {
        match &self.event_filter {
            Some(filter) => MonitoringFilter::Event(EventFilter {
                select_clauses: filter.request_clauses(),
                event_type: filter.event_type.clone(),
            }),
            None => MonitoringFilter::DataChange(self.data_change_filter),
        }
    }

    /// Sets the sampling interval.
    pub fn with_sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval = interval;
        self
    }

    /// Sets the queue size and discard policy.
    pub fn with_queue(mut self, queue_size: u32, discard_oldest: bool) -> Self {
        self.queue_size = queue_size;
        self.discard_oldest = discard_oldest;
        self
    }

    /// Sets the data change filter.
    pub fn with_filter(mut self, filter: DataChangeFilter) -> Self {
        self.data_change_filter = filter;
        self
    }

    /// Sets the display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Sets the desired monitoring mode.
    pub fn with_monitoring_mode(mut self, mode: MonitoringMode) -> Self {
        self.monitoring_mode = mode;
        self
    }

    /// Returns the item identity.
    pub fn key(&self) -> MonitoredItemKey {
        (self.node_id.clone(), self.attribute_id)
    }

    /// Returns `true` if a server-side modify is needed to go from `self` to `other`.
    pub fn needs_modify(&self, other: &Self) -> bool {
        self.sampling_interval != other.sampling_interval
            || self.queue_size != other.queue_size
            || self.discard_oldest != other.discard_oldest
            || self.data_change_filter != other.data_change_filter
            || self.event_filter != other.event_filter
    }
}

/// Ordered, deduplicated set of desired monitored items.
pub fn desired_item_set(
    items: impl IntoIterator<Item = MonitoredItemModel>,
) -> BTreeMap<MonitoredItemKey, MonitoredItemModel> {
    items.into_iter().map(|item| (item.key(), item)).collect()
}

// =============================================================================
// Subscription
// =============================================================================

/// Server-side subscription parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Publishing interval.
    #[serde(default = "default_publishing_interval", with = "humantime_serde")]
    pub publishing_interval: Duration,

    /// Keep-alive count.
    #[serde(default = "default_keep_alive_count")]
    pub keep_alive_count: u32,

    /// Lifetime count.
    #[serde(default = "default_lifetime_count")]
    pub lifetime_count: u32,

    /// Maximum notifications per publish; 0 means unlimited.
    #[serde(default)]
    pub max_notifications_per_publish: u32,

    /// Relative priority.
    #[serde(default)]
    pub priority: u8,

    /// Timestamps included in notifications.
    #[serde(default)]
    pub timestamps_to_return: TimestampsToReturn,
}

fn default_publishing_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_keep_alive_count() -> u32 {
    10
}

fn default_lifetime_count() -> u32 {
    60
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            publishing_interval: default_publishing_interval(),
            keep_alive_count: default_keep_alive_count(),
            lifetime_count: default_lifetime_count(),
            max_notifications_per_publish: 0,
            priority: 0,
            timestamps_to_return: TimestampsToReturn::Both,
        }
    }
}

impl SubscriptionConfig {
    /// Sets the publishing interval.
    pub fn with_publishing_interval(mut self, interval: Duration) -> Self {
        self.publishing_interval = interval;
        self
    }

    /// Returns `true` if going from `self` to `other` needs a modify call.
    ///
    /// Timestamps are applied client side and never need one.
    pub fn needs_modify(&self, other: &Self) -> bool {
        self.publishing_interval != other.publishing_interval
            || self.keep_alive_count != other.keep_alive_count
            || self.lifetime_count != other.lifetime_count
            || self.max_notifications_per_publish != other.max_notifications_per_publish
            || self.priority != other.priority
    }

    /// Per-publish limit with 0 mapped to unlimited.
    pub fn publish_limit(&self) -> usize {
        match self.max_notifications_per_publish {
            0 => usize::MAX,
            n => n as usize,
        }
    }
}

/// Caller-supplied identity of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    /// Logical id, e.g. a writer group.
    pub id: String,
    /// Connection the subscription lives on.
    pub connection: ConnectionModel,
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.connection.endpoint.url)
    }
}

/// Subscription to get or create.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionModel {
    /// Logical id.
    pub id: String,
    /// Connection.
    pub connection: ConnectionModel,
}

impl SubscriptionModel {
    /// Creates a subscription model.
    pub fn new(id: impl Into<String>, connection: ConnectionModel) -> Self {
        Self {
            id: id.into(),
            connection,
        }
    }

    /// Returns the key.
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            id: self.id.clone(),
            connection: self.connection.clone(),
        }
    }
}

// =============================================================================
// humantime_serde helper
// =============================================================================

pub(crate) mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*duration)
            .to_string()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
