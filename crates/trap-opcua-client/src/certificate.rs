// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Certificate provider boundary.
//!
//! The engine never parses certificates. It asks a [`CertificateProvider`]
//! for its own certificate when a secure endpoint is used, and whether a
//! server certificate belongs to a trusted peer.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{OpcUaError, OpcUaResult, SecurityError};

// =============================================================================
// ClientCertificate
// =============================================================================

/// The application instance certificate used by the client.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    /// DER encoded certificate.
    pub certificate: Vec<u8>,
    /// DER encoded private key.
    pub private_key: Vec<u8>,
}

impl ClientCertificate {
    /// Creates a client certificate.
    pub fn new(certificate: Vec<u8>, private_key: Vec<u8>) -> Self {
        Self {
            certificate,
            private_key,
        }
    }

    /// Short identifier used in logs.
    pub fn thumbprint(&self) -> String {
        thumbprint(&self.certificate)
    }
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("thumbprint", &self.thumbprint())
            .finish_non_exhaustive()
    }
}

/// Hex of the first 20 bytes of a DER blob.
pub fn thumbprint(der: &[u8]) -> String {
    der.iter()
        .take(20)
        .map(|b| format!("{b:02X}"))
        .collect()
}

// =============================================================================
// CertificateProvider
// =============================================================================

/// Supplies the client certificate and maintains the trusted peer list.
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Returns the client certificate, creating one if the provider can.
    async fn get_or_create_client_certificate(&self) -> OpcUaResult<ClientCertificate>;

    /// Replaces the client certificate.
    async fn update_client_certificate(&self, certificate: ClientCertificate) -> OpcUaResult<()>;

    /// Adds a DER encoded certificate to the trusted peers.
    async fn add_trusted_peer(&self, certificate: &[u8]) -> OpcUaResult<()>;

    /// Removes a DER encoded certificate from the trusted peers.
    async fn remove_trusted_peer(&self, certificate: &[u8]) -> OpcUaResult<()>;

    /// Returns `true` if the certificate is a trusted peer.
    async fn is_trusted_peer(&self, certificate: &[u8]) -> OpcUaResult<bool>;
}

// =============================================================================
// MemoryCertificateProvider
// =============================================================================

/// In-memory certificate provider for tests and simple deployments.
#[derive(Debug, Clone, Default)]
pub struct MemoryCertificateProvider {
    own: Arc<RwLock<Option<ClientCertificate>>>,
    trusted: Arc<RwLock<HashSet<Vec<u8>>>>,
}

impl MemoryCertificateProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider holding a client certificate.
    pub fn with_client_certificate(certificate: ClientCertificate) -> Self {
        let provider = Self::default();
        *provider.own.write() = Some(certificate);
        provider
    }

    /// Returns the number of trusted peers.
    pub fn trusted_count(&self) -> usize {
        self.trusted.read().len()
    }
}

#[async_trait]
impl CertificateProvider for MemoryCertificateProvider {
    async fn get_or_create_client_certificate(&self) -> OpcUaResult<ClientCertificate> {
        self.own
            .read()
            .clone()
            .ok_or(OpcUaError::Security(SecurityError::NoClientCertificate))
    }

    async fn update_client_certificate(&self, certificate: ClientCertificate) -> OpcUaResult<()> {
        tracing::info!(thumbprint = %certificate.thumbprint(), "Client certificate updated");
        *self.own.write() = Some(certificate);
        Ok(())
    }

    async fn add_trusted_peer(&self, certificate: &[u8]) -> OpcUaResult<()> {
        if certificate.is_empty() {
            return Err(OpcUaError::security(SecurityError::certificate_invalid(
                "empty certificate",
            )));
        }
        if self.trusted.write().insert(certificate.to_vec()) {
            tracing::debug!(thumbprint = %thumbprint(certificate), "Trusted peer added");
        }
        Ok(())
    }

    async fn remove_trusted_peer(&self, certificate: &[u8]) -> OpcUaResult<()> {
        if self.trusted.write().remove(certificate) {
            tracing::debug!(thumbprint = %thumbprint(certificate), "Trusted peer removed");
        }
        Ok(())
    }

    async fn is_trusted_peer(&self, certificate: &[u8]) -> OpcUaResult<bool> {
        Ok(self.trusted.read().contains(certificate))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_client_certificate() {
        let provider = MemoryCertificateProvider::new();
        let err = provider.get_or_create_client_certificate().await.unwrap_err();
        assert!(matches!(
            err,
            OpcUaError::Security(SecurityError::NoClientCertificate)
        ));
    }

    #[tokio::test]
    async fn test_update_client_certificate() {
        let provider = MemoryCertificateProvider::new();
        provider
            .update_client_certificate(ClientCertificate::new(vec![0xAB; 32], vec![1]))
            .await
            .unwrap();

        let cert = provider.get_or_create_client_certificate().await.unwrap();
        assert_eq!(cert.thumbprint(), "AB".repeat(20));
        assert!(!format!("{cert:?}").contains("private_key"));
    }

    #[tokio::test]
    async fn test_trusted_peers() {
        let provider = MemoryCertificateProvider::new();
        let server = vec![1, 2, 3];

        assert!(!provider.is_trusted_peer(&server).await.unwrap());
        provider.add_trusted_peer(&server).await.unwrap();
        provider.add_trusted_peer(&server).await.unwrap();
        assert!(provider.is_trusted_peer(&server).await.unwrap());
        assert_eq!(provider.trusted_count(), 1);

        provider.remove_trusted_peer(&server).await.unwrap();
        assert!(!provider.is_trusted_peer(&server).await.unwrap());
        assert!(provider.add_trusted_peer(&[]).await.is_err());
    }
}
