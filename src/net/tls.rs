//! TLS and mTLS configuration.
//!
//! All node-to-node traffic is mutually authenticated: every node presents
//! the same kind of certificate as both server and client, and accepts only
//! peers signed by the cluster CA.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TLS Configuration                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │   TlsConfig        - File paths and minimum version         │
//! │   TlsIdentity      - Loaded certificate chain + key         │
//! │   TrustStore       - Cluster CA roots                       │
//! │   TlsServerBuilder - Builds rustls ServerConfig             │
//! │   TlsClientBuilder - Builds rustls ClientConfig             │
//! │   TlsDialer        - Transport over the client config       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::core::config::TlsSection;
use crate::core::error::{KvsqlError, KvsqlResult};
use crate::net::{BoxStream, Transport};
use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// TLS configuration for a node.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Certificate chain path.
    pub cert_path: String,
    /// Private key path.
    pub key_path: String,
    /// Cluster CA path, used to verify both clients and servers.
    pub ca_path: String,
    /// Minimum TLS version (default: TLS 1.2).
    pub min_tls_version: TlsVersion,
}

/// TLS version enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2
    #[default]
    Tls12,
    /// TLS 1.3
    Tls13,
}

static TLS13_ONLY: [&SupportedProtocolVersion; 1] = [&rustls::version::TLS13];

impl TlsVersion {
    fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            Self::Tls12 => rustls::ALL_VERSIONS,
            Self::Tls13 => &TLS13_ONLY,
        }
    }
}

impl TlsConfig {
    pub fn new(
        cert_path: impl Into<String>,
        key_path: impl Into<String>,
        ca_path: impl Into<String>,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_path: ca_path.into(),
            min_tls_version: TlsVersion::Tls12,
        }
    }

    /// Build from the `[tls]` config section. `None` when TLS is not
    /// configured (the `insecure` case).
    pub fn from_section(section: &TlsSection) -> Option<Self> {
        match (&section.cert_path, &section.key_path, &section.ca_path) {
            (Some(cert), Some(key), Some(ca)) => Some(Self::new(cert, key, ca)),
            _ => None,
        }
    }

    /// Set minimum TLS version.
    pub fn with_min_version(mut self, version: TlsVersion) -> Self {
        self.min_tls_version = version;
        self
    }

    /// Validate that TLS files exist.
    pub fn validate(&self) -> KvsqlResult<()> {
        for (what, path) in [
            ("certificate", &self.cert_path),
            ("private key", &self.key_path),
            ("CA", &self.ca_path),
        ] {
            if !Path::new(path).exists() {
                return Err(KvsqlError::tls(format!("TLS {} not found: {}", what, path)));
            }
        }
        Ok(())
    }

    /// Acceptor for the control-plane listener.
    pub fn acceptor(&self) -> KvsqlResult<TlsAcceptor> {
        let config = TlsServerBuilder::from_config(self)?.build()?;
        Ok(TlsAcceptor::from(config))
    }

    /// Dialer for outbound node-to-node connections.
    pub fn dialer(&self) -> KvsqlResult<TlsDialer> {
        let config = TlsClientBuilder::from_config(self)?.build()?;
        Ok(TlsDialer::new(config))
    }
}

/// Loaded TLS identity (certificate chain + private key).
#[derive(Debug)]
pub struct TlsIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Load a PEM certificate chain and private key.
    pub fn load(cert_path: &str, key_path: &str) -> KvsqlResult<Self> {
        let certs = load_certs(cert_path)?;
        if certs.is_empty() {
            return Err(KvsqlError::tls(format!("no certificates in {}", cert_path)));
        }
        let key = load_private_key(key_path)?;
        Ok(Self { certs, key })
    }

    pub fn from_der(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { certs, key }
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

/// Trusted CA roots.
#[derive(Debug, Clone)]
pub struct TrustStore {
    roots: RootCertStore,
}

impl TrustStore {
    /// Load CA certificates from a PEM bundle.
    pub fn load(ca_path: &str) -> KvsqlResult<Self> {
        let mut store = Self::empty();
        for cert in load_certs(ca_path)? {
            store.add(cert)?;
        }
        if store.is_empty() {
            return Err(KvsqlError::tls(format!("no CA certificates in {}", ca_path)));
        }
        Ok(store)
    }

    pub fn empty() -> Self {
        Self {
            roots: RootCertStore::empty(),
        }
    }

    pub fn add(&mut self, cert: CertificateDer<'static>) -> KvsqlResult<()> {
        self.roots.add(cert)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Builder for server TLS configuration.
#[derive(Debug, Default)]
pub struct TlsServerBuilder {
    identity: Option<TlsIdentity>,
    client_ca: Option<TrustStore>,
    min_version: TlsVersion,
}

impl TlsServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(mut self, identity: TlsIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// CA that client certificates must chain to.
    pub fn client_ca(mut self, trust_store: TrustStore) -> Self {
        self.client_ca = Some(trust_store);
        self
    }

    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    pub fn from_config(config: &TlsConfig) -> KvsqlResult<Self> {
        Ok(Self::new()
            .identity(TlsIdentity::load(&config.cert_path, &config.key_path)?)
            .client_ca(TrustStore::load(&config.ca_path)?)
            .min_version(config.min_tls_version))
    }

    /// Build a server config that requires a client certificate.
    pub fn build(self) -> KvsqlResult<Arc<ServerConfig>> {
        let identity = self
            .identity
            .ok_or_else(|| KvsqlError::tls("server identity not set"))?;
        let client_ca = self
            .client_ca
            .ok_or_else(|| KvsqlError::tls("client CA not set"))?;

        let provider = provider();
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(client_ca.roots), provider.clone())
                .build()
                .map_err(|e| KvsqlError::tls(format!("client verifier: {}", e)))?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(self.min_version.versions())?
            .with_client_cert_verifier(verifier)
            .with_single_cert(identity.certs, identity.key)?;
        Ok(Arc::new(config))
    }
}

/// Builder for client TLS configuration.
#[derive(Debug, Default)]
pub struct TlsClientBuilder {
    identity: Option<TlsIdentity>,
    server_ca: Option<TrustStore>,
    min_version: TlsVersion,
}

impl TlsClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client certificate presented to servers.
    pub fn identity(mut self, identity: TlsIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn server_ca(mut self, trust_store: TrustStore) -> Self {
        self.server_ca = Some(trust_store);
        self
    }

    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    pub fn from_config(config: &TlsConfig) -> KvsqlResult<Self> {
        Ok(Self::new()
            .identity(TlsIdentity::load(&config.cert_path, &config.key_path)?)
            .server_ca(TrustStore::load(&config.ca_path)?)
            .min_version(config.min_tls_version))
    }

    pub fn build(self) -> KvsqlResult<Arc<ClientConfig>> {
        let server_ca = self
            .server_ca
            .ok_or_else(|| KvsqlError::tls("server CA not set"))?;
        let builder = ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(self.min_version.versions())?
            .with_root_certificates(server_ca.roots);

        let config = match self.identity {
            Some(identity) => builder.with_client_auth_cert(identity.certs, identity.key)?,
            None => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }
}

/// Outbound TLS transport. The server name is taken from the host part of
/// the dialed address.
#[derive(Clone)]
pub struct TlsDialer {
    connector: TlsConnector,
}

impl TlsDialer {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
        }
    }

    pub async fn dial(
        &self,
        address: &str,
    ) -> KvsqlResult<tokio_rustls::client::TlsStream<TcpStream>> {
        let name = server_name(address)?;
        let tcp = TcpStream::connect(address).await?;
        tcp.set_nodelay(true)?;
        let stream = self.connector.connect(name, tcp).await?;
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TlsDialer {
    async fn connect(&self, address: &str) -> KvsqlResult<BoxStream> {
        Ok(Box::new(self.dial(address).await?))
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn server_name(address: &str) -> KvsqlResult<ServerName<'static>> {
    let host = match address.rsplit_once(':') {
        Some((host, _port)) => host,
        None => address,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| KvsqlError::tls(format!("invalid server name {}: {}", host, e)))
}

fn load_certs(path: &str) -> KvsqlResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| KvsqlError::tls(format!("failed to open certificate file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| KvsqlError::tls(format!("failed to parse certificates in {}: {}", path, e)))
}

fn load_private_key(path: &str) -> KvsqlResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| KvsqlError::tls(format!("failed to open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| KvsqlError::tls(format!("failed to parse private key in {}: {}", path, e)))?
        .ok_or_else(|| KvsqlError::tls(format!("no private key found in {}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_section_requires_all_paths() {
        let mut section = TlsSection::default();
        assert!(TlsConfig::from_section(&section).is_none());

        section.cert_path = Some("cluster.crt".to_string());
        section.key_path = Some("cluster.key".to_string());
        assert!(TlsConfig::from_section(&section).is_none());

        section.ca_path = Some("ca.crt".to_string());
        let config = TlsConfig::from_section(&section).unwrap();
        assert_eq!(config.ca_path, "ca.crt");
        assert_eq!(config.min_tls_version, TlsVersion::Tls12);
    }

    #[test]
    fn test_min_version_selects_protocols() {
        let all: Vec<_> = TlsVersion::Tls12
            .versions()
            .iter()
            .map(|v| v.version)
            .collect();
        assert!(all.contains(&rustls::ProtocolVersion::TLSv1_2));
        assert!(all.contains(&rustls::ProtocolVersion::TLSv1_3));

        let strict = TlsVersion::Tls13.versions();
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].version, rustls::ProtocolVersion::TLSv1_3);
    }

    #[test]
    fn test_validate_missing_files() {
        let config = TlsConfig::new("/nonexistent/c.crt", "/nonexistent/c.key", "/nonexistent/ca");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("certificate not found"));
    }

    #[test]
    fn test_server_name_from_address() {
        assert!(matches!(
            server_name("localhost:9000").unwrap(),
            ServerName::DnsName(_)
        ));
        assert!(matches!(
            server_name("10.0.0.1:9000").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("[::1]:9000").unwrap(),
            ServerName::IpAddress(_)
        ));
    }

    #[test]
    fn test_builders_require_material() {
        assert!(TlsServerBuilder::new().build().is_err());
        assert!(TlsClientBuilder::new().build().is_err());
    }
}
