//! Certificate Authority (CA) management for the termination servers
//!
//! The root key and certificate are created once and persisted under the data
//! directory. Leaf certificates are issued lazily per host, written next to the
//! root, and reused on every later request for the same host.
//!

use crate::error::{Error, Result};
use crate::paths::{DataDir, CA_CERT_NAME, CA_KEY_NAME};
use moka::future::Cache;
use rand::RngCore;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose, PublicKeyData, SanType, SerialNumber,
};
use sha1::{Digest, Sha1};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Certificate validity period in days (10 years)
const VALIDITY_DAYS: i64 = 3650;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Upper bound on parsed leaf certificates kept in memory
const CACHE_CAPACITY: u64 = 10_000;

/// Certificate Authority for generating certificates
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  certs_dir: PathBuf,
  keys_dir: PathBuf,
}

impl CertificateAuthority {
  /// Load the root CA from the data directory, or generate and persist a new one.
  ///
  /// An existing but unreadable or malformed root is an error; callers treat it
  /// as fatal.
  pub async fn new(data_dir: &DataDir) -> Result<Self> {
    let certs_dir = data_dir.certs_dir();
    let keys_dir = data_dir.keys_dir();
    fs::create_dir_all(&certs_dir).await?;
    fs::create_dir_all(&keys_dir).await?;

    let ca_cert_path = certs_dir.join(CA_CERT_NAME);
    let ca_key_path = keys_dir.join(CA_KEY_NAME);

    let (issuer, ca_cert_der) = if ca_cert_path.exists() {
      tracing::info!("[CA] Loading root from {}", ca_cert_path.display());
      Self::load_ca(&ca_cert_path, &ca_key_path).await?
    } else {
      tracing::info!("[CA] Generating root at {}", ca_cert_path.display());
      Self::generate_ca(&ca_cert_path, &ca_key_path).await?
    };

    Ok(Self {
      issuer,
      ca_cert_der,
      certs_dir,
      keys_dir,
    })
  }

  /// Load existing CA certificate and key
  async fn load_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let cert_pem = fs::read_to_string(cert_path).await.map_err(|e| {
      Error::certificate_error(format!("Failed to read {}: {}", cert_path.display(), e))
    })?;
    let key_pem = fs::read_to_string(key_path).await.map_err(|e| {
      Error::certificate_error(format!("Failed to read {}: {}", key_path.display(), e))
    })?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| {
      Error::certificate_error(format!("Failed to create issuer from CA cert: {}", e))
    })?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("No certificate found in PEM"))?
      .map_err(|e| Error::certificate_error(format!("Failed to parse PEM: {}", e)))?;

    Ok((issuer, cert_der))
  }

  /// Generate a new CA certificate and key
  async fn generate_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Slinger Capture CA");
    dn.push(DnType::OrganizationName, "Emo-Crab");
    dn.push(DnType::OrganizationalUnitName, "CA");
    dn.push(DnType::LocalityName, "Internet");
    dn.push(DnType::StateOrProvinceName, "World");
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::ContentCommitment,
      KeyUsagePurpose::KeyEncipherment,
      KeyUsagePurpose::DataEncipherment,
    ];
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ClientAuth,
      ExtendedKeyUsagePurpose::ServerAuth,
      ExtendedKeyUsagePurpose::CodeSigning,
      ExtendedKeyUsagePurpose::EmailProtection,
      ExtendedKeyUsagePurpose::TimeStamping,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    let key_pair = generate_key_pair()?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    fs::write(key_path, key_pair.serialize_pem()).await?;
    fs::write(cert_path, cert_pem.as_bytes()).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to create issuer: {}", e)))?;

    Ok((issuer, cert_der))
  }

  /// Paths a leaf certificate and key for `host` are stored under
  fn leaf_paths(&self, host: &str) -> (PathBuf, PathBuf) {
    (
      self.certs_dir.join(format!("{}.pem", host)),
      self.keys_dir.join(format!("{}.key", host)),
    )
  }

  /// Generate a server certificate signed by this CA, returning `(cert_pem, key_pem)`
  fn generate_server_cert(&self, host: &str) -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::OrganizationName, "Slinger Capture Server Certificate");
    dn.push(DnType::OrganizationalUnitName, "Slinger Capture Server Certificate");
    params.distinguished_name = dn;

    // IP literals get both an IP SAN and a DNS SAN; clients disagree on which
    // one they check.
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate_error(format!("Invalid domain name: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
      KeyUsagePurpose::DataEncipherment,
    ];
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ServerAuth,
      ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let key_pair = generate_key_pair()?;
    params.key_identifier_method = KeyIdMethod::PreSpecified(subject_key_id(&key_pair));

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign server cert: {}", e)))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
  }

  /// Read the leaf for `host` from disk, issuing and persisting it first if absent.
  async fn load_or_issue(self: Arc<Self>, host: String) -> Result<LeafCertificate> {
    let (cert_path, key_path) = self.leaf_paths(&host);

    let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
      tracing::debug!("[CA] Reusing leaf for {}", host);
      (
        fs::read_to_string(&cert_path).await?,
        fs::read_to_string(&key_path).await?,
      )
    } else {
      tracing::info!("[CA] Issuing leaf for {}", host);
      let ca = self.clone();
      let name = host.clone();
      let (cert_pem, key_pem) = tokio::task::spawn_blocking(move || ca.generate_server_cert(&name))
        .await
        .map_err(|e| Error::other(format!("Leaf issuance task failed: {}", e)))??;
      fs::write(&key_path, key_pem.as_bytes()).await?;
      fs::write(&cert_path, cert_pem.as_bytes()).await?;
      (cert_pem, key_pem)
    };

    LeafCertificate::from_pem(
      host,
      cert_path,
      key_path,
      &cert_pem,
      &key_pem,
      &self.ca_cert_der,
    )
  }

  /// Get CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self.certs_dir.join(CA_CERT_NAME)
  }
}

/// A host certificate issued by the root, with the material needed to serve TLS.
pub struct LeafCertificate {
  /// Host the certificate was issued for
  pub host: String,
  /// Where the PEM certificate is persisted
  pub cert_path: PathBuf,
  /// Where the PEM private key is persisted
  pub key_path: PathBuf,
  cert_pem: String,
  key_pem: String,
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
}

impl LeafCertificate {
  fn from_pem(
    host: String,
    cert_path: PathBuf,
    key_path: PathBuf,
    cert_pem: &str,
    key_pem: &str,
    ca_cert_der: &CertificateDer<'static>,
  ) -> Result<Self> {
    let mut cert_chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .collect::<std::result::Result<Vec<_>, _>>()
      .map_err(|e| Error::certificate_error(format!("Failed to parse {}: {}", host, e)))?;
    if cert_chain.is_empty() {
      return Err(Error::certificate_error(format!(
        "No certificate found in {}",
        cert_path.display()
      )));
    }
    cert_chain.push(ca_cert_der.clone());

    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
      .map_err(|e| Error::certificate_error(format!("Failed to parse key for {}: {}", host, e)))?
      .ok_or_else(|| {
        Error::certificate_error(format!("No private key found in {}", key_path.display()))
      })?;

    Ok(Self {
      host,
      cert_path,
      key_path,
      cert_pem: cert_pem.to_string(),
      key_pem: key_pem.to_string(),
      cert_chain,
      key,
    })
  }

  /// PEM encoded certificate
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }

  /// PEM encoded private key
  pub fn key_pem(&self) -> &str {
    &self.key_pem
  }

  /// Chain served to clients: `[leaf, root]`
  pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
    &self.cert_chain
  }

  /// Build a TLS server configuration presenting this certificate
  pub fn server_config(&self) -> Result<ServerConfig> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
      .with_safe_default_protocol_versions()
      .map_err(|e| Error::tls_error(format!("Failed to select TLS versions: {}", e)))?
      .with_no_client_auth()
      .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
      .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))?;
    // The termination servers only speak HTTP/1.1.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
  }
}

/// Manager for caching issued server certificates
pub struct CertificateManager {
  ca: Arc<CertificateAuthority>,
  /// Parsed leaves, keyed by host
  cert_cache: Cache<String, Arc<LeafCertificate>>,
}

impl CertificateManager {
  /// Create a new certificate manager, loading or generating the root CA
  pub async fn new(data_dir: &DataDir) -> Result<Self> {
    let ca = Arc::new(CertificateAuthority::new(data_dir).await?);
    let cert_cache = Cache::builder().max_capacity(CACHE_CAPACITY).build();
    Ok(Self { ca, cert_cache })
  }

  /// Return the leaf certificate for `host`, issuing it on first use.
  ///
  /// Concurrent callers for the same host share one issuance, and a host that
  /// already has a certificate on disk is never re-issued.
  pub async fn issue_server_certificate(&self, host: &str) -> Result<Arc<LeafCertificate>> {
    let host = normalize_host(host)?;
    let ca = self.ca.clone();
    self
      .cert_cache
      .try_get_with(host.clone(), async move { ca.load_or_issue(host).await.map(Arc::new) })
      .await
      .map_err(|e| Error::certificate_error(e.to_string()))
  }

  /// Get the CA certificate in PEM format
  pub fn ca_cert_pem(&self) -> Result<String> {
    let path = self.ca.ca_cert_path();
    std::fs::read_to_string(&path)
      .map_err(|e| Error::certificate_error(format!("Failed to read CA cert: {}", e)))
  }

  /// Get the CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca.ca_cert_path()
  }
}

/// RSA-2048 where the crypto backend can generate it, ECDSA P-256 otherwise.
fn generate_key_pair() -> Result<KeyPair> {
  KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
    .or_else(|_| KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256))
    .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))
}

/// Positive 128-bit serial with a non-zero leading byte
fn random_serial() -> SerialNumber {
  let mut bytes = [0u8; 16];
  rand::thread_rng().fill_bytes(&mut bytes);
  bytes[0] = (bytes[0] & 0x7f).max(1);
  SerialNumber::from(bytes.to_vec())
}

/// SHA-1 over the DER-encoded SubjectPublicKeyInfo (RFC 5280 4.2.1.2)
fn subject_key_id(key_pair: &KeyPair) -> Vec<u8> {
  Sha1::digest(key_pair.subject_public_key_info()).to_vec()
}

/// Lowercase the host and refuse names that cannot be used as a file name.
fn normalize_host(host: &str) -> Result<String> {
  let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
  let unsafe_name = host.is_empty()
    || host == "ca"
    || host.contains("..")
    || host
      .chars()
      .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_whitespace());
  if unsafe_name {
    return Err(Error::certificate_error(format!(
      "Refusing to issue a certificate for {:?}",
      host
    )));
  }
  Ok(host)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn temp_data_dir(name: &str) -> DataDir {
    let dir = std::env::temp_dir().join(name);
    if dir.exists() {
      std::fs::remove_dir_all(&dir).ok();
    }
    DataDir::new(dir)
  }

  #[tokio::test]
  async fn test_root_is_persisted_and_reloaded() {
    let data_dir = temp_data_dir("slinger-capture-ca-reload");
    let first = CertificateManager::new(&data_dir).await.unwrap();
    let pem = first.ca_cert_pem().unwrap();
    assert!(pem.contains("BEGIN CERTIFICATE"));
    assert!(data_dir.keys_dir().join(CA_KEY_NAME).exists());

    let second = CertificateManager::new(&data_dir).await.unwrap();
    assert_eq!(second.ca_cert_pem().unwrap(), pem);

    std::fs::remove_dir_all(data_dir.root()).ok();
  }

  #[tokio::test]
  async fn test_malformed_root_key_is_rejected() {
    let data_dir = temp_data_dir("slinger-capture-ca-malformed");
    CertificateManager::new(&data_dir).await.unwrap();
    std::fs::write(data_dir.keys_dir().join(CA_KEY_NAME), "not a key").unwrap();

    let result = CertificateManager::new(&data_dir).await;
    assert!(matches!(result, Err(Error::CertificateError(_))));

    std::fs::remove_dir_all(data_dir.root()).ok();
  }

  #[tokio::test]
  async fn test_leaf_issuance_is_idempotent() {
    let data_dir = temp_data_dir("slinger-capture-ca-idempotent");
    let manager = CertificateManager::new(&data_dir).await.unwrap();

    let first = manager.issue_server_certificate("example.com").await.unwrap();
    let second = manager.issue_server_certificate("example.com").await.unwrap();
    assert_eq!(first.cert_pem(), second.cert_pem());
    assert_eq!(first.key_pem(), second.key_pem());
    assert!(first.cert_path.exists());
    assert!(first.key_path.exists());

    // A fresh manager has an empty memory cache and must reuse the files.
    let reloaded = CertificateManager::new(&data_dir).await.unwrap();
    let third = reloaded.issue_server_certificate("Example.COM").await.unwrap();
    assert_eq!(first.cert_pem(), third.cert_pem());
    assert_eq!(first.key_pem(), third.key_pem());

    std::fs::remove_dir_all(data_dir.root()).ok();
  }

  #[tokio::test]
  async fn test_leaf_serves_tls() {
    let data_dir = temp_data_dir("slinger-capture-ca-tls");
    let manager = CertificateManager::new(&data_dir).await.unwrap();

    let leaf = manager.issue_server_certificate("127.0.0.1").await.unwrap();
    assert_eq!(leaf.cert_chain().len(), 2);
    let config = leaf.server_config().unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);

    std::fs::remove_dir_all(data_dir.root()).ok();
  }

  #[test]
  fn test_unsafe_hosts_are_refused() {
    assert!(normalize_host("../etc").is_err());
    assert!(normalize_host("a/b").is_err());
    assert!(normalize_host("").is_err());
    assert!(normalize_host("ca").is_err());
    assert_eq!(normalize_host("Example.com.").unwrap(), "example.com");
  }
}
