//! On-disk layout of the capture proxy data directory

use std::path::{Path, PathBuf};

const STORE_DIR: &str = ".slinger-capture";
/// File name of the persisted root certificate
pub const CA_CERT_NAME: &str = "ca.pem";
/// File name of the persisted root private key
pub const CA_KEY_NAME: &str = "ca.private.key";

/// Resolves every path the proxy reads or writes below a single data directory.
#[derive(Clone, Debug)]
pub struct DataDir {
  root: PathBuf,
}

impl DataDir {
  /// Create a layout rooted at `root`
  pub fn new(root: impl AsRef<Path>) -> Self {
    Self {
      root: root.as_ref().to_path_buf(),
    }
  }

  /// The data directory itself
  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Directory holding the root and per-host certificates
  pub fn certs_dir(&self) -> PathBuf {
    self.root.join(STORE_DIR).join("certs")
  }

  /// Directory holding the root and per-host private keys
  pub fn keys_dir(&self) -> PathBuf {
    self.root.join(STORE_DIR).join("keys")
  }

  /// Persisted proxy configuration
  pub fn config_json(&self) -> PathBuf {
    self.root.join("config.json")
  }

  /// Bundled UI assets
  pub fn client_dir(&self) -> PathBuf {
    self.root.join("client").join("build")
  }

  /// Well-known location of the root certificate for trust installation
  pub fn ca_pem_link(&self) -> PathBuf {
    self.root.join(CA_CERT_NAME)
  }

  /// Point `<data>/ca.pem` at the persisted root certificate.
  ///
  /// An existing link or file is left alone.
  pub fn make_ca_symlink(&self) {
    let link = self.ca_pem_link();
    if link.symlink_metadata().is_ok() {
      return;
    }
    // Relative to the directory holding the link, so it survives a relative
    // or relocated data dir.
    #[cfg(unix)]
    let result = std::os::unix::fs::symlink(
      Path::new(STORE_DIR).join("certs").join(CA_CERT_NAME),
      &link,
    );
    #[cfg(not(unix))]
    let result = std::fs::copy(self.certs_dir().join(CA_CERT_NAME), &link).map(|_| ());
    if let Err(e) = result {
      tracing::warn!("[CA] Failed to link {}: {}", link.display(), e);
    }
  }
}
