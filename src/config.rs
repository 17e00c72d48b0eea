//! Proxy routes, their persisted form, and the proxy's own settings

use crate::error::{Error, Result};
use crate::paths::DataDir;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::net::TcpStream;

/// Protocol a route is configured for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigProtocol {
  /// Forward proxy traffic (browser proxy settings or CONNECT)
  #[serde(rename = "browser:")]
  Browser,
  /// gRPC
  #[serde(rename = "grpc:")]
  Grpc,
  /// Plain HTTP reverse proxy
  #[serde(rename = "http:")]
  Http,
  /// HTTPS reverse proxy
  #[serde(rename = "https:")]
  Https,
  /// Log tailing
  #[serde(rename = "log:")]
  Log,
  /// MongoDB wire protocol
  #[serde(rename = "mongo:")]
  Mongo,
  /// Redis wire protocol
  #[serde(rename = "redis:")]
  Redis,
  /// MySQL wire protocol
  #[serde(rename = "mysql:")]
  MySql,
  /// Raw TCP
  #[serde(rename = "tcp:")]
  Tcp,
}

impl ConfigProtocol {
  /// Protocols whose traffic is passed through byte-for-byte on a dedicated port
  pub fn is_raw_stream(&self) -> bool {
    matches!(
      self,
      ConfigProtocol::Tcp | ConfigProtocol::Mongo | ConfigProtocol::Redis | ConfigProtocol::MySql
    )
  }

  /// Tag as written in configuration files
  pub fn as_str(&self) -> &'static str {
    match self {
      ConfigProtocol::Browser => "browser:",
      ConfigProtocol::Grpc => "grpc:",
      ConfigProtocol::Http => "http:",
      ConfigProtocol::Https => "https:",
      ConfigProtocol::Log => "log:",
      ConfigProtocol::Mongo => "mongo:",
      ConfigProtocol::Redis => "redis:",
      ConfigProtocol::MySql => "mysql:",
      ConfigProtocol::Tcp => "tcp:",
    }
  }
}

impl fmt::Display for ConfigProtocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One configured route: which requests it captures and where they go.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
  /// Target expects TLS
  #[serde(default)]
  pub is_secure: bool,
  /// Literal prefix, or a regular expression when it contains `.*`.
  /// Raw stream protocols use it for the local port to listen on.
  pub path: String,
  /// Protocol tag
  pub protocol: ConfigProtocol,
  /// Target host name
  #[serde(default)]
  pub hostname: String,
  /// Target port, 0 for the scheme default
  #[serde(default)]
  pub port: u16,
  /// Emit captures for this route
  #[serde(default)]
  pub recording: bool,
  /// Last known reachability of the target
  #[serde(default)]
  pub host_reachable: bool,
  /// Process whose output a `log:` route tails
  #[serde(default)]
  pub log_proxy_process: String,
  /// Free text
  #[serde(default)]
  pub comment: String,
}

impl ProxyConfig {
  /// The configuration used when nothing has been persisted yet: capture all
  /// forward proxy traffic.
  pub fn defaults() -> Vec<ProxyConfig> {
    vec![ProxyConfig {
      is_secure: false,
      path: "/".to_string(),
      protocol: ConfigProtocol::Browser,
      hostname: String::new(),
      port: 0,
      recording: true,
      host_reachable: true,
      log_proxy_process: String::new(),
      comment: String::new(),
    }]
  }

  /// `hostname[:port]` of the target, if one is configured
  pub fn target_authority(&self) -> Option<String> {
    if self.hostname.is_empty() {
      return None;
    }
    Some(if self.port != 0 {
      format!("{}:{}", self.hostname, self.port)
    } else {
      self.hostname.clone()
    })
  }
}

/// Persisted form: `{ "configs": [...] }`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProxyConfigJson {
  /// Routes
  pub configs: Vec<ProxyConfig>,
}

/// Reads and rewrites the persisted configuration file wholesale.
#[derive(Clone, Debug)]
pub struct ConfigStore {
  path: PathBuf,
}

impl ConfigStore {
  /// Store backed by `path`
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  /// Location of the backing file
  pub fn path(&self) -> &PathBuf {
    &self.path
  }

  /// Load the persisted routes, falling back to [`ProxyConfig::defaults`] when
  /// nothing has been saved.
  pub async fn load(&self) -> Result<Vec<ProxyConfig>> {
    let data = match fs::read(&self.path).await {
      Ok(data) => data,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ProxyConfig::defaults()),
      Err(e) => return Err(e.into()),
    };
    let parsed: ProxyConfigJson = serde_json::from_slice(&data).map_err(|e| {
      Error::config_error(format!("Malformed {}: {}", self.path.display(), e))
    })?;
    Ok(parsed.configs)
  }

  /// Replace the persisted routes
  pub async fn save(&self, configs: &[ProxyConfig]) -> Result<()> {
    let json = ProxyConfigJson {
      configs: configs.to_vec(),
    };
    let data = serde_json::to_vec_pretty(&json)?;
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent).await?;
    }
    fs::write(&self.path, data).await?;
    Ok(())
  }
}

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Refresh `host_reachable` by dialing each route's target.
///
/// Forward proxy and log routes have no single target and are always
/// reachable. All dials run concurrently.
pub async fn check_reachability(configs: &mut [ProxyConfig]) {
  let mut dials = FuturesUnordered::new();
  for config in configs.iter_mut() {
    dials.push(async move {
      if matches!(config.protocol, ConfigProtocol::Browser | ConfigProtocol::Log) {
        config.host_reachable = true;
        return;
      }
      let Some(target) = config.target_authority().filter(|_| config.port != 0) else {
        config.host_reachable = false;
        return;
      };
      config.host_reachable = matches!(
        tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await,
        Ok(Ok(_))
      );
      tracing::debug!("[CHANNEL] {} reachable: {}", target, config.host_reachable);
    });
  }
  while dials.next().await.is_some() {}
}

/// Settings for the capture proxy
#[derive(Clone, Debug)]
pub struct CaptureConfig {
  /// Root of certificates, persisted routes and bundled UI
  pub data_dir: DataDir,
  /// Message slots an observer may have unacknowledged
  pub window_size: usize,
  /// Batches an observer may have unacknowledged
  pub max_outstanding: usize,
  /// Host name on the certificate of the shared reverse TLS server
  pub reverse_identity: String,
  /// Path of the observer control channel
  pub control_path: String,
  /// Directory served as static assets, if it exists
  pub assets_dir: Option<PathBuf>,
}

impl CaptureConfig {
  /// Default settings rooted at `data_dir`
  pub fn new(data_dir: impl Into<PathBuf>) -> Self {
    let data_dir = DataDir::new(data_dir.into());
    let assets_dir = Some(data_dir.client_dir());
    Self {
      data_dir,
      window_size: 500,
      max_outstanding: 2,
      reverse_identity: "localhost".to_string(),
      control_path: "/__capture/events".to_string(),
      assets_dir,
    }
  }

  /// Store for the persisted routes
  pub fn config_store(&self) -> ConfigStore {
    ConfigStore::new(self.data_dir.config_json())
  }
}

impl Default for CaptureConfig {
  fn default() -> Self {
    Self::new(".")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_protocol_tags() {
    let json = r#"{"configs":[{"path":"/api","protocol":"http:","hostname":"backend","port":8080,"recording":true}]}"#;
    let parsed: ProxyConfigJson = serde_json::from_str(json).unwrap();
    let config = &parsed.configs[0];
    assert_eq!(config.protocol, ConfigProtocol::Http);
    assert_eq!(config.target_authority().as_deref(), Some("backend:8080"));
    assert!(!config.is_secure);

    let out = serde_json::to_value(config).unwrap();
    assert_eq!(out["protocol"], "http:");
    assert_eq!(out["hostReachable"], false);
  }

  #[tokio::test]
  async fn test_store_round_trip_and_defaults() {
    let dir = std::env::temp_dir().join("slinger-capture-config-store");
    if dir.exists() {
      std::fs::remove_dir_all(&dir).ok();
    }
    let store = ConfigStore::new(dir.join("config.json"));
    assert_eq!(store.load().await.unwrap(), ProxyConfig::defaults());

    let mut configs = ProxyConfig::defaults();
    configs.push(ProxyConfig {
      path: "6379".to_string(),
      protocol: ConfigProtocol::Redis,
      hostname: "cache".to_string(),
      port: 6379,
      ..ProxyConfig::defaults().remove(0)
    });
    store.save(&configs).await.unwrap();
    assert_eq!(store.load().await.unwrap(), configs);

    std::fs::write(store.path(), "{").unwrap();
    assert!(matches!(store.load().await, Err(Error::ConfigError(_))));

    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn test_check_reachability() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let base = ProxyConfig::defaults().remove(0);
    let mut configs = vec![
      ProxyConfig {
        host_reachable: false,
        ..base.clone()
      },
      ProxyConfig {
        protocol: ConfigProtocol::Http,
        hostname: "127.0.0.1".to_string(),
        port,
        host_reachable: false,
        ..base.clone()
      },
      ProxyConfig {
        protocol: ConfigProtocol::Tcp,
        hostname: String::new(),
        ..base
      },
    ];
    check_reachability(&mut configs).await;
    assert!(configs[0].host_reachable);
    assert!(configs[1].host_reachable);
    assert!(!configs[2].host_reachable);
  }
}
