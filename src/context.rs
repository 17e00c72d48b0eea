//! Process-wide state shared by the dispatcher, termination servers and observers

use crate::ca::CertificateManager;
use crate::config::{check_reachability, CaptureConfig, ConfigStore, ProxyConfig};
use crate::correlation::SequenceCounter;
use crate::dns::ClientResolver;
use crate::error::Result;
use crate::forward::ForwardPool;
use crate::raw;
use crate::registry::{ObserverSession, Outbox, SessionRegistry};
use crate::upstream::UpstreamClient;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Real client behind each loopback hop into a termination server
#[derive(Default)]
pub struct ClientOrigins {
  hops: DashMap<SocketAddr, SocketAddr>,
}

impl ClientOrigins {
  /// Record that connections from `hop` carry traffic of `client`
  pub fn register(&self, hop: SocketAddr, client: SocketAddr) {
    self.hops.insert(hop, client);
  }

  /// Forget `hop`
  pub fn release(&self, hop: &SocketAddr) {
    self.hops.remove(hop);
  }

  /// The client behind `peer`, or `peer` itself for direct connections
  pub fn client_of(&self, peer: SocketAddr) -> SocketAddr {
    self.hops.get(&peer).map(|c| *c).unwrap_or(peer)
  }

  /// Hops currently registered
  pub fn len(&self) -> usize {
    self.hops.len()
  }

  /// No hop is registered
  pub fn is_empty(&self) -> bool {
    self.hops.is_empty()
  }
}

/// Shared state, created once by [`crate::CaptureProxy::new`].
pub struct ProxyContext {
  pub(crate) config: CaptureConfig,
  pub(crate) certs: Arc<CertificateManager>,
  pub(crate) store: ConfigStore,
  pub(crate) registry: SessionRegistry,
  pub(crate) sequence: SequenceCounter,
  pub(crate) upstream: UpstreamClient,
  pub(crate) resolver: Arc<dyn ClientResolver>,
  pub(crate) origins: ClientOrigins,
  pub(crate) forward: ForwardPool,
}

impl ProxyContext {
  pub(crate) fn new(
    config: CaptureConfig,
    certs: Arc<CertificateManager>,
    upstream: UpstreamClient,
    resolver: Arc<dyn ClientResolver>,
  ) -> Self {
    let store = config.config_store();
    let registry = SessionRegistry::new(config.window_size, config.max_outstanding);
    Self {
      config,
      certs,
      store,
      registry,
      sequence: SequenceCounter::new(),
      upstream,
      resolver,
      origins: ClientOrigins::default(),
      forward: ForwardPool::default(),
    }
  }

  /// Proxy settings
  pub fn config(&self) -> &CaptureConfig {
    &self.config
  }

  /// Observer sessions and route lookup
  pub fn registry(&self) -> &SessionRegistry {
    &self.registry
  }

  /// Per-host forward termination servers
  pub fn forward(&self) -> &ForwardPool {
    &self.forward
  }

  /// Hops into termination servers currently carrying client traffic
  pub fn origins(&self) -> &ClientOrigins {
    &self.origins
  }

  /// Persisted routes
  pub fn store(&self) -> &ConfigStore {
    &self.store
  }

  /// Routes to offer a newly connected observer, with reachability refreshed
  pub async fn current_configs(&self) -> Result<Vec<ProxyConfig>> {
    let mut configs = self.store.load().await?;
    check_reachability(&mut configs).await;
    Ok(configs)
  }

  /// Make `configs` the routes of session `id` and restart the raw stream
  /// listeners the session owns.
  pub async fn apply_configs(
    &self,
    id: &str,
    configs: Vec<ProxyConfig>,
    outbox: Option<Outbox>,
  ) -> Arc<ObserverSession> {
    let session = self.registry.activate(id, configs, outbox).await;
    session.shutdown_servers().await;
    for config in session.configs().iter().filter(|c| c.protocol.is_raw_stream()) {
      match raw::start(config).await {
        Ok(handle) => session.adopt_server(handle),
        Err(e) => tracing::warn!(
          "[RAW] Not listening for {} {}: {}",
          config.protocol,
          config.path,
          e
        ),
      }
    }
    session
  }
}
