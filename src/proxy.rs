//! Capture proxy construction and the public listener

use crate::ca::CertificateManager;
use crate::config::CaptureConfig;
use crate::context::ProxyContext;
use crate::dispatcher::Dispatcher;
use crate::dns::{ClientResolver, NoopResolver};
use crate::error::{Error, Result};
use crate::registry::CACHE_SESSION;
use crate::server::{Flavor, MitmServer, ServerHandle};
use crate::upstream::UpstreamClient;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_rustls::rustls::crypto::ring;

/// Accept loop of the public listener, returned by [`CaptureProxy::bind`]
pub type ServeFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Capture proxy main struct
pub struct CaptureProxy {
  ctx: Arc<ProxyContext>,
  dispatcher: Arc<Dispatcher>,
  shared_servers: Vec<ServerHandle>,
}

impl CaptureProxy {
  /// Create a capture proxy with the given configuration.
  ///
  /// Loads or creates the root CA, activates the persisted routes as the
  /// cache session and starts the shared termination servers. Any failure
  /// here is fatal.
  pub async fn new(config: CaptureConfig) -> Result<Self> {
    Self::with_resolver(config, Arc::new(NoopResolver)).await
  }

  /// Like [`CaptureProxy::new`], labelling clients with `resolver`
  pub async fn with_resolver(
    config: CaptureConfig,
    resolver: Arc<dyn ClientResolver>,
  ) -> Result<Self> {
    // Another crate in the process may have installed a provider already.
    let _ = ring::default_provider().install_default();

    let certs = Arc::new(CertificateManager::new(&config.data_dir).await?);
    config.data_dir.make_ca_symlink();
    let upstream = UpstreamClient::new()?;
    let ctx = Arc::new(ProxyContext::new(config, certs, upstream, resolver));

    let configs = ctx.store().load().await?;
    ctx.apply_configs(CACHE_SESSION, configs, None).await;

    let identity = ctx.config().reverse_identity.clone();
    let reverse_secure = MitmServer::new(Flavor::reverse_secure(identity), ctx.clone())
      .listen()
      .await?;
    let reverse_plain = MitmServer::new(Flavor::reverse_plain(), ctx.clone())
      .listen()
      .await?;
    let forward_plain = MitmServer::new(Flavor::forward_plain(), ctx.clone())
      .listen()
      .await?;

    let dispatcher = Arc::new(Dispatcher::new(
      ctx.clone(),
      reverse_secure.addr(),
      reverse_plain.addr(),
      forward_plain.addr(),
    ));
    Ok(Self {
      ctx,
      dispatcher,
      shared_servers: vec![reverse_secure, reverse_plain, forward_plain],
    })
  }

  /// Create a capture proxy rooted at the current directory
  pub async fn default() -> Result<Self> {
    Self::new(CaptureConfig::default()).await
  }

  /// Get the CA certificate in PEM format
  ///
  /// This certificate should be installed in the client's trust store
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.ctx.certs.ca_cert_pem()
  }

  /// Get the CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self.ctx.certs.ca_cert_path()
  }

  /// Shared state: sessions, routes, forward servers
  pub fn context(&self) -> &Arc<ProxyContext> {
    &self.ctx
  }

  /// Local addresses of the shared reverse secure, reverse plain and
  /// forward plain termination servers
  pub fn shared_server_addrs(&self) -> Vec<SocketAddr> {
    self.shared_servers.iter().map(ServerHandle::addr).collect()
  }

  /// Bind the public listener and return its address with the future that
  /// serves it.
  pub async fn bind<A: ToSocketAddrs>(
    &self,
    addr: A,
  ) -> Result<(SocketAddr, ServeFuture)> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::connection_error(format!("Failed to bind listener: {}", e)))?;
    let local = listener.local_addr()?;
    tracing::info!("[DISPATCH] Listening on {}", local);

    let dispatcher = self.dispatcher.clone();
    Ok((local, Box::pin(async move {
      loop {
        match listener.accept().await {
          Ok((stream, peer)) => {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
              if let Err(e) = dispatcher.handle_connection(stream, peer).await {
                tracing::debug!("[DISPATCH] Connection from {} ended: {}", peer, e);
              }
            });
          }
          Err(e) => {
            tracing::error!("[DISPATCH] Failed to accept connection: {}", e);
          }
        }
      }
    })))
  }

  /// Serve on `addr` until the future is dropped
  pub async fn start<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
    let (_, serve) = self.bind(addr).await?;
    serve.await;
    Ok(())
  }
}
