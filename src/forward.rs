//! One forward TLS termination server per CONNECT target

use crate::context::ProxyContext;
use crate::error::Result;
use crate::server::{Flavor, MitmServer, ServerHandle};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Lazily started forward servers, keyed by `host:port`.
///
/// The first caller for a target starts the server; concurrent callers for
/// the same target wait for it and share it. A failed start leaves the slot
/// empty so a later CONNECT retries.
#[derive(Default)]
pub struct ForwardPool {
  servers: DashMap<String, Arc<OnceCell<ServerHandle>>>,
}

impl ForwardPool {
  /// Address of the server for `host:port`, starting it if needed
  pub async fn get_or_start(
    &self,
    ctx: &Arc<ProxyContext>,
    host: &str,
    port: u16,
  ) -> Result<SocketAddr> {
    let key = authority(host, port);
    let slot = self.servers.entry(key).or_default().clone();
    let handle = slot
      .get_or_try_init(|| async {
        tracing::info!("[MITM] Starting forward server for {}:{}", host, port);
        MitmServer::new(Flavor::forward_secure(host, port), ctx.clone())
          .listen()
          .await
      })
      .await?;
    Ok(handle.addr())
  }

  /// Address of the running server for `host:port`
  pub fn address(&self, host: &str, port: u16) -> Option<SocketAddr> {
    self
      .servers
      .get(&authority(host, port))
      .and_then(|slot| slot.get().map(ServerHandle::addr))
  }

  /// Number of running servers
  pub fn len(&self) -> usize {
    self
      .servers
      .iter()
      .filter(|slot| slot.value().initialized())
      .count()
  }

  /// No server is running
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

fn authority(host: &str, port: u16) -> String {
  format!("{}:{}", host.to_ascii_lowercase(), port)
}
