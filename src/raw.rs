//! Raw stream routes (`tcp:`, `mongo:`, `redis:`, `mysql:`)
//!
//! Each route listens on the port named by its path and relays every
//! connection byte-for-byte to the route's target.

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::server::ServerHandle;
use crate::tunnel::pipe;
use tokio::net::{TcpListener, TcpStream};

/// Start the listener for `config`
pub async fn start(config: &ProxyConfig) -> Result<ServerHandle> {
  let port: u16 = config
    .path
    .trim_start_matches('/')
    .parse()
    .map_err(|_| Error::config_error(format!("{} route path is not a port: {}", config.protocol, config.path)))?;
  let target = config
    .target_authority()
    .filter(|_| config.port != 0)
    .ok_or_else(|| Error::config_error(format!("{} route on {} has no target", config.protocol, port)))?;

  let listener = TcpListener::bind(("0.0.0.0", port))
    .await
    .map_err(|e| Error::connection_error(format!("Failed to bind port {}: {}", port, e)))?;
  let addr = listener.local_addr()?;
  tracing::info!("[RAW] {} {} -> {}", config.protocol, addr, target);

  let task = tokio::spawn(async move {
    loop {
      match listener.accept().await {
        Ok((client, peer)) => {
          let target = target.clone();
          tokio::spawn(async move {
            match TcpStream::connect(&target).await {
              Ok(origin) => {
                let (sent, received) = pipe(client, origin).await;
                tracing::debug!(
                  "[RAW] {} -> {} closed ({} out, {} in)",
                  peer,
                  target,
                  sent,
                  received
                );
              }
              Err(e) => tracing::warn!("[RAW] Failed to connect to {}: {}", target, e),
            }
          });
        }
        Err(e) => tracing::error!("[RAW] Failed to accept connection: {}", e),
      }
    }
  });
  Ok(ServerHandle::new(addr, task))
}
