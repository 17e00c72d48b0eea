//! Public listener: sniff each connection and route it
//!
//! The first bytes are peeked rather than read, so whatever the connection is
//! handed to sees them again.

use crate::assets::StaticAssets;
use crate::channel;
use crate::context::ProxyContext;
use crate::error::{Error, Result};
use crate::tunnel::pipe;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const SNIFF_LEN: usize = 1024;
const SNIFF_ATTEMPTS: usize = 20;
const SNIFF_RETRY: Duration = Duration::from_millis(5);
const MAX_CONNECT_HEAD: usize = 16 * 1024;

/// Reply to a CONNECT once the termination server is ready
pub const CONNECT_ESTABLISHED: &[u8] =
  b"HTTP/1.1 200 Connection Established\r\nProxy-agent: slinger-capture\r\n\r\n";

/// What the first bytes of a connection look like
#[derive(Debug, PartialEq, Eq)]
pub enum Sniffed {
  /// `CONNECT host:port HTTP/1.1`
  Connect,
  /// TLS handshake record
  ClientHello,
  /// Anything else, assumed to be plain HTTP
  Http {
    /// Request path without the query
    path: String,
    /// Request target was in absolute form (`http://host/...`)
    absolute: bool,
  },
}

/// Classify a connection by its first bytes
pub fn sniff(prefix: &[u8]) -> Sniffed {
  if prefix.starts_with(b"CONNECT") {
    return Sniffed::Connect;
  }
  if prefix.len() >= 3 && prefix[..3] == [0x16, 0x03, 0x01] {
    return Sniffed::ClientHello;
  }
  let line = prefix.split(|b| *b == b'\n').next().unwrap_or_default();
  let line = String::from_utf8_lossy(line);
  let target = line.split_whitespace().nth(1).unwrap_or("/");
  let (absolute, path) = match target.strip_prefix("http://") {
    Some(rest) => (true, rest.find('/').map(|i| &rest[i..]).unwrap_or("/")),
    None => (false, target),
  };
  let path = path.split(['?', '#']).next().unwrap_or("/");
  Sniffed::Http {
    path: path.to_string(),
    absolute,
  }
}

/// Whether `prefix` can be classified without waiting for more bytes.
///
/// A TLS record needs its three-byte header; anything else needs a full
/// request line or a full sniff buffer.
fn enough_to_sniff(prefix: &[u8]) -> bool {
  match prefix.first() {
    Some(0x16) => prefix.len() >= 3,
    Some(_) => prefix.contains(&b'\n') || prefix.len() == SNIFF_LEN,
    None => false,
  }
}

/// Host and port of a CONNECT request head. The port defaults to 443.
pub fn parse_connect_target(head: &str) -> Result<(String, u16)> {
  let target = head
    .split_whitespace()
    .nth(1)
    .ok_or_else(|| Error::invalid_request("CONNECT without a target"))?;
  let (host, port) = if let Some(rest) = target.strip_prefix('[') {
    let (host, after) = rest
      .split_once(']')
      .ok_or_else(|| Error::invalid_request(format!("Invalid CONNECT target: {}", target)))?;
    (host, after.strip_prefix(':'))
  } else {
    match target.rsplit_once(':') {
      Some((host, port)) => (host, Some(port)),
      None => (target, None),
    }
  };
  if host.is_empty() {
    return Err(Error::invalid_request(format!("Invalid CONNECT target: {}", target)));
  }
  let port = match port {
    Some(port) => port
      .parse::<u16>()
      .map_err(|_| Error::invalid_request(format!("Invalid port: {}", port)))?,
    None => 443,
  };
  Ok((host.to_string(), port))
}

/// Routes accepted connections. Shared by every connection task.
pub struct Dispatcher {
  ctx: Arc<ProxyContext>,
  assets: Arc<StaticAssets>,
  reverse_secure: SocketAddr,
  reverse_plain: SocketAddr,
  forward_plain: SocketAddr,
}

impl Dispatcher {
  /// Dispatcher relaying into the given shared termination servers
  pub fn new(
    ctx: Arc<ProxyContext>,
    reverse_secure: SocketAddr,
    reverse_plain: SocketAddr,
    forward_plain: SocketAddr,
  ) -> Self {
    let assets = Arc::new(StaticAssets::new(ctx.config().assets_dir.clone()));
    Self {
      ctx,
      assets,
      reverse_secure,
      reverse_plain,
      forward_plain,
    }
  }

  /// Handle one accepted connection to completion
  pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut buf = [0u8; SNIFF_LEN];
    let mut n = 0;
    for _ in 0..SNIFF_ATTEMPTS {
      n = stream.peek(&mut buf).await?;
      if n == 0 {
        return Ok(());
      }
      if enough_to_sniff(&buf[..n]) {
        break;
      }
      tokio::time::sleep(SNIFF_RETRY).await;
    }

    match sniff(&buf[..n]) {
      Sniffed::Connect => self.connect(stream, peer).await,
      Sniffed::ClientHello => {
        tracing::debug!("[DISPATCH] {} TLS -> reverse secure", peer);
        self.relay(stream, peer, self.reverse_secure).await
      }
      Sniffed::Http { path, absolute } => {
        if path == self.ctx.config().control_path {
          tracing::debug!("[DISPATCH] {} control channel", peer);
          channel::serve(self.ctx.clone(), stream, peer).await
        } else if !absolute && self.assets.resolve(&path).await.is_some() {
          tracing::debug!("[DISPATCH] {} asset {}", peer, path);
          self.assets.clone().serve(stream).await
        } else if absolute {
          tracing::debug!("[DISPATCH] {} HTTP {} -> forward plain", peer, path);
          self.relay(stream, peer, self.forward_plain).await
        } else {
          tracing::debug!("[DISPATCH] {} HTTP {} -> reverse plain", peer, path);
          self.relay(stream, peer, self.reverse_plain).await
        }
      }
    }
  }

  /// Consume the CONNECT head, start or reuse the forward server for its
  /// target, confirm to the client and tunnel into the server.
  async fn connect(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let head = read_head(&mut stream).await?;
    let (host, port) = parse_connect_target(&head)?;
    tracing::info!("[DISPATCH] {} CONNECT {}:{}", peer, host, port);

    let server = match self.ctx.forward().get_or_start(&self.ctx, &host, port).await {
      Ok(addr) => addr,
      Err(e) => {
        let _ = stream
          .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
          .await;
        return Err(e);
      }
    };
    let upstream = self.open_hop(server, peer).await?;
    let hop = upstream.local_addr()?;
    let established = stream.write_all(CONNECT_ESTABLISHED).await;
    if let Err(e) = established {
      self.ctx.origins().release(&hop);
      return Err(e.into());
    }
    pipe(stream, upstream).await;
    self.ctx.origins().release(&hop);
    Ok(())
  }

  /// Tunnel the connection, unread bytes included, into a termination server
  async fn relay(&self, stream: TcpStream, peer: SocketAddr, server: SocketAddr) -> Result<()> {
    let upstream = self.open_hop(server, peer).await?;
    let hop = upstream.local_addr()?;
    pipe(stream, upstream).await;
    self.ctx.origins().release(&hop);
    Ok(())
  }

  /// Connect to a termination server and record whose traffic the hop carries
  async fn open_hop(&self, server: SocketAddr, peer: SocketAddr) -> Result<TcpStream> {
    let upstream = TcpStream::connect(server)
      .await
      .map_err(|e| Error::connection_error(format!("Failed to connect to {}: {}", server, e)))?;
    self.ctx.origins().register(upstream.local_addr()?, peer);
    Ok(upstream)
  }
}

/// Read up to and including the blank line ending a request head
async fn read_head(stream: &mut TcpStream) -> Result<String> {
  let mut head = Vec::with_capacity(256);
  while !head.ends_with(b"\r\n\r\n") && !head.ends_with(b"\n\n") {
    if head.len() >= MAX_CONNECT_HEAD {
      return Err(Error::invalid_request("CONNECT head exceeds maximum allowed"));
    }
    head.push(stream.read_u8().await?);
  }
  Ok(String::from_utf8_lossy(&head).into_owned())
}
