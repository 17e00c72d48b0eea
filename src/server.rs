//! Local termination servers: capture each request, then reverse-proxy it
//!
//! One implementation covers all four flavors, forward or reverse crossed
//! with TLS or plain. Every instance binds an ephemeral loopback port that
//! only the dispatcher connects to.

use crate::config::{ConfigProtocol, ProxyConfig};
use crate::context::ProxyContext;
use crate::correlation::{read_sequence, stamp_sequence, InFlight};
use crate::dns::client_label;
use crate::error::{Error, Result};
use crate::message::{CaptureMessage, MessageProtocol, ObservedRequest};
use crate::upstream::strip_hop_by_hop;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::request::Parts;
use http::{HeaderValue, Request, Response, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Comment on routes made up for forward traffic nobody configured
pub const PASSTHROUGH_COMMENT: &str = "Created by slinger-capture";

/// Who chose the destination of the traffic
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
  /// The client addressed the proxy as a proxy
  Forward,
  /// The client believes the proxy is the origin
  Reverse,
}

/// What a termination server terminates and where it forwards.
#[derive(Clone, Debug)]
pub struct Flavor {
  pub direction: Direction,
  /// Terminate TLS with a leaf issued for `host`
  pub secure: bool,
  /// Forward: the origin host from the CONNECT request. Reverse: the
  /// certificate identity, or empty for plain servers.
  pub host: String,
  /// Forward: the origin port from the CONNECT request
  pub port: u16,
}

impl Flavor {
  /// Terminates a CONNECT tunnel to `host:port`
  pub fn forward_secure(host: impl Into<String>, port: u16) -> Self {
    Self {
      direction: Direction::Forward,
      secure: true,
      host: host.into(),
      port,
    }
  }

  /// Plain HTTP sent to the proxy in absolute form
  pub fn forward_plain() -> Self {
    Self {
      direction: Direction::Forward,
      secure: false,
      host: String::new(),
      port: 0,
    }
  }

  /// TLS sent straight at the proxy, presented with a leaf for `identity`
  pub fn reverse_secure(identity: impl Into<String>) -> Self {
    Self {
      direction: Direction::Reverse,
      secure: true,
      host: identity.into(),
      port: 0,
    }
  }

  /// Plain HTTP sent straight at the proxy
  pub fn reverse_plain() -> Self {
    Self {
      direction: Direction::Reverse,
      secure: false,
      host: String::new(),
      port: 0,
    }
  }

  fn is_forward(&self) -> bool {
    self.direction == Direction::Forward
  }
}

impl fmt::Display for Flavor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let direction = match self.direction {
      Direction::Forward => "forward",
      Direction::Reverse => "reverse",
    };
    let scheme = if self.secure { "https" } else { "http" };
    if self.host.is_empty() {
      write!(f, "{} {}", direction, scheme)
    } else if self.port != 0 {
      write!(f, "{} {} {}:{}", direction, scheme, self.host, self.port)
    } else {
      write!(f, "{} {} {}", direction, scheme, self.host)
    }
  }
}

/// A running listener and the task serving it.
pub struct ServerHandle {
  addr: SocketAddr,
  task: JoinHandle<()>,
}

impl ServerHandle {
  /// Wrap the accept loop `task` listening on `addr`
  pub fn new(addr: SocketAddr, task: JoinHandle<()>) -> Self {
    Self { addr, task }
  }

  /// Local address the listener is bound to
  pub fn addr(&self) -> SocketAddr {
    self.addr
  }

  /// Stop accepting. Connections already being served run to completion.
  pub async fn shutdown(self) {
    self.task.abort();
    let _ = self.task.await;
  }
}

/// A termination server instance.
pub struct MitmServer {
  flavor: Flavor,
  ctx: Arc<ProxyContext>,
  pipeline: AtomicU64,
  in_flight: InFlight,
}

impl MitmServer {
  /// An instance of `flavor`, not yet listening
  pub fn new(flavor: Flavor, ctx: Arc<ProxyContext>) -> Arc<Self> {
    Arc::new(Self {
      flavor,
      ctx,
      pipeline: AtomicU64::new(0),
      in_flight: InFlight::new(),
    })
  }

  /// Bind an ephemeral loopback port and start serving.
  ///
  /// A secure instance obtains its leaf certificate first, so issuance and
  /// bind failures are reported here rather than per connection.
  pub async fn listen(self: Arc<Self>) -> Result<ServerHandle> {
    let acceptor = if self.flavor.secure {
      let leaf = self
        .ctx
        .certs
        .issue_server_certificate(&self.flavor.host)
        .await?;
      Some(TlsAcceptor::from(Arc::new(leaf.server_config()?)))
    } else {
      None
    };

    let listener = TcpListener::bind("127.0.0.1:0")
      .await
      .map_err(|e| Error::connection_error(format!("Failed to bind {}: {}", self.flavor, e)))?;
    let addr = listener.local_addr()?;
    tracing::info!("[MITM] {} listening on {}", self.flavor, addr);

    let task = tokio::spawn(self.accept_loop(listener, acceptor));
    Ok(ServerHandle::new(addr, task))
  }

  async fn accept_loop(self: Arc<Self>, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
    loop {
      match listener.accept().await {
        Ok((stream, peer)) => {
          let server = self.clone();
          let acceptor = acceptor.clone();
          tokio::spawn(async move {
            let result = match acceptor {
              Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls) => server.serve(tls, peer).await,
                Err(e) => Err(Error::tls_error(format!(
                  "Handshake for {} failed: {}",
                  server.flavor, e
                ))),
              },
              None => server.serve(stream, peer).await,
            };
            if let Err(e) = result {
              tracing::debug!("[MITM] Connection from {} ended: {}", peer, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("[MITM] Failed to accept connection: {}", e);
        }
      }
    }
  }

  async fn serve<S>(self: Arc<Self>, io: S, peer: SocketAddr) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let service = service_fn(move |request: Request<Incoming>| {
      let server = self.clone();
      async move { server.capture_and_forward(request, peer).await }
    });
    http1::Builder::new()
      .serve_connection(TokioIo::new(io), service)
      .await?;
    Ok(())
  }

  /// Capture one request, forward it to the origin, capture the response.
  pub async fn capture_and_forward(
    &self,
    request: Request<Incoming>,
    peer: SocketAddr,
  ) -> Result<Response<Full<Bytes>>> {
    let sequence_number = self.ctx.sequence.next();
    let pipeline_number = self.pipeline.fetch_add(1, Ordering::Relaxed) + 1;
    let client = self.ctx.origins.client_of(peer);
    let label = client_label(self.ctx.resolver.as_ref(), client.ip(), &client.to_string()).await;
    let path = request.uri().path().to_string();
    tracing::debug!(
      "[MITM] {} seq={} pipeline={} {} {}",
      self.flavor,
      sequence_number,
      pipeline_number,
      request.method(),
      request.uri()
    );

    let proxy_config = match self.ctx.registry.find_match(
      self.flavor.secure,
      &label,
      &path,
      self.flavor.is_forward(),
    ) {
      Some(config) => config,
      None if self.flavor.is_forward() => self.passthrough_config(&request, &path),
      None => {
        tracing::info!("[MITM] No route for {}", path);
        return no_route(&path);
      }
    };
    // Without a configured target a reverse request could only be sent back
    // to whatever its Host header names, which may be the proxy itself.
    if !self.flavor.is_forward() && proxy_config.target_authority().is_none() {
      tracing::warn!("[MITM] Route {} has no target host", proxy_config.path);
      return bad_gateway(&format!("No target host is configured for path: {}", path));
    }

    let (parts, body) = request.into_parts();
    let body = body.collect().await?.to_bytes();

    let message = CaptureMessage::observed(ObservedRequest {
      sequence_number,
      pipeline_number,
      protocol: if self.flavor.secure {
        MessageProtocol::Https
      } else {
        MessageProtocol::Http
      },
      proxy_config,
      client_ip: client.ip().to_string(),
      method: &parts.method,
      url: parts.uri.to_string(),
      headers: &parts.headers,
      body: &body,
    });
    self.exchange(message, parts, body).await
  }

  /// Emit and park the capture, forward the request, capture the response.
  ///
  /// The parked capture leaves the in-flight table when this future finishes
  /// or is dropped, so a client that hangs up mid-request leaves no entry.
  async fn exchange(
    &self,
    mut message: CaptureMessage,
    mut parts: Parts,
    body: Bytes,
  ) -> Result<Response<Full<Bytes>>> {
    let sequence_number = message.sequence_number;
    if self.ctx.registry.emit(&message) > 0 {
      message.mark_emitted();
    }
    let _parked = self.in_flight.park(message);
    stamp_sequence(&mut parts.headers, sequence_number);

    let upstream = self.direct(parts, body)?;
    let response = self.ctx.upstream.send(upstream).await?;
    self.intercept_response(sequence_number, response).await
  }

  /// Route for forward traffic that matched nothing: pass it through to
  /// the origin the client asked for.
  fn passthrough_config(&self, request: &Request<Incoming>, path: &str) -> ProxyConfig {
    let (hostname, port) = if self.flavor.host.is_empty() {
      let authority = request.uri().authority();
      (
        authority.map(|a| a.host().to_string()).unwrap_or_default(),
        authority.and_then(|a| a.port_u16()).unwrap_or(0),
      )
    } else {
      (self.flavor.host.clone(), self.flavor.port)
    };
    ProxyConfig {
      is_secure: self.flavor.secure,
      path: path.to_string(),
      protocol: if self.flavor.secure {
        ConfigProtocol::Https
      } else {
        ConfigProtocol::Http
      },
      hostname,
      port,
      recording: true,
      host_reachable: true,
      log_proxy_process: String::new(),
      comment: PASSTHROUGH_COMMENT.to_string(),
    }
  }

  /// Rewrite the captured request for the origin.
  ///
  /// Forward traffic goes where the client asked: the CONNECT target, or the
  /// absolute URI of a plain proxy request. Reverse traffic goes to the
  /// target of the route correlated with the request's sequence number.
  fn direct(&self, mut parts: Parts, body: Bytes) -> Result<Request<Full<Bytes>>> {
    let route = read_sequence(&parts.headers).and_then(|seq| self.in_flight.proxy_config(seq));

    let authority = match self.flavor.direction {
      Direction::Forward if !self.flavor.host.is_empty() => {
        format!("{}:{}", self.flavor.host, self.flavor.port)
      }
      Direction::Forward => parts
        .uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| host_header(&parts))
        .ok_or_else(|| Error::invalid_request("Forward request without a target host"))?,
      Direction::Reverse => route
        .as_ref()
        .and_then(|r| r.target_authority())
        .ok_or_else(|| Error::invalid_request("Route has no target host"))?,
    };
    let secure = self.flavor.secure
      || route
        .as_ref()
        .is_some_and(|r| r.is_secure || r.protocol == ConfigProtocol::Https);
    let scheme = if secure { "https" } else { "http" };
    let path_and_query = parts
      .uri
      .path_and_query()
      .map(|p| p.as_str())
      .unwrap_or("/");

    parts.uri = format!("{}://{}{}", scheme, authority, path_and_query)
      .parse::<Uri>()
      .map_err(|e| Error::invalid_request(format!("Bad upstream URI: {}", e)))?;
    parts.version = Version::HTTP_11;
    strip_hop_by_hop(&mut parts.headers);
    parts.headers.insert(
      HOST,
      HeaderValue::from_str(&authority)
        .map_err(|e| Error::invalid_request(format!("Bad host {}: {}", authority, e)))?,
    );
    Ok(Request::from_parts(parts, Full::new(body)))
  }

  /// Buffer the origin's response, finish its capture, and relay it unchanged.
  async fn intercept_response(
    &self,
    sequence_number: u64,
    response: Response<Incoming>,
  ) -> Result<Response<Full<Bytes>>> {
    let (mut parts, body) = response.into_parts();
    let body = body
      .collect()
      .await
      .map_err(|e| {
        Error::upstream_error(format!(
          "Response body of seq={} failed: {}",
          sequence_number, e
        ))
      })?
      .to_bytes();
    strip_hop_by_hop(&mut parts.headers);

    match self.in_flight.take(sequence_number) {
      Some(mut message) => {
        message.complete(parts.status.as_u16(), &parts.headers, &body);
        self.ctx.registry.emit(&message);
        tracing::debug!(
          "[MITM] seq={} {} in {}ms",
          sequence_number,
          message.status,
          message.elapsed_time
        );
      }
      None => tracing::warn!("[MITM] No pending capture for seq={}", sequence_number),
    }
    Ok(Response::from_parts(parts, Full::new(body)))
  }
}

fn host_header(parts: &Parts) -> Option<String> {
  parts
    .headers
    .get(HOST)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string)
}

/// Bad Gateway naming the path nothing is configured for
fn no_route(path: &str) -> Result<Response<Full<Bytes>>> {
  bad_gateway(&format!("No capture config is defined for path: {}", path))
}

/// Bad Gateway with `reason` as the page heading
fn bad_gateway(reason: &str) -> Result<Response<Full<Bytes>>> {
  let body = format!("<h1>{}</h1>", escape_html(reason));
  Ok(
    Response::builder()
      .status(StatusCode::BAD_GATEWAY)
      .header(CONTENT_TYPE, "text/html; charset=utf-8")
      .body(Full::new(Bytes::from(body)))?,
  )
}

fn escape_html(text: &str) -> String {
  let mut escaped = String::with_capacity(text.len());
  for c in text.chars() {
    match c {
      '&' => escaped.push_str("&amp;"),
      '<' => escaped.push_str("&lt;"),
      '>' => escaped.push_str("&gt;"),
      '"' => escaped.push_str("&quot;"),
      _ => escaped.push(c),
    }
  }
  escaped
}
