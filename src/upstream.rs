//! Pooled HTTP/1.1 client for the hop from a termination server to the origin

use crate::error::{Error, Result};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, CONNECTION};
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio_rustls::rustls::crypto::ring;

const MAX_IDLE_PER_HOST: usize = 10;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers that describe one hop and are never forwarded
const HOP_BY_HOP: [&str; 9] = [
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Client used by every termination server; cheap to clone.
#[derive(Clone)]
pub struct UpstreamClient {
  client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl UpstreamClient {
  /// Client that speaks plain HTTP or HTTPS (verified against the webpki roots)
  pub fn new() -> Result<Self> {
    let connector = HttpsConnectorBuilder::new()
      .with_provider_and_webpki_roots(ring::default_provider())
      .map_err(|e| Error::tls_error(format!("Failed to build upstream TLS config: {}", e)))?
      .https_or_http()
      .enable_http1()
      .build();
    let client = Client::builder(TokioExecutor::new())
      .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
      .pool_idle_timeout(IDLE_TIMEOUT)
      .build(connector);
    Ok(Self { client })
  }

  /// Send a fully buffered request; the URI must be absolute.
  pub async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
    let target = request.uri().clone();
    self
      .client
      .request(request)
      .await
      .map_err(|e| Error::upstream_error(format!("{}: {}", target, e)))
  }
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let listed: Vec<HeaderName> = headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|value| value.to_str().ok())
    .flat_map(|value| value.split(','))
    .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
    .collect();
  for name in listed {
    headers.remove(name);
  }
  for name in HOP_BY_HOP {
    headers.remove(name);
  }
}
