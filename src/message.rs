//! Captured request/response records delivered to observers

use crate::config::ProxyConfig;
use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Placeholder response body of a request that has not been answered yet
pub const NO_RESPONSE: &str = "No Response";

/// Stage of a capture, serialized as `0`, `1` or `2`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
  /// The request was observed, no response yet
  Request,
  /// The response to an already delivered request
  Response,
  /// Request and response in one record
  RequestAndResponse,
}

impl Serialize for MessageType {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let code = match self {
      MessageType::Request => 0,
      MessageType::Response => 1,
      MessageType::RequestAndResponse => 2,
    };
    serializer.serialize_u8(code)
  }
}

/// Scheme the capture was made on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum MessageProtocol {
  /// Plain HTTP
  #[serde(rename = "http:")]
  Http,
  /// HTTP inside TLS
  #[serde(rename = "https:")]
  Https,
}

/// A captured request/response pair
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMessage {
  #[serde(rename = "type")]
  pub message_type: MessageType,
  /// Milliseconds since the epoch when the request arrived
  pub timestamp: u64,
  pub sequence_number: u64,
  pub request_headers: BTreeMap<String, String>,
  pub response_headers: BTreeMap<String, String>,
  pub method: String,
  pub protocol: MessageProtocol,
  pub url: String,
  pub endpoint: String,
  pub request_body: Value,
  pub response_body: Value,
  pub client_ip: String,
  pub server_host: String,
  pub path: String,
  /// Milliseconds between request arrival and response arrival
  pub elapsed_time: u64,
  pub status: u16,
  pub proxy_config: ProxyConfig,
  /// Per-server request counter, diagnostic only
  #[serde(skip)]
  pub pipeline_number: u64,
  #[serde(skip)]
  started: Instant,
  #[serde(skip)]
  emit_count: usize,
}

/// What the termination server knows about a request when it first sees it
pub struct ObservedRequest<'a> {
  pub sequence_number: u64,
  pub pipeline_number: u64,
  pub protocol: MessageProtocol,
  pub proxy_config: ProxyConfig,
  pub client_ip: String,
  pub method: &'a Method,
  pub url: String,
  pub headers: &'a HeaderMap,
  pub body: &'a Bytes,
}

impl CaptureMessage {
  /// Build the request-stage record
  pub fn observed(request: ObservedRequest<'_>) -> Self {
    let request_body = parse_body(request.body);
    let endpoint = infer_endpoint(request.method, &request.url, &request_body);
    let server_host = server_host(&request.proxy_config, request.headers);
    let timestamp = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_millis() as u64)
      .unwrap_or(0);
    Self {
      message_type: MessageType::Request,
      timestamp,
      sequence_number: request.sequence_number,
      request_headers: first_values(request.headers),
      response_headers: BTreeMap::new(),
      method: request.method.to_string(),
      protocol: request.protocol,
      url: request.url,
      endpoint,
      request_body,
      response_body: Value::String(NO_RESPONSE.to_string()),
      client_ip: request.client_ip,
      server_host,
      path: request.proxy_config.path.clone(),
      elapsed_time: 0,
      status: 0,
      proxy_config: request.proxy_config,
      pipeline_number: request.pipeline_number,
      started: Instant::now(),
      emit_count: 0,
    }
  }

  /// Fill in the response fields.
  ///
  /// The record becomes [`MessageType::RequestAndResponse`] unless an observer
  /// already received its request stage.
  pub fn complete(&mut self, status: u16, headers: &HeaderMap, body: &Bytes) {
    self.status = status;
    self.response_headers = first_values(headers);
    self.response_body = parse_body(body);
    self.elapsed_time = self.started.elapsed().as_millis() as u64;
    self.message_type = if self.emit_count == 0 {
      MessageType::RequestAndResponse
    } else {
      MessageType::Response
    };
  }

  /// Record that at least one observer was sent this record
  pub fn mark_emitted(&mut self) {
    self.emit_count += 1;
  }
}

/// Keep the first value of every header, lossily decoded
pub fn first_values(headers: &HeaderMap) -> BTreeMap<String, String> {
  let mut out = BTreeMap::new();
  for (name, value) in headers {
    out
      .entry(name.as_str().to_string())
      .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
  }
  out
}

/// JSON objects and arrays are kept structured, anything else as text.
pub fn parse_body(body: &Bytes) -> Value {
  match serde_json::from_slice::<Value>(body) {
    Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
    _ => Value::String(String::from_utf8_lossy(body).into_owned()),
  }
}

/// Short label for a request, shown in the observer's list.
///
/// The last path segment, with the one before it when the last is numeric
/// (`/orders/42` gives `orders/42`). GraphQL endpoints are labelled `GQL` (or
/// `GQLP` for `/graphql-public`) followed by the operation names in the body.
pub fn infer_endpoint(method: &Method, url: &str, request_body: &Value) -> String {
  let path = url.split(['?', '#']).next().unwrap_or_default();

  if method != Method::OPTIONS {
    let tag = if path.ends_with("/graphql") {
      Some("GQL")
    } else if path.ends_with("/graphql-public") {
      Some("GQLP")
    } else {
      None
    };
    if let Some(tag) = tag {
      let operations = operation_names(request_body);
      return if operations.is_empty() {
        tag.to_string()
      } else {
        format!("{} {}", tag, operations.join(", "))
      };
    }
  }

  let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
  match segments.as_slice() {
    [] => String::new(),
    [.., previous, last] if last.parse::<i64>().is_ok() => format!("{}/{}", previous, last),
    [.., last] => last.to_string(),
  }
}

fn operation_names(body: &Value) -> Vec<String> {
  let operation = |value: &Value| {
    value
      .get("operationName")
      .and_then(Value::as_str)
      .map(str::to_string)
  };
  match body {
    Value::Array(batch) => batch.iter().filter_map(operation).collect(),
    other => operation(other).into_iter().collect(),
  }
}

fn server_host(proxy_config: &ProxyConfig, headers: &HeaderMap) -> String {
  proxy_config
    .target_authority()
    .or_else(|| {
      headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    })
    .unwrap_or_else(|| "Unknown".to_string())
}
