//! Integration tests for slinger-capture

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use slinger_capture::{
  CaptureConfig, CaptureProxy, ConfigProtocol, MessageType, ProxyConfig, CONNECT_ESTABLISHED,
  SEQUENCE_HEADER,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::protocol::Message;

const WAIT: Duration = Duration::from_secs(5);

/// Origin answering every request with its path and whether it carried the
/// sequence header
async fn start_origin() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else {
        continue;
      };
      tokio::spawn(async move {
        let service = service_fn(|request: hyper::Request<hyper::body::Incoming>| async move {
          let body = json!({
            "path": request.uri().path(),
            "correlated": request.headers().contains_key(SEQUENCE_HEADER),
          });
          Ok::<_, Infallible>(
            hyper::Response::builder()
              .header("content-type", "application/json")
              .body(Full::new(Bytes::from(body.to_string())))
              .unwrap(),
          )
        });
        let _ = http1::Builder::new()
          .serve_connection(TokioIo::new(stream), service)
          .await;
      });
    }
  });
  addr
}

fn fresh_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(name);
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

async fn start_proxy(dir: &PathBuf) -> (CaptureProxy, SocketAddr) {
  let proxy = CaptureProxy::new(CaptureConfig::new(dir)).await.unwrap();
  let (addr, serve) = proxy.bind("127.0.0.1:0").await.unwrap();
  tokio::spawn(serve);
  (proxy, addr)
}

fn origin_route(path: &str, origin: SocketAddr) -> ProxyConfig {
  ProxyConfig {
    path: path.to_string(),
    protocol: ConfigProtocol::Http,
    hostname: "127.0.0.1".to_string(),
    port: origin.port(),
    ..ProxyConfig::defaults().remove(0)
  }
}

/// Write `request` and read until the peer closes or `until` shows up
async fn exchange<S>(mut stream: S, request: &str, until: &str) -> String
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  stream.write_all(request.as_bytes()).await.unwrap();
  let mut response = Vec::new();
  let mut buf = [0u8; 4096];
  loop {
    match timeout(WAIT, stream.read(&mut buf)).await.unwrap() {
      Ok(0) | Err(_) => break,
      Ok(n) => {
        response.extend_from_slice(&buf[..n]);
        if String::from_utf8_lossy(&response).contains(until) {
          break;
        }
      }
    }
  }
  String::from_utf8_lossy(&response).into_owned()
}

fn tls_connector(proxy: &CaptureProxy) -> TlsConnector {
  let mut roots = RootCertStore::empty();
  let pem = proxy.ca_cert_pem().unwrap();
  for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
    roots.add(cert.unwrap()).unwrap();
  }
  let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn test_reverse_capture_round_trip() {
  let origin = start_origin().await;
  let dir = fresh_dir("slinger-capture-it-reverse");
  let (proxy, addr) = start_proxy(&dir).await;

  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  let registry = proxy.context().registry();
  registry
    .activate("observer", vec![origin_route("/api", origin)], Some(tx))
    .await;

  let stream = TcpStream::connect(addr).await.unwrap();
  let response = exchange(
    stream,
    "GET /api/orders/42 HTTP/1.1\r\nHost: shop.local\r\nConnection: close\r\n\r\n",
    "}",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
  assert!(response.contains(r#""correlated":true"#), "{}", response);

  let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
  assert_eq!(first.messages.len(), 1);
  let request = &first.messages[0];
  assert_eq!(request.message_type, MessageType::Request);
  assert_eq!(request.endpoint, "orders/42");
  assert_eq!(request.client_ip, "127.0.0.1");
  assert_eq!(request.server_host, format!("127.0.0.1:{}", origin.port()));
  assert!(registry.acknowledge("observer", first.id));

  let second = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
  let response = &second.messages[0];
  assert_eq!(response.message_type, MessageType::Response);
  assert_eq!(response.sequence_number, request.sequence_number);
  assert_eq!(response.status, 200);
  assert_eq!(response.response_body["path"], "/api/orders/42");
  assert_eq!(
    response.response_headers.get("content-type").map(String::as_str),
    Some("application/json")
  );

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_unconfigured_path_is_bad_gateway() {
  let dir = fresh_dir("slinger-capture-it-bad-gateway");
  let (_proxy, addr) = start_proxy(&dir).await;

  let stream = TcpStream::connect(addr).await.unwrap();
  let response = exchange(
    stream,
    "GET /nowhere/at/all HTTP/1.1\r\nHost: shop.local\r\nConnection: close\r\n\r\n",
    "</h1>",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
  assert!(response.contains("/nowhere/at/all"), "{}", response);

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_route_without_target_is_bad_gateway() {
  let dir = fresh_dir("slinger-capture-it-no-target");
  let (proxy, addr) = start_proxy(&dir).await;

  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  let route = ProxyConfig {
    path: "/loop".to_string(),
    protocol: ConfigProtocol::Http,
    hostname: String::new(),
    port: 0,
    ..ProxyConfig::defaults().remove(0)
  };
  proxy
    .context()
    .registry()
    .activate("observer", vec![route], Some(tx))
    .await;

  // Host names the proxy itself: following it would loop back in.
  let stream = TcpStream::connect(addr).await.unwrap();
  let response = exchange(
    stream,
    &format!(
      "GET /loop/again HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
      addr
    ),
    "</h1>",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
  assert!(response.contains("No target host"), "{}", response);
  assert!(rx.try_recv().is_err());

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_tls_sent_to_proxy_is_terminated() {
  let dir = fresh_dir("slinger-capture-it-reverse-tls");
  let (proxy, addr) = start_proxy(&dir).await;

  let stream = TcpStream::connect(addr).await.unwrap();
  let tls = tls_connector(&proxy)
    .connect(ServerName::try_from("localhost").unwrap(), stream)
    .await
    .unwrap();
  let response = exchange(
    tls,
    "GET /secure/missing HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    "</h1>",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
  assert!(response.contains("/secure/missing"), "{}", response);

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_connect_reuses_forward_server() {
  let dir = fresh_dir("slinger-capture-it-connect");
  let (proxy, addr) = start_proxy(&dir).await;
  let forward = proxy.context().forward();
  assert!(forward.is_empty());

  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
    .await
    .unwrap();
  let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
  timeout(WAIT, client.read_exact(&mut reply))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(reply, CONNECT_ESTABLISHED);
  let first = forward.address("example.com", 443).unwrap();

  // The ClientHello goes through the tunnel to a leaf issued for the host.
  let tls = tls_connector(&proxy)
    .connect(ServerName::try_from("example.com").unwrap(), client)
    .await
    .unwrap();
  drop(tls);

  let mut again = TcpStream::connect(addr).await.unwrap();
  again
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
    .await
    .unwrap();
  let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
  timeout(WAIT, again.read_exact(&mut reply))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(reply, CONNECT_ESTABLISHED);

  assert_eq!(forward.len(), 1);
  assert_eq!(forward.address("example.com", 443), Some(first));

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_concurrent_connects_share_one_forward_server() {
  let dir = fresh_dir("slinger-capture-it-connect-burst");
  let (proxy, addr) = start_proxy(&dir).await;

  let clients: Vec<_> = (0..20)
    .map(|_| {
      tokio::spawn(async move {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
          .write_all(b"CONNECT burst.test:443 HTTP/1.1\r\nHost: burst.test:443\r\n\r\n")
          .await
          .unwrap();
        let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
        timeout(WAIT, client.read_exact(&mut reply))
          .await
          .unwrap()
          .unwrap();
        reply
      })
    })
    .collect();
  for client in clients {
    assert_eq!(client.await.unwrap(), CONNECT_ESTABLISHED);
  }

  let forward = proxy.context().forward();
  assert_eq!(forward.len(), 1);
  assert!(forward.address("burst.test", 443).is_some());

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_observer_channel() {
  let origin = start_origin().await;
  let dir = fresh_dir("slinger-capture-it-channel");
  let (proxy, addr) = start_proxy(&dir).await;

  let (mut socket, _) =
    tokio_tungstenite::connect_async(format!("ws://{}/__capture/events", addr))
      .await
      .unwrap();

  let greeting = next_event(&mut socket).await;
  assert_eq!(greeting["event"], "proxy config");
  assert_eq!(greeting["configs"][0]["protocol"], "browser:");

  let push = json!({
    "event": "proxy config",
    "configs": [origin_route("/api", origin)],
  });
  socket.send(Message::text(push.to_string())).await.unwrap();

  let registry = proxy.context().registry();
  timeout(WAIT, async {
    while registry.find_match(false, "", "/api/items", false).is_none() {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .unwrap();
  assert!(dir.join("config.json").exists());

  let stream = TcpStream::connect(addr).await.unwrap();
  let response = exchange(
    stream,
    "POST /api/items HTTP/1.1\r\nHost: shop.local\r\nContent-Type: application/json\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"qty\": 3}\n",
    "}",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200"), "{}", response);

  let mut types = Vec::new();
  while types.len() < 2 {
    let event = next_event(&mut socket).await;
    assert_eq!(event["event"], "reqResJson");
    let messages: Value = serde_json::from_str(event["messages"].as_str().unwrap()).unwrap();
    for message in messages.as_array().unwrap() {
      assert_eq!(message["requestBody"]["qty"], 3);
      types.push(message["type"].as_u64().unwrap());
    }
    let ack = json!({ "event": "ack", "id": event["id"], "response": "ok" });
    socket.send(Message::text(ack.to_string())).await.unwrap();
  }
  assert_eq!(types, vec![0, 1]);

  socket
    .send(Message::text(json!({ "event": "disconnect" }).to_string()))
    .await
    .unwrap();
  timeout(WAIT, async {
    while !registry.is_empty() {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .unwrap();

  std::fs::remove_dir_all(&dir).ok();
}

async fn next_event<S>(socket: &mut S) -> Value
where
  S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
  loop {
    let frame = timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
    if let Message::Text(text) = frame {
      return serde_json::from_str(&text).unwrap();
    }
  }
}
