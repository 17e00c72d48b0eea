//! Bundled observer UI served from the data directory

use crate::error::Result;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;

/// Static files under one root directory.
#[derive(Clone, Debug)]
pub struct StaticAssets {
  root: Option<PathBuf>,
}

impl StaticAssets {
  /// Assets under `root`; `None` serves nothing
  pub fn new(root: Option<PathBuf>) -> Self {
    Self { root }
  }

  /// Regular file named by `url_path`, if there is one.
  ///
  /// Paths ending in `/` name the directory's `index.html`. Paths with `..`
  /// components never resolve.
  pub async fn resolve(&self, url_path: &str) -> Option<PathBuf> {
    let root = self.root.as_ref()?;
    let mut relative = PathBuf::from(url_path.trim_start_matches('/'));
    if url_path.ends_with('/') {
      relative.push("index.html");
    }
    if !relative
      .components()
      .all(|c| matches!(c, Component::Normal(_)))
    {
      return None;
    }
    let file = root.join(relative);
    match tokio::fs::metadata(&file).await {
      Ok(meta) if meta.is_file() => Some(file),
      _ => None,
    }
  }

  /// Serve requests on `stream` until the client is done
  pub async fn serve(self: Arc<Self>, stream: TcpStream) -> Result<()> {
    let service = service_fn(move |request: Request<Incoming>| {
      let assets = self.clone();
      async move { Ok::<_, Infallible>(assets.respond(request.uri().path()).await) }
    });
    http1::Builder::new()
      .keep_alive(false)
      .serve_connection(TokioIo::new(stream), service)
      .await?;
    Ok(())
  }

  async fn respond(&self, url_path: &str) -> Response<Full<Bytes>> {
    let file = match self.resolve(url_path).await {
      Some(file) => file,
      None => return status(StatusCode::NOT_FOUND),
    };
    match tokio::fs::read(&file).await {
      Ok(data) => {
        let mut response = Response::new(Full::new(Bytes::from(data)));
        if let Ok(value) = content_type(&file).parse() {
          response.headers_mut().insert(CONTENT_TYPE, value);
        }
        response
      }
      Err(e) => {
        tracing::warn!("[DISPATCH] Failed to read {}: {}", file.display(), e);
        status(StatusCode::INTERNAL_SERVER_ERROR)
      }
    }
  }
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
  let mut response = Response::new(Full::new(Bytes::new()));
  *response.status_mut() = code;
  response
}

/// Best-effort content type from the file extension
pub fn content_type(path: &Path) -> &'static str {
  match path.extension().and_then(|e| e.to_str()) {
    Some("html") | Some("htm") => "text/html; charset=utf-8",
    Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
    Some("css") => "text/css; charset=utf-8",
    Some("json") | Some("map") => "application/json",
    Some("svg") => "image/svg+xml",
    Some("png") => "image/png",
    Some("jpg") | Some("jpeg") => "image/jpeg",
    Some("gif") => "image/gif",
    Some("ico") => "image/x-icon",
    Some("woff") => "font/woff",
    Some("woff2") => "font/woff2",
    Some("txt") => "text/plain; charset=utf-8",
    _ => "application/octet-stream",
  }
}
