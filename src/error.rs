//! Error types for the capture proxy

use std::io;
use thiserror::Error;

/// Result type for capture proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for capture proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Certificate authority or leaf issuance error
  #[error("Certificate error: {0}")]
  CertificateError(String),

  /// TLS error
  #[error("TLS error: {0}")]
  TlsError(String),

  /// HTTP message construction error
  #[error("HTTP error: {0}")]
  HttpError(http::Error),

  /// Error raised by the local hyper server or a body stream
  #[error("Hyper error: {0}")]
  HyperError(hyper::Error),

  /// Transport error on the upstream hop
  #[error("Upstream error: {0}")]
  UpstreamError(String),

  /// Configuration error
  #[error("Config error: {0}")]
  ConfigError(String),

  /// JSON error
  #[error("JSON error: {0}")]
  JsonError(serde_json::Error),

  /// Invalid request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Connection error
  #[error("Connection error: {0}")]
  ConnectionError(String),

  /// Control channel error
  #[error("Channel error: {0}")]
  ChannelError(String),

  /// Other errors
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::CertificateError(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::TlsError(msg.into());
    tracing::error!("TLS error: {}", error);
    error
  }

  /// Create an upstream error and log it
  pub fn upstream_error(msg: impl Into<String>) -> Self {
    let error = Error::UpstreamError(msg.into());
    tracing::warn!("Upstream error: {}", error);
    error
  }

  /// Create a config error and log it
  pub fn config_error(msg: impl Into<String>) -> Self {
    let error = Error::ConfigError(msg.into());
    tracing::error!("Config error: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::warn!("Invalid request: {}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::ConnectionError(msg.into());
    tracing::warn!("Connection error: {}", error);
    error
  }

  /// Create a channel error and log it
  pub fn channel_error(msg: impl Into<String>) -> Self {
    let error = Error::ChannelError(msg.into());
    tracing::warn!("Channel error: {}", error);
    error
  }

  /// Create an other error and log it
  pub fn other(msg: impl Into<String>) -> Self {
    let error = Error::Other(msg.into());
    tracing::error!("Other error: {}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::debug!("IO error: {}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    let error = Error::HttpError(value);
    tracing::error!("HTTP error: {}", error);
    error
  }
}

impl From<hyper::Error> for Error {
  fn from(value: hyper::Error) -> Self {
    let error = Error::HyperError(value);
    tracing::debug!("Hyper error: {}", error);
    error
  }
}

impl From<serde_json::Error> for Error {
  fn from(value: serde_json::Error) -> Self {
    let error = Error::JsonError(value);
    tracing::error!("JSON error: {}", error);
    error
  }
}
