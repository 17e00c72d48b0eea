//! Interactive capture proxy with TLS interception
//!
//! This crate provides a proxy that sits between clients and the servers they
//! talk to, terminates their HTTP and HTTPS traffic locally, and streams every
//! request/response pair to connected observer UIs.
//!
//! # Features
//!
//! - One public port for everything: CONNECT tunnels, TLS sent straight at the
//!   proxy, plain HTTP, the observer control channel and the bundled UI
//! - Automatic root CA generation and per-host leaf certificates, cached on disk
//! - Route table per observer session with longest-match lookup
//! - Windowed flow control so a slow observer bounds memory, not throughput
//! - Raw TCP passthrough routes for database and cache protocols
//!
//! # Example
//!
//! ```no_run
//! use slinger_capture::{CaptureConfig, CaptureProxy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CaptureConfig::new(".");
//!     let proxy = CaptureProxy::new(config).await?;
//!     proxy.start("0.0.0.0:8888").await?;
//!     Ok(())
//! }
//! ```

mod assets;
mod ca;
mod channel;
mod config;
mod context;
mod correlation;
mod dispatcher;
mod dns;
mod error;
mod flow;
mod forward;
mod message;
mod paths;
mod proxy;
mod raw;
mod registry;
mod server;
mod tunnel;
mod upstream;

pub use assets::StaticAssets;
pub use ca::{CertificateAuthority, CertificateManager, LeafCertificate};
pub use channel::{ClientEvent, ServerEvent};
pub use config::{
  check_reachability, CaptureConfig, ConfigProtocol, ConfigStore, ProxyConfig, ProxyConfigJson,
};
pub use context::{ClientOrigins, ProxyContext};
pub use correlation::{InFlight, SequenceCounter, SEQUENCE_HEADER};
pub use dispatcher::{parse_connect_target, sniff, Dispatcher, Sniffed, CONNECT_ESTABLISHED};
pub use dns::{client_label, ClientResolver, NoopResolver};
pub use error::{Error, Result};
pub use flow::{Batch, FlowWindow};
pub use forward::ForwardPool;
pub use message::{infer_endpoint, CaptureMessage, MessageProtocol, MessageType, NO_RESPONSE};
pub use paths::DataDir;
pub use proxy::{CaptureProxy, ServeFuture};
pub use registry::{collapse_slashes, ObserverSession, Outbox, SessionRegistry, CACHE_SESSION};
pub use server::{Direction, Flavor, MitmServer, ServerHandle, PASSTHROUGH_COMMENT};
pub use tunnel::pipe;
pub use upstream::{strip_hop_by_hop, UpstreamClient};
