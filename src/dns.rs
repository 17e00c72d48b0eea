//! Client address to host label resolution

use std::net::IpAddr;

/// Reverse lookup of the client address, used when matching routes whose
/// pattern starts with a client host label.
#[async_trait::async_trait]
pub trait ClientResolver: Send + Sync {
  /// Host names registered for `ip`, in any order. Empty when unknown.
  async fn lookup(&self, ip: IpAddr) -> Vec<String>;
}

/// Resolver that knows no names
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopResolver;

#[async_trait::async_trait]
impl ClientResolver for NoopResolver {
  async fn lookup(&self, _ip: IpAddr) -> Vec<String> {
    Vec::new()
  }
}

/// Label for a client: the first DNS label of the smallest resolved name,
/// or `fallback` when nothing resolves.
pub async fn client_label(resolver: &dyn ClientResolver, ip: IpAddr, fallback: &str) -> String {
  let mut names = resolver.lookup(ip).await;
  names.sort();
  names
    .first()
    .and_then(|name| name.split('.').next())
    .filter(|label| !label.is_empty())
    .map(str::to_string)
    .unwrap_or_else(|| fallback.to_string())
}
