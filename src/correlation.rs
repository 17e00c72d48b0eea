//! Sequence numbering and request/response correlation across the upstream hop

use crate::config::ProxyConfig;
use crate::message::CaptureMessage;
use dashmap::DashMap;
use http::{HeaderMap, HeaderValue};
use std::sync::atomic::{AtomicU64, Ordering};

/// Request header carrying the sequence number through the upstream hop
pub const SEQUENCE_HEADER: &str = "x-slinger-capture-seq";

/// Process-wide source of sequence numbers. The first number handed out is 1.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
  /// A counter that has handed out nothing yet
  pub fn new() -> Self {
    Self::default()
  }

  /// Next number, never repeated for the lifetime of the counter
  pub fn next(&self) -> u64 {
    self.0.fetch_add(1, Ordering::Relaxed) + 1
  }
}

/// Captures waiting for their response, keyed by sequence number.
///
/// Each entry is inserted once by the request path and taken once by the
/// response path.
#[derive(Default)]
pub struct InFlight {
  pending: DashMap<u64, CaptureMessage>,
}

impl InFlight {
  /// An empty table
  pub fn new() -> Self {
    Self::default()
  }

  /// Park `message` until its response arrives.
  ///
  /// The entry lives no longer than the returned guard.
  pub fn park(&self, message: CaptureMessage) -> Parked<'_> {
    let sequence_number = message.sequence_number;
    self.pending.insert(sequence_number, message);
    Parked {
      in_flight: self,
      sequence_number,
    }
  }

  /// Route of a pending capture, without removing it
  pub fn proxy_config(&self, sequence_number: u64) -> Option<ProxyConfig> {
    self
      .pending
      .get(&sequence_number)
      .map(|entry| entry.proxy_config.clone())
  }

  /// Remove and return the pending capture
  pub fn take(&self, sequence_number: u64) -> Option<CaptureMessage> {
    self
      .pending
      .remove(&sequence_number)
      .map(|(_, message)| message)
  }

  /// Captures still waiting
  pub fn len(&self) -> usize {
    self.pending.len()
  }

  /// No capture is waiting
  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }
}

/// A parked capture, removed from its table on drop unless already taken
pub struct Parked<'a> {
  in_flight: &'a InFlight,
  sequence_number: u64,
}

impl Drop for Parked<'_> {
  fn drop(&mut self) {
    if self.in_flight.take(self.sequence_number).is_some() {
      tracing::debug!(
        "[MITM] Abandoned capture seq={} removed",
        self.sequence_number
      );
    }
  }
}

/// Write the sequence number into `headers`
pub fn stamp_sequence(headers: &mut HeaderMap, sequence_number: u64) {
  headers.insert(SEQUENCE_HEADER, HeaderValue::from(sequence_number));
}

/// Read the sequence number back from `headers`
pub fn read_sequence(headers: &HeaderMap) -> Option<u64> {
  headers
    .get(SEQUENCE_HEADER)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::{MessageProtocol, ObservedRequest};
  use bytes::Bytes;
  use http::Method;
  use std::collections::HashSet;
  use std::sync::Arc;

  #[test]
  fn test_sequence_numbers_are_unique_across_threads() {
    let counter = Arc::new(SequenceCounter::new());
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let counter = counter.clone();
        std::thread::spawn(move || (0..1000).map(|_| counter.next()).collect::<Vec<_>>())
      })
      .collect();

    let mut seen = HashSet::new();
    for handle in handles {
      for n in handle.join().unwrap() {
        assert!(seen.insert(n), "duplicate sequence number {}", n);
      }
    }
    assert_eq!(seen.len(), 8000);
    assert_eq!(seen.iter().min(), Some(&1));
  }

  fn pending(sequence_number: u64) -> CaptureMessage {
    let headers = HeaderMap::new();
    let body = Bytes::new();
    CaptureMessage::observed(ObservedRequest {
      sequence_number,
      pipeline_number: 1,
      protocol: MessageProtocol::Http,
      proxy_config: ProxyConfig::defaults().remove(0),
      client_ip: "127.0.0.1".to_string(),
      method: &Method::GET,
      url: "/orders/7".to_string(),
      headers: &headers,
      body: &body,
    })
  }

  #[test]
  fn test_parked_capture_is_removed_on_drop() {
    let in_flight = InFlight::new();
    let parked = in_flight.park(pending(7));
    assert_eq!(in_flight.len(), 1);
    assert!(in_flight.proxy_config(7).is_some());
    drop(parked);
    assert!(in_flight.is_empty());

    // Taken by the response path first: the guard finds nothing left.
    let parked = in_flight.park(pending(8));
    assert_eq!(in_flight.take(8).map(|m| m.sequence_number), Some(8));
    drop(parked);
    assert!(in_flight.is_empty());
  }

  #[test]
  fn test_sequence_header() {
    let mut headers = HeaderMap::new();
    assert_eq!(read_sequence(&headers), None);
    stamp_sequence(&mut headers, 42);
    assert_eq!(read_sequence(&headers), Some(42));
  }
}
