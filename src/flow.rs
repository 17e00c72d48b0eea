//! Windowed flow control for delivering captures to a slow observer
//!
//! A [`FlowWindow`] decides, for one observer, which messages can go out now and
//! which must wait. It never performs I/O: [`FlowWindow::emit`] and
//! [`FlowWindow::on_acknowledge`] hand back the [`Batch`] to transmit, if any, and
//! the caller writes it to the transport.

use std::collections::{HashMap, VecDeque};

/// Messages sent to an observer as one unit, acknowledged as one unit.
#[derive(Debug)]
pub struct Batch<T> {
  /// Identifier echoed back by the observer's acknowledgment
  pub id: u64,
  /// Messages in enqueue order
  pub messages: Vec<T>,
  /// Messages still queued behind this batch when it was cut
  pub queued: usize,
}

/// Window and outstanding-batch accounting for a single observer.
#[derive(Debug)]
pub struct FlowWindow<T> {
  remaining: usize,
  max_outstanding: usize,
  queue: VecDeque<T>,
  in_flight: HashMap<u64, usize>,
  next_id: u64,
}

impl<T> FlowWindow<T> {
  /// `capacity` message slots, at most `max_outstanding` unacknowledged batches
  pub fn new(capacity: usize, max_outstanding: usize) -> Self {
    Self {
      remaining: capacity,
      max_outstanding: max_outstanding.max(1),
      queue: VecDeque::new(),
      in_flight: HashMap::new(),
      next_id: 0,
    }
  }

  /// Slots left in the window
  pub fn remaining(&self) -> usize {
    self.remaining
  }

  /// Batches sent but not yet acknowledged
  pub fn outstanding(&self) -> usize {
    self.in_flight.len()
  }

  /// Messages waiting for window space
  pub fn queued(&self) -> usize {
    self.queue.len()
  }

  /// Offer messages for delivery.
  ///
  /// Returns the batch to send now, or `None` when the window is exhausted or
  /// too many batches are unacknowledged, in which case the messages stay
  /// queued behind any earlier ones.
  pub fn emit(&mut self, messages: impl IntoIterator<Item = T>) -> Option<Batch<T>> {
    self.queue.extend(messages);
    self.next_batch()
  }

  /// Credit back the batch `id`, then cut the next batch from the queue if
  /// there is room for one. Unknown or repeated ids change nothing.
  pub fn on_acknowledge(&mut self, id: u64) -> Option<Batch<T>> {
    let size = self.in_flight.remove(&id)?;
    self.remaining += size;
    self.next_batch()
  }

  fn next_batch(&mut self) -> Option<Batch<T>> {
    if self.remaining == 0 || self.in_flight.len() >= self.max_outstanding {
      return None;
    }
    let count = self.queue.len().min(self.remaining);
    if count == 0 {
      return None;
    }
    let messages: Vec<T> = self.queue.drain(..count).collect();
    self.remaining -= count;
    self.next_id += 1;
    let id = self.next_id;
    self.in_flight.insert(id, count);
    Some(Batch {
      id,
      messages,
      queued: self.queue.len(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_window_bounds_immediate_sends() {
    let window_size = 5;
    let mut window = FlowWindow::new(window_size, usize::MAX);
    let mut sent = Vec::new();
    for n in 0..8 {
      if let Some(batch) = window.emit([n]) {
        sent.push(batch);
      }
    }
    assert_eq!(sent.len(), window_size);
    assert_eq!(window.queued(), 3);
    assert_eq!(window.remaining(), 0);

    // Each acknowledgment frees one slot, the queue drains in order.
    let mut drained = Vec::new();
    for batch in &sent[..3] {
      let next = window.on_acknowledge(batch.id).unwrap();
      drained.extend(next.messages);
    }
    assert_eq!(drained, vec![5, 6, 7]);
    assert_eq!(window.queued(), 0);
  }

  #[test]
  fn test_outstanding_batch_cap() {
    let mut window = FlowWindow::new(500, 2);
    let first = window.emit([1]).unwrap();
    let second = window.emit([2]).unwrap();
    assert!(window.emit([3]).is_none());
    assert!(window.emit([4]).is_none());
    assert_eq!(window.outstanding(), 2);
    assert_eq!(window.queued(), 2);

    // One acknowledgment releases everything queued as a single batch.
    let third = window.on_acknowledge(first.id).unwrap();
    assert_eq!(third.messages, vec![3, 4]);
    assert_eq!(third.queued, 0);
    assert_eq!(window.remaining(), 500 - 1 - 2);

    assert!(window.on_acknowledge(second.id).is_none());
    assert!(window.on_acknowledge(third.id).is_none());
    assert_eq!(window.remaining(), 500);
    assert_eq!(window.outstanding(), 0);
  }

  #[test]
  fn test_drain_is_sized_by_window() {
    let mut window = FlowWindow::new(3, 1);
    let first = window.emit([0, 1]).unwrap();
    assert_eq!(first.messages, vec![0, 1]);
    for n in 2..7 {
      assert!(window.emit([n]).is_none());
    }
    let next = window.on_acknowledge(first.id).unwrap();
    assert_eq!(next.messages, vec![2, 3, 4]);
    assert_eq!(next.queued, 2);
    let last = window.on_acknowledge(next.id).unwrap();
    assert_eq!(last.messages, vec![5, 6]);
  }

  #[test]
  fn test_unknown_acknowledgment_is_ignored() {
    let mut window: FlowWindow<u8> = FlowWindow::new(2, 2);
    assert!(window.on_acknowledge(99).is_none());
    assert_eq!(window.remaining(), 2);
  }
}
