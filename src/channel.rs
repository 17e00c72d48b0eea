//! Control channel between the proxy and one observer UI
//!
//! Frames are JSON text tagged by `event`. On connect the proxy sends the
//! persisted routes (`proxy config`). The observer may push replacement
//! routes, acknowledges every `reqResJson` batch with `ack`, and ends the
//! session with `disconnect` or by closing the socket.

use crate::config::ProxyConfig;
use crate::context::ProxyContext;
use crate::error::{Error, Result};
use crate::flow::Batch;
use crate::message::CaptureMessage;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use uuid::Uuid;

/// Frames sent to the observer
#[derive(Debug, Serialize)]
#[serde(tag = "event")]
pub enum ServerEvent<'a> {
  /// Current routes
  #[serde(rename = "proxy config")]
  ProxyConfig { configs: &'a [ProxyConfig] },
  /// A batch of captures, JSON-encoded as a string
  #[serde(rename = "reqResJson")]
  ReqResJson {
    id: u64,
    messages: String,
    queued: usize,
  },
}

/// Frames received from the observer
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
pub enum ClientEvent {
  /// Replacement routes
  #[serde(rename = "proxy config")]
  ProxyConfig { configs: Vec<ProxyConfig> },
  /// Batch `id` was processed
  #[serde(rename = "ack")]
  Ack {
    id: u64,
    #[serde(default)]
    response: Value,
  },
  /// The observer is leaving
  #[serde(rename = "disconnect")]
  Disconnect,
}

impl ServerEvent<'static> {
  /// Frame for `batch`
  pub fn batch(batch: &Batch<CaptureMessage>) -> Result<Self> {
    Ok(ServerEvent::ReqResJson {
      id: batch.id,
      messages: serde_json::to_string_pretty(&batch.messages)?,
      queued: batch.queued,
    })
  }
}

impl ServerEvent<'_> {
  fn to_message(&self) -> Result<Message> {
    Ok(Message::text(serde_json::to_string(self)?))
  }
}

/// Run the control channel on an HTTP connection asking for the upgrade.
///
/// Returns when the observer disconnects; its session is removed then.
pub async fn serve(ctx: Arc<ProxyContext>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
  let socket = tokio_tungstenite::accept_async(stream)
    .await
    .map_err(|e| Error::channel_error(format!("Handshake with {} failed: {}", peer, e)))?;
  let id = Uuid::new_v4().to_string();
  tracing::info!("[CHANNEL] Observer {} connected from {}", id, peer);

  let (mut sink, mut frames) = socket.split();
  let (outbox, mut batches) = mpsc::unbounded_channel::<Batch<CaptureMessage>>();

  let configs = ctx.current_configs().await?;
  send(&mut sink, &ServerEvent::ProxyConfig { configs: &configs }).await?;

  let result = loop {
    tokio::select! {
      Some(batch) = batches.recv() => {
        let sent = match ServerEvent::batch(&batch) {
          Ok(event) => send(&mut sink, &event).await,
          Err(e) => Err(e),
        };
        if let Err(e) = sent {
          break Err(e);
        }
      }
      frame = frames.next() => {
        let text = match frame {
          Some(Ok(Message::Text(text))) => text,
          Some(Ok(Message::Close(_))) | None => break Ok(()),
          Some(Ok(_)) => continue,
          Some(Err(e)) => break Err(Error::channel_error(format!("Observer {}: {}", id, e))),
        };
        match serde_json::from_str::<ClientEvent>(&text) {
          Ok(ClientEvent::ProxyConfig { configs }) => {
            if let Err(e) = ctx.store().save(&configs).await {
              tracing::warn!("[CHANNEL] Routes from {} not persisted: {}", id, e);
            }
            ctx.apply_configs(&id, configs, Some(outbox.clone())).await;
          }
          Ok(ClientEvent::Ack { id: batch_id, response }) => {
            tracing::trace!("[CHANNEL] {} acknowledged batch {}: {}", id, batch_id, response);
            ctx.registry().acknowledge(&id, batch_id);
          }
          Ok(ClientEvent::Disconnect) => break Ok(()),
          Err(e) => tracing::warn!("[CHANNEL] Ignoring frame from {}: {}", id, e),
        }
      }
    }
  };

  ctx.registry().remove(&id).await;
  tracing::info!("[CHANNEL] Observer {} disconnected", id);
  result
}

async fn send<S>(sink: &mut S, event: &ServerEvent<'_>) -> Result<()>
where
  S: futures::Sink<Message> + Unpin,
  S::Error: std::fmt::Display,
{
  sink
    .send(event.to_message()?)
    .await
    .map_err(|e| Error::channel_error(format!("Send failed: {}", e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_client_events() {
    let ack: ClientEvent =
      serde_json::from_str(r#"{"event":"ack","id":3,"response":"ok"}"#).unwrap();
    assert!(matches!(ack, ClientEvent::Ack { id: 3, .. }));

    let configs: ClientEvent = serde_json::from_str(
      r#"{"event":"proxy config","configs":[{"path":"/","protocol":"browser:","recording":true}]}"#,
    )
    .unwrap();
    match configs {
      ClientEvent::ProxyConfig { configs } => assert_eq!(configs.len(), 1),
      other => panic!("unexpected {:?}", other),
    }

    let bye: ClientEvent = serde_json::from_str(r#"{"event":"disconnect"}"#).unwrap();
    assert!(matches!(bye, ClientEvent::Disconnect));
  }

  #[test]
  fn test_batch_frame() {
    let batch: Batch<CaptureMessage> = Batch {
      id: 9,
      messages: Vec::new(),
      queued: 4,
    };
    let event = ServerEvent::batch(&batch).unwrap();
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["event"], "reqResJson");
    assert_eq!(value["id"], 9);
    assert_eq!(value["queued"], 4);
    assert_eq!(serde_json::from_str::<Value>(value["messages"].as_str().unwrap()).unwrap(), json!([]));
  }
}
