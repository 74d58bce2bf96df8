// src/client.rs

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMsg};
use tracing::{debug, error, info, warn};

use crate::message::{HubEvent, OutgoingMessage};

/// Outbound half of a hub connection.
///
/// Sending is fire-and-forget: the implementation owns queuing, so callers
/// never wait on the network.
pub trait HubSender: Send + Sync {
    /// A fresh token the hub will echo back on the delivered message.
    fn generate_local_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn enqueue(&self, msg: OutgoingMessage) -> Result<(), HubError>;
}

#[derive(Error, Debug)]
pub enum HubError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The writer task is gone; nothing more can be sent.
    #[error("hub connection closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for HubError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        HubError::WebSocket(err.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct WsHubSender {
    tx: UnboundedSender<OutgoingMessage>,
}

impl HubSender for WsHubSender {
    fn enqueue(&self, msg: OutgoingMessage) -> Result<(), HubError> {
        self.tx.send(msg).map_err(|_| HubError::Closed)
    }
}

/// A WebSocket connection to the hub.
///
/// One task serialises queued `OutgoingMessage`s onto the socket, another
/// decodes incoming frames into `HubEvent`s.
pub struct WsHubClient {
    sender: WsHubSender,
    events: UnboundedReceiver<HubEvent>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl WsHubClient {
    pub async fn connect(url: &str) -> Result<Self, HubError> {
        let (ws_stream, _response) = connect_async(url).await?;
        info!("connected to hub at {}", url);
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = unbounded_channel::<OutgoingMessage>();
        let (event_tx, event_rx) = unbounded_channel::<HubEvent>();

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("could not encode outgoing message {}: {}", msg.local_id, e);
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMsg::Text(json.into())).await {
                    error!("hub write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            debug!("hub writer finished");
        });

        let reader_task = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMsg::Text(txt)) => match serde_json::from_str::<HubEvent>(txt.as_str()) {
                        Ok(event) => {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("skipping undecodable hub frame: {}", e),
                    },
                    Ok(WsMsg::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!("hub read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("hub reader finished");
        });

        Ok(Self {
            sender: WsHubSender { tx: out_tx },
            events: event_rx,
            reader_task,
            writer_task,
        })
    }

    pub fn sender(&self) -> WsHubSender {
        self.sender.clone()
    }

    /// Next inbound event, or `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<HubEvent> {
        self.events.recv().await
    }

    pub fn close(self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Directives, Participant, StateSnapshot};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[tokio::test]
    async fn test_ws_round_trip_with_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let state = serde_json::json!({
                "state": {"participants": [{"id": "p1", "name": "Alice"}], "my_participant_id": "me"}
            });
            ws.send(WsMsg::Text(state.to_string().into())).await.unwrap();
            ws.send(WsMsg::Text("not json".into())).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(WsMsg::Text(txt))) => {
                        return serde_json::from_str::<OutgoingMessage>(txt.as_str()).unwrap();
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected frame {other:?}"),
                }
            }
        });

        let mut client = WsHubClient::connect(&format!("ws://{addr}")).await.unwrap();
        let event = client.next_event().await.unwrap();
        assert_eq!(
            event,
            HubEvent::State(StateSnapshot {
                participants: Some(vec![Participant::new("p1", "Alice")]),
                my_participant_id: Some("me".into()),
            })
        );

        let sender = client.sender();
        let local_id = sender.generate_local_id();
        let msg = OutgoingMessage::text("hello", local_id.clone())
            .with_directives(&Directives::approved())
            .unwrap();
        sender.enqueue(msg).unwrap();

        let received = server.await.unwrap();
        assert_eq!(received.text, "hello");
        assert_eq!(received.local_id, local_id);
        assert!(received.directives().unwrap().self_approve);
        client.close();
    }
}
