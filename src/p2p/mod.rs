//! P2P daemon connection
//!
//! The transport itself is an external daemon; this module maintains a
//! persistent WebSocket to it, with reconnection, and exposes the pub/sub
//! surface the pipeline needs: subscribe to the message topic, publish
//! accepted envelopes.

pub mod inbound;
pub mod publish;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::error::NodeError;

pub use inbound::P2pInbound;
pub use publish::Publisher;

/// A message received from a subscribed topic.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub topic: String,
    pub data: Vec<u8>,
}

/// Frames exchanged with the daemon.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum DaemonFrame {
    Subscribe { topic: String },
    Publish { topic: String, data: String },
    Message { topic: String, data: String },
}

pub struct P2pClient {
    tx: mpsc::Sender<DaemonFrame>,
    incoming: broadcast::Sender<TopicMessage>,
    topics: Arc<Mutex<HashSet<String>>>,
    connected: Arc<RwLock<bool>>,
}

impl P2pClient {
    /// Connect to the daemon, spawning the reconnecting connection task.
    pub async fn connect(daemon_url: &str) -> Result<Self, NodeError> {
        let (tx, rx) = mpsc::channel::<DaemonFrame>(1024);
        let (incoming, _) = broadcast::channel(4096);
        let topics = Arc::new(Mutex::new(HashSet::new()));
        let connected = Arc::new(RwLock::new(false));

        let client = Self {
            tx,
            incoming: incoming.clone(),
            topics: Arc::clone(&topics),
            connected: Arc::clone(&connected),
        };

        let url = daemon_url.to_string();
        tokio::spawn(async move {
            connection_loop(url, rx, incoming, topics, connected).await;
        });

        // Wait briefly for the initial connection
        for _ in 0..50 {
            if *client.connected.read().await {
                return Ok(client);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(NodeError::P2p(
            "timeout waiting for P2P daemon connection".to_string(),
        ))
    }

    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }

    /// Subscribe to a topic. The returned receiver sees every message on
    /// any subscribed topic; callers filter by topic name.
    pub async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<broadcast::Receiver<TopicMessage>, NodeError> {
        self.topics.lock().await.insert(topic.to_string());
        self.tx
            .send(DaemonFrame::Subscribe {
                topic: topic.to_string(),
            })
            .await
            .map_err(|_| NodeError::P2p("daemon connection closed".to_string()))?;
        Ok(self.incoming.subscribe())
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NodeError> {
        self.tx
            .send(DaemonFrame::Publish {
                topic: topic.to_string(),
                data: BASE64.encode(data),
            })
            .await
            .map_err(|_| NodeError::P2p("daemon connection closed".to_string()))
    }
}

/// Connection task: dial, replay subscriptions, pump frames both ways,
/// reconnect with backoff on failure.
async fn connection_loop(
    url: String,
    mut outgoing: mpsc::Receiver<DaemonFrame>,
    incoming: broadcast::Sender<TopicMessage>,
    topics: Arc<Mutex<HashSet<String>>>,
    connected: Arc<RwLock<bool>>,
) {
    let mut backoff = Duration::from_secs(1);

    loop {
        info!(url = %url, "Connecting to P2P daemon");
        let (ws, _) = match connect_async(url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(url = %url, error = %e, "P2P daemon connection failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
                continue;
            }
        };
        backoff = Duration::from_secs(1);

        let (mut sink, mut stream) = ws.split();

        // Replay subscriptions after a reconnect
        let replay: Vec<String> = topics.lock().await.iter().cloned().collect();
        let mut replay_failed = false;
        for topic in replay {
            let frame = DaemonFrame::Subscribe { topic };
            let text = serde_json::to_string(&frame).expect("frame serializes");
            if sink.send(Message::Text(text)).await.is_err() {
                replay_failed = true;
                break;
            }
        }
        if replay_failed {
            continue;
        }

        *connected.write().await = true;
        info!("P2P daemon connected");

        loop {
            tokio::select! {
                frame = outgoing.recv() => {
                    let Some(frame) = frame else {
                        // Client dropped; terminate the task
                        *connected.write().await = false;
                        return;
                    };
                    let text = serde_json::to_string(&frame).expect("frame serializes");
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(error = %e, "P2P send failed, reconnecting");
                        break;
                    }
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<DaemonFrame>(&text) {
                                Ok(DaemonFrame::Message { topic, data }) => {
                                    match BASE64.decode(&data) {
                                        Ok(bytes) => {
                                            let _ = incoming.send(TopicMessage {
                                                topic,
                                                data: bytes,
                                            });
                                        }
                                        Err(e) => {
                                            debug!(error = %e, "Dropping frame with bad base64");
                                        }
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => debug!(error = %e, "Dropping unparseable frame"),
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("P2P daemon closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "P2P stream error");
                            break;
                        }
                    }
                }
            }
        }

        *connected.write().await = false;
    }
}
