//! P2P outbound: publish accepted messages to the network topic
//!
//! Publishes are rate-limited per channel with a token bucket so one noisy
//! application cannot drown the topic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::NodeError;
use crate::p2p::P2pClient;
use crate::types::MessageEnvelope;

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct Publisher {
    client: Arc<P2pClient>,
    topic: String,
    rate_per_sec: f64,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl Publisher {
    pub fn new(client: Arc<P2pClient>, topic: &str, rate_per_sec: u32) -> Self {
        Self {
            client,
            topic: topic.to_string(),
            rate_per_sec: f64::from(rate_per_sec.max(1)),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an accepted envelope, waiting for channel budget if needed.
    pub async fn publish_envelope(&self, envelope: &MessageEnvelope) -> Result<(), NodeError> {
        self.acquire_token(&envelope.channel).await;

        let payload = serde_json::to_vec(envelope)?;
        self.client.publish(&self.topic, payload).await?;
        debug!(
            item_hash = %envelope.item_hash,
            channel = %envelope.channel,
            "Published message"
        );
        Ok(())
    }

    async fn acquire_token(&self, channel: &str) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets.entry(channel.to_string()).or_insert(TokenBucket {
                    tokens: self.rate_per_sec,
                    last_refill: Instant::now(),
                });

                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens =
                    (bucket.tokens + elapsed * self.rate_per_sec).min(self.rate_per_sec);
                bucket.last_refill = Instant::now();

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - bucket.tokens) / self.rate_per_sec,
                    ))
                }
            };

            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}
