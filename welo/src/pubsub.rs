//! Topic based publish/subscribe, the transport of the live replicator.

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Capacity of each topic on the in-memory network.
const TOPIC_CAP: usize = 1024;

/// Contract of the pub/sub layer.
///
/// Messages published by a handle are not delivered back to that handle's own subscriptions.
#[async_trait]
pub trait PubSub: Debug + Send + Sync + 'static {
    /// Subscribe to `topic`. The stream ends on [`PubSub::unsubscribe`].
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Bytes>>;
    /// Publish to everyone subscribed to `topic`.
    async fn publish(&self, topic: &str, data: Bytes) -> Result<()>;
    /// End all subscriptions of this handle to `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Envelope {
    origin: usize,
    data: Bytes,
}

#[derive(Debug, Default)]
struct Topics {
    next_peer: usize,
    topics: HashMap<String, broadcast::Sender<Envelope>>,
}

impl Topics {
    fn sender(&mut self, topic: &str) -> broadcast::Sender<Envelope> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAP).0)
            .clone()
    }
}

/// A simulated network: every [`MemoryPubSub`] created from it sees the others' messages.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    topics: Arc<Mutex<Topics>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the network with a new handle.
    pub fn join(&self) -> MemoryPubSub {
        let id = {
            let mut topics = self.topics.lock();
            topics.next_peer += 1;
            topics.next_peer
        };
        MemoryPubSub {
            id,
            network: self.clone(),
            subscriptions: Default::default(),
        }
    }
}

/// In memory [`PubSub`] handle.
#[derive(Debug, Clone)]
pub struct MemoryPubSub {
    id: usize,
    network: MemoryNetwork,
    subscriptions: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Bytes>> {
        let receiver = self.network.topics.lock().sender(topic).subscribe();
        let token = self
            .subscriptions
            .lock()
            .entry(topic.to_string())
            .or_default()
            .clone();
        let me = self.id;
        let topic_name = topic.to_string();
        let stream = BroadcastStream::new(receiver)
            .filter_map(move |msg| {
                let topic = topic_name.clone();
                async move {
                    match msg {
                        Ok(env) if env.origin != me => Some(env.data),
                        Ok(_) => None,
                        Err(BroadcastStreamRecvError::Lagged(n)) => {
                            debug!(%topic, "subscriber lagged, {n} messages lost");
                            None
                        }
                    }
                }
            })
            .take_until(async move { token.cancelled().await });
        Ok(stream.boxed())
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<()> {
        let sender = self.network.topics.lock().sender(topic);
        // nobody listening is not an error
        sender
            .send(Envelope {
                origin: self.id,
                data,
            })
            .ok();
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        if let Some(token) = self.subscriptions.lock().remove(topic) {
            token.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    #[tokio::test]
    async fn delivers_to_others_only() -> TestResult {
        let network = MemoryNetwork::new();
        let a = network.join();
        let b = network.join();
        let mut a_sub = a.subscribe("t").await?;
        let mut b_sub = b.subscribe("t").await?;

        a.publish("t", Bytes::from_static(b"hello")).await?;
        assert_eq!(b_sub.next().await, Some(Bytes::from_static(b"hello")));

        b.publish("t", Bytes::from_static(b"back")).await?;
        // a's own message was filtered, the next one it sees is b's
        assert_eq!(a_sub.next().await, Some(Bytes::from_static(b"back")));

        a.unsubscribe("t").await?;
        assert_eq!(a_sub.next().await, None);
        Ok(())
    }
}
