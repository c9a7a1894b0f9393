//! Publish/subscribe bus between gateways and workers
//!
//! The gateway only needs two operations: publish an [`Envelope`] on a topic
//! and subscribe to a topic as a stream of raw payloads. [`NatsBus`] backs
//! them with NATS subjects; [`LocalBus`] is an in-process fan-out used in
//! standalone mode, where bus, discovery and workers share one process.

use crate::error::GateError;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use log::{debug, trace};
use shared::Envelope;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Raw payloads delivered on one subscription
pub type BusStream = BoxStream<'static, Vec<u8>>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<(), GateError>;

    async fn subscribe(&self, topic: &str) -> Result<BusStream, GateError>;

    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), GateError> {
        let payload = envelope.to_bytes()?;
        trace!("publish {} bytes on {}", payload.len(), topic);
        self.publish_raw(topic, payload).await
    }
}

pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self, GateError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| GateError::Bus(format!("connect {}: {}", url, e)))?;
        log::info!("Connected to message bus at {}", url);
        Ok(Self { client })
    }

    pub fn client(&self) -> async_nats::Client {
        self.client.clone()
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<(), GateError> {
        self.client
            .publish(topic.to_string(), payload.into())
            .await
            .map_err(|e| GateError::Bus(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<BusStream, GateError> {
        let subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| GateError::Bus(e.to_string()))?;
        Ok(subscriber.map(|msg| msg.payload.to_vec()).boxed())
    }
}

/// In-process fan-out keyed by exact topic name
#[derive(Default)]
pub struct LocalBus {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<(), GateError> {
        let mut topics = self.lock_topics();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        } else {
            debug!("No subscribers on {}", topic);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusStream, GateError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_topics()
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::CloseReason;

    #[tokio::test]
    async fn test_local_bus_fans_out() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("gate.broadcast").await.unwrap();
        let mut b = bus.subscribe("gate.broadcast").await.unwrap();

        let env = Envelope::kick_player(10001, CloseReason::ServerRelogin, 1);
        bus.publish("gate.broadcast", &env).await.unwrap();

        for stream in [&mut a, &mut b] {
            let payload = stream.next().await.unwrap();
            assert_eq!(Envelope::from_bytes(&payload).unwrap(), env);
        }
    }

    #[tokio::test]
    async fn test_local_bus_topics_are_exact() {
        let bus = LocalBus::new();
        let mut game = bus.subscribe("game.1").await.unwrap();
        bus.publish_raw("game.2", vec![1]).await.unwrap();
        bus.publish_raw("game.1", vec![2]).await.unwrap();
        assert_eq!(game.next().await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_local_bus_preserves_order() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("gate.1").await.unwrap();
        for i in 0..100u8 {
            bus.publish_raw("gate.1", vec![i]).await.unwrap();
        }
        for i in 0..100u8 {
            assert_eq!(sub.next().await.unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("path.1").await.unwrap();
        drop(sub);
        bus.publish_raw("path.1", vec![0]).await.unwrap();
        assert!(bus.lock_topics().get("path.1").unwrap().is_empty());
    }
}
