//! In-process publish bus.
//!
//! [`ReadingBus`] implements [`PublishLink`] on top of a
//! [`tokio::sync::broadcast`] channel so the whole pipeline can run without
//! a broker: `--simulate` subscribes a logger to it, tests subscribe and
//! assert on what the poll loop published.
//!
//! Every subscriber receives every message; a slow subscriber lags (and is
//! told so) instead of blocking the publisher.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sonarlink_types::{BrokerConfig, SonarError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::link::{LinkConnector, PublishLink};

/// Default channel capacity (number of buffered messages before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// One message as it would have been handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
}

/// Shared publish bus.  Clone it cheaply; all clones share the channel and
/// the link state.
#[derive(Clone, Debug)]
pub struct ReadingBus {
    sender: broadcast::Sender<PublishedMessage>,
    severed: Arc<Mutex<Option<SonarError>>>,
}

impl ReadingBus {
    /// Create a bus buffering up to `capacity` messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            severed: Arc::new(Mutex::new(None)),
        }
    }

    /// Subscribe to every message.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMessage> {
        self.sender.subscribe()
    }

    /// Subscribe to messages whose topic starts with `prefix`.
    pub fn subscribe_topic(&self, prefix: impl Into<String>) -> TopicSubscriber {
        TopicSubscriber {
            prefix: prefix.into(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Kill the link: every later publish fails with `err`.
    pub fn sever(&self, err: SonarError) {
        *lock(&self.severed) = Some(err);
    }

    pub fn is_severed(&self) -> bool {
        lock(&self.severed).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ReadingBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl PublishLink for ReadingBus {
    fn publish(&self, topic: &str, payload: String) -> Result<(), SonarError> {
        if let Some(err) = &*lock(&self.severed) {
            return Err(err.clone());
        }
        let message = PublishedMessage {
            topic: topic.to_string(),
            payload,
        };
        // No subscriber is not a delivery failure.
        if self.sender.send(message).is_err() {
            debug!(topic, "no bus subscribers; message dropped");
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let mut severed = lock(&self.severed);
        if severed.is_none() {
            *severed = Some(SonarError::BrokerConnection("bus disconnected".to_string()));
        }
    }
}

// ---------------------------------------------------------------------------
// Topic-prefix subscriber
// ---------------------------------------------------------------------------

/// A subscriber that only delivers messages whose topic starts with the
/// given prefix.
pub struct TopicSubscriber {
    prefix: String,
    receiver: broadcast::Receiver<PublishedMessage>,
}

impl TopicSubscriber {
    /// Wait for the next matching message.
    ///
    /// Returns `None` once every bus handle has been dropped.
    pub async fn recv(&mut self) -> Option<PublishedMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(msg) if msg.topic.starts_with(&self.prefix) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(prefix = %self.prefix, lagged_by = n, "TopicSubscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// [`LinkConnector`] that hands out clones of one [`ReadingBus`].
///
/// Each connect returns a fresh link state over the same channel, so
/// subscribers survive supervisor re-initialisation.
#[derive(Debug, Clone, Default)]
pub struct BusConnector {
    bus: ReadingBus,
    refusal: Option<SonarError>,
}

impl BusConnector {
    pub fn new(bus: ReadingBus) -> Self {
        Self { bus, refusal: None }
    }

    /// Refuse every connect with `err`, as an unreachable broker would.
    pub fn refusing(mut self, err: SonarError) -> Self {
        self.refusal = Some(err);
        self
    }

    pub fn bus(&self) -> &ReadingBus {
        &self.bus
    }
}

#[async_trait]
impl LinkConnector for BusConnector {
    async fn connect(&self, broker: &BrokerConfig) -> Result<Arc<dyn PublishLink>, SonarError> {
        if let Some(err) = &self.refusal {
            return Err(err.clone());
        }
        debug!(broker = %broker.host, "in-process bus standing in for the broker");
        let link = ReadingBus {
            sender: self.bus.sender.clone(),
            severed: Arc::new(Mutex::new(None)),
        };
        Ok(Arc::new(link))
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() -> Result<(), Box<dyn std::error::Error>> {
        let bus = ReadingBus::default();
        let mut rx = bus.subscribe();

        bus.publish("arduino/distance0", "42".to_string())?;

        let received = rx.recv().await?;
        assert_eq!(received.topic, "arduino/distance0");
        assert_eq!(received.payload, "42");
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = ReadingBus::default();
        assert!(bus.publish("t/0", "0".to_string()).is_ok());
    }

    #[tokio::test]
    async fn topic_subscriber_filters() -> Result<(), Box<dyn std::error::Error>> {
        let bus = ReadingBus::default();
        let mut sub = bus.subscribe_topic("garage/");

        bus.publish("arduino/distance1", "10".to_string())?;
        bus.publish("garage/distance1", "11".to_string())?;

        let received = sub.recv().await.ok_or("no message received")?;
        assert_eq!(received.payload, "11");
        Ok(())
    }

    #[tokio::test]
    async fn severed_bus_rejects_publish() {
        let bus = ReadingBus::default();
        bus.sever(SonarError::BrokerConnection("gone".into()));
        let err = bus.publish("t/0", "0".to_string()).unwrap_err();
        assert_eq!(err, SonarError::BrokerConnection("gone".into()));

        // Disconnect keeps the original reason.
        bus.disconnect().await;
        assert_eq!(
            bus.publish("t/0", "0".to_string()).unwrap_err(),
            SonarError::BrokerConnection("gone".into())
        );
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = ReadingBus::new(8);
        let mut slow = bus.subscribe();
        for i in 0..100 {
            bus.publish("t/0", i.to_string()).unwrap();
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn connector_links_share_subscribers_but_not_state() {
        let connector = BusConnector::default();
        let mut rx = connector.bus().subscribe();

        let first = connector.connect(&BrokerConfig::default()).await.unwrap();
        first.disconnect().await;
        assert!(first.publish("t/0", "1".to_string()).is_err());

        let second = connector.connect(&BrokerConfig::default()).await.unwrap();
        second.publish("t/0", "2".to_string()).unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, "2");
    }

    #[tokio::test]
    async fn refusing_connector_reports_broker_error() {
        let connector = BusConnector::default()
            .refusing(SonarError::BrokerConnection("refused".into()));
        let err = connector.connect(&BrokerConfig::default()).await.err().unwrap();
        assert!(matches!(err, SonarError::BrokerConnection(_)));
    }
}
