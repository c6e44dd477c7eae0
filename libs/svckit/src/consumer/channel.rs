//! In-memory broker over a bounded tokio channel.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};

use super::broker::{Broker, Subscription};
use super::message::ActionMessage;
use crate::error::BrokerError;

/// Single-consumer broker. One subscription at a time owns the receiving
/// side; closing it lets the next subscription pick up where it left off.
#[derive(Debug, Clone)]
pub struct ChannelBroker {
    sender: mpsc::Sender<ActionMessage>,
    receiver: Arc<Mutex<mpsc::Receiver<ActionMessage>>>,
}

impl ChannelBroker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    #[must_use]
    pub fn publisher(&self) -> ChannelPublisher {
        ChannelPublisher {
            sender: self.sender.clone(),
        }
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn subscribe(&self) -> Result<Box<dyn Subscription>, BrokerError> {
        let receiver = Arc::clone(&self.receiver)
            .try_lock_owned()
            .map_err(|_| BrokerError::Connection("channel already has a subscriber".to_owned()))?;
        Ok(Box::new(ChannelSubscription {
            receiver: Some(receiver),
        }))
    }
}

struct ChannelSubscription {
    receiver: Option<OwnedMutexGuard<mpsc::Receiver<ActionMessage>>>,
}

#[async_trait]
impl Subscription for ChannelSubscription {
    async fn recv(&mut self) -> Result<Option<ActionMessage>, BrokerError> {
        match self.receiver.as_mut() {
            Some(receiver) => Ok(receiver.recv().await),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.receiver = None;
    }
}

/// Cloneable producer side of a [`ChannelBroker`].
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    sender: mpsc::Sender<ActionMessage>,
}

impl ChannelPublisher {
    /// Enqueue a message, waiting while the channel is full.
    ///
    /// # Errors
    /// Returns [`BrokerError::Connection`] if the broker was dropped.
    pub async fn publish(&self, message: ActionMessage) -> Result<(), BrokerError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| BrokerError::Connection("broker is gone".to_owned()))
    }

    /// Enqueue a message without waiting.
    ///
    /// # Errors
    /// Returns [`BrokerError::Full`] when the channel has no free slot and
    /// [`BrokerError::Connection`] if the broker was dropped.
    pub fn try_publish(&self, message: ActionMessage) -> Result<(), BrokerError> {
        self.sender.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => BrokerError::Full,
            mpsc::error::TrySendError::Closed(_) => {
                BrokerError::Connection("broker is gone".to_owned())
            }
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let broker = ChannelBroker::new(8);
        let publisher = broker.publisher();
        for t in ["m1", "m2", "m3"] {
            publisher.publish(ActionMessage::new(t, "")).await.unwrap();
        }

        let mut sub = broker.subscribe().await.unwrap();
        for t in ["m1", "m2", "m3"] {
            assert_eq!(sub.recv().await.unwrap().unwrap().action_type, t);
        }
    }

    #[tokio::test]
    async fn one_subscriber_at_a_time() {
        let broker = ChannelBroker::new(8);
        let mut first = broker.subscribe().await.unwrap();
        assert!(broker.subscribe().await.is_err());

        first.close().await;
        first.close().await;
        assert!(first.recv().await.unwrap().is_none());

        broker
            .publisher()
            .publish(ActionMessage::new("after", "x"))
            .await
            .unwrap();
        let mut second = broker.subscribe().await.unwrap();
        assert_eq!(second.recv().await.unwrap().unwrap().action_type, "after");
    }

    #[tokio::test]
    async fn try_publish_reports_a_full_queue() {
        let broker = ChannelBroker::new(1);
        let publisher = broker.publisher();

        publisher.try_publish(ActionMessage::new("first", "")).unwrap();
        assert!(matches!(
            publisher.try_publish(ActionMessage::new("second", "")),
            Err(BrokerError::Full)
        ));

        let mut sub = broker.subscribe().await.unwrap();
        assert_eq!(sub.recv().await.unwrap().unwrap().action_type, "first");
        publisher.try_publish(ActionMessage::new("third", "")).unwrap();
    }

    #[test]
    fn try_publish_after_broker_dropped_fails() {
        let publisher = ChannelBroker::new(1).publisher();
        assert!(matches!(
            publisher.try_publish(ActionMessage::new("late", "")),
            Err(BrokerError::Connection(_))
        ));
    }
}
