use async_trait::async_trait;

use super::message::ActionMessage;
use crate::error::BrokerError;

/// Source of action messages.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a subscription. Called again to reconnect after a failure.
    async fn subscribe(&self) -> Result<Box<dyn Subscription>, BrokerError>;
}

/// An open subscription delivering messages in order.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message; `Ok(None)` means the broker closed the
    /// subscription.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a message.
    async fn recv(&mut self) -> Result<Option<ActionMessage>, BrokerError>;

    /// Unsubscribe and release the connection. Idempotent.
    async fn close(&mut self);
}
