use std::future::Future;

use async_trait::async_trait;

use super::message::ActionMessage;
use crate::error::HandlerError;

/// User business logic invoked once per received message.
///
/// Delivery is at-least-once: a message may be seen again after a broker
/// redelivery, so implementations should be idempotent.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// # Errors
    /// A returned error is logged with the message's correlation id and does
    /// not affect the processing of later messages.
    async fn handle(&self, message: &ActionMessage) -> Result<(), HandlerError>;
}

/// Handler built from an async closure, see [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap an async closure taking an owned [`ActionMessage`].
///
/// ```
/// use svckit::{handler_fn, HandlerError};
///
/// let handler = handler_fn(|msg| async move {
///     if msg.action_type == "reject" {
///         return Err(HandlerError::new("rejected"));
///     }
///     Ok(())
/// });
/// # let _ = handler;
/// ```
#[must_use]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ActionMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(ActionMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: &ActionMessage) -> Result<(), HandlerError> {
        (self.0)(message.clone()).await
    }
}
