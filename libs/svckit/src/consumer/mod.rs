//! Action consumption: a broker pull loop dispatching to a user handler.

pub mod broker;
pub mod channel;
pub mod handler;
pub mod message;
pub mod worker;

pub use broker::{Broker, Subscription};
pub use channel::{ChannelBroker, ChannelPublisher};
pub use handler::{ActionHandler, FnHandler, handler_fn};
pub use message::ActionMessage;
pub use worker::{ActionConsumer, ConsumerState};
