use bytes::Bytes;
use uuid::Uuid;

/// One unit of work delivered by a broker.
///
/// The consumer owns a message for exactly one dispatch and drops it as soon
/// as the handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionMessage {
    pub action_type: String,
    pub payload: Bytes,
    pub correlation_id: String,
}

impl ActionMessage {
    /// Message with a fresh random correlation id.
    #[must_use]
    pub fn new(action_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            action_type: action_type.into(),
            payload: payload.into(),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}
