use thiserror::Error;

/// Errors surfaced by a [`crate::DirectoryClient`].
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Transient network or directory-side failure. Callers retry on their
    /// own schedule; this is never fatal by itself.
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    /// The directory no longer knows the registration (TTL expiry or an
    /// out-of-band removal). The caller must register again.
    #[error("registration {instance_id} expired in the directory")]
    RecordExpired { instance_id: String },

    #[error("invalid service descriptor: {0}")]
    InvalidDescriptor(String),
}

impl DirectoryError {
    #[must_use]
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
