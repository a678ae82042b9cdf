use thiserror::Error;

/// Errors that can occur while subscribing, broadcasting or managing an adapter.
#[derive(Error, Debug)]
pub enum PubSubError {
    /// The backend transport could not accept a publish or could not
    /// establish (or keep) a channel subscription.
    ///
    /// Never retried inside this crate; retry policy belongs to the caller.
    #[error("transport error: {0}")]
    Transport(String),

    /// A listener returned an error or panicked while being invoked.
    ///
    /// Contained by the dispatcher; it is logged and never reaches a caller
    /// of `subscribe` or `broadcast`.
    #[error("listener error: {0}")]
    Listener(String),

    /// The adapter is shutting down or has been shut down.
    #[error("adapter stopped")]
    Stopped,

    /// A required configuration value was not provided.
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// A configuration value was provided but is not usable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON configuration could not be parsed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for pub/sub operations.
pub type Result<T> = std::result::Result<T, PubSubError>;
