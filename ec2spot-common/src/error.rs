use thiserror::Error;

/// Errors raised by the spot driver. Nothing here is retried: every variant
/// reaches the caller as soon as it is detected.
#[derive(Debug, Error)]
pub enum SpotError {
    /// Mutually exclusive options were supplied together.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid type: {0}")]
    InvalidType(String),

    /// A wire state token outside the five known values.
    #[error("unknown spot request state: {0:?}")]
    UnknownState(String),

    /// A response element that must be present was not found.
    #[error("missing element in response: {0}")]
    MissingElement(String),

    #[error("malformed XML response: {0}")]
    Xml(String),

    /// Error document returned by the provider.
    #[error("provider error {code}: {message}")]
    Provider { code: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, SpotError>;
