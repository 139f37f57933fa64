use thiserror::Error;

/// Canonical result for core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// `NotAnUpdate` is an in-process sentinel and has no wire representation.
    #[error("a non-update cannot be encoded for the wire")]
    NotAnUpdateOnWire,

    #[error("Wire decode error: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}
