//! Error types for the bootstrap runtime.
//!
//! Store-level failures never appear here: they travel through the state
//! machines as [`StoreError`](crate::StoreError) values and are handled as
//! ordinary transitions. This module covers faults of the runtime itself.

use std::fmt;

/// Result type alias for bootstrap runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the bootstrap components.
#[derive(Debug)]
pub enum Error {
    /// A component inbox was closed while a message was being delivered.
    Channel(String),

    /// The coordinator has been shut down.
    Shutdown,

    /// Configuration error.
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Channel(msg) => {
                write!(f, "channel error: {}", msg)
            }
            Error::Shutdown => {
                write!(f, "cluster discovery has been shut down")
            }
            Error::Config(msg) => {
                write!(f, "configuration error: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}

impl<T> From<async_channel::SendError<T>> for Error {
    fn from(err: async_channel::SendError<T>) -> Self {
        Error::Channel(err.to_string())
    }
}

impl From<async_channel::RecvError> for Error {
    fn from(err: async_channel::RecvError) -> Self {
        Error::Channel(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("seeds path is empty".to_owned());
        assert!(err.to_string().contains("seeds path is empty"));
        assert!(Error::Shutdown.to_string().contains("shut down"));
    }

    #[test]
    fn test_error_from_recv() {
        let (tx, rx) = async_channel::bounded::<u32>(1);
        drop(tx);
        let recv_err = futures::executor::block_on(rx.recv()).unwrap_err();
        let err: Error = recv_err.into();
        assert!(matches!(err, Error::Channel(_)));
    }
}
