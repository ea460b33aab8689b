//! Error types for the transport.

use thiserror::Error;

/// Result type for host and peer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the public API.
///
/// Intentionally small: per-datagram parse failures and discards are
/// handled inside the protocol and never reach the application, and a
/// reliable-delivery timeout surfaces as a `Disconnect` event rather than
/// an error.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket failure that aborts the current service call.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A caller-supplied value is out of range or the operation is not
    /// valid in the peer's current state.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The remote endpoint violated the protocol in a way that cannot be
    /// attributed to packet loss.
    #[error("protocol error: {message}")]
    Protocol { message: String },
}

impl Error {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }
}
