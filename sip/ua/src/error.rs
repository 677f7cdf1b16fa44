use sip_types::HeaderError;
use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure the dialog core surfaces to its user.
///
/// Recoverable conditions (for example a single retransmission lost on
/// UDP) are absorbed inside the dialog; everything here drove a state
/// transition first and is reported exactly once through the operation
/// result and the terminate observer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed message, event not allowed in the current state,
    /// out-of-order CSeq or a missing required header
    #[error("protocol violation: {0}")]
    Protocol(#[source] anyhow::Error),

    /// Timer B, F or H fired before a final response/ACK arrived
    #[error("transaction timed out")]
    TransactionTimeout,

    /// The transport adapter reported a send failure
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// The dialog is no longer in a usable state (SIP 481 on the wire)
    #[error("dialog no longer exists")]
    DialogTerminated,

    /// The configured dialog limit was reached
    #[error("dialog limit reached")]
    ResourceExhausted,

    /// The caller's cancellation token triggered
    #[error("operation cancelled")]
    Cancelled,

    /// Rejected synchronously at start-up
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl Error {
    pub(crate) fn protocol<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Protocol(error.into())
    }
}

impl From<HeaderError> for Error {
    fn from(error: HeaderError) -> Self {
        Self::Protocol(error.into())
    }
}
