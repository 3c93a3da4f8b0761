//! Relay error taxonomy.
//!
//! | Variant     | Effect                                               |
//! |-------------|------------------------------------------------------|
//! | `Protocol`  | frame dropped, connection survives                   |
//! | `Merge`     | update dropped, never rebroadcast, session survives  |
//! | `Transport` | connection closed, client leaves its session         |
//!
//! Nothing here is retried by the relay; reconnects are a client concern.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("merge rejected: {0}")]
    Merge(String),

    /// The session was evicted between lookup and join; look it up again.
    #[error("session closed")]
    SessionClosed,

    #[error("invalid connection target: {0}")]
    InvalidTarget(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the connection must be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_) | Self::InvalidTarget(_))
    }
}

impl From<yrs::encoding::read::Error> for RelayError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        RelayError::Merge(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(!RelayError::Protocol(ProtocolError::EmptyFrame).is_fatal());
        assert!(!RelayError::Merge("bad update".into()).is_fatal());
        assert!(!RelayError::SessionClosed.is_fatal());
        assert!(RelayError::Transport(tungstenite::Error::ConnectionClosed).is_fatal());
        assert!(RelayError::InvalidTarget(String::new()).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = RelayError::from(ProtocolError::UnknownKind(9));
        assert_eq!(err.to_string(), "protocol error: unknown message kind 9");
    }
}
