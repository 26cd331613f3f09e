use super::Topic;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure of a session request
///
/// Crosses the wire inside responses, so it stays `Clone` and serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionError {
    /// The remote handler refused the request (e.g. authorization denied)
    Rejected(String),
    /// The session closed before the request completed
    Disconnected,
    /// An unsubscribe arrived while the subscribe was still being authorized
    Superseded,
    /// No handler registered for the topic on the receiving side
    UnhandledTopic(Topic),
    /// Payload could not be encoded or decoded
    InvalidPayload(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Rejected(reason) => write!(f, "request rejected: {}", reason),
            SessionError::Disconnected => write!(f, "session disconnected"),
            SessionError::Superseded => {
                write!(f, "subscription superseded by a later unsubscribe")
            }
            SessionError::UnhandledTopic(topic) => write!(f, "no handler for topic '{}'", topic),
            SessionError::InvalidPayload(msg) => write!(f, "invalid payload: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::InvalidPayload(err.to_string())
    }
}
