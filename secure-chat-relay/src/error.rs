use std::time::Duration;

use thiserror::Error;

/// Failures of a single connection's session.
///
/// None of these escape the connection they happened on. The worst a peer can
/// see from another peer's failure is a routed delivery-error reply.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed frame: {0}")]
    Parse(String),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("user id '{0}' is already connected")]
    DuplicateUser(String),
    #[error("'{0}' not found or not connected")]
    NotFound(String),
    #[error("handshake did not finish within {0:?}")]
    Timeout(Duration),
    #[error("relay is shutting down")]
    Shutdown,
}
