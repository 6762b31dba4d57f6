//! Server side of the key exchange.
//!
//! ```text
//! server -> client   "<e> <n>"
//! client -> server   "<e> <n> [userId]"
//! ```
//!
//! Trust is on first use: whatever key the client presents is the key the
//! relay encrypts to from then on.

use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::{
    cipher::PublicKey,
    error::SessionError,
    frame::read_frame,
    registry::{ConnectionId, Outbound, SessionRegistry},
};

/// User id recorded for clients that do not send one.
pub const UNKNOWN_USER: &str = "(unknown)";

/// Sent in plaintext because the client's key is not trusted yet.
pub const DUPLICATE_USER_NOTICE: &str = "Error: User ID already in use.";

const MAX_USER_ID_CHARS: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub public_key: PublicKey,
    pub user_id: String,
}

/// Parses the leading `"<e> <n>"` of a key frame.
pub fn parse_public_key(frame: &str) -> Result<PublicKey, SessionError> {
    let mut tokens = frame.split_whitespace();
    let e = parse_key_part(tokens.next(), "exponent", frame)?;
    let n = parse_key_part(tokens.next(), "modulus", frame)?;
    if n < 2 {
        return Err(SessionError::Parse(format!("modulus {n} is too small")));
    }
    Ok(PublicKey { e, n })
}

fn parse_key_part(token: Option<&str>, part: &str, frame: &str) -> Result<u64, SessionError> {
    token
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| SessionError::Parse(format!("missing or invalid key {part} in {frame:?}")))
}

/// Parses the client's reply: a public key and an optional user id.
pub fn parse_client_hello(frame: &str) -> Result<ClientHello, SessionError> {
    let public_key = parse_public_key(frame)?;
    let user_id = frame
        .split_whitespace()
        .nth(2)
        .map(|token| token.chars().take(MAX_USER_ID_CHARS).collect())
        .unwrap_or_else(|| UNKNOWN_USER.to_string());

    Ok(ClientHello {
        public_key,
        user_id,
    })
}

/// Runs the exchange on a freshly accepted connection whose placeholder entry
/// `id` is already registered.
///
/// On success the entry carries the client's key and user id but is still not
/// connected. The caller flips that once the worker is running.
pub async fn perform<R>(
    reader: &mut R,
    outbound: &Outbound,
    registry: &SessionRegistry,
    id: ConnectionId,
    server_key: &PublicKey,
    buffer_size: usize,
) -> Result<ClientHello, SessionError>
where
    R: AsyncRead + Unpin,
{
    outbound.send(&server_key.to_string()).await?;

    let mut buf = vec![0u8; buffer_size];
    let frame = read_frame(reader, &mut buf)
        .await?
        .ok_or(SessionError::PeerClosed)?;
    let hello = parse_client_hello(&frame)?;

    if let Err(err) = registry
        .claim_identity(id, &hello.user_id, hello.public_key)
        .await
    {
        if matches!(err, SessionError::DuplicateUser(_)) {
            if let Err(send_err) = outbound.send(DUPLICATE_USER_NOTICE).await {
                debug!(id, error = ?send_err, "failed to send duplicate user notice");
            }
        }
        return Err(err);
    }

    info!(
        id,
        user = %hello.user_id,
        e = hello.public_key.e,
        n = hello.public_key.n,
        "client completed key exchange"
    );
    Ok(hello)
}
