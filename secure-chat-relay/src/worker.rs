//! Receive loop for one connection.
//!
//! ```text
//! Receiving -> Decoding -> Routing -> Receiving
//!     |            |
//!     +------------+--> Terminating
//! ```
//!
//! The worker is the only component that flips its own entry to
//! disconnected and removes it from the registry. Other workers only ever look
//! it up.

use std::{fmt, io, sync::Arc};

use clap::ValueEnum;
use tokio::{io::AsyncRead, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    cipher,
    frame::read_frame,
    registry::{Session, SessionRegistry},
    router::{RouteOutcome, Router},
    server::RelayContext,
};

/// What the worker does after a client sends `exit`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ExitPolicy {
    /// Keep reading until the client actually closes or the read fails.
    #[default]
    AwaitClose,
    /// Tear the session down as soon as `exit` is routed.
    CloseImmediately,
}

#[derive(Debug)]
pub enum TerminationReason {
    /// Zero-length read: the peer closed its side.
    Graceful,
    Io(io::Error),
    ExitCommand,
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Graceful => f.write_str("disconnected gracefully"),
            TerminationReason::Io(err) => write!(f, "connection lost: {err}"),
            TerminationReason::ExitCommand => f.write_str("sent exit"),
            TerminationReason::Shutdown => f.write_str("relay shutting down"),
        }
    }
}

pub struct ConnectionWorker<R> {
    session: Session,
    reader: R,
    context: RelayContext,
    router: Router,
    cancel: CancellationToken,
}

impl<R> ConnectionWorker<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(
        session: Session,
        reader: R,
        context: RelayContext,
        cancel: CancellationToken,
    ) -> Self {
        let router = Router::new(Arc::clone(&context.registry), Arc::clone(&context.cipher));
        Self {
            session,
            reader,
            context,
            router,
            cancel,
        }
    }

    /// Runs until the connection ends, then tears it down.
    pub async fn run(mut self) -> TerminationReason {
        info!(
            id = self.session.state.id,
            user = %self.session.state.display_name(),
            "receiver started"
        );

        let reason = self.receive_loop().await;
        self.teardown(&reason).await;
        reason
    }

    async fn receive_loop(&mut self) -> TerminationReason {
        let mut buf = vec![0u8; self.context.config.buffer_size];

        loop {
            let read = select! {
                _ = self.cancel.cancelled() => return TerminationReason::Shutdown,
                read = read_frame(&mut self.reader, &mut buf) => read,
            };

            let frame = match read {
                Ok(Some(frame)) => frame,
                Ok(None) => return TerminationReason::Graceful,
                Err(err) => return TerminationReason::Io(err),
            };

            if self.handle_frame(&frame).await == RouteOutcome::Exit
                && self.context.config.exit_policy == ExitPolicy::CloseImmediately
            {
                return TerminationReason::ExitCommand;
            }
        }
    }

    async fn handle_frame(&self, frame: &str) -> RouteOutcome {
        let id = self.session.state.id;
        trace!(id, bytes = frame.len(), hex = %hex::encode(frame), "received frame");

        let ciphertext = cipher::deserialize(frame);
        if ciphertext.is_empty() {
            if frame.trim().is_empty() {
                info!(id, "(empty message)");
            } else {
                let preview: String = frame.chars().take(50).collect();
                warn!(id, %preview, "client sent invalid data");
            }
            return RouteOutcome::Continue;
        }

        let plaintext = self
            .context
            .cipher
            .decrypt(&ciphertext, &self.context.config.keys.private);
        debug!(id, %plaintext, "decrypted message");
        self.router.dispatch(&self.session.state, &plaintext).await
    }

    async fn teardown(&self, reason: &TerminationReason) {
        let id = self.session.state.id;
        let user = self.session.state.display_name();

        let registry = &self.context.registry;
        registry.update(id, |state| state.connected = false).await;
        if let Err(err) = self.session.outbound.close().await {
            debug!(id, error = ?err, "send half already closed");
        }

        if registry.remove(id).await.is_some() {
            match reason {
                TerminationReason::Io(_) => warn!(id, %user, %reason, "client disconnected"),
                _ => info!(id, %user, %reason, "client disconnected"),
            }
            log_remaining_users(registry).await;
        }
    }
}

pub(crate) async fn log_remaining_users(registry: &SessionRegistry) {
    let remaining: Vec<String> = registry
        .snapshot()
        .await
        .into_iter()
        .map(|state| state.user_id)
        .collect();
    if remaining.is_empty() {
        info!("remaining connected users: none");
    } else {
        info!("remaining connected users: {}", remaining.join(" "));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::{
        cipher::{Cipher, KeyPair, ToyRsa},
        config::ServerConfig,
        registry::Outbound,
    };

    const SERVER: KeyPair = KeyPair::SERVER_DEFAULT;
    const CLIENT: KeyPair = KeyPair::CLIENT_DEFAULT;

    struct Harness {
        registry: Arc<SessionRegistry>,
        client: DuplexStream,
        cancel: CancellationToken,
        worker: tokio::task::JoinHandle<TerminationReason>,
    }

    async fn spawn_worker(user: &str, exit_policy: ExitPolicy) -> Harness {
        let registry = Arc::new(SessionRegistry::new());
        let (relay_side, client) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(relay_side);

        let id = registry.next_id();
        registry
            .insert(Session::placeholder(id, Outbound::new(writer)))
            .await;
        registry
            .claim_identity(id, user, CLIENT.public)
            .await
            .expect("claim");
        registry.mark_connected(id).await;
        let session = registry.get(id).await.expect("registered");

        let context = RelayContext {
            registry: Arc::clone(&registry),
            cipher: Arc::new(ToyRsa),
            config: Arc::new(ServerConfig {
                keys: SERVER,
                buffer_size: 4096,
                exit_policy,
                ..ServerConfig::default()
            }),
        };
        let cancel = CancellationToken::new();
        let worker = ConnectionWorker::new(session, reader, context, cancel.child_token());
        let worker = tokio::spawn(worker.run());

        Harness {
            registry,
            client,
            cancel,
            worker,
        }
    }

    fn encrypt_for_relay(text: &str) -> String {
        cipher::serialize(&ToyRsa.encrypt(text, &SERVER.public))
    }

    async fn finish(worker: tokio::task::JoinHandle<TerminationReason>) -> TerminationReason {
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker should stop")
            .expect("worker should not panic")
    }

    #[tokio::test]
    async fn peer_close_removes_the_entry() {
        let harness = spawn_worker("alice", ExitPolicy::AwaitClose).await;
        drop(harness.client);

        let reason = finish(harness.worker).await;
        assert!(matches!(reason, TerminationReason::Graceful | TerminationReason::Io(_)));
        assert!(harness.registry.is_empty().await);
    }

    #[tokio::test]
    async fn empty_and_invalid_frames_keep_the_session_open() {
        let mut harness = spawn_worker("alice", ExitPolicy::AwaitClose).await;

        harness.client.write_all(b" ").await.expect("send blank");
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.client.write_all(b"not ciphertext").await.expect("send junk");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut buf = [0u8; 64];
        let reply =
            tokio::time::timeout(Duration::from_millis(100), harness.client.read(&mut buf)).await;
        assert!(reply.is_err(), "no reply expected");
        assert!(harness.registry.find("alice").await.is_some());

        // Still routing: a message to self comes back.
        harness
            .client
            .write_all(encrypt_for_relay("alice/ping").as_bytes())
            .await
            .expect("send dm");
        let read = tokio::time::timeout(Duration::from_secs(1), harness.client.read(&mut buf))
            .await
            .expect("reply within timeout")
            .expect("read reply");
        let frame = String::from_utf8_lossy(&buf[..read]).into_owned();
        assert_eq!(
            ToyRsa.decrypt(&cipher::deserialize(&frame), &CLIENT.private),
            "[DM from alice]: ping"
        );
    }

    #[tokio::test]
    async fn exit_waits_for_close_by_default() {
        let mut harness = spawn_worker("alice", ExitPolicy::AwaitClose).await;

        harness
            .client
            .write_all(encrypt_for_relay("exit").as_bytes())
            .await
            .expect("send exit");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!harness.worker.is_finished());
        assert!(harness.registry.find("alice").await.is_some());

        harness.client.shutdown().await.expect("close client");
        let reason = finish(harness.worker).await;
        assert!(matches!(reason, TerminationReason::Graceful));
    }

    #[tokio::test]
    async fn exit_can_close_immediately() {
        let mut harness = spawn_worker("alice", ExitPolicy::CloseImmediately).await;

        harness
            .client
            .write_all(encrypt_for_relay("exit").as_bytes())
            .await
            .expect("send exit");

        let reason = finish(harness.worker).await;
        assert!(matches!(reason, TerminationReason::ExitCommand));
        assert!(harness.registry.is_empty().await);
    }

    #[tokio::test]
    async fn cancellation_tears_down_a_blocked_reader() {
        let mut harness = spawn_worker("alice", ExitPolicy::AwaitClose).await;
        harness.cancel.cancel();

        let reason = finish(harness.worker).await;
        assert!(matches!(reason, TerminationReason::Shutdown));
        assert!(harness.registry.is_empty().await);

        let mut buf = [0u8; 16];
        let read = harness.client.read(&mut buf).await.expect("read eof");
        assert_eq!(read, 0);
    }
}
