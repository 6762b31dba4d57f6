use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf},
    select,
    task::{JoinError, JoinSet},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cipher::{Cipher, ToyRsa},
    config::ServerConfig,
    error::SessionError,
    handshake::{self, ClientHello},
    registry::{ConnectionId, Outbound, Session, SessionRegistry},
    worker::{ConnectionWorker, TerminationReason, log_remaining_users},
};

/// Everything a connection worker shares with the rest of the relay.
#[derive(Clone)]
pub struct RelayContext {
    pub registry: Arc<SessionRegistry>,
    pub cipher: Arc<dyn Cipher>,
    pub config: Arc<ServerConfig>,
}

/// The accept loop: handshakes new clients and supervises their workers.
pub struct Server {
    listener: TcpListener,
    context: RelayContext,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            context: RelayContext {
                registry: Arc::new(SessionRegistry::new()),
                cipher: Arc::new(ToyRsa),
                config: Arc::new(config),
            },
        }
    }

    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener, config))
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.context.cipher = cipher;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.context.registry)
    }

    /// Accepts clients until `shutdown` is cancelled.
    ///
    /// On the way out every worker is cancelled and awaited for at most the
    /// configured grace period. Workers still blocked after that are aborted,
    /// and whatever is still registered is swept, so no session outlives this
    /// call.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Server { listener, context } = self;
        let mut workers = JoinSet::new();

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    log_worker_exit(joined);
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &context, &mut workers, &shutdown).await;
                }
            }
        }

        info!("relay shutting down");
        drop(listener);

        drain_workers(&mut workers, context.config.shutdown_grace).await;
        sweep_sessions(&context.registry).await;

        info!("relay shut down complete");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                return;
            }
            info!("interrupt received");
            signal_token.cancel();
        });

        self.run(shutdown).await
    }
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    context: &RelayContext,
    workers: &mut JoinSet<TerminationReason>,
    shutdown: &CancellationToken,
) {
    match result {
        Ok((stream, peer)) => admit_client(stream, peer, context, workers, shutdown).await,
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn admit_client(
    stream: TcpStream,
    peer: SocketAddr,
    context: &RelayContext,
    workers: &mut JoinSet<TerminationReason>,
    shutdown: &CancellationToken,
) {
    let registry = &context.registry;
    let id = registry.next_id();
    let (mut reader, writer) = stream.into_split();
    let outbound = Outbound::new(writer);

    registry
        .insert(Session::placeholder(id, outbound.clone()))
        .await;
    info!(%peer, id, "accepted connection");

    let hello = match run_handshake(&mut reader, &outbound, id, context, shutdown).await {
        Ok(hello) => hello,
        Err(SessionError::Shutdown) => {
            debug!(%peer, id, "key exchange interrupted by shutdown");
            abort_connection(registry, id, &outbound).await;
            return;
        }
        Err(err) => {
            warn!(%peer, id, error = %err, "key exchange failed");
            abort_connection(registry, id, &outbound).await;
            return;
        }
    };

    let Some(session) = registry.get(id).await else {
        warn!(id, "session vanished after key exchange");
        return;
    };

    let worker = ConnectionWorker::new(
        session,
        reader,
        context.clone(),
        shutdown.child_token(),
    );
    workers.spawn(worker.run());

    if registry.mark_connected(id).await {
        info!(%peer, id, user = %hello.user_id, "client session started");
    }
}

async fn run_handshake(
    reader: &mut OwnedReadHalf,
    outbound: &Outbound,
    id: ConnectionId,
    context: &RelayContext,
    shutdown: &CancellationToken,
) -> Result<ClientHello, SessionError> {
    let config = &context.config;
    let exchange = handshake::perform(
        reader,
        outbound,
        &context.registry,
        id,
        &config.keys.public,
        config.buffer_size,
    );

    select! {
        _ = shutdown.cancelled() => Err(SessionError::Shutdown),
        result = timeout(config.handshake_timeout, exchange) => {
            result.map_err(|_| SessionError::Timeout(config.handshake_timeout))?
        }
    }
}

/// Teardown for a connection that never got a worker.
async fn abort_connection(registry: &SessionRegistry, id: ConnectionId, outbound: &Outbound) {
    registry.update(id, |state| state.connected = false).await;
    if let Err(err) = outbound.close().await {
        debug!(id, error = ?err, "failed to close rejected connection");
    }
    registry.remove(id).await;
}

/// Waits for cancelled workers, aborting the ones that outlast `grace`.
///
/// A worker blocked writing to a peer that stopped reading never polls its
/// token. Aborting it drops the send lock it holds, which also unblocks the
/// recipient's own teardown.
async fn drain_workers(workers: &mut JoinSet<TerminationReason>, grace: Duration) {
    let drained = timeout(grace, async {
        while let Some(joined) = workers.join_next().await {
            log_worker_exit(joined);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            stuck = workers.len(),
            ?grace,
            "workers did not stop in time, aborting"
        );
        workers.shutdown().await;
    }
}

fn log_worker_exit(joined: Result<TerminationReason, JoinError>) {
    match joined {
        Ok(reason) => debug!(%reason, "receiver exited"),
        Err(err) => warn!(error = ?err, "receiver task failed"),
    }
}

/// Forced teardown of anything the workers did not remove themselves.
async fn sweep_sessions(registry: &SessionRegistry) {
    let ids = registry.ids().await;
    if ids.is_empty() {
        return;
    }

    info!(count = ids.len(), "cleaning up remaining clients");
    for id in ids {
        let Some(session) = registry.remove(id).await else {
            continue;
        };
        if let Err(err) = session.outbound.close().await {
            debug!(id, error = ?err, "ignoring close failure during shutdown");
        }
    }
    log_remaining_users(registry).await;
}
