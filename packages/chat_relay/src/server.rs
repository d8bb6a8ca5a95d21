//! Lifecycle controller
//!
//! Owns the listening socket: accepts connections, registers them or turns
//! them away, spawns their workers, and on shutdown closes everything that
//! is still registered.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::registry::{Connection, Full, Registry};
use crate::stats::{RelayStats, StatsSnapshot};
use crate::worker::Worker;

/// Sent once to a connection that arrives while every slot is taken,
/// right before it is closed.
pub const SERVER_FULL_NOTICE: &[u8] = b"Server full. Try again later.\n";

/// Pause after a failed accept (e.g. out of file descriptors) so the loop
/// doesn't spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What shutdown found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Connections still registered when shutdown started
    pub closed_connections: usize,
    pub stats: StatsSnapshot,
}

pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: RelayConfig,
    broadcaster: Broadcaster<OwnedWriteHalf>,
}

impl Server {
    /// Validate `config`, create an empty registry and start listening.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let addr = config.bind_addr()?;
        let bind_err = |source| RelayError::Bind { addr, source };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(config.listen_backlog()).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let registry = Arc::new(Registry::new(config.max_clients));
        let max_clients = registry.capacity();
        let broadcaster = Broadcaster::new(
            registry,
            config.write_timeout(),
            Arc::new(RelayStats::new()),
        );

        info!(
            addr = %local_addr,
            max_clients,
            buffer_size = config.buffer_size,
            "relay listening"
        );

        Ok(Self {
            listener,
            local_addr,
            config,
            broadcaster,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<Registry<OwnedWriteHalf>> {
        self.broadcaster.registry().clone()
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.broadcaster.stats().clone()
    }

    /// Accept connections until `shutdown` resolves, then close every
    /// registered connection and the listener.
    ///
    /// Workers are never joined. Any that are still running observe their
    /// connection's close signal and finish on their own; their final
    /// deregistration finds an empty slot and does nothing.
    ///
    /// Admission runs inline, so a shutdown that fires mid-admission is seen
    /// once that admission finishes. Registering can wait on the registry
    /// lock behind a broadcast, which holds it for up to the write timeout
    /// per stalled receiver.
    pub async fn run<S>(self, shutdown: S) -> ShutdownSummary
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer).await,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        info!("shutting down relay");
        let closed_connections = self.broadcaster.registry().close_all().await;
        drop(self.listener);

        let stats = self.broadcaster.stats().snapshot();
        info!(closed = closed_connections, "relay stopped");
        ShutdownSummary {
            closed_connections,
            stats,
        }
    }

    async fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let registry = self.broadcaster.registry();
        let stats = self.broadcaster.stats();
        let id = registry.next_id();
        info!(conn = %id, %peer, "connection accepted");

        let (reader, writer) = stream.into_split();
        let conn = Connection::new(id, peer, writer);
        let closed = conn.close_signal();

        let slot = match registry.try_insert(conn).await {
            Ok(slot) => slot,
            Err(Full(mut rejected)) => {
                stats.connection_rejected();
                if let Err(e) = rejected
                    .send(SERVER_FULL_NOTICE, self.config.write_timeout())
                    .await
                {
                    debug!(conn = %id, error = %e, "could not deliver server-full notice");
                }
                rejected.close().await;
                info!(conn = %id, %peer, "connection rejected, server full");
                return;
            }
        };
        debug!(conn = %id, %slot, "connection registered");

        let worker = match Worker::prepare(
            id,
            peer,
            reader,
            closed,
            self.broadcaster.clone(),
            self.config.buffer_size,
        ) {
            Ok(worker) => worker,
            Err(e) => {
                error!(conn = %id, error = %e, "could not start worker, dropping connection");
                if let Some(conn) = registry.remove(id).await {
                    conn.close().await;
                }
                return;
            }
        };

        stats.connection_accepted();
        debug!(conn = %worker.id(), "worker started");
        tokio::spawn(worker.run());
    }
}
