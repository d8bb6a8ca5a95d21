use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcaster, Message};
use crate::error::RelayError;
use crate::registry::ConnectionId;

/// Why a worker stopped reading.
#[derive(Debug)]
pub enum Disconnect {
    /// The peer closed its end.
    Eof,
    /// Reading failed.
    Error(io::Error),
    /// Someone else closed the connection: a broadcast found it dead, or
    /// the relay is shutting down.
    Closed,
}

/// Reads chunks from one connection and hands each to the broadcaster.
///
/// The worker owns the read side only. The write side lives in the registry,
/// and the worker refers to it by id.
pub struct Worker<R, W> {
    id: ConnectionId,
    peer: SocketAddr,
    reader: R,
    buffer: Vec<u8>,
    closed: CancellationToken,
    broadcaster: Broadcaster<W>,
}

impl<R, W> Worker<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Allocate the worker's read buffer. Fails instead of aborting when the
    /// buffer cannot be allocated, so the caller can roll the registration back.
    pub fn prepare(
        id: ConnectionId,
        peer: SocketAddr,
        reader: R,
        closed: CancellationToken,
        broadcaster: Broadcaster<W>,
        buffer_size: usize,
    ) -> Result<Self, RelayError> {
        if buffer_size < 2 {
            return Err(RelayError::WorkerSetup(format!(
                "read buffer of {buffer_size} bytes is too small"
            )));
        }
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(buffer_size)
            .map_err(|e| RelayError::WorkerSetup(e.to_string()))?;
        buffer.resize(buffer_size, 0);

        Ok(Self {
            id,
            peer,
            reader,
            buffer,
            closed,
            broadcaster,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Relay until the connection ends, then deregister and close it.
    pub async fn run(mut self) -> Disconnect {
        // one byte of the buffer is never filled
        let limit = self.buffer.len() - 1;

        let reason = loop {
            let read = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break Disconnect::Closed,
                read = self.reader.read(&mut self.buffer[..limit]) => read,
            };

            match read {
                Ok(0) => break Disconnect::Eof,
                Ok(n) => {
                    let message = Message::from_chunk(&self.buffer[..n]);
                    self.broadcaster.stats().message_received(n);
                    debug!(
                        conn = %self.id,
                        peer = %self.peer,
                        bytes = n,
                        text = %String::from_utf8_lossy(message.body()),
                        "message received"
                    );
                    self.broadcaster.broadcast(&message, self.id).await;
                }
                Err(e) => break Disconnect::Error(e),
            }
        };

        match &reason {
            Disconnect::Eof => info!(conn = %self.id, peer = %self.peer, "client disconnected"),
            Disconnect::Error(e) => {
                warn!(conn = %self.id, peer = %self.peer, error = %e, "read failed, dropping client")
            }
            Disconnect::Closed => {
                debug!(conn = %self.id, peer = %self.peer, "connection closed elsewhere")
            }
        }

        // A no-op when eviction or shutdown got there first.
        if let Some(conn) = self.broadcaster.registry().remove(self.id).await {
            conn.close().await;
        }
        self.broadcaster.stats().connection_closed();

        reason
    }
}
