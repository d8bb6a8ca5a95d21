//! Connection registry
//!
//! A fixed number of slots, each empty or holding one live [`Connection`].
//! Every access goes through a single `tokio::sync::Mutex` (FIFO-fair), and
//! the registry never hands a connection out while it stays registered: a
//! caller either borrows it inside [`Registry::for_each_except`] under the
//! lock, or takes it by value when it is removed. Taking it by value is what
//! makes close exactly-once: whoever pulls a connection out of its slot is
//! the only one able to close it.

use futures::future::BoxFuture;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Unique identifier for an accepted connection
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Position of a connection in the registry
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct SlotId(pub usize);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// The write side of one accepted connection.
///
/// The read side stays with the connection's worker. Closing the connection
/// shuts the writer down and fires `closed`, which the worker watches so it
/// stops reading as soon as anyone else closes its connection.
pub struct Connection<W> {
    id: ConnectionId,
    peer: SocketAddr,
    writer: W,
    closed: CancellationToken,
}

impl<W> std::fmt::Debug for Connection<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl<W> Connection<W> {
    pub fn new(id: ConnectionId, peer: SocketAddr, writer: W) -> Self {
        Self {
            id,
            peer,
            writer,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// A token that is cancelled once this connection has been closed.
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl<W: AsyncWrite + Unpin> Connection<W> {
    /// Write all of `bytes`, giving up after `timeout` if one is set.
    pub async fn send(&mut self, bytes: &[u8], timeout: Option<Duration>) -> io::Result<()> {
        let writer = &mut self.writer;
        let write = async move {
            writer.write_all(bytes).await?;
            writer.flush().await
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?,
            None => write.await,
        }
    }

    /// Close the connection. Consumes it, so it can only happen once.
    pub async fn close(mut self) {
        self.closed.cancel();
        if let Err(e) = self.writer.shutdown().await {
            // The peer is usually already gone when we get here.
            debug!(conn = %self.id, error = %e, "shutdown after close failed");
        }
    }
}

/// What a [`Registry::for_each_except`] visitor wants done with a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Visit {
    Keep,
    /// The connection is dead: clear its slot and close it.
    Evict,
}

/// Outcome of one [`Registry::for_each_except`] pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Sweep {
    pub visited: usize,
    pub evicted: usize,
}

/// Every slot was occupied. Hands the connection back so the caller can
/// turn it away.
pub struct Full<W>(pub Connection<W>);

impl<W> std::fmt::Debug for Full<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Full").field(&self.0).finish()
    }
}

/// Bounded set of live connections, shared between the accept loop, the
/// workers and the shutdown path.
pub struct Registry<W> {
    slots: Mutex<Vec<Option<Connection<W>>>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl<W> Registry<W> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new((0..capacity).map(|_| None).collect()),
            capacity,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocate an id for a connection that is about to be registered.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of occupied slots
    pub async fn len(&self) -> usize {
        self.slots.lock().await.iter().flatten().count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.slots
            .lock()
            .await
            .iter()
            .flatten()
            .any(|conn| conn.id == id)
    }

    /// Put `conn` in the first free slot.
    pub async fn try_insert(&self, conn: Connection<W>) -> Result<SlotId, Full<W>> {
        let mut slots = self.slots.lock().await;
        match slots.iter().position(Option::is_none) {
            Some(index) => {
                debug!(conn = %conn.id, slot = index, "registered connection");
                slots[index] = Some(conn);
                Ok(SlotId(index))
            }
            None => Err(Full(conn)),
        }
    }

    /// Clear the slot holding `id` and hand its connection to the caller,
    /// who becomes responsible for closing it. `None` if another path
    /// already removed it.
    pub async fn remove(&self, id: ConnectionId) -> Option<Connection<W>> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .iter_mut()
            .find(|slot| matches!(slot, Some(conn) if conn.id == id))?;
        slot.take()
    }
}

impl<W: AsyncWrite + Unpin + Send> Registry<W> {
    /// Run `visit` on every registered connection except `excluded`, all
    /// under one lock acquisition. Connections the visitor marks
    /// [`Visit::Evict`] are cleared and closed before the lock is released.
    pub async fn for_each_except<F>(&self, excluded: ConnectionId, mut visit: F) -> Sweep
    where
        F: for<'c> FnMut(&'c mut Connection<W>) -> BoxFuture<'c, Visit> + Send,
    {
        let mut slots = self.slots.lock().await;
        let mut sweep = Sweep::default();

        for (index, slot) in slots.iter_mut().enumerate() {
            let Some(conn) = slot.as_mut() else {
                continue;
            };
            if conn.id == excluded {
                continue;
            }

            sweep.visited += 1;
            if visit(conn).await == Visit::Evict {
                if let Some(dead) = slot.take() {
                    debug!(conn = %dead.id, peer = %dead.peer, slot = index, "evicted connection");
                    dead.close().await;
                    sweep.evicted += 1;
                }
            }
        }

        sweep
    }

    /// Close every registered connection and clear every slot.
    /// Returns how many connections were closed.
    pub async fn close_all(&self) -> usize {
        let mut slots = self.slots.lock().await;
        let mut closed = 0;
        for slot in slots.iter_mut() {
            if let Some(conn) = slot.take() {
                conn.close().await;
                closed += 1;
            }
        }
        closed
    }
}
