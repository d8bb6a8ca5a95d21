use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use crate::registry::{ConnectionId, Registry, Visit};
use crate::stats::RelayStats;

/// One chunk read from a client, normalized for the wire: a single trailing
/// newline is stripped from the input and exactly one is appended.
///
/// No reassembly happens. Whatever one read returned is one message, so a
/// line split across reads goes out in pieces and two lines arriving in one
/// read go out together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message(Arc<[u8]>);

impl Message {
    pub fn from_chunk(chunk: &[u8]) -> Self {
        let body = chunk.strip_suffix(b"\n").unwrap_or(chunk);
        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.extend_from_slice(body);
        bytes.push(b'\n');
        Self(bytes.into())
    }

    /// Wire bytes, trailing newline included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The message without its trailing newline.
    pub fn body(&self) -> &[u8] {
        &self.0[..self.0.len() - 1]
    }

    /// Length on the wire, trailing newline included.
    pub fn wire_len(&self) -> usize {
        self.0.len()
    }

    /// True for a message that is only the newline.
    pub fn is_blank(&self) -> bool {
        self.body().is_empty()
    }
}

/// Result of one broadcast.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Delivery {
    pub delivered: usize,
    pub evicted: usize,
}

/// Fans messages out to every registered connection but the sender.
pub struct Broadcaster<W> {
    registry: Arc<Registry<W>>,
    write_timeout: Option<Duration>,
    stats: Arc<RelayStats>,
}

impl<W> Clone for Broadcaster<W> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            write_timeout: self.write_timeout,
            stats: self.stats.clone(),
        }
    }
}

impl<W> Broadcaster<W> {
    pub fn new(
        registry: Arc<Registry<W>>,
        write_timeout: Option<Duration>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            registry,
            write_timeout,
            stats,
        }
    }

    pub fn registry(&self) -> &Arc<Registry<W>> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }
}

impl<W: AsyncWrite + Unpin + Send> Broadcaster<W> {
    /// Write `message` to every registered connection except `origin`.
    ///
    /// Never fails. A receiver whose write errors (or times out) is treated
    /// as dead: it is evicted and closed inside the same critical section,
    /// and delivery to everyone else carries on.
    pub async fn broadcast(&self, message: &Message, origin: ConnectionId) -> Delivery {
        let timeout = self.write_timeout;
        let payload = message.clone();

        let sweep = self
            .registry
            .for_each_except(origin, move |conn| {
                let payload = payload.clone();
                Box::pin(async move {
                    match conn.send(payload.as_bytes(), timeout).await {
                        Ok(()) => Visit::Keep,
                        Err(e) => {
                            warn!(
                                conn = %conn.id(),
                                peer = %conn.peer(),
                                error = %e,
                                "receiver unreachable during broadcast, dropping it"
                            );
                            Visit::Evict
                        }
                    }
                })
            })
            .await;

        let delivery = Delivery {
            delivered: sweep.visited - sweep.evicted,
            evicted: sweep.evicted,
        };
        self.stats
            .message_relayed(delivery.delivered, message.wire_len());
        if delivery.evicted > 0 {
            self.stats.peers_evicted(delivery.evicted);
        }
        debug!(
            origin = %origin,
            delivered = delivery.delivered,
            evicted = delivery.evicted,
            "broadcast complete"
        );
        delivery
    }
}
