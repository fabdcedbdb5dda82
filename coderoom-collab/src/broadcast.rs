//! Fan-out of coordinator messages to the live connections of a room.
//!
//! Each connection owns a bounded FIFO queue ([`PeerLink`]). A message is
//! encoded once and the same `Arc<str>` frame is pushed to every
//! recipient, so fan-out cost is one allocation plus N queue pushes.
//!
//! Nothing blocks, so broadcasting is safe while holding a room lock,
//! which is what keeps per-recipient order equal to the order in which the
//! room applied its mutations. A closed connection is skipped. A full queue
//! means the peer fell behind: the frame cannot be delivered, so the link
//! is flagged as overflowed and the connection task drops the peer, whose
//! reconnect starts again from a fresh `room-state`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::ServerMessage;

/// An encoded text frame, shared by all recipients of a broadcast.
pub type Frame = Arc<str>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handle used to push frames to one connection's writer task.
#[derive(Debug, Clone)]
pub struct PeerLink {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    overflow: Arc<Overflow>,
}

#[derive(Debug, Default)]
struct Overflow {
    flagged: AtomicBool,
    notify: Notify,
}

/// Outcome of a single enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Queue full; the frame was dropped and the link flagged.
    Full,
    /// The connection's writer is gone.
    Closed,
}

impl PeerLink {
    /// Create a link and the receiving end drained by the connection task.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ConnectionId::next(),
                tx,
                overflow: Arc::new(Overflow::default()),
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the receiving side is still alive.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Whether a frame was ever dropped because the queue was full.
    pub fn is_overflowed(&self) -> bool {
        self.overflow.flagged.load(Ordering::Acquire)
    }

    /// Resolves once the link has overflowed.
    pub async fn overflowed(&self) {
        // The stored `notify_one` permit covers a flag set between the
        // check and the wait.
        while !self.is_overflowed() {
            self.overflow.notify.notified().await;
        }
    }

    fn deliver(&self, frame: &Frame) -> Delivery {
        match self.tx.try_send(frame.clone()) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                if !self.overflow.flagged.swap(true, Ordering::AcqRel) {
                    self.overflow.notify.notify_waiters();
                    self.overflow.notify.notify_one();
                }
                Delivery::Full
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Which connections of a room receive a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients<'a> {
    All,
    /// Everyone except the given user id.
    AllExcept(&'a str),
}

impl Recipients<'_> {
    fn includes(&self, user_id: &str) -> bool {
        match self {
            Recipients::All => true,
            Recipients::AllExcept(excluded) => *excluded != user_id,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Messages handed to the hub (broadcasts and direct replies).
    pub messages_sent: u64,
    /// Frames enqueued to a recipient.
    pub frames_delivered: u64,
    /// Frames dropped because a recipient's queue was full.
    pub frames_dropped: u64,
    /// Recipients skipped because their connection was closed.
    pub closed_skipped: u64,
}

/// Atomic broadcast stats, lock-free on the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    closed_skipped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn record(&self, delivery: Delivery) {
        let counter = match delivery {
            Delivery::Sent => &self.frames_delivered,
            Delivery::Full => &self.frames_dropped,
            Delivery::Closed => &self.closed_skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Delivers coordinator messages to room connections.
#[derive(Default)]
pub struct BroadcastHub {
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `msg` to every selected connection.
    ///
    /// `peers` yields `(user_id, link)` pairs for the room. Returns the
    /// number of connections the frame was enqueued to.
    pub fn broadcast<'a>(
        &self,
        room_key: &str,
        peers: impl IntoIterator<Item = (&'a str, &'a PeerLink)>,
        msg: &ServerMessage,
        recipients: Recipients<'_>,
    ) -> usize {
        let frame = match encode(msg) {
            Some(frame) => frame,
            None => return 0,
        };
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        let mut sent = 0;
        for (user_id, link) in peers {
            if !recipients.includes(user_id) {
                continue;
            }
            let delivery = link.deliver(&frame);
            self.atomic_stats.record(delivery);
            match delivery {
                Delivery::Sent => sent += 1,
                Delivery::Full => {
                    log::warn!(
                        "Queue full for {user_id} in room {room_key}, dropping slow peer {}",
                        link.id()
                    );
                }
                Delivery::Closed => {}
            }
        }

        log::debug!("Broadcasted {} to {sent} users in room {room_key}", msg.kind());
        sent
    }

    /// Send a private reply to a single connection.
    pub fn send_direct(&self, link: &PeerLink, msg: &ServerMessage) -> Delivery {
        let Some(frame) = encode(msg) else {
            return Delivery::Closed;
        };
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        let delivery = link.deliver(&frame);
        self.atomic_stats.record(delivery);
        if delivery == Delivery::Full {
            log::warn!("Queue full for direct {}, dropping slow peer {}", msg.kind(), link.id());
        }
        delivery
    }

    /// Snapshot of the delivery counters.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            frames_delivered: self.atomic_stats.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.atomic_stats.frames_dropped.load(Ordering::Relaxed),
            closed_skipped: self.atomic_stats.closed_skipped.load(Ordering::Relaxed),
        }
    }
}

fn encode(msg: &ServerMessage) -> Option<Frame> {
    match msg.encode() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            log::error!("Failed to encode {}: {e}", msg.kind());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn left(user: &str) -> ServerMessage {
        ServerMessage::UserLeft { user_id: user.into() }
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let (a, _rx_a) = PeerLink::channel(4);
        let (b, _rx_b) = PeerLink::channel(4);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_excludes_sender() {
        let hub = BroadcastHub::new();
        let (alice, mut rx_alice) = PeerLink::channel(8);
        let (bob, mut rx_bob) = PeerLink::channel(8);
        let (carol, mut rx_carol) = PeerLink::channel(8);
        let peers = [("alice", &alice), ("bob", &bob), ("carol", &carol)];

        let sent = hub.broadcast("R", peers, &left("x"), Recipients::AllExcept("alice"));
        assert_eq!(sent, 2);

        assert!(rx_bob.recv().await.is_some());
        assert!(rx_carol.recv().await.is_some());
        assert!(rx_alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_all_includes_everyone() {
        let hub = BroadcastHub::new();
        let (alice, mut rx_alice) = PeerLink::channel(8);
        let (bob, mut rx_bob) = PeerLink::channel(8);

        let sent = hub.broadcast("R", [("alice", &alice), ("bob", &bob)], &left("x"), Recipients::All);
        assert_eq!(sent, 2);

        let frame = rx_alice.recv().await.unwrap();
        let same = rx_bob.recv().await.unwrap();
        // One encoding shared by every recipient.
        assert!(Arc::ptr_eq(&frame, &same));
        assert_eq!(ServerMessage::decode(&frame).unwrap(), left("x"));
    }

    #[tokio::test]
    async fn test_closed_connections_are_skipped() {
        let hub = BroadcastHub::new();
        let (alice, rx_alice) = PeerLink::channel(8);
        let (bob, mut rx_bob) = PeerLink::channel(8);
        drop(rx_alice);
        assert!(!alice.is_open());

        let sent = hub.broadcast("R", [("alice", &alice), ("bob", &bob)], &left("x"), Recipients::All);
        assert_eq!(sent, 1);
        assert!(rx_bob.recv().await.is_some());

        let stats = hub.stats();
        assert_eq!(stats.closed_skipped, 1);
        assert_eq!(stats.frames_delivered, 1);
    }

    #[tokio::test]
    async fn test_full_queue_flags_slow_peer() {
        let hub = BroadcastHub::new();
        let (slow, mut rx) = PeerLink::channel(1);
        let watcher = slow.clone();
        let flagged = tokio::spawn(async move { watcher.overflowed().await });

        assert_eq!(hub.send_direct(&slow, &left("a")), Delivery::Sent);
        assert!(!slow.is_overflowed());
        assert_eq!(hub.send_direct(&slow, &left("b")), Delivery::Full);
        assert!(slow.is_overflowed());
        tokio::time::timeout(std::time::Duration::from_secs(1), flagged)
            .await
            .expect("overflow not signalled")
            .unwrap();
        // Already flagged: resolves immediately.
        slow.overflowed().await;

        let stats = hub.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.frames_dropped, 1);

        assert_eq!(ServerMessage::decode(&rx.recv().await.unwrap()).unwrap(), left("a"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_per_recipient_order_preserved() {
        let hub = BroadcastHub::new();
        let (bob, mut rx) = PeerLink::channel(64);

        for i in 0..20 {
            hub.broadcast("R", [("bob", &bob)], &left(&i.to_string()), Recipients::All);
        }
        for i in 0..20 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(ServerMessage::decode(&frame).unwrap(), left(&i.to_string()));
        }
    }
}
