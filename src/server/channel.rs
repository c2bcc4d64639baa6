//! Client channels
//!
//! A channel is a connection-scoped duplex pipe to one client. Every transport
//! hands the controller a [`QueueChannel`]; the transport keeps the matching
//! [`ChannelEndpoint`] and moves decoded requests and encoded replies between
//! the queues and its socket.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};

use crate::error::ChannelError;
use crate::server::protocol::{Reply, Request};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique channel handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared handle the controller holds for a registered client
pub type ClientHandle = Arc<dyn ClientChannel>;

#[async_trait]
pub trait ClientChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Human-readable remote address, used as the log prefix
    fn peer(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Wait for the next complete request.
    ///
    /// Fails with [`ChannelError::Closed`] once the client is gone and with
    /// [`ChannelError::Malformed`] if the transport could not decode its input;
    /// the channel is closed in the latter case. Must be cancel-safe.
    async fn receive(&self) -> Result<Request, ChannelError>;

    /// Queue a reply for transmission. Does not wait for room: a client that
    /// has stopped reading is closed and reported as [`ChannelError::Closed`].
    async fn send(&self, reply: Reply) -> Result<(), ChannelError>;

    /// Ask the transport to drop the connection and wait for teardown. Idempotent.
    async fn close(&self);
}

// ============================================================================
// Queue-backed channel
// ============================================================================

type Inbound = Result<Request, ChannelError>;

pub struct QueueChannel {
    id: ChannelId,
    peer: String,
    inbound: Mutex<mpsc::Receiver<Inbound>>,
    outbound: mpsc::Sender<Reply>,
    kick: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

impl QueueChannel {
    /// Create a channel and the transport-side endpoint that feeds it.
    pub fn pair(peer: impl Into<String>, depth: usize) -> (Self, ChannelEndpoint) {
        let depth = depth.max(1);
        let id = ChannelId::next();
        let (inbound_tx, inbound_rx) = mpsc::channel(depth);
        let (outbound_tx, outbound_rx) = mpsc::channel(depth);
        let (kick_tx, kick_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let channel = Self {
            id,
            peer: peer.into(),
            inbound: Mutex::new(inbound_rx),
            outbound: outbound_tx,
            kick: kick_tx,
            done: done_rx,
        };

        let endpoint = ChannelEndpoint {
            id,
            requests: RequestSink {
                tx: inbound_tx,
                kick: kick_rx.clone(),
            },
            replies: outbound_rx,
            kick: KickSignal { rx: kick_rx },
            _teardown: TeardownGuard { tx: done_tx },
        };

        (channel, endpoint)
    }
}

#[async_trait]
impl ClientChannel for QueueChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    fn is_open(&self) -> bool {
        !*self.kick.borrow() && !*self.done.borrow()
    }

    async fn receive(&self) -> Result<Request, ChannelError> {
        // mpsc::Receiver::recv is cancel-safe, so an aborted watcher never
        // swallows a queued request.
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(message) => message,
            None => Err(ChannelError::Closed),
        }
    }

    async fn send(&self, reply: Reply) -> Result<(), ChannelError> {
        if *self.kick.borrow() {
            return Err(ChannelError::Closed);
        }
        match self.outbound.try_send(reply) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(reply)) => {
                tracing::warn!(
                    "[{}] Client is not reading replies, dropping it at '{}'",
                    self.peer,
                    reply.command
                );
                self.kick.send_replace(true);
                Err(ChannelError::Closed)
            }
            Err(TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    async fn close(&self) {
        self.kick.send_replace(true);
        let mut done = self.done.clone();
        // Err means the endpoint is already gone, which is also "torn down".
        let _ = done.wait_for(|finished| *finished).await;
    }
}

impl fmt::Debug for QueueChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueChannel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

// ============================================================================
// Transport side
// ============================================================================

/// Transport-facing half of a [`QueueChannel`]. Dropping it completes teardown.
pub struct ChannelEndpoint {
    pub id: ChannelId,
    pub requests: RequestSink,
    pub replies: mpsc::Receiver<Reply>,
    pub kick: KickSignal,
    _teardown: TeardownGuard,
}

impl ChannelEndpoint {
    /// Replies already queued by the controller. Transports flush these
    /// after a kick so replies sent before a shutdown still reach the client.
    pub fn drain_replies(&mut self) -> Vec<Reply> {
        let mut replies = Vec::new();
        while let Ok(reply) = self.replies.try_recv() {
            replies.push(reply);
        }
        replies
    }
}

pub struct RequestSink {
    tx: mpsc::Sender<Inbound>,
    kick: watch::Receiver<bool>,
}

impl RequestSink {
    /// Hand a decoded request to the controller. Returns false if nobody is
    /// listening or the channel was closed while the queue was full.
    pub async fn deliver(&self, request: Request) -> bool {
        self.push(Ok(request)).await
    }

    /// Report undecodable input. The caller must end the connection afterwards.
    pub async fn reject(&self, reason: impl Into<String>) {
        self.push(Err(ChannelError::Malformed(reason.into()))).await;
    }

    async fn push(&self, message: Inbound) -> bool {
        let mut kick = self.kick.clone();
        tokio::select! {
            biased;
            _ = kick.wait_for(|kicked| *kicked) => false,
            sent = self.tx.send(message) => sent.is_ok(),
        }
    }
}

pub struct KickSignal {
    rx: watch::Receiver<bool>,
}

impl KickSignal {
    /// Resolves once `close()` has been called on the channel.
    pub async fn requested(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|kicked| *kicked).await.is_err() {
            // Channel handle dropped without a close: nothing will ever kick us.
            std::future::pending::<()>().await;
        }
    }
}

struct TeardownGuard {
    tx: watch::Sender<bool>,
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.tx.send_replace(true);
    }
}
