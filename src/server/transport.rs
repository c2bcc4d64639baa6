//! Server transports
//!
//! A transport listens on one port, turns every accepted connection into a
//! registered [`QueueChannel`], and runs a per-connection task that moves
//! frames between the socket and the channel's queues. On shutdown it stops
//! accepting, kicks every open channel and waits for the connection tasks, so
//! nothing it created is left registered.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinHandle, JoinSet};

use crate::models::config::InterfaceKind;
use crate::server::channel::{ChannelEndpoint, ChannelId, ClientHandle, QueueChannel};
use crate::server::registry::ClientRegistry;
use crate::server::{telnet, websocket};

#[async_trait]
pub trait ServerTransport: Send {
    fn name(&self) -> &str;

    /// Bound address, if the transport listens on a socket
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stop accepting, close every open channel and wait for teardown
    async fn shutdown(&mut self);
}

// ============================================================================
// Connection bookkeeping
// ============================================================================

/// Channels opened by one transport and the tasks serving them
pub struct Connections {
    registry: ClientRegistry,
    depth: usize,
    open: HashMap<ChannelId, ClientHandle>,
    tasks: JoinSet<ChannelId>,
    task_channels: HashMap<task::Id, ChannelId>,
}

impl Connections {
    pub fn new(registry: ClientRegistry, depth: usize) -> Self {
        Self {
            registry,
            depth,
            open: HashMap::new(),
            tasks: JoinSet::new(),
            task_channels: HashMap::new(),
        }
    }

    /// Create and register a channel, then serve it on a new task. The task
    /// deregisters the channel when `serve` returns.
    pub fn open<F, Fut>(&mut self, peer: impl Into<String>, serve: F) -> ChannelId
    where
        F: FnOnce(ChannelEndpoint) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (channel, endpoint) = QueueChannel::pair(peer, self.depth);
        let id = endpoint.id;
        let handle: ClientHandle = Arc::new(channel);

        self.open.insert(id, Arc::clone(&handle));
        self.registry.register(handle);

        let registry = self.registry.clone();
        let connection = serve(endpoint);
        let abort = self.tasks.spawn(async move {
            connection.await;
            registry.deregister(id);
            id
        });
        self.task_channels.insert(abort.id(), id);
        id
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Reap the next finished connection task. Never resolves while none are running.
    pub async fn next_finished(&mut self) {
        match self.tasks.join_next_with_id().await {
            Some(result) => self.finished(result),
            None => std::future::pending().await,
        }
    }

    /// Kick every open channel concurrently and wait for all connection tasks.
    pub async fn close_all(&mut self) {
        let handles: Vec<ClientHandle> = self.open.values().cloned().collect();
        join_all(handles.iter().map(|handle| handle.close())).await;

        while let Some(result) = self.tasks.join_next_with_id().await {
            self.finished(result);
        }
        self.open.clear();
    }

    fn finished(&mut self, result: Result<(task::Id, ChannelId), JoinError>) {
        let id = match result {
            Ok((task_id, id)) => {
                self.task_channels.remove(&task_id);
                id
            }
            Err(e) => {
                let Some(id) = self.task_channels.remove(&e.id()) else {
                    return;
                };
                if e.is_panic() {
                    tracing::error!("Connection task for {} panicked", id);
                }
                self.registry.deregister(id);
                id
            }
        };
        self.open.remove(&id);
    }
}

// ============================================================================
// TCP transport
// ============================================================================

pub struct TcpTransport {
    kind: InterfaceKind,
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Bind `0.0.0.0:<port>` and start accepting. Port 0 picks a free port.
    pub async fn bind(
        kind: InterfaceKind,
        port: u16,
        registry: ClientRegistry,
        depth: usize,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("{} server starting on {}", kind, local_addr);

        let (stop, stop_rx) = watch::channel(false);
        let connections = Connections::new(registry, depth);
        let accept_task = tokio::spawn(accept_loop(kind, listener, connections, stop_rx));

        Ok(Self {
            kind,
            local_addr,
            stop,
            accept_task: Some(accept_task),
        })
    }
}

async fn accept_loop(
    kind: InterfaceKind,
    listener: TcpListener,
    mut connections: Connections,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let peer = peer.to_string();
                    tracing::info!("[{}] New {} client", peer, kind);
                    let label = peer.clone();
                    match kind {
                        InterfaceKind::WebSocket => {
                            connections.open(peer, move |endpoint| websocket::serve(stream, label, endpoint));
                        }
                        InterfaceKind::Telnet => {
                            connections.open(peer, move |endpoint| telnet::serve(stream, label, endpoint));
                        }
                    }
                }
                Err(e) => tracing::warn!("{} accept failed: {}", kind, e),
            },
            _ = connections.next_finished() => {}
        }
    }

    drop(listener);
    if !connections.is_empty() {
        tracing::info!("Kicking {} connected {} clients", connections.len(), kind);
    }
    connections.close_all().await;
}

#[async_trait]
impl ServerTransport for TcpTransport {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    async fn shutdown(&mut self) {
        tracing::info!("Shutting down {} server...", self.kind);
        self.stop.send_replace(true);
        if let Some(task) = self.accept_task.take()
            && let Err(e) = task.await
        {
            tracing::error!("{} accept loop failed: {}", self.kind, e);
        }
        tracing::info!("{} server shutdown complete", self.kind);
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}
