//! Connection controller
//!
//! The controller is the only owner of the command dispatcher. It keeps one
//! receive watcher per registered client, waits until at least one watcher
//! has finished, and then answers every finished watcher as one batch. A
//! restart or shutdown raised inside a batch takes effect only after the rest
//! of that batch has been answered.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::future::{Future, poll_fn};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

use crate::error::{ChannelError, ConfigError, OceResult};
use crate::models::config::defaults;
use crate::server::channel::{ChannelId, ClientHandle};
use crate::server::dispatch::{CommandDispatcher, ControlSignal, Outcome};
use crate::server::protocol::Request;
use crate::server::registry::ClientRegistry;
use crate::server::transport::ServerTransport;
use crate::services::langid::{LanguageIdentifier, NaiveBayesIdentifier};
use crate::services::provider::DataProvider;

type Received = Result<Request, ChannelError>;

/// Pending `receive()` on one client
struct Watcher {
    channel: ClientHandle,
    task: JoinHandle<Received>,
}

/// A watcher that has finished, taken out of the watch set
pub(crate) struct Completion {
    id: ChannelId,
    channel: ClientHandle,
    result: Result<Received, JoinError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Running,
    /// Shutdown sequence in progress
    Draining,
    Stopped,
}

enum Event {
    Batch(Vec<Completion>),
    MembershipChanged,
    Interrupted,
}

pub struct Controller {
    registry: ClientRegistry,
    membership: watch::Receiver<u64>,
    watchers: BTreeMap<ChannelId, Watcher>,
    transports: Vec<Box<dyn ServerTransport>>,
    dispatcher: CommandDispatcher,
    state: ControllerState,
}

impl Controller {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::default()
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Channels that currently have a watcher
    pub fn watched_ids(&self) -> Vec<ChannelId> {
        self.watchers.keys().copied().collect()
    }

    pub fn transports(&self) -> impl Iterator<Item = &dyn ServerTransport> {
        self.transports.iter().map(|t| t.as_ref())
    }

    /// Serve until a client asks for a restart or shutdown.
    pub async fn run(&mut self) -> OceResult<ControlSignal> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until a client raises a signal or `interrupt` completes, which
    /// counts as a shutdown. Either way the controller is stopped on return.
    pub async fn run_until<F>(&mut self, interrupt: F) -> OceResult<ControlSignal>
    where
        F: Future<Output = ()>,
    {
        if self.state != ControllerState::Running {
            tracing::warn!("Controller already stopped");
            return Ok(ControlSignal::Shutdown);
        }
        tokio::pin!(interrupt);
        tracing::info!(
            "Controller running ({} transport(s))",
            self.transports.len()
        );

        let signal = loop {
            let leftovers = self.reconcile().await;
            let batch = if leftovers.is_empty() {
                match self.next_event(interrupt.as_mut()).await {
                    Event::Batch(batch) => batch,
                    Event::MembershipChanged => continue,
                    Event::Interrupted => {
                        tracing::info!("Interrupted");
                        break ControlSignal::Shutdown;
                    }
                }
            } else {
                leftovers
            };

            if let Some(signal) = self.process_batch(batch).await {
                break signal;
            }
        };

        self.shutdown().await?;
        Ok(signal)
    }

    async fn next_event<F>(&mut self, interrupt: Pin<&mut F>) -> Event
    where
        F: Future<Output = ()>,
    {
        let watchers = &mut self.watchers;
        let membership = &mut self.membership;
        tokio::select! {
            biased;
            _ = interrupt => Event::Interrupted,
            batch = poll_fn(|cx| poll_watchers(watchers, cx)) => Event::Batch(batch),
            _ = membership.changed() => Event::MembershipChanged,
        }
    }

    /// Bring the watch set in line with the registry: cancel watchers of
    /// departed clients and arm one for every new client.
    ///
    /// A cancelled watcher that had already received a request hands it back
    /// so it is still answered exactly once.
    async fn reconcile(&mut self) -> Vec<Completion> {
        // Mark the current membership as seen before taking the snapshot, so
        // any later change wakes the next wait.
        self.membership.borrow_and_update();
        let clients = self.registry.snapshot();

        let departed: Vec<ChannelId> = self
            .watchers
            .keys()
            .filter(|id| !clients.contains_key(id))
            .copied()
            .collect();

        let mut leftovers = Vec::new();
        for id in departed {
            let Some(watcher) = self.watchers.remove(&id) else {
                continue;
            };
            watcher.task.abort();
            match watcher.task.await {
                Ok(Ok(request)) => {
                    tracing::debug!("Client {} left with '{}' pending", id, request.command);
                    leftovers.push(Completion {
                        id,
                        channel: watcher.channel,
                        result: Ok(Ok(request)),
                    });
                }
                Ok(Err(_)) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::error!("Watcher for {} failed: {}", id, e),
            }
            tracing::debug!("Stopped watching client {}", id);
        }

        for (id, channel) in clients {
            if let Entry::Vacant(slot) = self.watchers.entry(id) {
                let watched = Arc::clone(&channel);
                let task = tokio::spawn(async move { watched.receive().await });
                slot.insert(Watcher { channel, task });
                tracing::debug!("Watching client {}", id);
            }
        }

        leftovers
    }

    /// Answer every completion. Returns the strongest signal raised, if any.
    pub(crate) async fn process_batch(&mut self, batch: Vec<Completion>) -> Option<ControlSignal> {
        let mut strongest = None;

        for Completion {
            id,
            channel,
            result,
        } in batch
        {
            match result {
                Ok(Ok(request)) => match self.dispatcher.dispatch(request).await {
                    Outcome::Reply(reply) => {
                        if let Err(e) = channel.send(reply).await {
                            tracing::debug!("[{}] Could not deliver reply: {}", channel.peer(), e);
                            self.registry.deregister(id);
                        }
                    }
                    Outcome::Signal(signal) => strongest = strongest.max(Some(signal)),
                },
                Ok(Err(ChannelError::Closed)) => {
                    tracing::debug!("[{}] Channel closed", channel.peer());
                    self.registry.deregister(id);
                }
                Ok(Err(ChannelError::Malformed(reason))) => {
                    tracing::warn!("[{}] Dropping client: {}", channel.peer(), reason);
                    channel.close().await;
                    self.registry.deregister(id);
                }
                Err(e) => {
                    tracing::error!("[{}] Watcher failed: {}", channel.peer(), e);
                    self.registry.deregister(id);
                }
            }
        }

        strongest
    }

    async fn shutdown(&mut self) -> OceResult<()> {
        self.state = ControllerState::Draining;
        tracing::info!("=== Controller shutting down ===");

        for (id, watcher) in std::mem::take(&mut self.watchers) {
            watcher.task.abort();
            if let Ok(Ok(request)) = watcher.task.await {
                tracing::warn!("Dropping '{}' from client {}: server is stopping", request.command, id);
            }
        }

        for transport in &mut self.transports {
            transport.shutdown().await;
        }
        for id in self.registry.ids() {
            tracing::warn!("Client {} outlived its transport", id);
            self.registry.deregister(id);
        }

        let result = self.dispatcher.shutdown().await;
        self.state = ControllerState::Stopped;
        tracing::info!("Controller stopped");
        result
    }
}

/// Take every finished watcher out of the set. Pending while none has finished.
fn poll_watchers(
    watchers: &mut BTreeMap<ChannelId, Watcher>,
    cx: &mut Context<'_>,
) -> Poll<Vec<Completion>> {
    let mut ready = Vec::new();
    for (id, watcher) in watchers.iter_mut() {
        if let Poll::Ready(result) = Pin::new(&mut watcher.task).poll(cx) {
            ready.push((*id, result));
        }
    }
    if ready.is_empty() {
        return Poll::Pending;
    }

    let batch = ready
        .into_iter()
        .filter_map(|(id, result)| {
            watchers.remove(&id).map(|watcher| Completion {
                id,
                channel: watcher.channel,
                result,
            })
        })
        .collect();
    Poll::Ready(batch)
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Default)]
pub struct ControllerBuilder {
    registry: Option<ClientRegistry>,
    providers: Vec<Box<dyn DataProvider>>,
    transports: Vec<Box<dyn ServerTransport>>,
    langid: Option<Box<dyn LanguageIdentifier>>,
    motd_file: Option<PathBuf>,
}

impl ControllerBuilder {
    /// Registry the transports register their clients with
    pub fn registry(mut self, registry: ClientRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn provider(mut self, provider: Box<dyn DataProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn transport(mut self, transport: Box<dyn ServerTransport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn language_identifier(mut self, langid: Box<dyn LanguageIdentifier>) -> Self {
        self.langid = Some(langid);
        self
    }

    pub fn motd_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.motd_file = Some(path.into());
        self
    }

    /// Exactly one provider and at least one transport are required.
    pub fn build(self) -> Result<Controller, ConfigError> {
        let mut providers = self.providers.into_iter();
        let provider = providers.next().ok_or(ConfigError::MissingProvider)?;
        if let Some(second) = providers.next() {
            return Err(ConfigError::DuplicateProvider {
                first: provider.name().to_string(),
                second: second.name().to_string(),
            });
        }
        if self.transports.is_empty() {
            return Err(ConfigError::NoInterfaces);
        }

        let langid = self
            .langid
            .unwrap_or_else(|| Box::new(NaiveBayesIdentifier::untrained()));
        let motd_file = self.motd_file.unwrap_or_else(defaults::motd_file);
        let registry = self.registry.unwrap_or_default();

        Ok(Controller {
            membership: registry.subscribe(),
            registry,
            watchers: BTreeMap::new(),
            transports: self.transports,
            dispatcher: CommandDispatcher::new(provider, langid, motd_file),
            state: ControllerState::Running,
        })
    }
}
