//! In-process stand-ins for the controller's collaborators

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::error::{ClassifierError, ProviderError};
use crate::models::record::{Features, Record, SearchResults};
use crate::server::channel::{ChannelEndpoint, ChannelId};
use crate::server::protocol::{Reply, Request};
use crate::server::registry::ClientRegistry;
use crate::server::transport::{Connections, ServerTransport};
use crate::services::langid::LanguageIdentifier;
use crate::services::provider::{DataProvider, TagCounts};

/// Ordered record of side-effecting calls, shared between stubs
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Five records, "record 1" to "record 5", all labelled English
pub struct StubProvider {
    log: CallLog,
    records: BTreeMap<i64, Record>,
    tags: TagCounts,
}

impl StubProvider {
    pub fn new(log: CallLog) -> Self {
        let records = (1..=5)
            .map(|rowid| {
                let record = Record::new(rowid, format!("record {}", rowid)).with_language("English");
                (rowid, record)
            })
            .collect();
        Self {
            log,
            records,
            tags: TagCounts::new(),
        }
    }
}

#[async_trait]
impl DataProvider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn fetch_record(&mut self, rowid: i64) -> Result<Record, ProviderError> {
        self.log.push(format!("fetch_record {}", rowid));
        self.records
            .get(&rowid)
            .cloned()
            .ok_or(ProviderError::RecordNotFound(rowid))
    }

    async fn fetch_records(&mut self, start: i64, end: i64) -> Result<Vec<Record>, ProviderError> {
        Ok(self.records.range(start..=end).map(|(_, r)| r.clone()).collect())
    }

    async fn fetch_total(&mut self) -> Result<u64, ProviderError> {
        Ok(self.records.len() as u64)
    }

    async fn fetch_tags(&mut self) -> Result<Vec<String>, ProviderError> {
        Ok(self.tags.tags())
    }

    async fn fetch_search_results(
        &mut self,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> Result<SearchResults, ProviderError> {
        self.log
            .push(format!("fetch_search_results {} {} {}", query, offset, limit));
        let limit = if limit == 0 { usize::MAX } else { limit };
        Ok(SearchResults {
            total: self.records.len(),
            results: self.records.values().skip(offset).take(limit).cloned().collect(),
            query: query.to_string(),
            elapsed: "0.000".to_string(),
            offset,
        })
    }

    async fn update_record(
        &mut self,
        rowid: i64,
        field: &str,
        value: &str,
    ) -> Result<(), ProviderError> {
        let record = self
            .records
            .get_mut(&rowid)
            .ok_or(ProviderError::RecordNotFound(rowid))?;
        match field {
            "tag" => {
                self.tags.apply_change(value, &record.tag);
                record.tag = value.to_string();
            }
            "content" => record.content = value.to_string(),
            other => return Err(ProviderError::UnknownField(other.to_string())),
        }
        Ok(())
    }

    async fn execute_literal(&mut self, query: &str, limit: usize) -> Result<Value, ProviderError> {
        self.log.push(format!("execute_literal {} {}", query, limit));
        Ok(json!({"results": [], "elapsed": "0.000"}))
    }

    async fn execute_drop(&mut self, target: &str) -> Result<Value, ProviderError> {
        self.log.push(format!("execute_drop {}", target));
        Ok(json!({"results": [], "elapsed": "0.000"}))
    }

    async fn execute_recreate(&mut self, target: &str) -> Result<Value, ProviderError> {
        self.log.push(format!("execute_recreate {}", target));
        Ok(json!({"results": [], "elapsed": "0.000"}))
    }

    async fn shutdown(&mut self) -> Result<(), ProviderError> {
        self.log.push("provider.shutdown");
        Ok(())
    }
}

// ============================================================================
// Language identifier
// ============================================================================

/// Answers "English" once trained. Failure switches stay reachable after
/// the stub has been boxed into a dispatcher.
pub struct StubLangid {
    log: CallLog,
    trained: bool,
    lookups_fail: Arc<AtomicBool>,
    training_fails: Arc<AtomicBool>,
}

impl StubLangid {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            trained: false,
            lookups_fail: Arc::new(AtomicBool::new(false)),
            training_fails: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn trained(log: CallLog) -> Self {
        Self {
            trained: true,
            ..Self::new(log)
        }
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.lookups_fail.store(fail, Ordering::SeqCst);
    }

    pub fn fail_training(&self, fail: bool) {
        self.training_fails.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LanguageIdentifier for StubLangid {
    fn check_classifier(&self) -> bool {
        self.trained
    }

    fn suggest_language(&self, _text: &str) -> Result<String, ClassifierError> {
        if self.lookups_fail.load(Ordering::SeqCst) {
            return Err(ClassifierError::ModelUnavailable("stub".to_string()));
        }
        Ok("English".to_string())
    }

    fn train_classifier(&mut self, examples: Vec<(Features, String)>) -> Result<(), ClassifierError> {
        self.log.push(format!("train_classifier {}", examples.len()));
        if self.training_fails.load(Ordering::SeqCst) {
            return Err(ClassifierError::NoTrainingData);
        }
        self.trained = true;
        Ok(())
    }

    fn extract_features(&self, text: &str) -> Features {
        let mut features = Features::new();
        for token in text.split_whitespace() {
            *features.entry(token.to_string()).or_insert(0) += 1;
        }
        features
    }

    async fn shutdown(&mut self) -> Result<(), ClassifierError> {
        self.log.push("langid.shutdown");
        Ok(())
    }
}

// ============================================================================
// Transport
// ============================================================================

type ClientMessage = Result<Request, String>;

/// Transport whose clients live in the test itself
pub struct LocalTransport {
    log: CallLog,
    connections: Arc<tokio::sync::Mutex<Connections>>,
}

/// Opens clients on a [`LocalTransport`] after it has been handed to a controller
#[derive(Clone)]
pub struct LocalConnector {
    connections: Arc<tokio::sync::Mutex<Connections>>,
}

impl LocalTransport {
    pub fn new(registry: ClientRegistry, log: CallLog) -> (Self, LocalConnector) {
        let connections = Arc::new(tokio::sync::Mutex::new(Connections::new(registry, 16)));
        let connector = LocalConnector {
            connections: Arc::clone(&connections),
        };
        (Self { log, connections }, connector)
    }
}

#[async_trait]
impl ServerTransport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }

    async fn shutdown(&mut self) {
        self.log.push("transport.shutdown");
        self.connections.lock().await.close_all().await;
    }
}

impl LocalConnector {
    pub async fn connect(&self) -> LocalClient {
        let (requests, inbound) = mpsc::channel(16);
        let (outbound, replies) = mpsc::channel(16);
        let id = self
            .connections
            .lock()
            .await
            .open("local", move |endpoint| pump(endpoint, inbound, outbound));
        LocalClient {
            id,
            requests,
            replies,
        }
    }
}

/// Test-side end of a local connection. Dropping it disconnects.
pub struct LocalClient {
    pub id: ChannelId,
    requests: mpsc::Sender<ClientMessage>,
    replies: mpsc::Receiver<Reply>,
}

impl LocalClient {
    pub async fn send(&self, request: Request) {
        let _ = self.requests.send(Ok(request)).await;
    }

    /// Input the transport cannot decode
    pub async fn send_garbage(&self, reason: &str) {
        let _ = self.requests.send(Err(reason.to_string())).await;
    }

    /// Next reply, or None once the server has hung up
    pub async fn recv(&mut self) -> Option<Reply> {
        self.replies.recv().await
    }
}

async fn pump(
    mut endpoint: ChannelEndpoint,
    mut inbound: mpsc::Receiver<ClientMessage>,
    outbound: mpsc::Sender<Reply>,
) {
    loop {
        tokio::select! {
            _ = endpoint.kick.requested() => {
                for reply in endpoint.drain_replies() {
                    let _ = outbound.send(reply).await;
                }
                break;
            }
            message = inbound.recv() => match message {
                Some(Ok(request)) => {
                    if !endpoint.requests.deliver(request).await {
                        break;
                    }
                }
                Some(Err(reason)) => {
                    endpoint.requests.reject(reason).await;
                    break;
                }
                None => break,
            },
            reply = endpoint.replies.recv() => match reply {
                Some(reply) => {
                    if outbound.send(reply).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}
