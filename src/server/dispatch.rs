//! Command dispatcher
//!
//! Maps a request's command name onto a closed [`Command`] enum and runs the
//! handler against the data provider and the language identifier. Handlers
//! never fail the caller: errors become error-shaped reply payloads, and
//! `restart`/`shutdown` surface as an [`Outcome::Signal`] for the controller
//! to act on once the whole completion batch has been answered.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{DispatchError, OceError, OceResult, ProviderError};
use crate::models::record::Features;
use crate::server::handlers::{
    LiteralQueryParams, RowParams, SearchParams, SearchQuery, TargetParams, UpdateParams,
    ViewParams,
};
use crate::server::protocol::{
    Reply, Request, classifier_error_payload, commands, error_payload, unknown_command_payload,
};
use crate::services::langid::LanguageIdentifier;
use crate::services::provider::DataProvider;

/// Terminal control token raised by a request.
///
/// Ordered by strength: when a batch raises both, the maximum wins, so
/// shutdown beats restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControlSignal {
    Restart,
    Shutdown,
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restart => f.write_str("restart"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Result of dispatching one request
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Reply(Reply),
    Signal(ControlSignal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    View,
    Meta,
    Update,
    Search,
    LiteralQuery,
    Drop,
    Recreate,
    Langid,
    Retrain,
    Features,
    Motd,
    Restart,
    Shutdown,
}

impl Command {
    pub const ALL: &'static [Command] = &[
        Self::View,
        Self::Meta,
        Self::Update,
        Self::Search,
        Self::LiteralQuery,
        Self::Drop,
        Self::Recreate,
        Self::Langid,
        Self::Retrain,
        Self::Features,
        Self::Motd,
        Self::Restart,
        Self::Shutdown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => commands::VIEW,
            Self::Meta => commands::META,
            Self::Update => commands::UPDATE,
            Self::Search => commands::SEARCH,
            Self::LiteralQuery => commands::LITERAL_QUERY,
            Self::Drop => commands::DROP,
            Self::Recreate => commands::RECREATE,
            Self::Langid => commands::LANGID,
            Self::Retrain => commands::RETRAIN,
            Self::Features => commands::FEATURES,
            Self::Motd => commands::MOTD,
            Self::Restart => commands::RESTART,
            Self::Shutdown => commands::SHUTDOWN,
        }
    }

    /// Handlers that touch the classifier get the lookup-error wrapper
    pub fn uses_classifier(self) -> bool {
        matches!(self, Self::Langid | Self::Retrain | Self::Features)
    }

    pub fn signal(self) -> Option<ControlSignal> {
        match self {
            Self::Restart => Some(ControlSignal::Restart),
            Self::Shutdown => Some(ControlSignal::Shutdown),
            _ => None,
        }
    }
}

impl FromStr for Command {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| DispatchError::UnknownCommand(s.to_string()))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct CommandDispatcher {
    provider: Box<dyn DataProvider>,
    langid: Box<dyn LanguageIdentifier>,
    motd_file: PathBuf,
}

impl CommandDispatcher {
    pub fn new(
        provider: Box<dyn DataProvider>,
        langid: Box<dyn LanguageIdentifier>,
        motd_file: PathBuf,
    ) -> Self {
        Self {
            provider,
            langid,
            motd_file,
        }
    }

    pub async fn dispatch(&mut self, request: Request) -> Outcome {
        let command = match request.command.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("Invalid input from client: {}", e);
                return Outcome::Reply(Reply::new(request.command, unknown_command_payload()));
            }
        };

        if let Some(signal) = command.signal() {
            tracing::info!("Client requested {}", signal);
            return Outcome::Signal(signal);
        }

        tracing::debug!("Dispatching '{}'", command);
        let params = request.params_value();
        let data = match self.execute(command, &params).await {
            Ok(data) => data,
            Err(e) if command.uses_classifier() => {
                tracing::warn!("Language identification failed ({}): {}", command, e);
                classifier_error_payload(&e)
            }
            Err(e) => {
                tracing::warn!("Command '{}' failed: {}", command, e);
                error_payload(e.to_string())
            }
        };

        Outcome::Reply(Reply::new(request.command, data))
    }

    /// Shut down both collaborators. Both are always attempted; the first error is returned.
    pub async fn shutdown(&mut self) -> OceResult<()> {
        let provider = self.provider.shutdown().await.map_err(OceError::from);
        if let Err(e) = &provider {
            tracing::error!("Data provider shutdown failed: {}", e);
        }
        let langid = self.langid.shutdown().await.map_err(OceError::from);
        if let Err(e) = &langid {
            tracing::error!("Language identifier shutdown failed: {}", e);
        }
        provider.and(langid)
    }

    async fn execute(&mut self, command: Command, params: &Value) -> Result<Value, DispatchError> {
        match command {
            Command::View => self.handle_view(params).await,
            Command::Meta => self.handle_meta().await,
            Command::Update => self.handle_update(params).await,
            Command::Search => self.handle_search(params).await,
            Command::LiteralQuery => {
                let p: LiteralQueryParams = parse_params(params)?;
                Ok(self.provider.execute_literal(&p.query, p.limit).await?)
            }
            Command::Drop => {
                let p: TargetParams = parse_params(params)?;
                Ok(self.provider.execute_drop(&p.target).await?)
            }
            Command::Recreate => {
                let p: TargetParams = parse_params(params)?;
                Ok(self.provider.execute_recreate(&p.target).await?)
            }
            Command::Langid => self.handle_langid(params).await,
            Command::Retrain => self.retrain().await.map(Value::Bool),
            Command::Features => self.handle_features(params).await,
            Command::Motd => self.handle_motd().await,
            // Answered before execution
            Command::Restart | Command::Shutdown => Ok(Value::Null),
        }
    }

    // ========================================================================
    // Corpus handlers
    // ========================================================================

    async fn handle_view(&mut self, params: &Value) -> Result<Value, DispatchError> {
        let p: ViewParams = parse_params(params)?;
        let records = self.provider.fetch_records(p.start, p.end).await?;
        let record = p.record.unwrap_or_else(|| Value::from(p.start));

        Ok(serde_json::json!({
            "results": to_data(&records)?,
            "record": record,
        }))
    }

    async fn handle_meta(&mut self) -> Result<Value, DispatchError> {
        let total = self.provider.fetch_total().await?;
        let tags = self.provider.fetch_tags().await?;
        Ok(serde_json::json!({
            "total": total,
            "tags": tags,
        }))
    }

    async fn handle_update(&mut self, params: &Value) -> Result<Value, DispatchError> {
        let p: UpdateParams = parse_params(params)?;
        self.provider
            .update_record(p.rowid, &p.field, &p.value_text())
            .await?;
        Ok(Value::from("success"))
    }

    async fn handle_search(&mut self, params: &Value) -> Result<Value, DispatchError> {
        let p: SearchParams = parse_params(params)?;
        let query = SearchQuery::parse(&p.query)?;
        let results = self
            .provider
            .fetch_search_results(&query.terms, query.offset(p.perpage), p.perpage)
            .await?;
        to_data(&results)
    }

    async fn handle_motd(&mut self) -> Result<Value, DispatchError> {
        let motd = tokio::fs::read_to_string(&self.motd_file)
            .await
            .map_err(DispatchError::Motd)?;
        Ok(Value::String(motd))
    }

    // ========================================================================
    // Language identification handlers
    // ========================================================================

    async fn handle_langid(&mut self, params: &Value) -> Result<Value, DispatchError> {
        let p: RowParams = parse_params(params)?;
        let record = self.provider.fetch_record(p.rowid).await?;

        if !self.langid.check_classifier() {
            match self.retrain().await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::error!("Retraining produced no usable classifier");
                    return Ok(Value::from("error"));
                }
                Err(e) => {
                    tracing::error!("Retraining failed: {}", e);
                    return Ok(Value::from("error"));
                }
            }
        }

        let suggested = self.langid.suggest_language(&record.content)?;
        Ok(serde_json::json!([record.content, suggested]))
    }

    /// Train on every language-labelled record. True if a usable classifier resulted.
    async fn retrain(&mut self) -> Result<bool, DispatchError> {
        let labelled = self
            .provider
            .fetch_search_results("has:language", 0, 0)
            .await?;

        let examples: Vec<(Features, String)> = labelled
            .results
            .into_iter()
            .map(|record| (self.langid.extract_features(&record.content), record.language))
            .collect();
        tracing::info!("Retraining classifier on {} labelled records", examples.len());

        self.langid.train_classifier(examples)?;
        Ok(self.langid.check_classifier())
    }

    async fn handle_features(&mut self, params: &Value) -> Result<Value, DispatchError> {
        let p: RowParams = parse_params(params)?;
        let record = self.provider.fetch_record(p.rowid).await?;
        let features: Map<String, Value> = self
            .langid
            .extract_features(&record.content)
            .into_iter()
            .map(|(name, count)| (name, Value::from(count)))
            .collect();
        Ok(Value::Object(features))
    }
}

fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T, DispatchError> {
    serde_json::from_value(params.clone()).map_err(|e| DispatchError::invalid_params(e.to_string()))
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, DispatchError> {
    serde_json::to_value(value).map_err(|e| ProviderError::from(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::{CallLog, StubLangid, StubProvider};
    use serde_json::json;
    use tempfile::TempDir;

    fn dispatcher(log: &CallLog, langid: StubLangid) -> CommandDispatcher {
        CommandDispatcher::new(
            Box::new(StubProvider::new(log.clone())),
            Box::new(langid),
            PathBuf::from("/nonexistent/motd.txt"),
        )
    }

    fn reply_data(outcome: Outcome) -> Value {
        match outcome {
            Outcome::Reply(reply) => reply.data,
            Outcome::Signal(signal) => panic!("unexpected signal {}", signal),
        }
    }

    #[test]
    fn test_command_table_is_closed() {
        for command in Command::ALL {
            assert_eq!(command.as_str().parse::<Command>().unwrap(), *command);
        }
        assert!(matches!(
            "exec_view".parse::<Command>(),
            Err(DispatchError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_signal_strength() {
        assert!(ControlSignal::Shutdown > ControlSignal::Restart);
        let strongest = [ControlSignal::Restart, ControlSignal::Shutdown, ControlSignal::Restart]
            .into_iter()
            .max();
        assert_eq!(strongest, Some(ControlSignal::Shutdown));
    }

    #[tokio::test]
    async fn test_view_reply_shape() {
        let log = CallLog::default();
        let mut d = dispatcher(&log, StubLangid::new(log.clone()));

        let request = Request::new("view").with_param("start", 1).with_param("end", 3);
        let outcome = d.dispatch(request).await;
        let Outcome::Reply(reply) = outcome else {
            panic!("expected reply");
        };
        assert_eq!(reply.command, "view");
        assert_eq!(reply.data["record"], 1);
        assert_eq!(reply.data["results"].as_array().unwrap().len(), 3);
        assert_eq!(reply.data["results"][0]["rowid"], 1);
    }

    #[tokio::test]
    async fn test_unknown_command_reply() {
        let log = CallLog::default();
        let mut d = dispatcher(&log, StubLangid::new(log.clone()));
        let outcome = d.dispatch(Request::new("frobnicate")).await;
        assert_eq!(
            outcome,
            Outcome::Reply(Reply::new("frobnicate", json!("error")))
        );
        assert!(log.calls().is_empty());
    }

    #[tokio::test]
    async fn test_control_commands_raise_signals() {
        let log = CallLog::default();
        let mut d = dispatcher(&log, StubLangid::new(log.clone()));
        assert_eq!(
            d.dispatch(Request::new("restart")).await,
            Outcome::Signal(ControlSignal::Restart)
        );
        assert_eq!(
            d.dispatch(Request::new("shutdown")).await,
            Outcome::Signal(ControlSignal::Shutdown)
        );
    }

    #[tokio::test]
    async fn test_provider_error_becomes_payload() {
        let log = CallLog::default();
        let mut d = dispatcher(&log, StubLangid::new(log.clone()));

        let request = Request::new("update")
            .with_param("rowid", 99)
            .with_param("field", "tag")
            .with_param("value", "x");
        let data = reply_data(d.dispatch(request).await);
        assert_eq!(data["error"], true);
        assert!(data["message"].as_str().unwrap().contains("99"));

        let data = reply_data(d.dispatch(Request::new("view")).await);
        assert_eq!(data["error"], true);
    }

    #[tokio::test]
    async fn test_update_and_meta() {
        let log = CallLog::default();
        let mut d = dispatcher(&log, StubLangid::new(log.clone()));

        let data = reply_data(
            d.dispatch(
                Request::new("update")
                    .with_param("rowid", 2)
                    .with_param("field", "tag")
                    .with_param("value", "fun"),
            )
            .await,
        );
        assert_eq!(data, json!("success"));

        let data = reply_data(d.dispatch(Request::new("meta")).await);
        assert_eq!(data["total"], 5);
        assert_eq!(data["tags"], json!(["fun"]));
    }

    #[tokio::test]
    async fn test_search_offsets_by_page() {
        let log = CallLog::default();
        let mut d = dispatcher(&log, StubLangid::new(log.clone()));

        let request = Request::new("search")
            .with_param("query", "s=record&p=2")
            .with_param("perpage", 2);
        let data = reply_data(d.dispatch(request).await);
        assert_eq!(data["offset"], 2);
        assert_eq!(log.calls(), vec!["fetch_search_results record 2 2"]);
    }

    #[tokio::test]
    async fn test_literal_query_limit_defaults_to_zero() {
        let log = CallLog::default();
        let mut d = dispatcher(&log, StubLangid::new(log.clone()));
        d.dispatch(Request::new("literal_query").with_param("query", "SELECT 1"))
            .await;
        assert_eq!(log.calls(), vec!["execute_literal SELECT 1 0"]);
    }

    #[tokio::test]
    async fn test_langid_retrains_when_untrained() {
        let log = CallLog::default();
        let mut d = dispatcher(&log, StubLangid::new(log.clone()));

        let data = reply_data(d.dispatch(Request::new("langid").with_param("rowid", 1)).await);
        assert_eq!(data, json!(["record 1", "English"]));
        assert_eq!(
            log.calls(),
            vec![
                "fetch_record 1",
                "fetch_search_results has:language 0 0",
                "train_classifier 5",
            ]
        );
    }

    #[tokio::test]
    async fn test_langid_lookup_failure_is_wrapped() {
        let log = CallLog::default();
        let langid = StubLangid::trained(log.clone());
        langid.fail_lookups(true);
        let mut d = dispatcher(&log, langid);

        let data = reply_data(d.dispatch(Request::new("langid").with_param("rowid", 1)).await);
        assert_eq!(data["error"], true);
        assert!(
            data["message"]
                .as_str()
                .unwrap()
                .starts_with("Server returned a LookupError:\n")
        );
    }

    #[tokio::test]
    async fn test_langid_failed_retrain_replies_error() {
        let log = CallLog::default();
        let langid = StubLangid::new(log.clone());
        langid.fail_training(true);
        let mut d = dispatcher(&log, langid);

        let data = reply_data(d.dispatch(Request::new("langid").with_param("rowid", 1)).await);
        assert_eq!(data, json!("error"));
    }

    #[tokio::test]
    async fn test_retrain_and_features() {
        let log = CallLog::default();
        let mut d = dispatcher(&log, StubLangid::new(log.clone()));

        let data = reply_data(d.dispatch(Request::new("retrain")).await);
        assert_eq!(data, json!(true));

        let data = reply_data(d.dispatch(Request::new("features").with_param("rowid", "3")).await);
        assert_eq!(data, json!({"record": 1, "3": 1}));
    }

    #[tokio::test]
    async fn test_motd() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("motd.txt");
        tokio::fs::write(&path, "Welcome!\n").await.unwrap();

        let log = CallLog::default();
        let mut d = CommandDispatcher::new(
            Box::new(StubProvider::new(log.clone())),
            Box::new(StubLangid::new(log.clone())),
            path,
        );
        let data = reply_data(d.dispatch(Request::new("motd")).await);
        assert_eq!(data, json!("Welcome!\n"));

        let mut d = dispatcher(&log, StubLangid::new(log.clone()));
        let data = reply_data(d.dispatch(Request::new("motd")).await);
        assert_eq!(data["error"], true);
    }

    #[tokio::test]
    async fn test_shutdown_reaches_both_collaborators() {
        let log = CallLog::default();
        let mut d = dispatcher(&log, StubLangid::new(log.clone()));
        d.shutdown().await.unwrap();
        assert_eq!(log.calls(), vec!["provider.shutdown", "langid.shutdown"]);
    }
}
