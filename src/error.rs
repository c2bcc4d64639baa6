//! Error types for the corpus editor server

use thiserror::Error;

pub type OceResult<T> = std::result::Result<T, OceError>;

#[derive(Debug, Error)]
pub enum OceError {
    #[error("{0}")]
    Channel(#[from] ChannelError),

    #[error("{0}")]
    Dispatch(#[from] DispatchError),

    #[error("{0}")]
    Provider(#[from] ProviderError),

    #[error("{0}")]
    Classifier(#[from] ClassifierError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Connection-level failures. Caught at the watcher boundary, never bubbled
/// into the controller loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Client disconnected")]
    Closed,

    #[error("Malformed input: {0}")]
    Malformed(String),
}

/// Per-request failures. Always converted into an error-shaped reply.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Provider(#[from] ProviderError),

    #[error("{0}")]
    Classifier(#[from] ClassifierError),

    #[error("Could not read motd: {0}")]
    Motd(#[source] std::io::Error),
}

impl DispatchError {
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    pub fn is_lookup(&self) -> bool {
        matches!(self, Self::Classifier(ClassifierError::ModelUnavailable(_)))
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Record not found: {0}")]
    RecordNotFound(i64),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: &'static str,
        operation: &'static str,
    },

    #[error("Store is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    /// Equivalent of a missing trained model: nothing to classify with.
    #[error("No trained classifier available ({0})")]
    ModelUnavailable(String),

    #[error("No labelled records to train on")]
    NoTrainingData,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid provider/interface: '{0}'")]
    UnknownComponent(String),

    #[error("More than one data provider specified ({first}, {second})")]
    DuplicateProvider { first: String, second: String },

    #[error("No data provider specified")]
    MissingProvider,

    #[error("No interfaces specified")]
    NoInterfaces,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
