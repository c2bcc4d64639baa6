//! Service layer for the corpus editor server

pub mod config;
pub mod langid;
pub mod provider;

pub use config::{ConfigService, DefaultConfigService};
pub use langid::{LanguageIdentifier, NaiveBayesIdentifier};
pub use provider::{CorpusStore, DataProvider};
