//! Data provider service
//!
//! The controller talks to storage only through [`DataProvider`]. Providers
//! are owned by the controller task, so methods take `&mut self` freely and
//! need no internal locking.

mod corpus;
mod tags;

pub use corpus::CorpusStore;
pub use tags::{TagCounts, normalise_language};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProviderError;
use crate::models::config::ProviderSpec;
use crate::models::record::{Record, SearchResults};

#[async_trait]
pub trait DataProvider: Send {
    fn name(&self) -> &'static str;

    async fn fetch_record(&mut self, rowid: i64) -> Result<Record, ProviderError>;

    /// Records with `start <= rowid <= end`, ordered by rowid
    async fn fetch_records(&mut self, start: i64, end: i64) -> Result<Vec<Record>, ProviderError>;

    async fn fetch_total(&mut self) -> Result<u64, ProviderError>;

    /// All tags in use, sorted
    async fn fetch_tags(&mut self) -> Result<Vec<String>, ProviderError>;

    /// `limit == 0` means no limit
    async fn fetch_search_results(
        &mut self,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> Result<SearchResults, ProviderError>;

    async fn update_record(
        &mut self,
        rowid: i64,
        field: &str,
        value: &str,
    ) -> Result<(), ProviderError>;

    async fn execute_literal(&mut self, query: &str, limit: usize) -> Result<Value, ProviderError>;

    async fn execute_drop(&mut self, target: &str) -> Result<Value, ProviderError>;

    async fn execute_recreate(&mut self, target: &str) -> Result<Value, ProviderError>;

    async fn shutdown(&mut self) -> Result<(), ProviderError>;
}

/// Open the provider described by `spec`
pub async fn open(spec: &ProviderSpec) -> Result<Box<dyn DataProvider>, ProviderError> {
    let store = match spec {
        ProviderSpec::Json(path) => CorpusStore::open(path).await?,
        ProviderSpec::Memory => CorpusStore::in_memory(Vec::new()),
    };
    Ok(Box::new(store))
}
