//! Data models for the corpus editor server
//!
//! Contains core type definitions used throughout the application.

pub mod config;
pub mod record;

// Re-export commonly used types
pub use config::{ComponentSet, InterfaceKind, InterfaceSpec, OceConfig, ProviderSpec};
pub use record::{Features, Record, SearchResults};
