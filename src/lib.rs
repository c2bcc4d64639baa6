//! oce - Online Corpus Editor server
//!
//! Multi-client backend for a corpus annotation tool. Clients connect over
//! WebSocket or Telnet; a single controller multiplexes every connection,
//! dispatches requests to the corpus store and the language identifier, and
//! coordinates graceful shutdown and restart.

pub mod app;
pub mod cli;
pub mod error;
pub mod models;
pub mod server;
pub mod services;

pub use error::{OceError, OceResult};
