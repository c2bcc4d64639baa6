//! CLI module for the corpus editor server
//!
//! Provides command-line interface using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use crate::models::config::{OceConfig, keys};

const LONG_ABOUT: &str = r#"
oce - backend server for the online corpus editor

Serves a corpus of short text records to annotation clients. Clients view,
search, tag and label records over WebSocket (the web front end) or Telnet
(the admin console). Every connected client is answered by one controller,
so edits from different clients never interleave.

QUICK START:
  oce                                   # WebSocket on 8081, data/corpus.json
  oce --ws 9000 --telnet 9001           # Both interfaces
  oce --memory --telnet 9001            # Throwaway in-memory corpus

CONFIG FILE (~/.config/oce/config.toml):
  [server]
  motd_file = "data/motd.txt"

  [components]
  websocket = "8081"
  telnet = "8082"
  json = "data/corpus.json"

  [langid]
  model_path = "data/langid-model.json"

TELNET COMMANDS:
  motd, commands, db meta, db query "<sql>", db drop <target>,
  db recreate <target>, !, exit, restart, shutdown
"#;

/// oce - backend server for the online corpus editor
#[derive(Parser, Debug, Default)]
#[command(name = "oce")]
#[command(author, version, about, long_about = LONG_ABOUT)]
pub struct Cli {
    /// WebSocket interface port
    #[arg(long, value_name = "PORT")]
    pub ws: Option<u16>,

    /// Telnet interface port
    #[arg(long, value_name = "PORT")]
    pub telnet: Option<u16>,

    /// JSON corpus store
    #[arg(long, value_name = "PATH", conflicts_with = "memory")]
    pub store: Option<PathBuf>,

    /// Keep the corpus in memory only
    #[arg(long)]
    pub memory: bool,

    /// Config file (default: ~/.config/oce/config.toml)
    #[arg(short, long, value_name = "FILE", env = "OCE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose output (show debug info)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Merge the components requested on the command line over the config
    /// file's. A provider flag replaces any configured provider.
    pub fn apply(&self, config: &mut OceConfig) {
        let components = &mut config.components;

        if let Some(port) = self.ws {
            components.insert(keys::WEBSOCKET.to_string(), port.to_string());
        }
        if let Some(port) = self.telnet {
            components.insert(keys::TELNET.to_string(), port.to_string());
        }

        if let Some(path) = &self.store {
            components.retain(|key, _| !keys::PROVIDERS.contains(&key.as_str()));
            components.insert(keys::JSON.to_string(), path.display().to_string());
        } else if self.memory {
            components.retain(|key, _| !keys::PROVIDERS.contains(&key.as_str()));
            components.insert(keys::MEMORY.to_string(), String::new());
        }
    }
}
