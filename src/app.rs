//! Application supervisor
//!
//! Builds the data provider, the language identifier and the transports from
//! configuration, runs a [`Controller`] over them, and on a restart request
//! tears everything down and builds it again from scratch.

use anyhow::Context;
use tokio::sync::watch;

use crate::cli::Cli;
use crate::models::config::OceConfig;
use crate::server::{ClientRegistry, ControlSignal, Controller, TcpTransport};
use crate::services::config::{ConfigService, DefaultConfigService};
use crate::services::langid::NaiveBayesIdentifier;
use crate::services::provider;

pub struct App {
    config: OceConfig,
}

impl App {
    pub fn new(config: OceConfig) -> Self {
        Self {
            config: config.with_default_components(),
        }
    }

    /// Load the config file and merge the command line over it.
    pub async fn load(cli: &Cli) -> anyhow::Result<Self> {
        let service = DefaultConfigService::new(cli.config.clone());
        let mut config = service.load().await.with_context(|| {
            format!(
                "Failed to load config from {}",
                service.config_path().display()
            )
        })?;
        cli.apply(&mut config);
        Ok(Self::new(config))
    }

    /// Serve until a client asks for shutdown or the process gets Ctrl-C.
    pub async fn run(&self) -> anyhow::Result<()> {
        let (interrupt_tx, interrupt_rx) = watch::channel(false);
        let listener = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received Ctrl-C");
                    interrupt_tx.send_replace(true);
                }
                Err(e) => {
                    tracing::warn!("Could not listen for Ctrl-C: {}", e);
                    // Keep the sender alive so the controller is never interrupted
                    std::future::pending::<()>().await;
                }
            }
        });

        let result = self.supervise(interrupt_rx).await;
        listener.abort();
        result
    }

    /// Outer loop: one controller per generation, rebuilt on restart.
    pub async fn supervise(&self, interrupt: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut generation = 1u32;
        loop {
            let mut controller = self.build_controller().await?;
            let mut interrupt = interrupt.clone();
            let signal = controller
                .run_until(async move {
                    if interrupt.wait_for(|interrupted| *interrupted).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                })
                .await
                .context("Controller did not shut down cleanly")?;

            match signal {
                ControlSignal::Shutdown => {
                    tracing::info!("Server shut down");
                    return Ok(());
                }
                ControlSignal::Restart => {
                    generation += 1;
                    tracing::info!("Restarting server (generation {})", generation);
                }
            }
        }
    }

    /// Fresh collaborators and transports, wired into a new controller.
    pub async fn build_controller(&self) -> anyhow::Result<Controller> {
        let components = self.config.component_set()?;
        let registry = ClientRegistry::new();

        let model_path = &self.config.langid.model_path;
        let langid = NaiveBayesIdentifier::open(model_path)
            .await
            .with_context(|| format!("Failed to load language model {}", model_path.display()))?;

        let mut builder = Controller::builder()
            .registry(registry.clone())
            .motd_file(self.config.server.motd_file.clone())
            .language_identifier(Box::new(langid));

        for spec in &components.providers {
            let provider = provider::open(spec)
                .await
                .with_context(|| format!("Failed to open {} data provider", spec.key()))?;
            builder = builder.provider(provider);
        }

        for spec in &components.interfaces {
            let transport = TcpTransport::bind(
                spec.kind,
                spec.port,
                registry.clone(),
                self.config.server.queue_depth,
            )
            .await
            .with_context(|| format!("Failed to start {} server on port {}", spec.kind, spec.port))?;
            builder = builder.transport(Box::new(transport));
        }

        Ok(builder.build()?)
    }
}
