//! oce - backend server for the online corpus editor
//!
//! Serves a text corpus to annotation clients over WebSocket and Telnet.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oce::app::App;
use oce::cli::Cli;

fn main() {
    let cli = Cli::parse();

    // RUST_LOG overrides both defaults, e.g. RUST_LOG=oce=trace
    let default_filter = if cli.verbose { "oce=debug" } else { "oce=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact(),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main(cli)) {
        tracing::error!("{:#}", e);
        std::process::exit(2);
    }
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    let app = App::load(&cli).await?;
    app.run().await
}
