//! 'main' for the multiverse node process
use anyhow::Result;
use bc_common::messages::Message;
use caryatid_process::Process;
use config::{Config, Environment, File};
use std::sync::Arc;
use tracing::info;

// External modules
use bc_module_chain_selection::ChainSelection;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Standard main
#[tokio::main]
pub async fn main() -> Result<()> {
    // Standard logging using RUST_LOG for log levels
    let fmt_layer = fmt::layer().with_filter(EnvFilter::from_default_env());
    Registry::default().with(fmt_layer).init();

    info!("Multiverse node process");

    // Read the config
    let config = Arc::new(
        Config::builder()
            .add_source(File::with_name("node"))
            .add_source(Environment::with_prefix("BC"))
            .build()?,
    );

    // Create the process
    let mut process = Process::<Message>::create(config).await;

    // Register modules
    ChainSelection::register(&mut process);

    // Run it
    process.run().await?;

    // Bye!
    info!("Exiting");
    Ok(())
}
