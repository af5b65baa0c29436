mod config;
mod logging;
mod server;
mod signaling;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use huddle_sfu::{LocalEngine, SessionCoordinator, TransportOptions};

use config::Config;
use server::Exit;

#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "Huddle SFU signaling server", long_about = None)]
struct Args {
    /// Path to a configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "HUDDLE_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref())?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Huddle SFU starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Media engine and session coordinator
    let options = TransportOptions::from(&config.engine);
    let (engine, engine_events) = LocalEngine::new(config.engine.clone());
    let coordinator = SessionCoordinator::new(config.sfu.clone(), options, engine);
    tokio::spawn(Arc::clone(&coordinator).run_engine_events(engine_events));

    // 5. Serve until shutdown
    match server::run(&config, coordinator).await? {
        Exit::Signal => {
            info!("Huddle SFU stopped");
            Ok(())
        }
        Exit::EngineLost => {
            error!("Exiting because the media engine is gone");
            Err(anyhow::anyhow!("media engine terminated unexpectedly"))
        }
    }
}
