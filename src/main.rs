//! Macro server command line.
//!
//! Runs macros against a simulated device pool:
//!
//! ```bash
//! macroserver list
//! macroserver run ascan mot01 0 10 10 0.1
//! macroserver --config config/macroserver.toml run ascanc mot01 0 10 mot02 0 100 0.1
//! ```
//!
//! Scan records are printed to stdout as JSON lines. The first Ctrl-C stops
//! the running macro, the second one aborts it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_macroserver::config::Settings;
use daq_macroserver::hardware::mock::{MockCounter, MockMotor};
use daq_macroserver::hardware::DevicePool;
use daq_macroserver::macros::context::ACTIVE_MNTGRP;
use daq_macroserver::macros::MacroCatalog;
use daq_macroserver::session::{InMemorySession, SessionEvent};
use daq_macroserver::value::ParamValue;
use daq_macroserver::{logging, MacroExecutor};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "macroserver")]
#[command(version)]
#[command(about = "Run macros and scans against a simulated device pool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file
    #[arg(long, short, global = true, default_value = "config/macroserver.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// List the registered macros
    List,

    /// Run a macro and print its records as JSON lines
    Run {
        /// Macro name
        name: String,

        /// Macro parameters
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn demo_pool() -> Arc<DevicePool> {
    let pool = Arc::new(DevicePool::new());
    pool.register_moveable(Arc::new(MockMotor::with_velocity("mot01", 100.0)));
    pool.register_moveable(Arc::new(MockMotor::with_velocity("mot02", 100.0)));
    pool.register_acquirable(Arc::new(
        MockCounter::new("mntgrp01", &["ct01", "ct02"]).with_ref_channel("img01"),
    ));
    pool
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load settings from {:?}", cli.config))?;
    logging::init_from_settings(&settings)?;

    let catalog = Arc::new(MacroCatalog::with_builtins());
    match cli.command {
        Commands::List => {
            for def in catalog.definitions() {
                println!("{:<10} {}", def.name, def.description);
            }
            Ok(())
        }
        Commands::Run { name, args } => run(settings, catalog, &name, &args).await,
    }
}

async fn run(settings: Settings, catalog: Arc<MacroCatalog>, name: &str, args: &[String]) -> Result<()> {
    let session = Arc::new(
        InMemorySession::new(&settings.application.name).with_env(ACTIVE_MNTGRP, json!("mntgrp01")),
    );
    let mut events = session.subscribe();
    let executor = MacroExecutor::new(session.clone(), demo_pool(), catalog, settings);

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Record(record)) => match serde_json::to_string(&record) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "failed to serialize record"),
                },
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "record printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let control = executor.clone();
    let interrupts = tokio::spawn(async move {
        let mut count = 0;
        while tokio::signal::ctrl_c().await.is_ok() {
            count += 1;
            if count == 1 {
                info!("interrupted, stopping");
                control.stop();
            } else {
                info!("interrupted again, aborting");
                control.abort();
            }
        }
    });

    let params: Vec<ParamValue> = args.iter().map(|a| ParamValue::from_token(a)).collect();
    let result = executor.run(name, params).await;
    executor.wait_passes().await;
    interrupts.abort();
    let _ = interrupts.await;
    drop(executor);
    drop(session);
    // the printer ends once the last session handle is gone
    let _ = printer.await;

    match result {
        Ok(Some(value)) => {
            info!(%value, "macro finished");
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("{} failed: {}", name, e)),
    }
}
