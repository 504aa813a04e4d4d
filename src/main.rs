// =============================================================================
// Meridian — autonomous perpetual-futures trading engine
// =============================================================================
//
// Commands:
//   meridian trading start   run the scheduler and the tool API
//   meridian db init         apply the schema and seed the account history
//
// Exit codes: 0 ok, 1 configuration or initialisation failure, 2 fatal
// runtime error.
// =============================================================================

mod api;
mod config;
mod engine;
mod error;
mod exchange;
mod exit;
mod indicators;
mod market;
mod regime;
mod scoring;
mod stop_loss;
mod store;
mod strategy;
mod tools;
mod types;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::engine::TradingEngine;
use crate::store::Store;
use crate::tools::ToolContext;

#[derive(Parser)]
#[command(name = "meridian", about = "Autonomous perpetual-futures trading engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Trading engine operations.
    Trading {
        #[command(subcommand)]
        action: TradingAction,
    },
    /// Database maintenance.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
}

#[derive(Subcommand)]
enum TradingAction {
    /// Start the scheduler, monitor loops, and the tool API.
    Start,
}

#[derive(Subcommand)]
enum DbAction {
    /// Apply the schema and insert the initial account row.
    Init,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            return ExitCode::from(1);
        }
    };

    match cli.command {
        Command::Db { action: DbAction::Init } => db_init(&settings),
        Command::Trading { action: TradingAction::Start } => trading_start(settings).await,
    }
}

fn db_init(settings: &Settings) -> ExitCode {
    match Store::open(&settings.database_path)
        .and_then(|store| store.seed_account(settings.initial_balance))
    {
        Ok(()) => {
            info!(path = %settings.database_path, "database initialised");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "database initialisation failed");
            ExitCode::from(1)
        }
    }
}

async fn trading_start(settings: Settings) -> ExitCode {
    if let Err(e) = settings.require_credentials() {
        error!(error = %e, "exchange credentials missing");
        return ExitCode::from(1);
    }

    let engine = match TradingEngine::new(settings) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!(error = %e, "engine initialisation failed");
            return ExitCode::from(1);
        }
    };

    // The tool API serves the reasoning layer alongside the trading loops.
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3400".to_string());
    let ctx = ToolContext::new(engine.clone());
    let api_addr = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(ctx);
        match tokio::net::TcpListener::bind(&api_addr).await {
            Ok(listener) => {
                info!(addr = %api_addr, "tool API listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "tool API server failed");
                }
            }
            Err(e) => error!(addr = %api_addr, error = %e, "tool API bind failed"),
        }
    });

    match engine.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal runtime error");
            ExitCode::from(2)
        }
    }
}
