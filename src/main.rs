//! autsys-relay: durable store-and-forward relay between a mobile client and
//! a core agent.

use clap::Parser;
use std::process::ExitCode;

use autsys_relay::{logging, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args = Commands::parse();

    let settings = match args.settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging; the guard flushes the file writer on exit.
    let _guard = match logging::init(&settings.logging) {
        Ok((guard, _)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Run the command
    match args.run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
