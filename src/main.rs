//! Nancy - directive gating and file-based comms for supervised coding agents.

use clap::Parser;
use std::process::ExitCode;

use nancy::Commands;

#[tokio::main]
async fn main() -> ExitCode {
    // Held until exit so buffered file logs are flushed
    let _guard = match nancy::logging::init() {
        Ok((guard, _log_dir)) => Some(guard),
        Err(e) => {
            nancy::logging::init_console();
            tracing::debug!("File logging unavailable: {}", e);
            None
        }
    };

    let args = Commands::parse();

    match args.run().await {
        Ok(code) => code,
        Err(e) => {
            // Reaches stderr through the console layer and the log file.
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
