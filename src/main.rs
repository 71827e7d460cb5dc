use std::process::ExitCode;

use clap::Parser;
use maestro_core::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    maestro_core::cli::run(cli).await
}
