mod commands;
mod terminal;

use std::process::ExitCode;

use commands::{CommandLine, Commands, report, scan, worker};
use terminal::logging;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let commands = CommandLine::parse_args();

    logging::init_logging();

    match commands.command {
        Commands::Scan(args) => {
            let success: bool = scan::scan(*args).await?;
            Ok(if success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::Report { target, db } => {
            report::report(&target, &db).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Worker => {
            worker::worker().await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
