//! DeviceDock CLI
//!
//! Starts, drives and stops cloud devices for automation agents.

use clap::Parser;
use devicedock::cli::{self, Cli};
use devicedock::{logging, paths};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = paths::init_data_dir(cli.data_dir.as_deref())?;
    let _logging = logging::init_logging(&paths::log_dir(&data_dir))?;

    let command = format!("{:?}", cli.command);
    tracing::info!(
        component = "cli",
        event = "cli.command",
        command = %command,
    );

    let result = cli::run(cli).await;
    if let Err(err) = &result {
        tracing::error!(
            component = "cli",
            event = "cli.failed",
            error = %format!("{err:#}"),
        );
    }
    result
}
