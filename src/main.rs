//! nova-snapshot - generational hardlink snapshots
//!
//! Main binary entry point for the command-line interface.

use clap::Parser;
use nova_snapshot::cli::{self, Cli};
use std::process::ExitCode;
use std::time::Duration;

/// Upper bound on waiting for detached section workers at exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("nova-snapshot: unable to start the runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(cli::run(cli));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            eprintln!("nova-snapshot: {}", failure);
            ExitCode::from(failure.exit_code())
        }
    }
}
