use std::process::ExitCode;

use chainsweep::{
    cli::{Args, SweepArgs, SweepCommand},
    logger,
};
use tracing::error;

fn main() -> ExitCode {
    logger::init();

    // Bare `chainsweep` runs the full default sweep.
    let args = argh::from_env::<Args>();
    let command = args
        .command
        .unwrap_or_else(|| SweepCommand::Sweep(SweepArgs::default()));

    match command.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("chainsweep failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}
