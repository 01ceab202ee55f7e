use clap::Parser;
use std::process::ExitCode;
use tracing::error;

use dragonkick::cli::Cli;
use dragonkick::config::KickOptions;
use dragonkick::error::EX_OK;
use dragonkick::logging::init_tracing;
use dragonkick::Kickstart;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match Kickstart::new(KickOptions::from(cli)).run() {
        Ok(_) => ExitCode::from(EX_OK),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
