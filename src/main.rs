use std::process::ExitCode;

use clap::Parser;
use hookdeck_listen::cli::{self, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    ExitCode::from(cli::run(cli).await)
}
