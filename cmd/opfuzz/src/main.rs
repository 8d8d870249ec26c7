mod cli;
mod initializers;

use clap::Parser;

use crate::cli::CLI;
use crate::initializers::{init_config, init_tracing};

fn main() -> eyre::Result<()> {
    let CLI { opts, command } = CLI::parse();
    init_tracing(&opts)?;
    let config = init_config(&opts)?;
    command.run(config)
}
