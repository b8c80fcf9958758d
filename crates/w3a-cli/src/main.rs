use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = w3a_cli::Cli::parse();
    w3a_cli::init_tracing(cli.log_level());
    w3a_cli::run_cli(cli)
}
