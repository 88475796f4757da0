use clap::{Parser, Subcommand};
use color_eyre::Result;

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "spindle", version, about = "Test matrix driver for spindle simulations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the test matrix
    Run(commands::run::RunArgs),
    /// Show which targets and devices are available on this machine
    Targets(commands::targets::TargetsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => commands::run::execute(args).await,
        Commands::Targets(args) => commands::targets::execute(args),
    }
}
