mod commands;
mod config;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "fishler",
    about = "SSH honeypot that drops attackers into disposable sandboxes"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base directory for the operational log, session transcripts and
    /// overlay homes.
    #[arg(long, short = 'l', global = true)]
    log_basepath: Option<PathBuf>,

    /// Raise log verbosity to debug.
    #[arg(long, short = 'd', global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the honeypot server.
    Serve(commands::serve::ServeArgs),
    /// Manage the sandbox image.
    Image {
        #[command(subcommand)]
        command: commands::image::ImageCommands,
    },
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("fatal: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Serve(args) => commands::serve::command(&cli, args).await,
        Commands::Image { command } => commands::image::command(&cli, command).await,
    }
}
