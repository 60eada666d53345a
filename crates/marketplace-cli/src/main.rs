use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod completion;
mod dispatch;
mod render;

use completion::CliCompletionShell;

#[derive(Parser, Debug)]
#[command(name = "marketplace")]
#[command(about = "Install, update and remove marketplace applications", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Install {
        app_id: String,
        source: String,
        #[arg(long)]
        sha256: Option<String>,
        #[arg(long, requires = "public_key")]
        signature: Option<String>,
        #[arg(long, requires = "signature")]
        public_key: Option<String>,
        #[arg(long)]
        replace: bool,
    },
    Uninstall {
        app_id: String,
    },
    List,
    Sweep,
    Config,
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    dispatch::run_cli(cli).await
}
