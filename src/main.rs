mod browser;
mod cli;
mod config;
mod daemon;
mod engine;
mod ipc;
mod matching;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            socket,
            tuning,
            matching,
        } => {
            let config = tuning.daemon_config(socket, matching.options());
            if let Err(e) = daemon::run(config).await {
                tracing::error!(error = %e, "daemon failed");
                eprintln!("tabwardend serve: {e}");
                std::process::exit(1);
            }
        }
        Command::Key { matching, urls } => {
            let opts = matching.options();
            for url in &urls {
                print!("{}", matching::describe(url, &opts));
            }
        }
    }
}
