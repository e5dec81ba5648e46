use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod tail;

/// Market data channel CLI
///
/// Follows a market (and optionally a user) channel, printing every
/// message as it arrives and falling back to REST polling when the
/// channel gives up.
///
/// Examples:
///   mlink tail abc123 --base https://news.example.com
///
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a market's messages and connection status
    Tail(tail::Cmd),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let res = match args.command {
        Commands::Tail(cmd) => tail::run(cmd),
    };
    if let Err(err) = res {
        eprintln!("{:?}", err);
    }
}
