//! magpie-console - Protocol debugging console
//!
//! Connects an account over IRCv3, SIMPLE, or the raw passthrough
//! protocol, prints everything the core reports, and sends what you
//! type. Also exposes NAT discovery and port-mapping probes.

mod connect;
mod nat;

use clap::{Parser, Subcommand};
use magpie::Result;

#[derive(Parser)]
#[command(name = "magpie-console")]
#[command(about = "Protocol debugging console", long_about = None)]
#[command(version)]
struct Cli {
    /// Output JSON
    #[arg(short, long, global = true)]
    json: bool,

    /// Verbose output (wire-level logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect an account and run an interactive console
    Connect(connect::ConnectArgs),

    /// Probe NAT traversal (discovery, port mapping)
    Nat(nat::NatArgs),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "magpie=trace" } else { "magpie=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Connect(args) => connect::run(args, cli.json).await,
        Command::Nat(args) => nat::run(args, cli.json).await,
    }
}
