mod burrow;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "burrow", version, about = "Burrow - reverse TCP tunnel relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay: expose a public port and accept a tunnel client.
    Serve {
        /// Path to config file (.toml/.yaml/.yml). Falls back to BURROW_CONFIG.
        #[arg(long, env = "BURROW_CONFIG")]
        config: Option<std::path::PathBuf>,
    },
    /// Run the tunnel client: dial the relay and forward to a local service.
    Connect {
        /// Path to config file (.toml/.yaml/.yml). Falls back to BURROW_CONFIG.
        #[arg(long, env = "BURROW_CONFIG")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => burrow::serve(config).await,
        Command::Connect { config } => burrow::connect(config).await,
    }
}
