mod mtcp;

use clap::{Parser, Subcommand};

use crate::mtcp::app::{AgentOverrides, Mode, RelayOverrides};

#[derive(Debug, Parser)]
#[command(
    name = "mtcp",
    version,
    about = "mtcp - reverse TCP tunnel: a public relay paired with a local agent"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses MTCP_CONFIG; then auto-detects mtcp.toml > mtcp.yaml > mtcp.yml from CWD; then the OS default path (Linux: /etc/mtcp/mtcp.toml; others: user config dir); then built-in defaults.
    #[arg(long, env = "MTCP_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the public relay that external callers and agents connect to.
    Relay {
        /// Port to listen on (default 9999).
        #[arg(long)]
        port: Option<u16>,
        /// Capacity of the idle connector pool (default 10).
        #[arg(long)]
        pool_size: Option<usize>,
    },
    /// Run the local agent that keeps a fleet of connectors open to the relay.
    Agent {
        /// Target host the agent forwards sessions to (default 127.0.0.1).
        #[arg(long)]
        ip: Option<String>,
        /// Target port (default 80).
        #[arg(long)]
        port: Option<u16>,
        /// Relay address as HOST:PORT (default 127.0.0.1:9999).
        #[arg(long)]
        server: Option<String>,
        /// Number of standby connectors (default 10).
        #[arg(long)]
        fleet_size: Option<usize>,
    },
}

impl Command {
    fn into_mode(self) -> Mode {
        match self {
            Command::Relay { port, pool_size } => Mode::Relay(RelayOverrides { port, pool_size }),
            Command::Agent {
                ip,
                port,
                server,
                fleet_size,
            } => Mode::Agent(AgentOverrides {
                ip,
                port,
                server,
                fleet_size,
            }),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    mtcp::run(cli.config, cli.command.into_mode()).await
}
