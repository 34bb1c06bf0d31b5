mod portbridge;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "portbridge",
    version,
    about = "portbridge - keeps a workspace's forwarded ports in sync with the local agent"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses PORTBRIDGE_CONFIG; then auto-detects portbridge.toml > portbridge.yaml > portbridge.yml from CWD; then falls back to the user config dir.
    #[arg(long, env = "PORTBRIDGE_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Workspace instance id sent with every agent call. Overrides workspace.instance_id.
    #[arg(long, env = "PORTBRIDGE_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Agent port. Overrides agent.port.
    #[arg(long, env = "PORTBRIDGE_AGENT_PORT")]
    agent_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    portbridge::run(portbridge::app::Overrides {
        config_path: cli.config,
        instance_id: cli.instance_id,
        agent_port: cli.agent_port,
    })
    .await
}
