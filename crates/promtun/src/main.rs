mod promtun;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "promtun",
    version = promtun::VERSION,
    about = "promtun - keeps authenticated tunnels to Coroot gateways and relays their streams to a local destination"
)]
struct Cli {
    /// Resolver returning the gateway endpoints (default: https://gw.coroot.com/promtun/resolve).
    #[arg(long, env = "RESOLVER_URL")]
    resolver_url: Option<String>,

    /// Project token (36 bytes).
    #[arg(long, env = "PROJECT_TOKEN", hide_env_values = true)]
    project_token: Option<String>,

    /// Config file sent to the gateway; $VAR and ${VAR} are expanded from the environment.
    #[arg(long, env = "CONFIG_PATH")]
    config_path: Option<std::path::PathBuf>,

    /// Fixed destination address, falling back to `PROMETHEUS_ADDRESS`. When
    /// neither is set, each stream names its own destination.
    #[arg(long, env = "DESTINATION_ADDRESS")]
    destination: Option<String>,

    /// Optional settings file (.toml/.yaml/.yml) with timeouts, backoff, logging and the admin listener.
    #[arg(long, env = "PROMTUN_SETTINGS")]
    settings: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    promtun::run(promtun::config::StartupArgs {
        resolver_url: cli.resolver_url,
        project_token: cli.project_token,
        config_path: cli.config_path,
        destination: cli.destination,
        settings: cli.settings,
    })
    .await
}
