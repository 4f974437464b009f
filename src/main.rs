mod app;
mod cli;
mod logging;
mod shutdown;
mod workload;

use clap::Parser;
use tracing::info;

use peermesh_core::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    logging::init(&config.log, config.swarm.starting_port)?;
    info!(
        n_peers = config.swarm.n_peers,
        starting_port = config.swarm.starting_port,
        transport = ?config.transport.kind,
        "peermesh starting"
    );

    app::run(config, cli.peer_type, cli.package.clone()).await?;
    Ok(())
}
