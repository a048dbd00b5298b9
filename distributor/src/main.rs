mod api;
mod commands;

use anyhow::Context;
use commands::{Cli, Commands};
use distributor::config::Config;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Cli::parse_args();
    if let Commands::ShowConfig = opt.command {
        println!("{}", Config::show()?);
        return Ok(());
    }

    let config = Config::load(&opt.config).with_context(|| format!("loading config {:?}", opt.config))?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match opt.command {
            Commands::Run => commands::run_cmd(&config).await,
            Commands::Once => commands::once_cmd(&config).await,
            Commands::Serve => commands::serve_cmd(&config).await,
            Commands::Raffle { id, name, inactive } => commands::raffle_cmd(&config, id, name, inactive).await,
            Commands::Winners { limit } => commands::winners_cmd(&config, limit).await,
            Commands::ShowConfig => Ok(()),
        }
    })?;

    Ok(())
}
