use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use distributor::{
    config::Config,
    cycle::{CycleSettings, DistributionCycle},
    db::Db,
    error::Result,
    model::Raffle,
    pumpportal::PumpPortal,
    scheduler::Scheduler,
    utils::lamports_to_sol,
    SolanaClient,
};
use log::{info, warn};

use crate::api;

pub(crate) type Cycle = DistributionCycle<Db, PumpPortal, SolanaClient>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    /// Config file, environment variables override its values
    #[arg(short = 'c', long = "config", default_value = "config.json", global = true)]
    pub(crate) config: PathBuf,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Run a distribution round every interval until interrupted
    Run,
    /// Run a single distribution round and exit
    Once,
    /// Serve participant registration and the winners feed
    Serve,
    /// Create or update a raffle
    Raffle {
        /// raffle id
        #[arg(long)]
        id: u64,

        /// display name
        #[arg(long)]
        name: String,

        /// store the raffle disabled
        #[arg(long)]
        inactive: bool,
    },
    /// Print the latest winner records
    Winners {
        /// how many records to print
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print a config file with every default filled in
    ShowConfig,
}

impl Cli {
    pub(crate) fn parse_args() -> Self {
        Cli::parse()
    }
}

async fn setup_cycle(config: &Config) -> Result<Cycle> {
    config.require_worker_keys()?;
    if let Some(warning) = config.mode_mismatch() {
        warn!("{}", warning);
    }
    let db = Db::connect(&config.redis).await?;
    info!("connected to {}", db);
    let chain = SolanaClient::setup(config)?;
    let collector = PumpPortal::setup(config, &chain)?;
    let settings = CycleSettings::from_config(config);
    info!(
        "raffle {} in {} settlement, split {}/{}, reserve {} lamports",
        settings.raffle_id, settings.mode, settings.split.numerator, settings.split.denominator, settings.reserve_lamports
    );
    Ok(DistributionCycle::new(db, collector, chain, settings))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for ctrl-c, running until killed: {}", e);
        futures::future::pending::<()>().await;
    }
}

pub(crate) async fn run_cmd(config: &Config) -> Result<()> {
    let cycle = setup_cycle(config).await?;
    let scheduler = Scheduler::new(cycle, Duration::from_secs(config.raffle.interval));
    let rounds = scheduler.main_loop(shutdown_signal()).await;
    info!("raffle loop stopped after {} rounds", rounds);
    Ok(())
}

pub(crate) async fn once_cmd(config: &Config) -> Result<()> {
    let cycle = setup_cycle(config).await?;
    let outcome = cycle.run_once().await?;
    println!("{}", outcome);
    Ok(())
}

pub(crate) async fn serve_cmd(config: &Config) -> Result<()> {
    let db = Db::connect(&config.redis).await?;
    info!("connected to {}", db);
    api::serve(config, db).await?;
    Ok(())
}

pub(crate) async fn raffle_cmd(config: &Config, id: u64, name: String, inactive: bool) -> Result<()> {
    let db = Db::connect(&config.redis).await?;
    let raffle = match db.get_raffle(id).await? {
        // keep the original creation time
        Some(existing) => Raffle {
            name,
            is_active: !inactive,
            ..existing
        },
        None => Raffle::new(id, name, !inactive),
    };
    db.put_raffle(&raffle).await?;
    println!("{}", serde_json::to_string_pretty(&raffle)?);
    if raffle.id != config.raffle.active_raffle_id {
        warn!(
            "raffle {} is not the configured active raffle {}",
            raffle.id, config.raffle.active_raffle_id
        );
    }
    Ok(())
}

pub(crate) async fn winners_cmd(config: &Config, limit: usize) -> Result<()> {
    let db = Db::connect(&config.redis).await?;
    println!("{} participants registered", db.participant_count().await?);
    for w in db.latest_winners(limit).await? {
        println!(
            "#{} {} raffle={} wallet={} amount={} SOL tx={}",
            w.id,
            w.created_at.format("%Y-%m-%d %H:%M:%S"),
            w.raffle_id,
            w.wallet,
            lamports_to_sol(w.amount_lamports),
            w.tx_signature.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_raffle_subcommand() {
        let cli = Cli::try_parse_from(["distributor", "-c", "prod.json", "raffle", "--id", "2", "--name", "weekly", "--inactive"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("prod.json"));
        match cli.command {
            Commands::Raffle { id, name, inactive } => {
                assert_eq!(id, 2);
                assert_eq!(name, "weekly");
                assert!(inactive);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn config_defaults_and_is_global() {
        let cli = Cli::try_parse_from(["distributor", "winners"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("config.json"));
        assert!(matches!(cli.command, Commands::Winners { limit: 10 }));

        let cli = Cli::try_parse_from(["distributor", "run", "--config", "other.json"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("other.json"));
    }

    #[test]
    fn clap_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
