use crate::beacon_client::{BeaconNodeHttpClient, Timeouts};
use crate::config::Config;
use crate::database::Database;
use crate::indexer::Indexer;
use crate::logger;
use clap::{Arg, ArgAction, Command};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const RUN: &str = "run";
pub const CONFIG: &str = "config";

fn run_indexer() -> Command {
    Command::new(RUN).about("Track the beacon chain head and index epochs")
}

pub fn app() -> Command {
    Command::new("beacon_indexer")
        .author("Sigma Prime <contact@sigmaprime.io>")
        .arg(
            Arg::new(CONFIG)
                .long(CONFIG)
                .value_name("PATH_TO_CONFIG")
                .help("Path to configuration file")
                .action(ArgAction::Set)
                .global(true),
        )
        .subcommand(run_indexer())
}

pub async fn run() -> Result<(), String> {
    let matches = app().get_matches();

    let config = match matches.get_one::<String>(CONFIG) {
        Some(path) => Config::load_from_file(path.to_string())?,
        None => Config::default(),
    };

    logger::init_logger(&config.log_level)?;

    match matches.subcommand() {
        Some((RUN, _)) => start_indexer(config)
            .await
            .map_err(|e| format!("Failure: {:?}", e)),
        _ => Err("Unsupported subcommand. See --help".into()),
    }
}

async fn start_indexer(config: Config) -> Result<(), String> {
    let spec = Arc::new(config.chain.clone());
    let client = Arc::new(BeaconNodeHttpClient::new(
        config.beacon_api.endpoint.clone(),
        spec.clone(),
        Timeouts::default(),
    ));

    match client.get_node_version().await {
        Ok(version) => info!("Connected to beacon node: {}", version),
        Err(e) => error!("Beacon node version probe failed: {}", e),
    }
    match client.get_node_syncing().await {
        Ok(syncing) if syncing.is_syncing => warn!(
            "Beacon node is still syncing, {} slots behind",
            syncing.sync_distance
        ),
        Ok(_) => {}
        Err(e) => error!("Beacon node syncing probe failed: {}", e),
    }
    match client.get_genesis().await {
        Ok(genesis) => {
            if genesis.genesis_time != config.chain.genesis_timestamp {
                return Err(format!(
                    "Beacon node genesis time {} does not match configured {}",
                    genesis.genesis_time, config.chain.genesis_timestamp
                ));
            }
        }
        Err(e) => error!("Beacon node genesis probe failed: {}", e),
    }

    let database = if config.indexer.write_db {
        let database = Database::connect(&config.database)
            .await
            .map_err(|e| format!("Database connection failed: {:?}", e))?;
        Some(Arc::new(Mutex::new(database)))
    } else {
        None
    };

    let indexer = Arc::new(Indexer::new(
        client,
        database,
        spec,
        &config.indexer,
    ));
    indexer.start().map_err(|e| format!("{:?}", e))?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for shutdown signal: {}", e))?;
    info!("Shutdown signal received");
    indexer.stop();

    Ok(())
}
