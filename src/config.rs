//! Runtime configuration, loadable from a YAML file. Every field has a
//! default so a partial file (or none at all) is enough to get a devnet
//! indexer running.

use crate::types::ChainSpec;
use serde::{Deserialize, Serialize};
use std::fs::File;

pub const LOG_LEVEL: &str = "info";

fn log_level() -> String {
    LOG_LEVEL.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub beacon_api: BeaconApiConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub chain: ChainSpec,
    /// The minimum severity for emitted logs.
    #[serde(default = "log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            beacon_api: BeaconApiConfig::default(),
            indexer: IndexerConfig::default(),
            database: DatabaseConfig::default(),
            chain: ChainSpec::default(),
            log_level: log_level(),
        }
    }
}

impl Config {
    pub fn load_from_file(path_to_file: String) -> Result<Config, String> {
        let file =
            File::open(path_to_file).map_err(|e| format!("Error reading config file: {}", e))?;
        let config: Config =
            serde_yaml::from_reader(file).map_err(|e| format!("Error parsing config file: {}", e))?;
        Ok(config)
    }
}

pub mod beacon_api {
    pub const ENDPOINT: &str = "http://localhost:5052";

    pub fn endpoint() -> String {
        ENDPOINT.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconApiConfig {
    #[serde(default = "beacon_api::endpoint")]
    pub endpoint: String,
}

impl Default for BeaconApiConfig {
    fn default() -> Self {
        BeaconApiConfig {
            endpoint: beacon_api::endpoint(),
        }
    }
}

pub mod indexer {
    /// Epochs of blocks kept in memory for reorg resolution.
    pub const IN_MEMORY_EPOCHS: u16 = 3;
    /// Epochs to wait before an epoch summary is considered settled.
    pub const EPOCH_PROCESSING_DELAY: u16 = 2;
    pub const WRITE_DB: bool = false;

    pub const fn in_memory_epochs() -> u16 {
        IN_MEMORY_EPOCHS
    }

    pub const fn epoch_processing_delay() -> u16 {
        EPOCH_PROCESSING_DELAY
    }

    pub const fn write_db() -> bool {
        WRITE_DB
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default = "indexer::in_memory_epochs")]
    pub in_memory_epochs: u16,
    #[serde(default = "indexer::epoch_processing_delay")]
    pub epoch_processing_delay: u16,
    /// Enables persistence and the historical synchronizer.
    #[serde(default = "indexer::write_db")]
    pub write_db: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        IndexerConfig {
            in_memory_epochs: indexer::in_memory_epochs(),
            epoch_processing_delay: indexer::epoch_processing_delay(),
            write_db: indexer::write_db(),
        }
    }
}

pub mod database {
    pub const USER: &str = "postgres";
    pub const PASSWORD: &str = "postgres";
    pub const DBNAME: &str = "beacon_indexer";
    pub const DEFAULT_DBNAME: &str = "postgres";
    pub const HOST: &str = "localhost";
    pub const PORT: u16 = 5432;
    pub const CONNECT_TIMEOUT_MILLIS: u64 = 2_000;

    pub fn user() -> String {
        USER.to_string()
    }

    pub fn password() -> String {
        PASSWORD.to_string()
    }

    pub fn dbname() -> String {
        DBNAME.to_string()
    }

    pub fn default_dbname() -> String {
        DEFAULT_DBNAME.to_string()
    }

    pub fn host() -> String {
        HOST.to_string()
    }

    pub const fn port() -> u16 {
        PORT
    }

    pub const fn connect_timeout_millis() -> u64 {
        CONNECT_TIMEOUT_MILLIS
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "database::user")]
    pub user: String,
    #[serde(default = "database::password")]
    pub password: String,
    #[serde(default = "database::dbname")]
    pub dbname: String,
    #[serde(default = "database::default_dbname")]
    pub default_dbname: String,
    #[serde(default = "database::host")]
    pub host: String,
    #[serde(default = "database::port")]
    pub port: u16,
    #[serde(default = "database::connect_timeout_millis")]
    pub connect_timeout_millis: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            user: database::user(),
            password: database::password(),
            dbname: database::dbname(),
            default_dbname: database::default_dbname(),
            host: database::host(),
            port: database::port(),
            connect_timeout_millis: database::connect_timeout_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Epoch;

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "
indexer:
  in_memory_epochs: 5
chain:
  genesis_timestamp: 1606824023
  whisk_fork_epoch: \"512\"
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.indexer.in_memory_epochs, 5);
        assert_eq!(
            config.indexer.epoch_processing_delay,
            indexer::EPOCH_PROCESSING_DELAY
        );
        assert_eq!(config.chain.genesis_timestamp, 1_606_824_023);
        assert_eq!(config.chain.whisk_fork_epoch, Some(Epoch::new(512)));
        assert_eq!(config.beacon_api.endpoint, beacon_api::ENDPOINT);
        assert!(!config.indexer.write_db);
    }

    #[test]
    fn empty_config_is_default() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.database.port, database::PORT);
        assert_eq!(config.log_level, LOG_LEVEL);
    }
}
