pub mod beacon_client;
pub mod cli;
pub mod config;
pub mod database;
pub mod indexer;
pub mod logger;
pub mod types;
