//! Transactional persistence of epoch summaries to Postgres.
//!
//! The schema is created on connect. All writes for one epoch happen inside
//! a single transaction so a restart never observes a half-written epoch.

mod error;
mod models;

pub use error::Error;
pub use models::{
    BlobAssignmentRow, BlockRow, EpochRow, OrphanedBlockRow, SlotAssignmentRow, SyncAssignmentRow,
};

use crate::config::DatabaseConfig;
use log::error;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::{runtime, task::JoinHandle};
use tokio_postgres::{config::Config as PostgresConfig, Client, NoTls};

pub use tokio_postgres::Transaction;

/// The key-value slot under which the synchronizer checkpoint is stored.
pub const SYNC_STATE_KEY: &str = "indexer.syncstate";

pub struct Database {
    client: Client,
    _connection: JoinHandle<()>,
}

fn as_i64(value: u64) -> Result<i64, Error> {
    value.try_into().map_err(|_| Error::OutOfRange(value))
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, Error> {
        let (client, connection) = Self::postgres_config(config).connect(NoTls).await?;
        let connection = runtime::Handle::current().spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {:?}", e);
            }
        });

        let db = Self {
            client,
            _connection: connection,
        };
        db.ensure_schema().await?;
        Ok(db)
    }

    fn postgres_config(config: &DatabaseConfig) -> PostgresConfig {
        let mut postgres_config = PostgresConfig::new();
        postgres_config
            .user(&config.user)
            .password(config.password.clone())
            .dbname(&config.dbname)
            .host(&config.host)
            .port(config.port)
            .connect_timeout(Duration::from_millis(config.connect_timeout_millis));
        postgres_config
    }

    async fn ensure_schema(&self) -> Result<(), Error> {
        self.client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS explorer_state (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS epochs (
                    epoch BIGINT PRIMARY KEY,
                    validator_count BIGINT NOT NULL,
                    eligible BIGINT NOT NULL,
                    voted_target BIGINT NOT NULL,
                    voted_head BIGINT NOT NULL,
                    voted_total BIGINT NOT NULL,
                    block_count INTEGER NOT NULL,
                    orphaned_count INTEGER NOT NULL,
                    attestation_count BIGINT NOT NULL,
                    deposit_count BIGINT NOT NULL,
                    exit_count BIGINT NOT NULL,
                    withdraw_count BIGINT NOT NULL,
                    withdraw_amount BIGINT NOT NULL,
                    attester_slashing_count BIGINT NOT NULL,
                    proposer_slashing_count BIGINT NOT NULL,
                    bls_change_count BIGINT NOT NULL,
                    eth_transaction_count BIGINT NOT NULL,
                    sync_participation REAL NOT NULL
                );
                CREATE TABLE IF NOT EXISTS blocks (
                    root BYTEA PRIMARY KEY,
                    slot BIGINT NOT NULL,
                    parent_root BYTEA NOT NULL,
                    state_root BYTEA NOT NULL,
                    orphaned BOOLEAN NOT NULL,
                    proposer BIGINT NOT NULL,
                    graffiti BYTEA NOT NULL,
                    graffiti_text TEXT NOT NULL,
                    attestation_count BIGINT NOT NULL,
                    deposit_count BIGINT NOT NULL,
                    exit_count BIGINT NOT NULL,
                    withdraw_count BIGINT NOT NULL,
                    withdraw_amount BIGINT NOT NULL,
                    attester_slashing_count BIGINT NOT NULL,
                    proposer_slashing_count BIGINT NOT NULL,
                    bls_change_count BIGINT NOT NULL,
                    eth_transaction_count BIGINT NOT NULL,
                    eth_block_number BIGINT,
                    eth_block_hash BYTEA,
                    sync_participation REAL NOT NULL
                );
                CREATE INDEX IF NOT EXISTS blocks_slot_idx ON blocks (slot);
                CREATE TABLE IF NOT EXISTS orphaned_blocks (
                    root BYTEA PRIMARY KEY,
                    slot BIGINT NOT NULL,
                    header_json TEXT NOT NULL,
                    block_json TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS slot_assignments (
                    slot BIGINT PRIMARY KEY,
                    proposer BIGINT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS sync_assignments (
                    period BIGINT NOT NULL,
                    index INTEGER NOT NULL,
                    validator BIGINT NOT NULL,
                    PRIMARY KEY (period, index)
                );
                CREATE TABLE IF NOT EXISTS blob_assignments (
                    root BYTEA NOT NULL,
                    commitment BYTEA NOT NULL,
                    slot BIGINT NOT NULL,
                    PRIMARY KEY (root, commitment)
                );",
            )
            .await?;
        Ok(())
    }

    pub async fn transaction(&mut self) -> Result<Transaction<'_>, Error> {
        self.client.transaction().await.map_err(Into::into)
    }

    /// Read a JSON state blob from the `explorer_state` table.
    pub async fn get_explorer_state<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, Error> {
        let row = self
            .client
            .query_opt("SELECT value FROM explorer_state WHERE key = $1", &[&key])
            .await?;
        match row {
            Some(row) => {
                let value: String = row.get(0);
                Ok(Some(serde_json::from_str(&value)?))
            }
            None => Ok(None),
        }
    }

    /// Write a JSON state blob inside an open transaction.
    pub async fn set_explorer_state<'a, T: Serialize>(
        tx: &'a Transaction<'a>,
        key: &str,
        value: &T,
    ) -> Result<(), Error> {
        let value = serde_json::to_string(value)?;
        tx.execute(
            "INSERT INTO explorer_state (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            &[&key, &value],
        )
        .await?;
        Ok(())
    }

    pub async fn insert_epoch<'a>(tx: &'a Transaction<'a>, row: &EpochRow) -> Result<(), Error> {
        tx.execute(
            "INSERT INTO epochs (
                epoch, validator_count, eligible, voted_target, voted_head, voted_total,
                block_count, orphaned_count, attestation_count, deposit_count, exit_count,
                withdraw_count, withdraw_amount, attester_slashing_count,
                proposer_slashing_count, bls_change_count, eth_transaction_count,
                sync_participation
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18)
            ON CONFLICT (epoch) DO UPDATE SET
                validator_count = excluded.validator_count,
                eligible = excluded.eligible,
                voted_target = excluded.voted_target,
                voted_head = excluded.voted_head,
                voted_total = excluded.voted_total,
                block_count = excluded.block_count,
                orphaned_count = excluded.orphaned_count,
                attestation_count = excluded.attestation_count,
                deposit_count = excluded.deposit_count,
                exit_count = excluded.exit_count,
                withdraw_count = excluded.withdraw_count,
                withdraw_amount = excluded.withdraw_amount,
                attester_slashing_count = excluded.attester_slashing_count,
                proposer_slashing_count = excluded.proposer_slashing_count,
                bls_change_count = excluded.bls_change_count,
                eth_transaction_count = excluded.eth_transaction_count,
                sync_participation = excluded.sync_participation",
            &[
                &as_i64(row.epoch.as_u64())?,
                &as_i64(row.validator_count)?,
                &as_i64(row.eligible)?,
                &as_i64(row.voted_target)?,
                &as_i64(row.voted_head)?,
                &as_i64(row.voted_total)?,
                &(row.block_count as i32),
                &(row.orphaned_count as i32),
                &as_i64(row.attestation_count)?,
                &as_i64(row.deposit_count)?,
                &as_i64(row.exit_count)?,
                &as_i64(row.withdraw_count)?,
                &as_i64(row.withdraw_amount)?,
                &as_i64(row.attester_slashing_count)?,
                &as_i64(row.proposer_slashing_count)?,
                &as_i64(row.bls_change_count)?,
                &as_i64(row.eth_transaction_count)?,
                &row.sync_participation,
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn insert_block<'a>(tx: &'a Transaction<'a>, row: &BlockRow) -> Result<(), Error> {
        let eth_block_number = row.eth_block_number.map(as_i64).transpose()?;
        tx.execute(
            "INSERT INTO blocks (
                root, slot, parent_root, state_root, orphaned, proposer, graffiti,
                graffiti_text, attestation_count, deposit_count, exit_count, withdraw_count,
                withdraw_amount, attester_slashing_count, proposer_slashing_count,
                bls_change_count, eth_transaction_count, eth_block_number, eth_block_hash,
                sync_participation
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20)
            ON CONFLICT (root) DO UPDATE SET orphaned = excluded.orphaned",
            &[
                &row.root.as_bytes(),
                &as_i64(row.slot.as_u64())?,
                &row.parent_root.as_bytes(),
                &row.state_root.as_bytes(),
                &row.orphaned,
                &as_i64(row.proposer)?,
                &row.graffiti,
                &row.graffiti_text,
                &as_i64(row.attestation_count)?,
                &as_i64(row.deposit_count)?,
                &as_i64(row.exit_count)?,
                &as_i64(row.withdraw_count)?,
                &as_i64(row.withdraw_amount)?,
                &as_i64(row.attester_slashing_count)?,
                &as_i64(row.proposer_slashing_count)?,
                &as_i64(row.bls_change_count)?,
                &as_i64(row.eth_transaction_count)?,
                &eth_block_number,
                &row.eth_block_hash.as_ref().map(|hash| hash.as_bytes()),
                &row.sync_participation,
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn insert_orphaned_block<'a>(
        tx: &'a Transaction<'a>,
        row: &OrphanedBlockRow,
    ) -> Result<(), Error> {
        tx.execute(
            "INSERT INTO orphaned_blocks (root, slot, header_json, block_json)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (root) DO NOTHING",
            &[
                &row.root.as_bytes(),
                &as_i64(row.slot.as_u64())?,
                &row.header,
                &row.block,
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn insert_slot_assignment<'a>(
        tx: &'a Transaction<'a>,
        row: &SlotAssignmentRow,
    ) -> Result<(), Error> {
        tx.execute(
            "INSERT INTO slot_assignments (slot, proposer) VALUES ($1, $2)
             ON CONFLICT (slot) DO UPDATE SET proposer = excluded.proposer",
            &[&as_i64(row.slot.as_u64())?, &as_i64(row.proposer)?],
        )
        .await?;
        Ok(())
    }

    pub async fn insert_sync_assignment<'a>(
        tx: &'a Transaction<'a>,
        row: &SyncAssignmentRow,
    ) -> Result<(), Error> {
        tx.execute(
            "INSERT INTO sync_assignments (period, index, validator) VALUES ($1, $2, $3)
             ON CONFLICT (period, index) DO NOTHING",
            &[
                &as_i64(row.period)?,
                &(row.index as i32),
                &as_i64(row.validator)?,
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn insert_blob_assignment<'a>(
        tx: &'a Transaction<'a>,
        row: &BlobAssignmentRow,
    ) -> Result<(), Error> {
        tx.execute(
            "INSERT INTO blob_assignments (root, commitment, slot) VALUES ($1, $2, $3)
             ON CONFLICT (root, commitment) DO NOTHING",
            &[
                &row.root.as_bytes(),
                &row.commitment,
                &as_i64(row.slot.as_u64())?,
            ],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_conversion_bounds() {
        assert_eq!(as_i64(0).unwrap(), 0);
        assert_eq!(as_i64(i64::MAX as u64).unwrap(), i64::MAX);
        assert!(as_i64(i64::MAX as u64 + 1).is_err());
    }
}
