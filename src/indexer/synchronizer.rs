//! Historical catch-up between the persisted checkpoint and the live
//! processing frontier.
//!
//! The synchronizer fetches everything it needs per epoch straight from the
//! beacon node and never touches the live caches; the only shared state it
//! reads is the frontier, so it can suspend itself once it would overlap
//! live processing.

use crate::beacon_client::types::StateId;
use crate::beacon_client::BeaconNodeHttpClient;
use crate::database::Database;
use crate::indexer::block_info::BlockInfo;
use crate::indexer::epoch_stats::{EpochStats, ValidatorSet};
use crate::indexer::persistence::{build_epoch_data, persist_epoch_data, SyncState};
use crate::indexer::votes::{aggregate_epoch_votes, epoch_target};
use crate::indexer::{Error, IndexerState};
use crate::types::{ChainSpec, Epoch, Slot};
use log::{error, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

/// Consecutive failures on one epoch before the sync run gives up. A new
/// run is started by the next indexer restart.
const MAX_RETRY_COUNT: usize = 10;
const RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default)]
struct SyncRunState {
    running: bool,
    current_epoch: Epoch,
}

pub struct Synchronizer {
    client: Arc<BeaconNodeHttpClient>,
    database: Arc<AsyncMutex<Database>>,
    spec: Arc<ChainSpec>,
    indexer_state: Arc<RwLock<IndexerState>>,
    state: Mutex<SyncRunState>,
}

impl Synchronizer {
    pub(crate) fn new(
        client: Arc<BeaconNodeHttpClient>,
        database: Arc<AsyncMutex<Database>>,
        spec: Arc<ChainSpec>,
        indexer_state: Arc<RwLock<IndexerState>>,
    ) -> Self {
        Synchronizer {
            client,
            database,
            spec,
            indexer_state,
            state: Mutex::new(SyncRunState::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Whether a running sync has already progressed past `epoch`, in which
    /// case a new start would be redundant.
    pub fn is_epoch_ahead(&self, epoch: Epoch) -> bool {
        let state = self.state.lock();
        state.running && state.current_epoch > epoch
    }

    pub(crate) fn start_sync(self: &Arc<Self>, start_epoch: Epoch) {
        {
            let mut state = self.state.lock();
            if state.running {
                return;
            }
            state.running = true;
            state.current_epoch = start_epoch;
        }
        let synchronizer = self.clone();
        tokio::spawn(async move { synchronizer.run_sync().await });
    }

    pub(crate) fn stop(&self) {
        self.state.lock().running = false;
    }

    async fn run_sync(self: Arc<Self>) {
        let start_epoch = self.state.lock().current_epoch;
        info!("Synchronization started from epoch {}", start_epoch);

        let mut retry_count = 0;
        loop {
            let epoch = {
                let state = self.state.lock();
                if !state.running {
                    info!("Synchronization stopped");
                    return;
                }
                state.current_epoch
            };

            // Suspend once the cursor reaches the live frontier.
            let last_processed = self.indexer_state.read().await.last_processed_epoch;
            match last_processed {
                Some(last_processed) if epoch < last_processed => {}
                _ => {
                    info!("Synchronization caught up at epoch {}", epoch);
                    break;
                }
            }

            match self.sync_epoch(epoch).await {
                Ok(()) => {
                    retry_count = 0;
                    self.state.lock().current_epoch = epoch + 1;
                }
                Err(e) => {
                    retry_count += 1;
                    error!(
                        "Error synchronizing epoch {} (attempt {}): {}",
                        epoch, retry_count, e
                    );
                    if retry_count >= MAX_RETRY_COUNT {
                        error!("Aborting synchronization at epoch {}", epoch);
                        break;
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
        self.state.lock().running = false;
    }

    async fn sync_epoch(&self, epoch: Epoch) -> Result<(), Error> {
        info!("Synchronizing epoch {}", epoch);

        let assignments = self.client.get_epoch_assignments(epoch, None).await?;

        let mut blocks: HashMap<Slot, Vec<Arc<BlockInfo>>> = HashMap::new();
        for slot in epoch.slot_iter(self.spec.slots_per_epoch) {
            let header = match self.client.get_block_header_by_slot(slot).await? {
                Some(header) => header,
                // A missed slot, nothing to fetch.
                None => continue,
            };
            let block = self.client.get_block_body_by_root(header.root).await?;
            blocks.insert(
                slot,
                vec![Arc::new(BlockInfo::new(header.root, header.header, block))],
            );
        }

        let validators = self
            .client
            .get_state_validators(StateId::Root(assignments.dependent_state_root))
            .await?;

        let (stats, _) = EpochStats::new(assignments.dependent_root, None);
        stats.publish_assignments(Some(assignments));
        stats
            .validators()
            .fill(ValidatorSet::from_validator_data(&validators));

        // Unlike the live path an epoch without any canonical block is final
        // here, so it is persisted empty instead of retried.
        let votes = match epoch_target(&blocks, &self.spec, epoch) {
            Some(target) => aggregate_epoch_votes(
                &blocks, &self.spec, epoch, &stats, None, target, None, true,
            ),
            None => {
                info!("Epoch {} has no canonical block", epoch);
                Default::default()
            }
        };
        let data = build_epoch_data(&self.spec, epoch, &blocks, &stats, &votes)?;

        let checkpoint = SyncState {
            epoch: epoch.as_u64(),
        };
        let mut database = self.database.lock().await;
        persist_epoch_data(&mut database, &data, Some(checkpoint)).await?;

        info!(
            "Synchronized epoch {} ({} blocks, {} votes)",
            epoch,
            data.epoch.block_count,
            votes.current_epoch.total_vote_amount
        );
        Ok(())
    }
}
