//! The indexer engine: an in-memory window of recent blocks with reorg
//! tracking, fed by the beacon node's event stream and a fallback head
//! poll, plus the per-epoch aggregation pipeline behind it.
//!
//! The ingestion loop is the sole writer of both caches. Readers (frontend
//! accessors, the epoch aggregator) take the shared side of one
//! reader/writer latch covering both maps.

pub mod block_info;
pub mod epoch_stats;
mod error;
mod persistence;
mod synchronizer;
mod votes;

pub use block_info::BlockInfo;
pub use epoch_stats::{EpochStats, EpochValidators, ValidatorSet};
pub use error::Error;
pub use persistence::SyncState;
pub use synchronizer::Synchronizer;
pub use votes::{EpochVotes, VoteAmounts};

use crate::beacon_client::types::{BlockHeaderData, SignedBeaconBlock, StateId};
use crate::beacon_client::{BeaconNodeHttpClient, EpochAssignments, Error as ApiError};
use crate::config::IndexerConfig;
use crate::database::{BlockRow, Database, EpochRow, SYNC_STATE_KEY};
use crate::types::{ChainSpec, Epoch, Hash256, Slot};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

/// Pause before the event stream is re-established after a drop.
const STREAM_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Fallback head poll covering missed events.
const HEAD_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Attempts for the duty-assignment fetch of a freshly seen epoch.
const ASSIGNMENT_FETCH_RETRIES: usize = 3;
const ASSIGNMENT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Default)]
struct ControlState {
    running: bool,
}

/// Everything behind the shared cache latch.
pub(crate) struct IndexerState {
    pub(crate) cached_blocks: HashMap<Slot, Vec<Arc<BlockInfo>>>,
    pub(crate) epoch_stats: HashMap<Epoch, Arc<EpochStats>>,
    pub(crate) lowest_cached_slot: Option<Slot>,
    pub(crate) last_head_slot: Slot,
    pub(crate) last_head_root: Option<Hash256>,
    /// Epochs at or below this are persisted and immutable; `None` until
    /// the first epoch settles.
    pub(crate) last_processed_epoch: Option<Epoch>,
    /// Raised when a reorg walked out of the in-memory window.
    pub(crate) resync_needed: bool,
}

impl IndexerState {
    fn new() -> Self {
        IndexerState {
            cached_blocks: HashMap::new(),
            epoch_stats: HashMap::new(),
            lowest_cached_slot: None,
            last_head_slot: Slot::new(0),
            last_head_root: None,
            last_processed_epoch: None,
            resync_needed: false,
        }
    }
}

/// Delete all slots below `threshold` and advance the watermark.
pub(crate) fn drop_below(state: &mut IndexerState, threshold: Slot) {
    state.cached_blocks.retain(|slot, _| {
        if *slot < threshold {
            debug!("Dropped cached blocks at slot {}", slot);
            false
        } else {
            true
        }
    });
    if state.lowest_cached_slot.map_or(false, |lowest| lowest < threshold) {
        state.lowest_cached_slot = Some(threshold);
    }
}

pub struct Indexer {
    client: Arc<BeaconNodeHttpClient>,
    database: Option<Arc<AsyncMutex<Database>>>,
    spec: Arc<ChainSpec>,
    write_db: bool,
    in_memory_epochs: u16,
    epoch_processing_delay: u16,
    control: Mutex<ControlState>,
    run_lock: AsyncMutex<()>,
    state: Arc<RwLock<IndexerState>>,
    synchronizer: Mutex<Option<Arc<Synchronizer>>>,
}

impl Indexer {
    pub fn new(
        client: Arc<BeaconNodeHttpClient>,
        database: Option<Arc<AsyncMutex<Database>>>,
        spec: Arc<ChainSpec>,
        config: &IndexerConfig,
    ) -> Self {
        let write_db = config.write_db && database.is_some();
        Indexer {
            client,
            database,
            spec,
            write_db,
            in_memory_epochs: config.in_memory_epochs.max(1),
            epoch_processing_delay: config.epoch_processing_delay,
            control: Mutex::new(ControlState::default()),
            run_lock: AsyncMutex::new(()),
            state: Arc::new(RwLock::new(IndexerState::new())),
            synchronizer: Mutex::new(None),
        }
    }

    /// Spawn the ingestion loop. Fails if it is already running.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        let mut control = self.control.lock();
        if control.running {
            return Err(Error::AlreadyRunning);
        }
        control.running = true;
        drop(control);

        let indexer = self.clone();
        tokio::spawn(async move { indexer.run_indexer().await });
        Ok(())
    }

    /// Request a cooperative stop after the current event.
    pub fn stop(&self) {
        self.control.lock().running = false;
        if let Some(synchronizer) = self.synchronizer.lock().as_ref() {
            synchronizer.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.control.lock().running
    }

    pub async fn get_lowest_cached_slot(&self) -> Option<Slot> {
        self.state.read().await.lowest_cached_slot
    }

    pub async fn get_head_slot(&self) -> Slot {
        self.state.read().await.last_head_slot
    }

    /// All observed variants at `slot`, as a defensive copy of the list.
    pub async fn get_cached_blocks(&self, slot: Slot) -> Vec<Arc<BlockInfo>> {
        let state = self.state.read().await;
        if state.lowest_cached_slot.map_or(true, |lowest| slot < lowest) {
            return Vec::new();
        }
        state.cached_blocks.get(&slot).cloned().unwrap_or_default()
    }

    pub async fn get_cached_epoch_stats(&self, epoch: Epoch) -> Option<Arc<EpochStats>> {
        self.state.read().await.epoch_stats.get(&epoch).cloned()
    }

    /// Aggregate a not-yet-persisted epoch straight from the cache.
    pub async fn build_live_epoch(&self, epoch: Epoch) -> Option<EpochRow> {
        let state = self.state.read().await;
        let stats = state.epoch_stats.get(&epoch)?.clone();
        let target = votes::epoch_target(&state.cached_blocks, &self.spec, epoch)?;
        let next_target = votes::epoch_target(&state.cached_blocks, &self.spec, epoch + 1);
        let next_stats = state.epoch_stats.get(&(epoch + 1)).cloned();
        let votes = votes::aggregate_epoch_votes(
            &state.cached_blocks,
            &self.spec,
            epoch,
            &stats,
            next_stats.as_deref(),
            target,
            next_target,
            false,
        );
        persistence::build_epoch_data(&self.spec, epoch, &state.cached_blocks, &stats, &votes)
            .ok()
            .map(|data| data.epoch)
    }

    pub async fn build_live_block(&self, block: &BlockInfo) -> BlockRow {
        let epoch = self.spec.epoch_of_slot(block.slot());
        let assignments = self
            .state
            .read()
            .await
            .epoch_stats
            .get(&epoch)
            .and_then(|stats| stats.assignments());
        persistence::build_db_block(block, assignments.as_deref())
    }

    async fn run_indexer(self: Arc<Self>) {
        let _run_guard = self.run_lock.lock().await;

        // Start the window just before `current - in_memory_epochs` and the
        // frontier at `current - processing_delay`; everything older is the
        // synchronizer's territory.
        {
            let mut state = self.state.write().await;
            if let Some(current_epoch) = self.spec.current_epoch() {
                state.last_head_slot = bootstrap_head_slot(
                    current_epoch,
                    self.in_memory_epochs,
                    self.spec.slots_per_epoch,
                );
                if current_epoch.as_u64() > self.epoch_processing_delay as u64 {
                    state.last_processed_epoch =
                        Some(current_epoch - self.epoch_processing_delay as u64);
                }
            }
        }

        if let Err(e) = self.poll_head_block().await {
            error!("Error while polling latest head: {}", e);
        }

        let mut stream = self.client.new_block_stream();
        stream.start();

        if self.write_db {
            match self.read_sync_state().await {
                Ok(sync_state) => {
                    let last_processed = self.state.read().await.last_processed_epoch;
                    if let Some(last_processed) = last_processed {
                        if Epoch::new(sync_state.epoch) < last_processed {
                            self.start_synchronization(Epoch::new(sync_state.epoch));
                        }
                    }
                }
                Err(e) => error!("Error reading persisted sync state: {}", e),
            }
        }

        loop {
            if !self.is_running() {
                break;
            }

            tokio::select! {
                Some(head) = stream.head_rx.recv() => {
                    info!(
                        "RPC Event: Head {} (root: {:?}, dep: {:?})",
                        head.slot, head.block, head.current_duty_dependent_root
                    );
                    self.process_head_epoch(
                        self.spec.epoch_of_slot(head.slot),
                        Some(head.current_duty_dependent_root),
                    )
                    .await;
                }
                Some(block) = stream.block_rx.recv() => {
                    info!("RPC Event: Block {} (root: {:?})", block.slot, block.block);
                    if let Err(e) = self.poll_streamed_block(block.block).await {
                        error!("Error while fetching streamed block: {}", e);
                    }
                }
                Some(()) = stream.closed_rx.recv() => {
                    warn!(
                        "Lost connection to beacon event stream, reconnecting in {:?}",
                        STREAM_RECONNECT_DELAY
                    );
                    tokio::time::sleep(STREAM_RECONNECT_DELAY).await;
                    stream.start();
                    // Best-effort snapshot to close any gap spanning the outage.
                    if let Err(e) = self.poll_head_block().await {
                        error!("Error while polling latest head: {}", e);
                    }
                }
                _ = tokio::time::sleep(HEAD_POLL_INTERVAL) => {
                    if let Err(e) = self.poll_head_block().await {
                        error!("Error while polling latest head: {}", e);
                    }
                }
            }

            self.process_indexing().await;
            self.process_cache_cleanup().await;

            if self.state.read().await.resync_needed {
                if let Err(e) = self.resync().await {
                    error!("Error during resync: {}", e);
                }
            }
        }

        stream.close();
        info!("Indexer loop stopped");
    }

    async fn read_sync_state(&self) -> Result<SyncState, Error> {
        let database = self.database.as_ref().ok_or(Error::DatabaseNotConfigured)?;
        let sync_state = database
            .lock()
            .await
            .get_explorer_state::<SyncState>(SYNC_STATE_KEY)
            .await?;
        Ok(sync_state.unwrap_or_default())
    }

    fn start_synchronization(&self, start_epoch: Epoch) {
        let database = match &self.database {
            Some(database) => database.clone(),
            None => return,
        };
        let mut synchronizer = self.synchronizer.lock();
        let synchronizer = synchronizer.get_or_insert_with(|| {
            Arc::new(Synchronizer::new(
                self.client.clone(),
                database,
                self.spec.clone(),
                self.state.clone(),
            ))
        });
        if !synchronizer.is_epoch_ahead(start_epoch) {
            synchronizer.start_sync(start_epoch);
        }
    }

    /// Fetch the current head and ingest it, backfilling any slots between
    /// the cached head and the new one.
    async fn poll_head_block(self: &Arc<Self>) -> Result<(), Error> {
        let header = self.client.get_latest_block_header().await?;
        if self.state.read().await.last_head_root == Some(header.root) {
            // Chain head did not proceed, possibly a missed slot.
            return Ok(());
        }
        let block = self.client.get_block_body_by_root(header.root).await?;

        let head_slot = header.header.message.slot;
        let last_head_slot = self.state.read().await.last_head_slot;
        if head_slot > last_head_slot + 1 {
            let mut backfill_slot = last_head_slot + 1;
            while backfill_slot < head_slot {
                if let Err(e) = self.poll_backfill_block(backfill_slot).await {
                    error!("Error backfilling slot {}: {}", backfill_slot, e);
                }
                backfill_slot += 1;
            }
        }

        let epoch = self.spec.epoch_of_slot(head_slot);
        info!("Process latest slot {}/{}: {:?}", epoch, head_slot, header.root);
        self.process_head_epoch(epoch, None).await;
        self.process_head_block(head_slot, header, block).await;
        Ok(())
    }

    /// Fetch one slot of a gap. A 404 is a legitimately missed slot.
    async fn poll_backfill_block(
        self: &Arc<Self>,
        slot: Slot,
    ) -> Result<Option<Arc<BlockInfo>>, Error> {
        let epoch = self.spec.epoch_of_slot(slot);
        let header = match self.client.get_block_header_by_slot(slot).await? {
            Some(header) => header,
            None => {
                info!("Process missed slot {}/{}", epoch, slot);
                return Ok(None);
            }
        };
        let block = self.client.get_block_body_by_root(header.root).await?;

        info!("Process polled slot {}/{}: {:?}", epoch, slot, header.root);
        self.process_head_epoch(epoch, None).await;
        Ok(self.process_head_block(slot, header, block).await)
    }

    /// Ingest a block announced on the event stream, closing any gap first.
    async fn poll_streamed_block(
        self: &Arc<Self>,
        root: Hash256,
    ) -> Result<Option<Arc<BlockInfo>>, Error> {
        let header = self.client.get_block_header_by_root(root).await?;
        let block = self.client.get_block_body_by_root(header.root).await?;

        let slot = header.header.message.slot;
        let last_head_slot = self.state.read().await.last_head_slot;
        if slot > last_head_slot + 1 {
            let mut backfill_slot = last_head_slot + 1;
            while backfill_slot < slot {
                if let Err(e) = self.poll_backfill_block(backfill_slot).await {
                    error!("Error backfilling slot {}: {}", backfill_slot, e);
                }
                backfill_slot += 1;
            }
        }

        info!(
            "Process stream slot {}/{}: {:?}",
            self.spec.epoch_of_slot(slot),
            slot,
            header.root
        );
        Ok(self.process_head_block(slot, header, block).await)
    }

    /// Insert a new head block into the slot cache and reconcile the
    /// canonical chain. Returns `None` for a duplicate.
    pub(crate) async fn process_head_block(
        &self,
        slot: Slot,
        header: BlockHeaderData,
        block: SignedBeaconBlock,
    ) -> Option<Arc<BlockInfo>> {
        let mut state = self.state.write().await;

        let root = header.root;
        let parent_root = header.header.message.parent_root;
        let block_info = Arc::new(BlockInfo::new(root, header.header, block));

        match state.cached_blocks.get_mut(&slot) {
            Some(blocks) => {
                if blocks.iter().any(|block| block.root() == root) {
                    info!("Skip duplicate block {} ({:?})", slot, root);
                    return None;
                }
                blocks.push(block_info.clone());
            }
            None => {
                state.cached_blocks.insert(slot, vec![block_info.clone()]);
            }
        }

        if state.lowest_cached_slot.map_or(true, |lowest| slot < lowest) {
            state.lowest_cached_slot = Some(slot);
        }

        // A non-linear successor means at least one cached block is no
        // longer on the canonical chain.
        if let Some(last_head_root) = state.last_head_root {
            if last_head_root != parent_root {
                resolve_reorg(&mut state, slot, root, parent_root);
            }
        }

        state.last_head_slot = slot;
        state.last_head_root = Some(root);
        Some(block_info)
    }

    /// Make sure `EpochStats` exist for `epoch` under the given dependent
    /// root, fetching assignments and kicking off the validator-set load
    /// for a fresh epoch.
    pub(crate) async fn process_head_epoch(
        self: &Arc<Self>,
        epoch: Epoch,
        dependent_root: Option<Hash256>,
    ) {
        let mut assignments: Option<Arc<EpochAssignments>> = None;
        let dependent_root = match dependent_root {
            Some(root) => root,
            None => {
                // Without a head event the dependent root is learned from
                // the proposer duties themselves.
                if self.state.read().await.epoch_stats.contains_key(&epoch) {
                    return;
                }
                match self.fetch_epoch_assignments(epoch, None).await {
                    Some(fetched) => {
                        let root = fetched.dependent_root;
                        assignments = Some(fetched);
                        root
                    }
                    None => {
                        error!("Error fetching epoch {} duties", epoch);
                        return;
                    }
                }
            }
        };

        let (stats, fresh_validators) = match self.new_epoch_stats(epoch, dependent_root).await {
            Some(allocated) => allocated,
            None => return,
        };

        if assignments.is_none() {
            assignments = self
                .fetch_epoch_assignments(epoch, Some(dependent_root))
                .await;
        }
        // Releases the assignments latch even when the fetch failed
        // terminally, so waiters proceed with what is available.
        stats.publish_assignments(assignments);

        if fresh_validators {
            let indexer = self.clone();
            let stats = stats.clone();
            tokio::spawn(async move { indexer.load_epoch_validators(epoch, stats).await });
        }
    }

    async fn fetch_epoch_assignments(
        &self,
        epoch: Epoch,
        dependent_root: Option<Hash256>,
    ) -> Option<Arc<EpochAssignments>> {
        for attempt in 1..=ASSIGNMENT_FETCH_RETRIES {
            match self
                .client
                .get_epoch_assignments(epoch, dependent_root)
                .await
            {
                Ok(assignments) => return Some(assignments),
                Err(ApiError::ProposerDutiesNotApplicable(epoch)) => {
                    warn!("Proposer duties not available for epoch {}", epoch);
                    return None;
                }
                Err(e) => {
                    error!(
                        "Error fetching epoch {} duties (attempt {}): {}",
                        epoch, attempt, e
                    );
                    if attempt < ASSIGNMENT_FETCH_RETRIES {
                        tokio::time::sleep(ASSIGNMENT_RETRY_DELAY).await;
                    }
                }
            }
        }
        None
    }

    /// Allocate `EpochStats` under the cache latch. Returns `None` if the
    /// epoch is already processed or the same dependent root is cached;
    /// the flag reports whether a validator fetch still has to start.
    async fn new_epoch_stats(
        &self,
        epoch: Epoch,
        dependent_root: Hash256,
    ) -> Option<(Arc<EpochStats>, bool)> {
        let mut state = self.state.write().await;

        if let Some(last_processed) = state.last_processed_epoch {
            if epoch < last_processed {
                return None;
            }
        }
        let old_stats = state.epoch_stats.get(&epoch).cloned();
        if let Some(old_stats) = &old_stats {
            if old_stats.dependent_root() == dependent_root {
                return None;
            }
        }
        info!(
            "Epoch {} head, fetching assignments (dependent root: {:?})",
            epoch, dependent_root
        );

        // A superseded dependent root keeps the validator snapshot: the
        // validator set is state-dependent, but reuse is sound as long as
        // only one fetch destination exists per epoch.
        let prior_validators = old_stats.map(|old| old.validators().clone());
        let (stats, fresh_validators) = EpochStats::new(dependent_root, prior_validators);
        let stats = Arc::new(stats);
        state.epoch_stats.insert(epoch, stats.clone());
        Some((stats, fresh_validators))
    }

    /// Background fetch of an epoch's validator set. The readiness latch is
    /// released on every path.
    async fn load_epoch_validators(self: Arc<Self>, epoch: Epoch, stats: Arc<EpochStats>) {
        let state_root = match stats.wait_assignments().await {
            Some(assignments) => assignments.dependent_state_root,
            None => {
                stats.validators().release();
                return;
            }
        };

        info!(
            "Epoch {} head, loading validator set (state: {:?})",
            epoch, state_root
        );
        match self
            .client
            .get_state_validators(StateId::Root(state_root))
            .await
        {
            Ok(validators) => stats
                .validators()
                .fill(ValidatorSet::from_validator_data(&validators)),
            Err(e) => {
                error!("Error fetching epoch {} validators: {}", epoch, e);
                stats.validators().release();
            }
        }
    }

    /// Advance the processing frontier through every epoch old enough to
    /// have settled. An epoch only advances the frontier on success; a
    /// failed epoch is retried on the next loop iteration.
    pub(crate) async fn process_indexing(&self) {
        let (current_epoch, last_processed) = {
            let state = self.state.read().await;
            (
                self.spec.epoch_of_slot(state.last_head_slot),
                state.last_processed_epoch,
            )
        };
        let process_until = current_epoch.saturating_sub(self.epoch_processing_delay as u64);

        let mut epoch = match last_processed {
            Some(last_processed) => {
                if last_processed >= process_until {
                    return;
                }
                last_processed + 1
            }
            None => Epoch::new(0),
        };

        while epoch <= process_until {
            match self.process_epoch(epoch).await {
                Ok(()) => {
                    self.state.write().await.last_processed_epoch = Some(epoch);
                    epoch += 1;
                }
                Err(e) => {
                    error!("Error processing epoch {}: {}", epoch, e);
                    break;
                }
            }
        }
    }

    /// Drop cache entries that fell out of the in-memory window, handing
    /// evicted assignments back to the client cache.
    pub(crate) async fn process_cache_cleanup(&self) {
        let current_epoch = {
            let state = self.state.read().await;
            self.spec.epoch_of_slot(state.last_head_slot)
        };
        if current_epoch.as_u64() < self.in_memory_epochs as u64 {
            return;
        }
        let clean_epoch = current_epoch - self.in_memory_epochs as u64;
        let threshold = (clean_epoch + 1).start_slot(self.spec.slots_per_epoch);

        {
            let state = self.state.read().await;
            let slots_clean = state
                .lowest_cached_slot
                .map_or(true, |lowest| lowest >= threshold);
            let stats_clean = !state.epoch_stats.keys().any(|epoch| *epoch <= clean_epoch);
            if slots_clean && stats_clean {
                return;
            }
        }

        let mut state = self.state.write().await;
        drop_below(&mut state, threshold);

        let evict: Vec<Epoch> = state
            .epoch_stats
            .keys()
            .filter(|epoch| **epoch <= clean_epoch)
            .copied()
            .collect();
        for epoch in evict {
            if let Some(stats) = state.epoch_stats.remove(&epoch) {
                debug!("Dropped cached epoch stats for epoch {}", epoch);
                if let Some(assignments) = stats.assignments() {
                    self.client.add_cached_epoch_assignments(epoch, assignments);
                }
            }
        }
    }

    /// Aggregate one settled epoch and persist it.
    pub(crate) async fn process_epoch(&self, epoch: Epoch) -> Result<(), Error> {
        info!("Process epoch {}", epoch);
        let stats = self
            .state
            .read()
            .await
            .epoch_stats
            .get(&epoch)
            .cloned()
            .ok_or(Error::NoEpochStats(epoch))?;

        // Wait for the validator snapshot without holding the cache latch;
        // the latch is released on failed fetches too.
        stats.validators().wait_ready().await;

        let (data, votes) = {
            let state = self.state.read().await;
            let target = match votes::epoch_target(&state.cached_blocks, &self.spec, epoch) {
                Some(target) => target,
                None => {
                    error!("Error fetching epoch {} target block (no block found)", epoch);
                    return Err(Error::NoCanonicalBlock(epoch));
                }
            };
            let next_target = votes::epoch_target(&state.cached_blocks, &self.spec, epoch + 1);
            let next_stats = state.epoch_stats.get(&(epoch + 1)).cloned();
            let votes = votes::aggregate_epoch_votes(
                &state.cached_blocks,
                &self.spec,
                epoch,
                &stats,
                next_stats.as_deref(),
                target,
                next_target,
                false,
            );
            let data = persistence::build_epoch_data(
                &self.spec,
                epoch,
                &state.cached_blocks,
                &stats,
                &votes,
            )?;
            (data, votes)
        };

        if self.write_db {
            let database = self.database.as_ref().ok_or(Error::DatabaseNotConfigured)?;
            // The checkpoint only advances here while the synchronizer is
            // idle; a running sync owns it.
            let checkpoint = match self.synchronizer.lock().as_ref() {
                Some(synchronizer) if synchronizer.is_running() => None,
                _ => Some(SyncState {
                    epoch: epoch.as_u64(),
                }),
            };
            let mut database = database.lock().await;
            persistence::persist_epoch_data(&mut database, &data, checkpoint)
                .await
                .map_err(|e| {
                    error!("Error persisting epoch {} data: {}", epoch, e);
                    Error::Database(e)
                })?;
        }

        let validator_count = stats.validator_set().map_or(0, |set| set.validator_count);
        info!(
            "Epoch {} stats: {} validators, {} blocks, {} orphaned",
            epoch, validator_count, data.epoch.block_count, data.epoch.orphaned_count
        );
        info!(
            "Epoch {} votes: target {} + {} = {}",
            epoch,
            votes.current_epoch.target_vote_amount,
            votes.next_epoch.target_vote_amount,
            data.epoch.voted_target
        );
        info!(
            "Epoch {} votes: head {} + {} = {}",
            epoch,
            votes.current_epoch.head_vote_amount,
            votes.next_epoch.head_vote_amount,
            data.epoch.voted_head
        );
        info!(
            "Epoch {} votes: total {} + {} = {}",
            epoch,
            votes.current_epoch.total_vote_amount,
            votes.next_epoch.total_vote_amount,
            data.epoch.voted_total
        );
        Ok(())
    }

    /// Discard all unfinalized in-memory state after an out-of-window reorg
    /// and restart ingestion from the current head. The persisted
    /// checkpoint is untouched, so the synchronizer backfills the hole.
    async fn resync(self: &Arc<Self>) -> Result<(), Error> {
        warn!("Large chain reorg detected, discarding unfinalized in-memory state");
        {
            let mut state = self.state.write().await;
            state.cached_blocks.clear();
            state.epoch_stats.clear();
            state.lowest_cached_slot = None;
            state.last_head_root = None;
            state.resync_needed = false;
            if let Some(current_epoch) = self.spec.current_epoch() {
                state.last_head_slot = bootstrap_head_slot(
                    current_epoch,
                    self.in_memory_epochs,
                    self.spec.slots_per_epoch,
                );
            }
        }
        self.poll_head_block().await
    }
}

/// The slot just before the start of the in-memory window at `current`.
fn bootstrap_head_slot(current_epoch: Epoch, in_memory_epochs: u16, slots_per_epoch: u64) -> Slot {
    if current_epoch.as_u64() > in_memory_epochs as u64 {
        Slot::new(
            (current_epoch.as_u64() - in_memory_epochs as u64 + 1) * slots_per_epoch - 1,
        )
    } else {
        Slot::new(0)
    }
}

/// Walk back from the new head and reconcile `orphaned` flags against the
/// chain it extends. Flags `resync_needed` when the fork base lies outside
/// the in-memory window.
fn resolve_reorg(state: &mut IndexerState, slot: Slot, new_root: Hash256, parent_root: Hash256) {
    let lowest = state.lowest_cached_slot.unwrap_or(slot);

    // Find the common ancestor, orphaning everything newer that is not on
    // the new chain.
    let mut reorg_base: Option<Arc<BlockInfo>> = None;
    let mut reorg_base_slot = slot;
    let mut sidx = slot;
    loop {
        if let Some(blocks) = state.cached_blocks.get(&sidx) {
            for block in blocks {
                if block.root() == new_root {
                    continue;
                }
                if block.root() == parent_root {
                    reorg_base = Some(block.clone());
                    reorg_base_slot = sidx;
                } else {
                    if !block.is_orphaned() {
                        info!(
                            "Chain reorg: mark {} as orphaned ({:?})",
                            sidx,
                            block.root()
                        );
                    }
                    block.set_orphaned(true);
                }
            }
            if reorg_base.is_some() {
                break;
            }
        }
        if sidx == lowest {
            break;
        }
        sidx -= 1;
    }

    let mut resync_needed = false;
    match reorg_base {
        None => resync_needed = true,
        Some(base) => {
            if base.is_orphaned() {
                // The new head extends a branch that previously lost: walk
                // its ancestry, re-canonicalizing the chain and orphaning
                // the competing blocks, until an ancestor that stayed
                // canonical bounds the reorg.
                base.set_orphaned(false);
                info!(
                    "Chain reorg: mark {} as canonical ({:?})",
                    reorg_base_slot,
                    base.root()
                );

                let mut cursor = base;
                let mut found_boundary = false;
                let mut sidx = reorg_base_slot;
                while !found_boundary && sidx > lowest {
                    sidx -= 1;
                    let parent = cursor.parent_root();
                    if let Some(blocks) = state.cached_blocks.get(&sidx) {
                        let mut next_cursor = None;
                        for block in blocks {
                            if block.root() == parent {
                                if block.is_orphaned() {
                                    block.set_orphaned(false);
                                    info!(
                                        "Chain reorg: mark {} as canonical ({:?})",
                                        sidx,
                                        block.root()
                                    );
                                } else {
                                    found_boundary = true;
                                }
                                next_cursor = Some(block.clone());
                            } else {
                                if !block.is_orphaned() {
                                    info!(
                                        "Chain reorg: mark {} as orphaned ({:?})",
                                        sidx,
                                        block.root()
                                    );
                                }
                                block.set_orphaned(true);
                            }
                        }
                        if let Some(next_cursor) = next_cursor {
                            cursor = next_cursor;
                        }
                    }
                }
                if !found_boundary {
                    resync_needed = true;
                }
            }
        }
    }

    if resync_needed {
        error!("Large chain reorg detected, no fork base inside the in-memory window");
        state.resync_needed = true;
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::beacon_client::types::{
        Attestation, AttestationData, BeaconBlock, BeaconBlockBody, BeaconBlockHeader,
        BlockHeaderData, Checkpoint, Eth1Data, SignedBeaconBlock, SignedBeaconBlockHeader,
    };
    use crate::beacon_client::Timeouts;
    use crate::config::IndexerConfig;

    pub(crate) fn root_hash(seed: u64) -> Hash256 {
        Hash256::from_low_u64_be(seed)
    }

    pub(crate) fn make_body(attestations: Vec<Attestation>) -> BeaconBlockBody {
        BeaconBlockBody {
            randao_reveal: "0x00".to_string(),
            eth1_data: Eth1Data {
                deposit_root: Hash256::zero(),
                deposit_count: 0,
                block_hash: Hash256::zero(),
            },
            graffiti: Hash256::zero(),
            proposer_slashings: vec![],
            attester_slashings: vec![],
            attestations,
            deposits: vec![],
            voluntary_exits: vec![],
            sync_aggregate: None,
            execution_payload: None,
            bls_to_execution_changes: None,
            blob_kzg_commitments: None,
        }
    }

    pub(crate) fn make_block(
        slot: Slot,
        root_seed: u64,
        parent_seed: u64,
        attestations: Vec<Attestation>,
    ) -> (BlockHeaderData, SignedBeaconBlock) {
        let parent_root = root_hash(parent_seed);
        let body = make_body(attestations);
        let message = BeaconBlock {
            slot,
            proposer_index: root_seed % 64,
            parent_root,
            state_root: root_hash(root_seed + 1_000_000),
            body,
        };
        let header = BlockHeaderData {
            root: root_hash(root_seed),
            canonical: true,
            header: SignedBeaconBlockHeader {
                message: BeaconBlockHeader {
                    slot,
                    proposer_index: message.proposer_index,
                    parent_root,
                    state_root: message.state_root,
                    body_root: root_hash(root_seed + 2_000_000),
                },
                signature: "0x00".to_string(),
            },
        };
        let block = SignedBeaconBlock {
            message,
            signature: "0x00".to_string(),
        };
        (header, block)
    }

    pub(crate) fn block_with_attestations(
        slot: Slot,
        root_seed: u64,
        parent_seed: u64,
        attestations: Vec<Attestation>,
    ) -> Arc<BlockInfo> {
        let (header, block) = make_block(slot, root_seed, parent_seed, attestations);
        Arc::new(BlockInfo::new(header.root, header.header, block))
    }

    /// An attestation with the given committee positions set in its
    /// aggregation bits.
    pub(crate) fn make_attestation(
        slot: Slot,
        index: u64,
        target_epoch: Epoch,
        target_root: Hash256,
        beacon_block_root: Hash256,
        positions: &[usize],
    ) -> Attestation {
        let bytes = positions.iter().max().map_or(1, |max| max / 8 + 1);
        let mut aggregation_bits = vec![0u8; bytes];
        for position in positions {
            aggregation_bits[position / 8] |= 1 << (position % 8);
        }
        Attestation {
            aggregation_bits,
            data: AttestationData {
                slot,
                index,
                beacon_block_root,
                source: Checkpoint {
                    epoch: target_epoch.saturating_sub(1u64),
                    root: Hash256::zero(),
                },
                target: Checkpoint {
                    epoch: target_epoch,
                    root: target_root,
                },
            },
            signature: "0x00".to_string(),
        }
    }

    pub(crate) fn test_indexer(spec: ChainSpec, config: IndexerConfig) -> Arc<Indexer> {
        let spec = Arc::new(spec);
        let client = Arc::new(BeaconNodeHttpClient::new(
            "http://localhost:0".to_string(),
            spec.clone(),
            Timeouts::set_all(Duration::from_secs(1)),
        ));
        Arc::new(Indexer::new(client, None, spec, &config))
    }

    /// Insert a linear chain of blocks covering `slots`, skipping any slot
    /// in `missed`. Returns the seed of the last inserted block.
    pub(crate) async fn insert_chain(
        indexer: &Arc<Indexer>,
        slots: std::ops::RangeInclusive<u64>,
        missed: &[u64],
    ) -> u64 {
        let mut parent_seed = 99;
        let mut last_seed = 0;
        for slot in slots {
            if missed.contains(&slot) {
                continue;
            }
            let seed = 100 + slot;
            let (header, block) = make_block(Slot::new(slot), seed, parent_seed, vec![]);
            indexer
                .process_head_block(Slot::new(slot), header, block)
                .await
                .expect("insert should not be a duplicate");
            parent_seed = seed;
            last_seed = seed;
        }
        last_seed
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;
    use crate::beacon_client::types::ValidatorStatus;
    use crate::config::IndexerConfig;
    use crate::indexer::epoch_stats::ValidatorSet;

    fn test_spec() -> ChainSpec {
        ChainSpec {
            slots_per_epoch: 4,
            ..ChainSpec::default()
        }
    }

    fn no_delay_config() -> IndexerConfig {
        IndexerConfig {
            in_memory_epochs: 3,
            epoch_processing_delay: 0,
            write_db: false,
        }
    }

    /// Follow parent pointers from the cached head down to
    /// `lowest_cached_slot` and assert exactly one canonical block per
    /// populated slot on the walk.
    async fn assert_canonical_chain(indexer: &Arc<Indexer>) {
        let state = indexer.state.read().await;
        let lowest = match state.lowest_cached_slot {
            Some(lowest) => lowest,
            None => return,
        };
        let mut expected_root = state.last_head_root.expect("head root must be set");

        let mut slot = state.last_head_slot;
        loop {
            if let Some(blocks) = state.cached_blocks.get(&slot) {
                let canonical: Vec<_> = blocks
                    .iter()
                    .filter(|block| !block.is_orphaned())
                    .collect();
                if let Some(block) = canonical.first() {
                    if block.root() == expected_root {
                        assert_eq!(
                            canonical.len(),
                            1,
                            "slot {} has {} canonical blocks",
                            slot,
                            canonical.len()
                        );
                        expected_root = block.parent_root();
                    }
                }
            }
            if slot == lowest {
                break;
            }
            slot -= 1;
        }
    }

    #[tokio::test]
    async fn linear_chain_has_one_canonical_block_per_slot() {
        let indexer = test_indexer(test_spec(), no_delay_config());
        insert_chain(&indexer, 0..=7, &[]).await;

        assert_eq!(indexer.get_head_slot().await, Slot::new(7));
        assert_eq!(indexer.get_lowest_cached_slot().await, Some(Slot::new(0)));
        for slot in 0..=7 {
            let blocks = indexer.get_cached_blocks(Slot::new(slot)).await;
            assert_eq!(blocks.len(), 1);
            assert!(!blocks[0].is_orphaned());
        }
        assert_canonical_chain(&indexer).await;
        assert!(!indexer.state.read().await.resync_needed);
    }

    #[tokio::test]
    async fn missed_slot_leaves_no_cache_entry() {
        let indexer = test_indexer(test_spec(), no_delay_config());
        insert_chain(&indexer, 0..=10, &[6]).await;

        assert!(indexer.get_cached_blocks(Slot::new(6)).await.is_empty());
        let at_7 = indexer.get_cached_blocks(Slot::new(7)).await;
        assert_eq!(at_7.len(), 1);
        assert!(!at_7[0].is_orphaned());
        // The block after the gap links to the block before it.
        assert_eq!(at_7[0].parent_root(), root_hash(105));
        assert_canonical_chain(&indexer).await;
    }

    #[tokio::test]
    async fn duplicate_insert_is_idempotent() {
        let indexer = test_indexer(test_spec(), no_delay_config());
        insert_chain(&indexer, 0..=3, &[]).await;

        let (header, block) = make_block(Slot::new(3), 103, 102, vec![]);
        assert!(indexer
            .process_head_block(Slot::new(3), header, block)
            .await
            .is_none());

        let state = indexer.state.read().await;
        assert_eq!(state.cached_blocks.get(&Slot::new(3)).unwrap().len(), 1);
        assert_eq!(state.last_head_root, Some(root_hash(103)));
    }

    #[tokio::test]
    async fn one_slot_reorg_orphans_the_replaced_branch() {
        let indexer = test_indexer(test_spec(), no_delay_config());
        insert_chain(&indexer, 0..=9, &[]).await;

        // A and B compete at slot 10 with the same parent; C extends B.
        let (header_a, block_a) = make_block(Slot::new(10), 200, 109, vec![]);
        let (header_b, block_b) = make_block(Slot::new(10), 201, 109, vec![]);
        let (header_c, block_c) = make_block(Slot::new(11), 202, 201, vec![]);
        let a = indexer
            .process_head_block(Slot::new(10), header_a, block_a)
            .await
            .unwrap();
        let b = indexer
            .process_head_block(Slot::new(10), header_b, block_b)
            .await
            .unwrap();
        let c = indexer
            .process_head_block(Slot::new(11), header_c, block_c)
            .await
            .unwrap();

        assert!(a.is_orphaned());
        assert!(!b.is_orphaned());
        assert!(!c.is_orphaned());
        assert_canonical_chain(&indexer).await;
    }

    #[tokio::test]
    async fn reorg_back_to_orphaned_branch_recanonicalizes_it() {
        let indexer = test_indexer(test_spec(), no_delay_config());
        insert_chain(&indexer, 0..=9, &[]).await;

        let (header_a, block_a) = make_block(Slot::new(10), 200, 109, vec![]);
        let (header_b, block_b) = make_block(Slot::new(10), 201, 109, vec![]);
        let (header_c, block_c) = make_block(Slot::new(11), 202, 201, vec![]);
        let a = indexer
            .process_head_block(Slot::new(10), header_a, block_a)
            .await
            .unwrap();
        let b = indexer
            .process_head_block(Slot::new(10), header_b, block_b)
            .await
            .unwrap();
        let c = indexer
            .process_head_block(Slot::new(11), header_c, block_c)
            .await
            .unwrap();

        // D extends the orphaned A two slots later.
        let (header_d, block_d) = make_block(Slot::new(12), 203, 200, vec![]);
        let d = indexer
            .process_head_block(Slot::new(12), header_d, block_d)
            .await
            .unwrap();

        assert!(!a.is_orphaned());
        assert!(b.is_orphaned());
        assert!(c.is_orphaned());
        assert!(!d.is_orphaned());
        assert!(!indexer.state.read().await.resync_needed);
        assert_canonical_chain(&indexer).await;
    }

    #[tokio::test]
    async fn reorg_without_base_in_window_flags_resync() {
        let indexer = test_indexer(test_spec(), no_delay_config());
        insert_chain(&indexer, 8..=15, &[]).await;

        // A head whose parent is unknown to the whole window.
        let (header, block) = make_block(Slot::new(16), 300, 999, vec![]);
        indexer
            .process_head_block(Slot::new(16), header, block)
            .await
            .unwrap();

        assert!(indexer.state.read().await.resync_needed);
        // Previously cached blocks are still queryable, not corrupted.
        assert_eq!(indexer.get_cached_blocks(Slot::new(8)).await.len(), 1);
    }

    #[tokio::test]
    async fn drop_below_prunes_cache_and_advances_watermark() {
        let indexer = test_indexer(test_spec(), no_delay_config());
        insert_chain(&indexer, 0..=11, &[]).await;

        {
            let mut state = indexer.state.write().await;
            drop_below(&mut state, Slot::new(8));
        }

        assert_eq!(indexer.get_lowest_cached_slot().await, Some(Slot::new(8)));
        for slot in 0..8 {
            assert!(indexer.get_cached_blocks(Slot::new(slot)).await.is_empty());
        }
        assert_eq!(indexer.get_cached_blocks(Slot::new(8)).await.len(), 1);
    }

    /// Build ready `EpochStats` for an epoch: one committee per slot and a
    /// flat 32-balance validator set.
    async fn install_epoch_stats(
        indexer: &Arc<Indexer>,
        epoch: Epoch,
        committee: Vec<u64>,
    ) -> Arc<EpochStats> {
        let spec = indexer.spec.clone();
        let mut attestors = HashMap::new();
        let mut proposers = HashMap::new();
        for slot in epoch.slot_iter(spec.slots_per_epoch) {
            attestors.insert((slot, 0), committee.clone());
            proposers.insert(slot, committee[0]);
        }
        let assignments = Arc::new(EpochAssignments {
            dependent_root: root_hash(500 + epoch.as_u64()),
            dependent_state_root: root_hash(600 + epoch.as_u64()),
            proposers,
            attestors,
            sync_committee: vec![],
        });
        let (stats, _) = EpochStats::new(assignments.dependent_root, None);
        stats.publish_assignments(Some(assignments));
        let balances = committee.iter().map(|&index| (index, 32u64)).collect();
        stats.validators().fill(ValidatorSet {
            validator_count: committee.len() as u64,
            eligible_amount: 32 * committee.len() as u64,
            validator_balances: balances,
        });
        let stats = Arc::new(stats);
        indexer
            .state
            .write()
            .await
            .epoch_stats
            .insert(epoch, stats.clone());
        stats
    }

    #[tokio::test]
    async fn live_epoch_aggregates_included_attestations() {
        let spec = test_spec();
        let indexer = test_indexer(spec.clone(), no_delay_config());
        let epoch = Epoch::new(0);
        install_epoch_stats(&indexer, epoch, vec![1, 2, 3]).await;

        // Genesis block, then a block carrying an attestation for slot 0
        // with a correct target and head.
        let (genesis_header, genesis_block) = make_block(Slot::new(0), 100, 99, vec![]);
        let target = genesis_header.root;
        indexer
            .process_head_block(Slot::new(0), genesis_header, genesis_block)
            .await
            .unwrap();
        let attestation = make_attestation(Slot::new(0), 0, epoch, target, target, &[0, 1, 2]);
        let (header, block) = make_block(Slot::new(1), 101, 100, vec![attestation]);
        indexer
            .process_head_block(Slot::new(1), header, block)
            .await
            .unwrap();

        let row = indexer.build_live_epoch(epoch).await.expect("epoch row");
        assert_eq!(row.block_count, 2);
        assert_eq!(row.voted_total, 3 * 32);
        assert_eq!(row.voted_target, 3 * 32);
        assert_eq!(row.voted_head, 3 * 32);
        assert_eq!(row.validator_count, 3);
    }

    #[tokio::test]
    async fn frontier_advances_monotonically() {
        let spec = test_spec();
        let indexer = test_indexer(spec.clone(), no_delay_config());
        install_epoch_stats(&indexer, Epoch::new(0), vec![1, 2]).await;
        insert_chain(&indexer, 0..=3, &[]).await;

        assert_eq!(indexer.state.read().await.last_processed_epoch, None);
        indexer.process_indexing().await;
        assert_eq!(
            indexer.state.read().await.last_processed_epoch,
            Some(Epoch::new(0))
        );

        // Epoch 1 has no stats yet; the frontier must hold, not regress.
        insert_chain(&indexer, 4..=7, &[]).await;
        indexer.process_indexing().await;
        assert_eq!(
            indexer.state.read().await.last_processed_epoch,
            Some(Epoch::new(0))
        );

        install_epoch_stats(&indexer, Epoch::new(1), vec![1, 2]).await;
        indexer.process_indexing().await;
        assert_eq!(
            indexer.state.read().await.last_processed_epoch,
            Some(Epoch::new(1))
        );
    }

    #[tokio::test]
    async fn cache_cleanup_evicts_old_epochs_into_client_cache() {
        let spec = test_spec();
        let indexer = test_indexer(
            spec.clone(),
            IndexerConfig {
                in_memory_epochs: 2,
                epoch_processing_delay: 0,
                write_db: false,
            },
        );
        install_epoch_stats(&indexer, Epoch::new(0), vec![1]).await;
        // Head in epoch 2 with a two-epoch window, so epoch 0 is out.
        insert_chain(&indexer, 0..=8, &[]).await;

        indexer.process_cache_cleanup().await;

        let state = indexer.state.read().await;
        assert_eq!(state.lowest_cached_slot, Some(Slot::new(4)));
        assert!(!state.cached_blocks.contains_key(&Slot::new(3)));
        assert!(state.cached_blocks.contains_key(&Slot::new(4)));
        assert!(!state.epoch_stats.contains_key(&Epoch::new(0)));
    }

    #[tokio::test]
    async fn new_epoch_stats_rejects_processed_and_duplicate_roots() {
        let indexer = test_indexer(test_spec(), no_delay_config());
        indexer.state.write().await.last_processed_epoch = Some(Epoch::new(5));

        // Below the frontier: rejected.
        assert!(indexer
            .new_epoch_stats(Epoch::new(4), root_hash(1))
            .await
            .is_none());

        // Fresh epoch: allocated with a pending validator fetch.
        let (_, fresh) = indexer
            .new_epoch_stats(Epoch::new(6), root_hash(1))
            .await
            .unwrap();
        assert!(fresh);

        // Same dependent root again: no-op.
        assert!(indexer
            .new_epoch_stats(Epoch::new(6), root_hash(1))
            .await
            .is_none());

        // Superseding dependent root: new stats, reused validator holder.
        let (stats, fresh) = indexer
            .new_epoch_stats(Epoch::new(6), root_hash(2))
            .await
            .unwrap();
        assert!(!fresh);
        assert_eq!(stats.dependent_root(), root_hash(2));
    }

    #[tokio::test]
    async fn validator_status_gates_eligibility() {
        // Regression guard for the status mapping used by the balances
        // snapshot; exited validators stay queryable but not eligible.
        assert!(ValidatorStatus::ActiveOngoing.is_active_ongoing());
        assert!(!ValidatorStatus::ActiveExiting.is_active_ongoing());
        assert!(!ValidatorStatus::ExitedUnslashed.is_active_ongoing());
    }
}
