//! A client for the standard beacon node HTTP API.
//!
//! All requests are JSON. A missing resource (HTTP 404) is surfaced as
//! `Ok(None)` where it is a legitimate answer (e.g. a skipped slot) and as
//! an error everywhere else. Per-epoch duty assignments are fetched as one
//! composed unit and cached in an LRU so that the indexer can hand them
//! back when an epoch leaves the in-memory window.

pub mod events;
pub mod types;

use crate::types::{ChainSpec, Epoch, Hash256, Slot};
use log::debug;
use lru::LruCache;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use self::events::BlockStream;
use self::types::*;

/// Assignments kept around for late frontend queries after cache cleanup.
const ASSIGNMENTS_CACHE_SIZE: usize = 16;

#[derive(Debug)]
pub enum Error {
    /// The server returned an error or the connection failed.
    Reqwest(reqwest::Error),
    /// The server returned a non-2xx status with the given body.
    StatusCode(StatusCode, String),
    /// A resource that must exist was not found.
    NotFound(String),
    /// Proposer duties are not computable at or after the whisk fork.
    ProposerDutiesNotApplicable(Epoch),
    /// Sync committees do not exist before the altair fork.
    PreAltairEpoch(Epoch),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Reqwest(e)
    }
}

/// Per-category request timeouts. The defaults are deliberately generous:
/// bulk validator fetches against a large state can take minutes.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub header: Duration,
    pub block: Duration,
    pub duties: Duration,
    pub validators: Duration,
}

impl Timeouts {
    pub fn set_all(timeout: Duration) -> Self {
        Timeouts {
            header: timeout,
            block: timeout,
            duties: timeout,
            validators: timeout,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            header: Duration::from_secs(300),
            block: Duration::from_secs(300),
            duties: Duration::from_secs(300),
            validators: Duration::from_secs(600),
        }
    }
}

/// The proposer, committee and sync-committee assignments of one epoch,
/// anchored at a dependent root.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochAssignments {
    /// Block root whose post-state determined the assignments.
    pub dependent_root: Hash256,
    /// State root of the dependent block, used to fetch the validator set.
    pub dependent_state_root: Hash256,
    pub proposers: HashMap<Slot, u64>,
    /// `(slot, committee index)` to the ordered committee member indices.
    pub attestors: HashMap<(Slot, u64), Vec<u64>>,
    /// Empty before altair.
    pub sync_committee: Vec<u64>,
}

impl EpochAssignments {
    pub fn committee(&self, slot: Slot, index: u64) -> Option<&Vec<u64>> {
        self.attestors.get(&(slot, index))
    }
}

pub struct BeaconNodeHttpClient {
    client: reqwest::Client,
    server: String,
    timeouts: Timeouts,
    spec: Arc<ChainSpec>,
    assignments_cache: Mutex<LruCache<Epoch, Arc<EpochAssignments>>>,
}

impl BeaconNodeHttpClient {
    pub fn new(server: String, spec: Arc<ChainSpec>, timeouts: Timeouts) -> Self {
        Self {
            client: reqwest::Client::new(),
            server: server.trim_end_matches('/').to_string(),
            timeouts,
            spec,
            assignments_cache: Mutex::new(LruCache::new(ASSIGNMENTS_CACHE_SIZE)),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn spec(&self) -> &Arc<ChainSpec> {
        &self.spec
    }

    /// Perform a GET returning `Ok(None)` on 404.
    async fn get_opt<T: DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<Option<T>, Error> {
        let url = format!("{}{}", self.server, path);
        let start = Instant::now();
        let response = self.client.get(&url).timeout(timeout).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::StatusCode(status, body));
        }

        let value = response.json().await?;
        debug!(
            "api GET {} [{} ms]",
            path,
            start.elapsed().as_millis()
        );
        Ok(Some(value))
    }

    /// Perform a GET where 404 is an error.
    async fn get<T: DeserializeOwned>(&self, path: &str, timeout: Duration) -> Result<T, Error> {
        self.get_opt(path, timeout)
            .await?
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    pub async fn get_genesis(&self) -> Result<GenesisData, Error> {
        self.get::<GenericResponse<GenesisData>>("/eth/v1/beacon/genesis", self.timeouts.header)
            .await
            .map(|resp| resp.data)
    }

    pub async fn get_node_version(&self) -> Result<String, Error> {
        self.get::<GenericResponse<VersionData>>("/eth/v1/node/version", self.timeouts.header)
            .await
            .map(|resp| resp.data.version)
    }

    pub async fn get_node_syncing(&self) -> Result<SyncingData, Error> {
        self.get::<GenericResponse<SyncingData>>("/eth/v1/node/syncing", self.timeouts.header)
            .await
            .map(|resp| resp.data)
    }

    pub async fn get_finality_checkpoints(&self) -> Result<FinalityCheckpointsData, Error> {
        self.get::<GenericResponse<FinalityCheckpointsData>>(
            "/eth/v1/beacon/states/head/finality_checkpoints",
            self.timeouts.header,
        )
        .await
        .map(|resp| resp.data)
    }

    pub async fn get_latest_block_header(&self) -> Result<BlockHeaderData, Error> {
        self.get::<GenericResponse<BlockHeaderData>>(
            "/eth/v1/beacon/headers/head",
            self.timeouts.header,
        )
        .await
        .map(|resp| resp.data)
    }

    /// `Ok(None)` means the slot was skipped.
    pub async fn get_block_header_by_slot(
        &self,
        slot: Slot,
    ) -> Result<Option<BlockHeaderData>, Error> {
        self.get_opt::<GenericResponse<BlockHeaderData>>(
            &format!("/eth/v1/beacon/headers/{}", slot),
            self.timeouts.header,
        )
        .await
        .map(|resp| resp.map(|resp| resp.data))
    }

    pub async fn get_block_header_by_root(&self, root: Hash256) -> Result<BlockHeaderData, Error> {
        self.get::<GenericResponse<BlockHeaderData>>(
            &format!("/eth/v1/beacon/headers/{:?}", root),
            self.timeouts.header,
        )
        .await
        .map(|resp| resp.data)
    }

    pub async fn get_block_body_by_root(&self, root: Hash256) -> Result<SignedBeaconBlock, Error> {
        self.get::<ForkVersionedResponse<SignedBeaconBlock>>(
            &format!("/eth/v2/beacon/blocks/{:?}", root),
            self.timeouts.block,
        )
        .await
        .map(|resp| resp.data)
    }

    /// Pre-deneb block roots yield an empty list.
    pub async fn get_blob_sidecars(&self, root: Hash256) -> Result<Vec<BlobSidecar>, Error> {
        self.get_opt::<GenericResponse<Vec<BlobSidecar>>>(
            &format!("/eth/v1/beacon/blob_sidecars/{:?}", root),
            self.timeouts.block,
        )
        .await
        .map(|resp| resp.map(|resp| resp.data).unwrap_or_default())
    }

    pub async fn get_state_validators(
        &self,
        state: StateId,
    ) -> Result<Vec<ValidatorData>, Error> {
        self.get::<GenericResponse<Vec<ValidatorData>>>(
            &format!("/eth/v1/beacon/states/{}/validators", state),
            self.timeouts.validators,
        )
        .await
        .map(|resp| resp.data)
    }

    /// `Ok(None)` is the "not applicable" sentinel at or after the whisk
    /// fork, where proposers cannot be pre-computed.
    pub async fn get_proposer_duties(
        &self,
        epoch: Epoch,
    ) -> Result<Option<DutiesResponse<Vec<ProposerData>>>, Error> {
        if !self.spec.proposer_duties_available(epoch) {
            return Ok(None);
        }
        self.get::<DutiesResponse<Vec<ProposerData>>>(
            &format!("/eth/v1/validator/duties/proposer/{}", epoch),
            self.timeouts.duties,
        )
        .await
        .map(Some)
    }

    pub async fn get_committee_duties(
        &self,
        state: StateId,
        epoch: Epoch,
    ) -> Result<Vec<CommitteeData>, Error> {
        self.get::<GenericResponse<Vec<CommitteeData>>>(
            &format!("/eth/v1/beacon/states/{}/committees?epoch={}", state, epoch),
            self.timeouts.duties,
        )
        .await
        .map(|resp| resp.data)
    }

    pub async fn get_sync_committee_duties(
        &self,
        state: StateId,
        epoch: Epoch,
    ) -> Result<SyncCommitteeData, Error> {
        if !self.spec.is_altair_active(epoch) {
            return Err(Error::PreAltairEpoch(epoch));
        }
        self.get::<GenericResponse<SyncCommitteeData>>(
            &format!(
                "/eth/v1/beacon/states/{}/sync_committees?epoch={}",
                state, epoch
            ),
            self.timeouts.duties,
        )
        .await
        .map(|resp| resp.data)
    }

    /// Fetch the composed duty assignments of `epoch`.
    ///
    /// When the caller already knows the dependent root (from a head event)
    /// it is passed in so a cached entry can be validated against it and the
    /// proposer-duty fetch can be skipped under whisk. The result is added
    /// to the LRU keyed by epoch.
    pub async fn get_epoch_assignments(
        &self,
        epoch: Epoch,
        known_dependent_root: Option<Hash256>,
    ) -> Result<Arc<EpochAssignments>, Error> {
        if let Some(cached) = self.assignments_cache.lock().get(&epoch) {
            match known_dependent_root {
                Some(root) if cached.dependent_root != root => {}
                _ => return Ok(cached.clone()),
            }
        }

        let mut proposers = HashMap::new();
        let dependent_root = match self.get_proposer_duties(epoch).await? {
            Some(duties) => {
                for duty in &duties.data {
                    proposers.insert(duty.slot, duty.validator_index);
                }
                duties.dependent_root
            }
            None => known_dependent_root
                .ok_or(Error::ProposerDutiesNotApplicable(epoch))?,
        };

        // The committees and the validator set are anchored at the post-state
        // of the dependent block.
        let dependent_header = self.get_block_header_by_root(dependent_root).await?;
        let dependent_state_root = dependent_header.header.message.state_root;
        let state = StateId::Root(dependent_state_root);

        let mut attestors = HashMap::new();
        for committee in self.get_committee_duties(state, epoch).await? {
            attestors.insert((committee.slot, committee.index), committee.validators);
        }

        let sync_committee = if self.spec.is_altair_active(epoch) {
            self.get_sync_committee_duties(state, epoch).await?.validators
        } else {
            Vec::new()
        };

        let assignments = Arc::new(EpochAssignments {
            dependent_root,
            dependent_state_root,
            proposers,
            attestors,
            sync_committee,
        });
        self.assignments_cache
            .lock()
            .put(epoch, assignments.clone());
        Ok(assignments)
    }

    /// Handback used by the indexer's cache cleanup so that late queries for
    /// a just-evicted epoch can still be answered without a refetch.
    pub fn add_cached_epoch_assignments(
        &self,
        epoch: Epoch,
        assignments: Arc<EpochAssignments>,
    ) {
        self.assignments_cache.lock().put(epoch, assignments);
    }

    /// Create an (unstarted) subscription to the `head` + `block` topics of
    /// the node's event stream.
    pub fn new_block_stream(&self) -> BlockStream {
        BlockStream::new(self.client.clone(), self.server.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_construction_is_lazy() {
        // No connection is attempted until a request is issued.
        let client = BeaconNodeHttpClient::new(
            "http://localhost:0/".to_string(),
            Arc::new(ChainSpec::default()),
            Timeouts::set_all(Duration::from_secs(1)),
        );
        assert_eq!(client.server(), "http://localhost:0");
    }

    #[test]
    fn assignments_cache_round_trip() {
        let client = BeaconNodeHttpClient::new(
            "http://localhost:0".to_string(),
            Arc::new(ChainSpec::default()),
            Timeouts::default(),
        );
        let assignments = Arc::new(EpochAssignments {
            dependent_root: Hash256::repeat_byte(1),
            dependent_state_root: Hash256::repeat_byte(2),
            proposers: HashMap::new(),
            attestors: HashMap::new(),
            sync_committee: vec![],
        });
        client.add_cached_epoch_assignments(Epoch::new(7), assignments.clone());
        let cached = client
            .assignments_cache
            .lock()
            .get(&Epoch::new(7))
            .cloned()
            .unwrap();
        assert_eq!(cached, assignments);
    }
}
