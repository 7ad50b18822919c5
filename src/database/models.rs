//! Row types written by the indexer. These are plain structs; the SQL lives
//! next to the insert statements in the parent module.

use crate::types::{Epoch, Hash256, Slot};

/// Aggregated summary of one canonical epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochRow {
    pub epoch: Epoch,
    pub validator_count: u64,
    pub eligible: u64,
    pub voted_target: u64,
    pub voted_head: u64,
    pub voted_total: u64,
    pub block_count: u16,
    pub orphaned_count: u16,
    pub attestation_count: u64,
    pub deposit_count: u64,
    pub exit_count: u64,
    pub withdraw_count: u64,
    pub withdraw_amount: u64,
    pub attester_slashing_count: u64,
    pub proposer_slashing_count: u64,
    pub bls_change_count: u64,
    pub eth_transaction_count: u64,
    pub sync_participation: f32,
}

/// Per-block extract of one observed block, canonical or orphaned.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRow {
    pub root: Hash256,
    pub slot: Slot,
    pub parent_root: Hash256,
    pub state_root: Hash256,
    pub orphaned: bool,
    pub proposer: u64,
    pub graffiti: Vec<u8>,
    pub graffiti_text: String,
    pub attestation_count: u64,
    pub deposit_count: u64,
    pub exit_count: u64,
    pub withdraw_count: u64,
    pub withdraw_amount: u64,
    pub attester_slashing_count: u64,
    pub proposer_slashing_count: u64,
    pub bls_change_count: u64,
    pub eth_transaction_count: u64,
    pub eth_block_number: Option<u64>,
    pub eth_block_hash: Option<Hash256>,
    pub sync_participation: f32,
}

/// Full JSON body of a block that lost a fork, retained for inspection
/// after the canonical chain has moved on.
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanedBlockRow {
    pub root: Hash256,
    pub slot: Slot,
    pub header: String,
    pub block: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotAssignmentRow {
    pub slot: Slot,
    pub proposer: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncAssignmentRow {
    pub period: u64,
    pub index: u32,
    pub validator: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobAssignmentRow {
    pub root: Hash256,
    pub commitment: Vec<u8>,
    pub slot: Slot,
}
