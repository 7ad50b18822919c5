//! Builders turning cached blocks + epoch stats into database rows, and the
//! transactional write path shared by the live aggregator and the
//! synchronizer.

use crate::beacon_client::EpochAssignments;
use crate::database::{
    self, BlobAssignmentRow, BlockRow, Database, EpochRow, OrphanedBlockRow, SlotAssignmentRow,
    SyncAssignmentRow, SYNC_STATE_KEY,
};
use crate::indexer::block_info::BlockInfo;
use crate::indexer::epoch_stats::EpochStats;
use crate::indexer::votes::{count_bits, EpochVotes};
use crate::indexer::Error;
use crate::types::{ChainSpec, Epoch, Slot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// The synchronizer checkpoint persisted under [`SYNC_STATE_KEY`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub epoch: u64,
}

/// Share of the sync committee that signed this block, or zero pre-altair.
fn sync_participation(block: &BlockInfo, sync_committee_size: usize) -> f32 {
    match (&block.body().sync_aggregate, sync_committee_size) {
        (Some(aggregate), size) if size > 0 => {
            count_bits(&aggregate.sync_committee_bits) as f32 / size as f32
        }
        _ => 0.0,
    }
}

fn graffiti_text(graffiti: &[u8]) -> String {
    let trimmed = match graffiti.iter().rposition(|byte| *byte != 0) {
        Some(position) => &graffiti[..=position],
        None => &[],
    };
    String::from_utf8_lossy(trimmed).into_owned()
}

pub(crate) fn build_db_block(
    block: &BlockInfo,
    assignments: Option<&EpochAssignments>,
) -> BlockRow {
    let body = block.body();
    let (withdraw_count, withdraw_amount) = body
        .execution_payload
        .as_ref()
        .and_then(|payload| payload.withdrawals.as_ref())
        .map(|withdrawals| {
            (
                withdrawals.len() as u64,
                withdrawals.iter().map(|w| w.amount).sum(),
            )
        })
        .unwrap_or((0, 0));
    let sync_committee_size = assignments.map_or(0, |a| a.sync_committee.len());

    BlockRow {
        root: block.root(),
        slot: block.slot(),
        parent_root: block.parent_root(),
        state_root: block.state_root(),
        orphaned: block.is_orphaned(),
        proposer: block.proposer_index(),
        graffiti: body.graffiti.as_bytes().to_vec(),
        graffiti_text: graffiti_text(body.graffiti.as_bytes()),
        attestation_count: body.attestations.len() as u64,
        deposit_count: body.deposits.len() as u64,
        exit_count: body.voluntary_exits.len() as u64,
        withdraw_count,
        withdraw_amount,
        attester_slashing_count: body.attester_slashings.len() as u64,
        proposer_slashing_count: body.proposer_slashings.len() as u64,
        bls_change_count: body
            .bls_to_execution_changes
            .as_ref()
            .map_or(0, |changes| changes.len() as u64),
        eth_transaction_count: body
            .execution_payload
            .as_ref()
            .map_or(0, |payload| payload.transactions.len() as u64),
        eth_block_number: body.execution_payload.as_ref().map(|p| p.block_number),
        eth_block_hash: body.execution_payload.as_ref().map(|p| p.block_hash),
        sync_participation: sync_participation(block, sync_committee_size),
    }
}

/// Everything one epoch writes, assembled under the shared cache latch and
/// persisted in a single transaction afterwards.
#[derive(Debug, Default)]
pub(crate) struct EpochData {
    pub epoch: EpochRow,
    pub blocks: Vec<BlockRow>,
    pub orphaned: Vec<OrphanedBlockRow>,
    pub slot_assignments: Vec<SlotAssignmentRow>,
    pub sync_assignments: Vec<SyncAssignmentRow>,
    pub blob_assignments: Vec<BlobAssignmentRow>,
}

pub(crate) fn build_epoch_data(
    spec: &ChainSpec,
    epoch: Epoch,
    blocks: &HashMap<Slot, Vec<Arc<BlockInfo>>>,
    stats: &EpochStats,
    votes: &EpochVotes,
) -> Result<EpochData, Error> {
    let assignments = stats.assignments();
    let validator_set = stats.validator_set();

    let mut data = EpochData {
        epoch: EpochRow {
            epoch,
            validator_count: validator_set.as_ref().map_or(0, |set| set.validator_count),
            eligible: validator_set.as_ref().map_or(0, |set| set.eligible_amount),
            voted_target: votes.current_epoch.target_vote_amount
                + votes.next_epoch.target_vote_amount,
            voted_head: votes.current_epoch.head_vote_amount + votes.next_epoch.head_vote_amount,
            voted_total: votes.current_epoch.total_vote_amount
                + votes.next_epoch.total_vote_amount,
            ..EpochRow::default()
        },
        ..EpochData::default()
    };

    let mut sync_participation_sum = 0.0;
    for slot in epoch.slot_iter(spec.slots_per_epoch) {
        for block in blocks.get(&slot).map(|b| b.as_slice()).unwrap_or_default() {
            let row = build_db_block(block, assignments.as_deref());
            if row.orphaned {
                data.epoch.orphaned_count += 1;
                data.orphaned.push(OrphanedBlockRow {
                    root: block.root(),
                    slot,
                    header: serde_json::to_string(block.header())?,
                    block: serde_json::to_string(block.block())?,
                });
            } else {
                data.epoch.block_count += 1;
                data.epoch.attestation_count += row.attestation_count;
                data.epoch.deposit_count += row.deposit_count;
                data.epoch.exit_count += row.exit_count;
                data.epoch.withdraw_count += row.withdraw_count;
                data.epoch.withdraw_amount += row.withdraw_amount;
                data.epoch.attester_slashing_count += row.attester_slashing_count;
                data.epoch.proposer_slashing_count += row.proposer_slashing_count;
                data.epoch.bls_change_count += row.bls_change_count;
                data.epoch.eth_transaction_count += row.eth_transaction_count;
                sync_participation_sum += row.sync_participation;

                if let Some(commitments) = &block.body().blob_kzg_commitments {
                    for commitment in commitments {
                        data.blob_assignments.push(BlobAssignmentRow {
                            root: block.root(),
                            commitment: commitment.0.clone(),
                            slot,
                        });
                    }
                }
            }
            data.blocks.push(row);
        }
    }
    if data.epoch.block_count > 0 {
        data.epoch.sync_participation = sync_participation_sum / data.epoch.block_count as f32;
    }

    if let Some(assignments) = &assignments {
        for slot in epoch.slot_iter(spec.slots_per_epoch) {
            if let Some(&proposer) = assignments.proposers.get(&slot) {
                data.slot_assignments
                    .push(SlotAssignmentRow { slot, proposer });
            }
        }
        let period = spec.sync_committee_period(epoch);
        for (index, &validator) in assignments.sync_committee.iter().enumerate() {
            data.sync_assignments.push(SyncAssignmentRow {
                period,
                index: index as u32,
                validator,
            });
        }
    }

    Ok(data)
}

/// Write one epoch's rows in a single transaction. With `checkpoint` set the
/// persisted sync state is advanced in the same transaction.
pub(crate) async fn persist_epoch_data(
    database: &mut Database,
    data: &EpochData,
    checkpoint: Option<SyncState>,
) -> Result<(), database::Error> {
    let tx = database.transaction().await?;

    Database::insert_epoch(&tx, &data.epoch).await?;
    for row in &data.blocks {
        Database::insert_block(&tx, row).await?;
    }
    for row in &data.orphaned {
        Database::insert_orphaned_block(&tx, row).await?;
    }
    for row in &data.slot_assignments {
        Database::insert_slot_assignment(&tx, row).await?;
    }
    for row in &data.sync_assignments {
        Database::insert_sync_assignment(&tx, row).await?;
    }
    for row in &data.blob_assignments {
        Database::insert_blob_assignment(&tx, row).await?;
    }
    if let Some(sync_state) = checkpoint {
        Database::set_explorer_state(&tx, SYNC_STATE_KEY, &sync_state).await?;
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::epoch_stats::ValidatorSet;
    use crate::indexer::test_utils::{block_with_attestations, make_attestation};
    use crate::indexer::votes::{aggregate_epoch_votes, epoch_target};
    use crate::types::Hash256;

    #[test]
    fn sync_state_wire_format() {
        let state = SyncState { epoch: 123 };
        assert_eq!(serde_json::to_string(&state).unwrap(), "{\"epoch\":123}");
        let parsed: SyncState = serde_json::from_str("{\"epoch\":7}").unwrap();
        assert_eq!(parsed.epoch, 7);
    }

    #[test]
    fn graffiti_text_trims_padding() {
        let mut graffiti = b"lighthouse".to_vec();
        graffiti.resize(32, 0);
        assert_eq!(graffiti_text(&graffiti), "lighthouse");
        assert_eq!(graffiti_text(&[0u8; 32]), "");
    }

    #[test]
    fn epoch_row_totals_span_both_vote_buckets() {
        let spec = ChainSpec {
            slots_per_epoch: 4,
            ..ChainSpec::default()
        };
        let epoch = Epoch::new(0);

        let mut attestors = HashMap::new();
        for slot in 0..8u64 {
            attestors.insert((Slot::new(slot), 0), vec![1, 2]);
        }
        let assignments = Arc::new(EpochAssignments {
            dependent_root: Hash256::repeat_byte(1),
            dependent_state_root: Hash256::repeat_byte(2),
            proposers: HashMap::from([(Slot::new(0), 42)]),
            attestors,
            sync_committee: vec![],
        });
        let (stats, _) = EpochStats::new(assignments.dependent_root, None);
        stats.publish_assignments(Some(assignments));
        stats.validators().fill(ValidatorSet {
            validator_count: 2,
            eligible_amount: 64,
            validator_balances: HashMap::from([(1, 32), (2, 32)]),
        });

        let mut blocks = HashMap::new();
        let genesis = block_with_attestations(Slot::new(0), 100, 99, vec![]);
        let target = genesis.root();
        blocks.insert(Slot::new(0), vec![genesis]);
        blocks.insert(
            Slot::new(1),
            vec![block_with_attestations(
                Slot::new(1),
                101,
                100,
                vec![make_attestation(Slot::new(0), 0, epoch, target, target, &[0, 1])],
            )],
        );

        let derived_target = epoch_target(&blocks, &spec, epoch).unwrap();
        assert_eq!(derived_target, target);
        let votes = aggregate_epoch_votes(
            &blocks,
            &spec,
            epoch,
            &stats,
            None,
            derived_target,
            None,
            false,
        );
        let data = build_epoch_data(&spec, epoch, &blocks, &stats, &votes).unwrap();

        assert_eq!(data.epoch.block_count, 2);
        assert_eq!(data.epoch.orphaned_count, 0);
        assert_eq!(data.epoch.attestation_count, 1);
        assert_eq!(
            data.epoch.voted_total,
            votes.current_epoch.total_vote_amount + votes.next_epoch.total_vote_amount
        );
        assert_eq!(data.epoch.voted_total, 64);
        assert_eq!(data.slot_assignments.len(), 1);
        assert_eq!(data.slot_assignments[0].proposer, 42);
        assert_eq!(data.blocks.len(), 2);
    }

    #[test]
    fn orphaned_blocks_are_extracted_with_bodies() {
        let spec = ChainSpec {
            slots_per_epoch: 4,
            ..ChainSpec::default()
        };
        let (stats, _) = EpochStats::new(Hash256::repeat_byte(1), None);
        stats.publish_assignments(None);
        stats.validators().release();

        let mut blocks = HashMap::new();
        let canonical = block_with_attestations(Slot::new(1), 11, 10, vec![]);
        let orphaned = block_with_attestations(Slot::new(1), 12, 10, vec![]);
        orphaned.set_orphaned(true);
        blocks.insert(Slot::new(1), vec![canonical, orphaned.clone()]);

        let data = build_epoch_data(
            &spec,
            Epoch::new(0),
            &blocks,
            &stats,
            &EpochVotes::default(),
        )
        .unwrap();

        assert_eq!(data.epoch.block_count, 1);
        assert_eq!(data.epoch.orphaned_count, 1);
        assert_eq!(data.orphaned.len(), 1);
        assert_eq!(data.orphaned[0].root, orphaned.root());
        assert!(data.orphaned[0].block.contains("\"attestations\""));
        // Both variants land in the blocks table, flagged accordingly.
        assert_eq!(data.blocks.len(), 2);
        assert_eq!(data.blocks.iter().filter(|row| row.orphaned).count(), 1);
    }
}
