//! Attestation vote aggregation over one epoch.
//!
//! Attestations justifying an epoch can land in blocks of the epoch itself
//! or of the following one, so the scan window spans two epochs. Votes are
//! bucketed by the attestation's target epoch and weighted by effective
//! balance from the target epoch's validator snapshot.

use crate::indexer::block_info::BlockInfo;
use crate::indexer::epoch_stats::EpochStats;
use crate::types::{ChainSpec, Epoch, Hash256, Slot};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VoteAmounts {
    pub target_vote_amount: u64,
    pub head_vote_amount: u64,
    pub total_vote_amount: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochVotes {
    pub current_epoch: VoteAmounts,
    pub next_epoch: VoteAmounts,
}

/// Bit `index` of an SSZ bitlist/bitvector in its hex wire encoding.
pub(crate) fn bit_at(bytes: &[u8], index: usize) -> bool {
    bytes
        .get(index / 8)
        .map_or(false, |byte| byte & (1 << (index % 8)) != 0)
}

pub(crate) fn count_bits(bytes: &[u8]) -> u64 {
    bytes.iter().map(|byte| byte.count_ones() as u64).sum()
}

/// The root attestations targeting `epoch` must carry: the root of the
/// epoch's first canonical block if it sits on the epoch boundary slot,
/// otherwise that block's parent root. `None` while the epoch has no
/// canonical block in cache.
pub(crate) fn epoch_target(
    blocks: &HashMap<Slot, Vec<Arc<BlockInfo>>>,
    spec: &ChainSpec,
    epoch: Epoch,
) -> Option<Hash256> {
    let first_slot = epoch.start_slot(spec.slots_per_epoch);
    for slot in epoch.slot_iter(spec.slots_per_epoch) {
        if let Some(slot_blocks) = blocks.get(&slot) {
            for block in slot_blocks {
                if !block.is_orphaned() {
                    return if slot == first_slot {
                        Some(block.root())
                    } else {
                        Some(block.parent_root())
                    };
                }
            }
        }
    }
    None
}

struct VoteBucket {
    amounts: VoteAmounts,
    voted: HashSet<u64>,
}

impl VoteBucket {
    fn new() -> Self {
        VoteBucket {
            amounts: VoteAmounts::default(),
            voted: HashSet::new(),
        }
    }
}

/// Fold the attestations of all canonical blocks in
/// `[first_slot, last_slot + slots_per_epoch]` into per-target-epoch vote
/// totals.
///
/// With `current_only` the scan stops at the epoch's own last slot and the
/// next-epoch bucket stays empty; the synchronizer uses this since it only
/// fetches one epoch of history at a time.
#[allow(clippy::too_many_arguments)]
pub(crate) fn aggregate_epoch_votes(
    blocks: &HashMap<Slot, Vec<Arc<BlockInfo>>>,
    spec: &ChainSpec,
    epoch: Epoch,
    epoch_stats: &EpochStats,
    next_epoch_stats: Option<&EpochStats>,
    epoch_target: Hash256,
    next_epoch_target: Option<Hash256>,
    current_only: bool,
) -> EpochVotes {
    let first_slot = epoch.start_slot(spec.slots_per_epoch);
    let last_slot = if current_only {
        epoch.end_slot(spec.slots_per_epoch)
    } else {
        (epoch + 1).end_slot(spec.slots_per_epoch)
    };

    // Canonical root per slot, for head-vote checks.
    let mut canonical_roots: HashMap<Slot, Hash256> = HashMap::new();
    let mut slot = first_slot;
    while slot <= last_slot {
        if let Some(slot_blocks) = blocks.get(&slot) {
            for block in slot_blocks {
                if !block.is_orphaned() {
                    canonical_roots.insert(slot, block.root());
                }
            }
        }
        if slot == last_slot {
            break;
        }
        slot += 1;
    }

    let mut current_bucket = VoteBucket::new();
    let mut next_bucket = VoteBucket::new();

    let mut slot = first_slot;
    while slot <= last_slot {
        for block in blocks.get(&slot).map(|b| b.as_slice()).unwrap_or_default() {
            if block.is_orphaned() {
                continue;
            }
            for attestation in &block.body().attestations {
                let target_epoch = attestation.data.target.epoch;
                let (bucket, stats, target_root) = if target_epoch == epoch {
                    (&mut current_bucket, Some(epoch_stats), Some(epoch_target))
                } else if target_epoch == epoch + 1 && !current_only {
                    (&mut next_bucket, next_epoch_stats, next_epoch_target)
                } else {
                    continue;
                };
                let assignments = match stats.and_then(|stats| stats.assignments()) {
                    Some(assignments) => assignments,
                    None => continue,
                };
                let committee =
                    match assignments.committee(attestation.data.slot, attestation.data.index) {
                        Some(committee) => committee,
                        None => continue,
                    };
                let validator_set = stats.and_then(|stats| stats.validator_set());

                let is_target_vote = target_root
                    .map_or(false, |root| attestation.data.target.root == root);
                let is_head_vote = canonical_roots.get(&attestation.data.slot)
                    == Some(&attestation.data.beacon_block_root);

                for (position, &validator) in committee.iter().enumerate() {
                    if !bit_at(&attestation.aggregation_bits, position) {
                        continue;
                    }
                    if !bucket.voted.insert(validator) {
                        continue;
                    }
                    let weight = validator_set
                        .as_ref()
                        .map_or(0, |set| set.balance(validator));
                    bucket.amounts.total_vote_amount += weight;
                    if is_target_vote {
                        bucket.amounts.target_vote_amount += weight;
                    }
                    if is_head_vote {
                        bucket.amounts.head_vote_amount += weight;
                    }
                }
            }
        }
        if slot == last_slot {
            break;
        }
        slot += 1;
    }

    EpochVotes {
        current_epoch: current_bucket.amounts,
        next_epoch: next_bucket.amounts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon_client::EpochAssignments;
    use crate::indexer::epoch_stats::ValidatorSet;
    use crate::indexer::test_utils::{block_with_attestations, make_attestation};

    fn test_spec() -> ChainSpec {
        ChainSpec {
            slots_per_epoch: 4,
            ..ChainSpec::default()
        }
    }

    fn stats_with_committee(
        epoch: Epoch,
        spec: &ChainSpec,
        committee: Vec<u64>,
        balance: u64,
    ) -> EpochStats {
        let mut attestors = HashMap::new();
        for slot in epoch.slot_iter(spec.slots_per_epoch) {
            attestors.insert((slot, 0), committee.clone());
        }
        let assignments = EpochAssignments {
            dependent_root: Hash256::repeat_byte(0xde),
            dependent_state_root: Hash256::repeat_byte(0xdf),
            proposers: HashMap::new(),
            attestors,
            sync_committee: vec![],
        };
        let (stats, _) = EpochStats::new(assignments.dependent_root, None);
        stats.publish_assignments(Some(Arc::new(assignments)));

        let mut balances = HashMap::new();
        for &validator in &committee {
            balances.insert(validator, balance);
        }
        stats.validators().fill(ValidatorSet {
            validator_count: committee.len() as u64,
            eligible_amount: balance * committee.len() as u64,
            validator_balances: balances,
        });
        stats
    }

    #[test]
    fn bit_helpers() {
        assert!(bit_at(&[0b0000_0101], 0));
        assert!(!bit_at(&[0b0000_0101], 1));
        assert!(bit_at(&[0b0000_0101], 2));
        assert!(bit_at(&[0x00, 0x01], 8));
        assert!(!bit_at(&[0x00], 64));
        assert_eq!(count_bits(&[0xff, 0x01]), 9);
    }

    #[test]
    fn epoch_target_at_boundary_and_past_it() {
        let spec = test_spec();
        let mut blocks = HashMap::new();

        // Epoch 1 starts at slot 4. A block right on the boundary is the
        // target itself.
        let boundary = block_with_attestations(Slot::new(4), 40, 30, vec![]);
        blocks.insert(Slot::new(4), vec![boundary.clone()]);
        assert_eq!(
            epoch_target(&blocks, &spec, Epoch::new(1)),
            Some(boundary.root())
        );

        // With slot 4 missed, the first block at slot 5 points back to the
        // boundary ancestor through its parent root.
        let mut blocks = HashMap::new();
        let late = block_with_attestations(Slot::new(5), 50, 30, vec![]);
        blocks.insert(Slot::new(5), vec![late.clone()]);
        assert_eq!(
            epoch_target(&blocks, &spec, Epoch::new(1)),
            Some(late.parent_root())
        );

        assert_eq!(epoch_target(&blocks, &spec, Epoch::new(2)), None);
    }

    #[test]
    fn orphaned_blocks_are_not_targets() {
        let spec = test_spec();
        let mut blocks = HashMap::new();
        let orphaned = block_with_attestations(Slot::new(4), 40, 30, vec![]);
        orphaned.set_orphaned(true);
        let canonical = block_with_attestations(Slot::new(4), 41, 30, vec![]);
        blocks.insert(Slot::new(4), vec![orphaned, canonical.clone()]);
        assert_eq!(
            epoch_target(&blocks, &spec, Epoch::new(1)),
            Some(canonical.root())
        );
    }

    #[test]
    fn votes_weighted_and_deduplicated() {
        let spec = test_spec();
        let epoch = Epoch::new(1);
        let committee = vec![7, 8, 9];
        let stats = stats_with_committee(epoch, &spec, committee, 32);

        let target = Hash256::repeat_byte(0xaa);
        // Two attestations from the same committee: the second one repeats
        // voters 0 and 1 and must not double-count them.
        let att_a = make_attestation(Slot::new(4), 0, epoch, target, target, &[0, 1]);
        let att_b = make_attestation(Slot::new(4), 0, epoch, target, target, &[1, 2]);
        let block = block_with_attestations(Slot::new(4), 40, 30, vec![att_a, att_b]);
        let mut blocks = HashMap::new();
        blocks.insert(Slot::new(4), vec![block]);

        let votes = aggregate_epoch_votes(
            &blocks,
            &spec,
            epoch,
            &stats,
            None,
            target,
            None,
            false,
        );

        assert_eq!(votes.current_epoch.total_vote_amount, 3 * 32);
        assert_eq!(votes.current_epoch.target_vote_amount, 3 * 32);
        assert_eq!(votes.next_epoch, VoteAmounts::default());
    }

    #[test]
    fn head_and_target_votes_check_roots() {
        let spec = test_spec();
        let epoch = Epoch::new(1);
        let stats = stats_with_committee(epoch, &spec, vec![1, 2], 10);

        let epoch_target_root = Hash256::repeat_byte(0xaa);
        let wrong_root = Hash256::repeat_byte(0xbb);

        let block = block_with_attestations(
            Slot::new(5),
            50,
            30,
            vec![make_attestation(
                Slot::new(4),
                0,
                epoch,
                wrong_root,
                wrong_root,
                &[0, 1],
            )],
        );
        let mut blocks = HashMap::new();
        blocks.insert(Slot::new(5), vec![block]);

        let votes = aggregate_epoch_votes(
            &blocks,
            &spec,
            epoch,
            &stats,
            None,
            epoch_target_root,
            None,
            false,
        );

        // Wrong target root and no canonical block at slot 4: total counts,
        // target and head do not.
        assert_eq!(votes.current_epoch.total_vote_amount, 20);
        assert_eq!(votes.current_epoch.target_vote_amount, 0);
        assert_eq!(votes.current_epoch.head_vote_amount, 0);
    }

    #[test]
    fn next_epoch_bucket_and_current_only() {
        let spec = test_spec();
        let epoch = Epoch::new(1);
        let next_epoch = Epoch::new(2);
        let stats = stats_with_committee(epoch, &spec, vec![1], 10);
        let next_stats = stats_with_committee(next_epoch, &spec, vec![2], 10);

        let next_target = Hash256::repeat_byte(0xcc);
        // A block in epoch 2 carrying an attestation targeting epoch 2.
        let block = block_with_attestations(
            Slot::new(8),
            80,
            30,
            vec![make_attestation(
                Slot::new(8),
                0,
                next_epoch,
                next_target,
                next_target,
                &[0],
            )],
        );
        let mut blocks = HashMap::new();
        blocks.insert(Slot::new(8), vec![block]);

        let votes = aggregate_epoch_votes(
            &blocks,
            &spec,
            epoch,
            &stats,
            Some(&next_stats),
            Hash256::repeat_byte(0xaa),
            Some(next_target),
            false,
        );
        assert_eq!(votes.next_epoch.total_vote_amount, 10);
        assert_eq!(votes.next_epoch.target_vote_amount, 10);

        let votes = aggregate_epoch_votes(
            &blocks,
            &spec,
            epoch,
            &stats,
            Some(&next_stats),
            Hash256::repeat_byte(0xaa),
            Some(next_target),
            true,
        );
        assert_eq!(votes.next_epoch, VoteAmounts::default());
    }
}
