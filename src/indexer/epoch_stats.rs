//! Per-epoch metadata: duty assignments and a snapshot of the validator
//! set, each guarded by a readiness latch.
//!
//! The latches make partially-fetched state invisible: a reader either sees
//! nothing or the final value. Both are released on failure too, so waiters
//! always make progress with whatever is available.

use crate::beacon_client::types::ValidatorData;
use crate::beacon_client::EpochAssignments;
use crate::types::Hash256;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// A one-shot readiness flag that tasks can await.
pub struct Latch {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Latch {
    fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Latch { tx, rx }
    }

    /// Idempotent; wakes all current and future waiters.
    pub fn release(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_released(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// The validator-set snapshot of one epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatorSet {
    /// Number of `active_ongoing` validators.
    pub validator_count: u64,
    /// Total effective balance of `active_ongoing` validators.
    pub eligible_amount: u64,
    /// Effective balance of every validator, active or not.
    pub validator_balances: HashMap<u64, u64>,
}

impl ValidatorSet {
    pub fn from_validator_data(validators: &[ValidatorData]) -> Self {
        let mut set = ValidatorSet {
            validator_balances: HashMap::with_capacity(validators.len()),
            ..Default::default()
        };
        for validator in validators {
            set.validator_balances
                .insert(validator.index, validator.validator.effective_balance);
            if validator.status.is_active_ongoing() {
                set.validator_count += 1;
                set.eligible_amount += validator.validator.effective_balance;
            }
        }
        set
    }

    pub fn balance(&self, validator_index: u64) -> u64 {
        self.validator_balances
            .get(&validator_index)
            .copied()
            .unwrap_or(0)
    }
}

/// Shared holder of a validator-set snapshot and its readiness latch.
///
/// When a head event supersedes an epoch's dependent root, the fresh
/// `EpochStats` keeps the previous holder so an in-flight fetch keeps a
/// single destination and a single latch.
pub struct EpochValidators {
    ready: Latch,
    set: RwLock<Option<Arc<ValidatorSet>>>,
}

impl EpochValidators {
    fn new() -> Self {
        EpochValidators {
            ready: Latch::new(),
            set: RwLock::new(None),
        }
    }

    pub fn get(&self) -> Option<Arc<ValidatorSet>> {
        self.set.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_released()
    }

    pub async fn wait_ready(&self) {
        self.ready.wait().await
    }

    pub(crate) fn fill(&self, set: ValidatorSet) {
        *self.set.write() = Some(Arc::new(set));
        self.ready.release();
    }

    /// Mark the fetch finished without data (terminal failure).
    pub(crate) fn release(&self) {
        self.ready.release();
    }
}

/// Per-epoch metadata anchored at a dependent root.
pub struct EpochStats {
    dependent_root: Hash256,
    assignments: RwLock<Option<Arc<EpochAssignments>>>,
    assignments_ready: Latch,
    validators: Arc<EpochValidators>,
}

impl EpochStats {
    /// Allocate stats for `dependent_root`, reusing a previous epoch's
    /// validator holder when one is given. Returns the stats and whether a
    /// validator fetch still has to be started.
    pub(crate) fn new(
        dependent_root: Hash256,
        prior_validators: Option<Arc<EpochValidators>>,
    ) -> (EpochStats, bool) {
        let fresh_validators = prior_validators.is_none();
        let validators =
            prior_validators.unwrap_or_else(|| Arc::new(EpochValidators::new()));
        (
            EpochStats {
                dependent_root,
                assignments: RwLock::new(None),
                assignments_ready: Latch::new(),
                validators,
            },
            fresh_validators,
        )
    }

    pub fn dependent_root(&self) -> Hash256 {
        self.dependent_root
    }

    pub fn assignments(&self) -> Option<Arc<EpochAssignments>> {
        self.assignments.read().clone()
    }

    pub async fn wait_assignments(&self) -> Option<Arc<EpochAssignments>> {
        self.assignments_ready.wait().await;
        self.assignments()
    }

    pub fn assignments_ready(&self) -> bool {
        self.assignments_ready.is_released()
    }

    /// Publish the assignment fetch result (`None` on terminal failure) and
    /// release the latch either way.
    pub(crate) fn publish_assignments(&self, assignments: Option<Arc<EpochAssignments>>) {
        if let Some(assignments) = assignments {
            *self.assignments.write() = Some(assignments);
        }
        self.assignments_ready.release();
    }

    pub fn validators(&self) -> &Arc<EpochValidators> {
        &self.validators
    }

    pub fn validator_set(&self) -> Option<Arc<ValidatorSet>> {
        self.validators.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon_client::types::{Validator, ValidatorStatus};
    use crate::types::Epoch;
    use std::time::Duration;

    fn validator_data(index: u64, status: ValidatorStatus, balance: u64) -> ValidatorData {
        ValidatorData {
            index,
            balance,
            status,
            validator: Validator {
                pubkey: format!("0x{:02x}", index),
                effective_balance: balance,
                slashed: false,
                activation_epoch: Epoch::new(0),
                exit_epoch: Epoch::max_value(),
            },
        }
    }

    #[test]
    fn validator_set_totals() {
        let set = ValidatorSet::from_validator_data(&[
            validator_data(0, ValidatorStatus::ActiveOngoing, 32_000_000_000),
            validator_data(1, ValidatorStatus::ActiveOngoing, 31_000_000_000),
            validator_data(2, ValidatorStatus::ExitedUnslashed, 32_000_000_000),
        ]);
        assert_eq!(set.validator_count, 2);
        assert_eq!(set.eligible_amount, 63_000_000_000);
        // Exited validators keep a balance entry for late attestations.
        assert_eq!(set.balance(2), 32_000_000_000);
        assert_eq!(set.balance(3), 0);
    }

    #[tokio::test]
    async fn latch_released_before_wait() {
        let latch = Latch::new();
        latch.release();
        latch.release();
        assert!(latch.is_released());
        latch.wait().await;
    }

    #[tokio::test]
    async fn latch_wakes_waiter() {
        let (stats, fresh) = EpochStats::new(Hash256::repeat_byte(1), None);
        assert!(fresh);
        let stats = Arc::new(stats);

        let waiter = {
            let stats = stats.clone();
            tokio::spawn(async move {
                stats.validators().wait_ready().await;
                stats.validator_set()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        stats.validators().fill(ValidatorSet::default());

        let set = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(set.is_some());
    }

    #[tokio::test]
    async fn failed_fetch_still_releases() {
        let (stats, _) = EpochStats::new(Hash256::repeat_byte(2), None);
        stats.publish_assignments(None);
        assert!(stats.assignments_ready());
        assert!(stats.wait_assignments().await.is_none());

        stats.validators().release();
        stats.validators().wait_ready().await;
        assert!(stats.validator_set().is_none());
    }

    #[test]
    fn validator_holder_is_shared_across_supersession() {
        let (old_stats, _) = EpochStats::new(Hash256::repeat_byte(3), None);
        let (new_stats, fresh) =
            EpochStats::new(Hash256::repeat_byte(4), Some(old_stats.validators().clone()));
        assert!(!fresh);

        old_stats.validators().fill(ValidatorSet {
            validator_count: 1,
            eligible_amount: 32,
            validator_balances: HashMap::new(),
        });
        assert_eq!(new_stats.validator_set().unwrap().validator_count, 1);
    }
}
