//! Chain parameters and the wall-clock to slot/epoch conversion.

use crate::types::{Epoch, Slot};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const fn default_slots_per_epoch() -> u64 {
    32
}

const fn default_seconds_per_slot() -> u64 {
    12
}

const fn default_genesis_timestamp() -> u64 {
    0
}

const fn default_altair_fork_epoch() -> Epoch {
    Epoch::new(0)
}

const fn default_whisk_fork_epoch() -> Option<Epoch> {
    None
}

const fn default_epochs_per_sync_committee_period() -> u64 {
    256
}

/// The subset of the chain configuration the indexer needs: the slot
/// schedule and the fork epochs that gate duty endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSpec {
    #[serde(default = "default_slots_per_epoch")]
    pub slots_per_epoch: u64,
    #[serde(default = "default_seconds_per_slot")]
    pub seconds_per_slot: u64,
    #[serde(default = "default_genesis_timestamp")]
    pub genesis_timestamp: u64,
    #[serde(default = "default_altair_fork_epoch")]
    pub altair_fork_epoch: Epoch,
    /// Proposer duties cannot be pre-computed at or after this epoch.
    #[serde(default = "default_whisk_fork_epoch")]
    pub whisk_fork_epoch: Option<Epoch>,
    #[serde(default = "default_epochs_per_sync_committee_period")]
    pub epochs_per_sync_committee_period: u64,
}

impl Default for ChainSpec {
    fn default() -> Self {
        ChainSpec {
            slots_per_epoch: default_slots_per_epoch(),
            seconds_per_slot: default_seconds_per_slot(),
            genesis_timestamp: default_genesis_timestamp(),
            altair_fork_epoch: default_altair_fork_epoch(),
            whisk_fork_epoch: default_whisk_fork_epoch(),
            epochs_per_sync_committee_period: default_epochs_per_sync_committee_period(),
        }
    }
}

impl ChainSpec {
    pub fn epoch_of_slot(&self, slot: Slot) -> Epoch {
        slot.epoch(self.slots_per_epoch)
    }

    pub fn slot_duration(&self) -> Duration {
        Duration::from_secs(self.seconds_per_slot)
    }

    pub fn slot_to_time(&self, slot: Slot) -> SystemTime {
        UNIX_EPOCH
            + Duration::from_secs(self.genesis_timestamp)
            + self.slot_duration() * slot.as_u64() as u32
    }

    /// The slot in progress at `time`, or `None` before genesis.
    pub fn time_to_slot(&self, time: SystemTime) -> Option<Slot> {
        let since_epoch = time.duration_since(UNIX_EPOCH).ok()?;
        let genesis = Duration::from_secs(self.genesis_timestamp);
        let since_genesis = since_epoch.checked_sub(genesis)?;
        Some(Slot::new(
            since_genesis.as_secs() / self.seconds_per_slot.max(1),
        ))
    }

    pub fn current_slot(&self) -> Option<Slot> {
        self.time_to_slot(SystemTime::now())
    }

    pub fn current_epoch(&self) -> Option<Epoch> {
        self.current_slot().map(|slot| self.epoch_of_slot(slot))
    }

    /// The sync committee period covering `epoch`.
    pub fn sync_committee_period(&self, epoch: Epoch) -> u64 {
        epoch.as_u64() / self.epochs_per_sync_committee_period.max(1)
    }

    /// Whether sync committees exist at `epoch`.
    pub fn is_altair_active(&self, epoch: Epoch) -> bool {
        epoch >= self.altair_fork_epoch
    }

    /// Whether proposer duties can still be fetched for `epoch`.
    pub fn proposer_duties_available(&self, epoch: Epoch) -> bool {
        match self.whisk_fork_epoch {
            Some(whisk_epoch) => epoch < whisk_epoch,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ChainSpec {
        ChainSpec {
            slots_per_epoch: 32,
            seconds_per_slot: 12,
            genesis_timestamp: 1_606_824_023,
            altair_fork_epoch: Epoch::new(74240),
            whisk_fork_epoch: None,
            epochs_per_sync_committee_period: 256,
        }
    }

    #[test]
    fn time_slot_round_trip() {
        let spec = spec();
        let slot = Slot::new(4_100_000);
        let time = spec.slot_to_time(slot);
        assert_eq!(spec.time_to_slot(time), Some(slot));
        // Mid-slot times resolve to the slot in progress.
        assert_eq!(
            spec.time_to_slot(time + Duration::from_secs(11)),
            Some(slot)
        );
        assert_eq!(
            spec.time_to_slot(time + Duration::from_secs(12)),
            Some(slot + 1)
        );
    }

    #[test]
    fn pre_genesis_has_no_slot() {
        let spec = spec();
        let before = UNIX_EPOCH + Duration::from_secs(spec.genesis_timestamp - 1);
        assert_eq!(spec.time_to_slot(before), None);
    }

    #[test]
    fn fork_gates() {
        let mut spec = spec();
        assert!(!spec.is_altair_active(Epoch::new(74239)));
        assert!(spec.is_altair_active(Epoch::new(74240)));
        assert!(spec.proposer_duties_available(Epoch::new(u64::MAX)));

        spec.whisk_fork_epoch = Some(Epoch::new(100));
        assert!(spec.proposer_duties_available(Epoch::new(99)));
        assert!(!spec.proposer_duties_available(Epoch::new(100)));
    }

    #[test]
    fn sync_committee_period() {
        let spec = spec();
        assert_eq!(spec.sync_committee_period(Epoch::new(0)), 0);
        assert_eq!(spec.sync_committee_period(Epoch::new(255)), 0);
        assert_eq!(spec.sync_committee_period(Epoch::new(256)), 1);
    }
}
