//! The `Slot` and `Epoch` types are defined as new types over u64 to enforce
//! type-safety between the two.
//!
//! All math operations on `Slot` and `Epoch` are saturating, they never wrap.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::ops::{Add, AddAssign, Rem, Sub, SubAssign};
use std::str::FromStr;

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slot(#[serde(with = "eth2_serde_utils::quoted_u64")] u64);

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(#[serde(with = "eth2_serde_utils::quoted_u64")] u64);

macro_rules! impl_common {
    ($main: ident) => {
        impl $main {
            pub const fn as_u64(&self) -> u64 {
                self.0
            }

            pub const fn as_usize(&self) -> usize {
                self.0 as usize
            }

            pub fn saturating_add<T: Into<u64>>(&self, other: T) -> $main {
                $main(self.0.saturating_add(other.into()))
            }

            pub fn saturating_sub<T: Into<u64>>(&self, other: T) -> $main {
                $main(self.0.saturating_sub(other.into()))
            }
        }

        impl From<u64> for $main {
            fn from(n: u64) -> $main {
                $main(n)
            }
        }

        impl From<$main> for u64 {
            fn from(n: $main) -> u64 {
                n.0
            }
        }

        impl PartialEq<u64> for $main {
            fn eq(&self, other: &u64) -> bool {
                self.0 == *other
            }
        }

        impl Add<u64> for $main {
            type Output = $main;

            fn add(self, other: u64) -> $main {
                $main(self.0.saturating_add(other))
            }
        }

        impl AddAssign<u64> for $main {
            fn add_assign(&mut self, other: u64) {
                self.0 = self.0.saturating_add(other);
            }
        }

        impl Sub<u64> for $main {
            type Output = $main;

            fn sub(self, other: u64) -> $main {
                $main(self.0.saturating_sub(other))
            }
        }

        impl SubAssign<u64> for $main {
            fn sub_assign(&mut self, other: u64) {
                self.0 = self.0.saturating_sub(other);
            }
        }

        impl Rem<u64> for $main {
            type Output = u64;

            fn rem(self, modulus: u64) -> u64 {
                self.0 % modulus
            }
        }

        impl FromStr for $main {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<$main, Self::Err> {
                u64::from_str(s).map($main)
            }
        }

        impl fmt::Display for $main {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $main {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({})", stringify!($main), self.0)
            }
        }
    };
}

impl_common!(Slot);
impl_common!(Epoch);

impl Slot {
    pub const fn new(slot: u64) -> Slot {
        Slot(slot)
    }

    pub fn epoch(self, slots_per_epoch: u64) -> Epoch {
        Epoch::new(self.0 / slots_per_epoch)
    }

    pub fn max_value() -> Slot {
        Slot(u64::MAX)
    }
}

impl Epoch {
    pub const fn new(epoch: u64) -> Epoch {
        Epoch(epoch)
    }

    pub fn max_value() -> Epoch {
        Epoch(u64::MAX)
    }

    /// The first slot in the epoch.
    pub fn start_slot(self, slots_per_epoch: u64) -> Slot {
        Slot::from(self.0.saturating_mul(slots_per_epoch))
    }

    /// The last slot in the epoch.
    pub fn end_slot(self, slots_per_epoch: u64) -> Slot {
        Slot::from(
            self.0
                .saturating_mul(slots_per_epoch)
                .saturating_add(slots_per_epoch.saturating_sub(1)),
        )
    }

    /// Position of some slot inside an epoch, if any.
    ///
    /// E.g., the first `slot` in `epoch` is at position `0`.
    pub fn position(self, slot: Slot, slots_per_epoch: u64) -> Option<usize> {
        let start = self.start_slot(slots_per_epoch);
        let end = self.end_slot(slots_per_epoch);

        if slot >= start && slot <= end {
            slot.as_usize().checked_sub(start.as_usize())
        } else {
            None
        }
    }

    pub fn slot_iter(&self, slots_per_epoch: u64) -> SlotIter {
        SlotIter {
            current_iteration: 0,
            epoch: *self,
            slots_per_epoch,
        }
    }
}

pub struct SlotIter {
    current_iteration: u64,
    epoch: Epoch,
    slots_per_epoch: u64,
}

impl Iterator for SlotIter {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        if self.current_iteration >= self.slots_per_epoch {
            None
        } else {
            let start_slot = self.epoch.start_slot(self.slots_per_epoch);
            let previous = self.current_iteration;
            self.current_iteration = self.current_iteration.checked_add(1)?;
            Some(start_slot + previous)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_start_end() {
        let slots_per_epoch = 8;

        let epoch = Epoch::new(0);

        assert_eq!(epoch.start_slot(slots_per_epoch), Slot::new(0));
        assert_eq!(epoch.end_slot(slots_per_epoch), Slot::new(7));
    }

    #[test]
    fn end_slot_boundary() {
        let slots_per_epoch = 32;

        // The last epoch which can be represented by u64.
        let epoch = Epoch::new(u64::MAX / slots_per_epoch);

        assert_eq!(epoch.end_slot(slots_per_epoch), Slot::new(u64::MAX));
    }

    #[test]
    fn position() {
        let slots_per_epoch = 8;

        let epoch = Epoch::new(1);
        assert_eq!(epoch.position(Slot::new(7), slots_per_epoch), None);
        assert_eq!(epoch.position(Slot::new(8), slots_per_epoch), Some(0));
        assert_eq!(epoch.position(Slot::new(15), slots_per_epoch), Some(7));
        assert_eq!(epoch.position(Slot::new(16), slots_per_epoch), None);
    }

    #[test]
    fn slot_iter() {
        let slots_per_epoch = 8;

        let epoch = Epoch::new(1);
        let slots: Vec<Slot> = epoch.slot_iter(slots_per_epoch).collect();

        assert_eq!(slots.len(), slots_per_epoch as usize);
        for i in 0..slots_per_epoch {
            assert_eq!(Slot::from(slots_per_epoch + i), slots[i as usize])
        }
    }

    #[test]
    fn saturating_math() {
        assert_eq!(Slot::new(1) - 5, Slot::new(0));
        assert_eq!(Epoch::new(u64::MAX) + 1, Epoch::new(u64::MAX));
        assert_eq!(Slot::new(33).epoch(32), Epoch::new(1));
    }

    #[test]
    fn quoted_serde() {
        let slot: Slot = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(slot, Slot::new(42));
        assert_eq!(serde_json::to_string(&slot).unwrap(), "\"42\"");
    }
}
