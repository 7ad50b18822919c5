//! Core chain types shared by the client, the indexer and the database
//! layer.
//!
//! `Slot` and `Epoch` are type-safe wrappers over `u64`; roots are plain
//! 256-bit hashes since no hashing or signature verification happens in
//! this crate.

mod chain_spec;
mod slot_epoch;

pub use chain_spec::ChainSpec;
pub use slot_epoch::{Epoch, Slot, SlotIter};

pub type Hash256 = ethereum_types::H256;

pub type CommitteeIndex = u64;
pub type ValidatorIndex = u64;
