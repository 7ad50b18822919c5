use crate::beacon_client::types::{
    BeaconBlockBody, SignedBeaconBlock, SignedBeaconBlockHeader,
};
use crate::types::{Hash256, Slot};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// One observed block variant at a slot.
///
/// Everything except the `orphaned` flag is immutable after insertion into
/// the slot cache. The flag is only flipped by the ingestion loop while it
/// holds the cache write latch; readers may observe it at any time.
pub struct BlockInfo {
    root: Hash256,
    header: SignedBeaconBlockHeader,
    block: SignedBeaconBlock,
    orphaned: AtomicBool,
}

impl BlockInfo {
    pub fn new(root: Hash256, header: SignedBeaconBlockHeader, block: SignedBeaconBlock) -> Self {
        BlockInfo {
            root,
            header,
            block,
            orphaned: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> Hash256 {
        self.root
    }

    pub fn slot(&self) -> Slot {
        self.header.message.slot
    }

    pub fn parent_root(&self) -> Hash256 {
        self.header.message.parent_root
    }

    pub fn state_root(&self) -> Hash256 {
        self.header.message.state_root
    }

    pub fn proposer_index(&self) -> u64 {
        self.header.message.proposer_index
    }

    pub fn header(&self) -> &SignedBeaconBlockHeader {
        &self.header
    }

    pub fn block(&self) -> &SignedBeaconBlock {
        &self.block
    }

    pub fn body(&self) -> &BeaconBlockBody {
        &self.block.message.body
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::Acquire)
    }

    pub(crate) fn set_orphaned(&self, orphaned: bool) {
        self.orphaned.store(orphaned, Ordering::Release);
    }
}

impl fmt::Debug for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockInfo")
            .field("slot", &self.slot())
            .field("root", &self.root)
            .field("orphaned", &self.is_orphaned())
            .finish()
    }
}
