//! Key-to-slot addressing.
//!
//! A key is mapped to its slot by a 64-bit xxHash reduced modulo the slot
//! count. The slot count must be a power of two so the reduction is a
//! bitmask, which keeps addressing O(1) with no probe sequence.
//!
//! There is deliberately no collision resolution: two keys that land on the
//! same slot overwrite each other. Callers size the table so collisions stay
//! negligible for their key cardinality.

use crate::error::{Result, TallyError};
use crate::store::slot::SLOT_SIZE;
use xxhash_rust::xxh64::xxh64;

/// Maps textual keys to byte offsets inside the slot table region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotAddresser {
    slot_mask: u64,
}

impl SlotAddresser {
    /// Creates an addresser for a table of `slot_count` slots.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::InvalidSlotCount`] if `slot_count` is zero or
    /// not a power of two.
    pub(crate) fn new(slot_count: u64) -> Result<Self> {
        if slot_count == 0 || !slot_count.is_power_of_two() {
            return Err(TallyError::InvalidSlotCount(slot_count));
        }
        Ok(Self {
            slot_mask: slot_count - 1,
        })
    }

    /// Byte offset of `key`'s slot, relative to the start of the slot array.
    pub(crate) fn slot_offset(&self, key: &str) -> u64 {
        (xxh64(key.as_bytes(), 0) & self.slot_mask) * SLOT_SIZE
    }

    /// 64-bit fingerprint of an arbitrary byte string.
    ///
    /// Used for merge-descriptor source-set fingerprints; unlike
    /// [`slot_offset`](Self::slot_offset) the full hash is kept so drift
    /// detection does not weaken with small tables.
    pub(crate) fn fingerprint(data: &[u8]) -> u64 {
        xxh64(data, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two() {
        assert!(SlotAddresser::new(0).is_err());
        assert!(SlotAddresser::new(1000).is_err());
        assert!(SlotAddresser::new(1024).is_ok());
    }

    #[test]
    fn offsets_are_slot_aligned_and_bounded() {
        let addresser = SlotAddresser::new(64).unwrap();
        for key in ["users/1/order_count", "product/stock", "a", ""] {
            let offset = addresser.slot_offset(key);
            assert_eq!(offset % SLOT_SIZE, 0);
            assert!(offset < 64 * SLOT_SIZE);
        }
    }

    #[test]
    fn offset_is_deterministic() {
        let addresser = SlotAddresser::new(1 << 20).unwrap();
        assert_eq!(
            addresser.slot_offset("users/1/order_count"),
            addresser.slot_offset("users/1/order_count")
        );
    }
}
