//! Device DMA constraints.

use crate::IoError;

/// Segment count assumed when a device does not report one.
pub const DEFAULT_MAX_SEGMENT_COUNT: usize = 16;

/// DMA constraints reported by a device.
///
/// Any field left at zero means "no restriction". [`normalized`] replaces
/// zeros with the unrestricted value so the translator never has to special
/// case them.
///
/// [`normalized`]: HardwareRestrictions::normalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareRestrictions {
    /// Lowest physical address the device can reach.
    pub low_address: u64,
    /// Exclusive upper bound on reachable physical addresses.
    pub high_address: u64,
    /// Required alignment of every segment's address and length.
    pub alignment: usize,
    /// Segments may not cross a multiple of this value.
    pub boundary: usize,
    pub max_transfer_size: usize,
    pub max_segment_count: usize,
    pub max_segment_size: usize,
}

impl HardwareRestrictions {
    /// Replace zero fields with their unrestricted values.
    pub fn normalized(&self) -> Self {
        fn or(value: usize, default: usize) -> usize {
            if value == 0 { default } else { value }
        }

        let mut normalized = Self {
            low_address: self.low_address,
            high_address: if self.high_address == 0 {
                u64::MAX
            } else {
                self.high_address
            },
            alignment: or(self.alignment, 1),
            boundary: self.boundary,
            max_transfer_size: or(self.max_transfer_size, usize::MAX),
            max_segment_count: or(self.max_segment_count, DEFAULT_MAX_SEGMENT_COUNT),
            max_segment_size: or(self.max_segment_size, usize::MAX),
        };

        if normalized.alignment.is_power_of_two() {
            normalized.max_segment_size &= !(normalized.alignment - 1);
        }

        // A transfer can never be longer than its segments can describe.
        let described = normalized
            .max_segment_size
            .saturating_mul(normalized.max_segment_count);
        if described < normalized.max_transfer_size {
            normalized.max_transfer_size = described;
        }

        normalized
    }

    /// Check that the (normalized) restrictions can carry whole blocks.
    ///
    /// Block size and alignment must be powers of two with alignment no larger
    /// than a block. A boundary, if set, must be a power of two no smaller
    /// than a block, and segments must be able to hold at least one aligned
    /// unit.
    pub fn validate(&self, block_size: usize) -> Result<(), IoError> {
        let valid = block_size.is_power_of_two()
            && self.alignment.is_power_of_two()
            && self.alignment <= block_size
            && self.max_segment_size >= self.alignment
            && self.max_transfer_size >= block_size
            && self.low_address < self.high_address
            && (self.boundary == 0
                || (self.boundary.is_power_of_two() && self.boundary >= block_size));

        if valid {
            Ok(())
        } else {
            log::debug!(
                "dma-io: unsatisfiable restrictions {:?} for block size {}",
                self,
                block_size
            );
            Err(IoError::ConstraintUnsatisfiable)
        }
    }

    /// Whether any transfer can require staging with these restrictions.
    pub fn needs_staging(&self, block_size: usize) -> bool {
        self.alignment > 1
            || self.low_address != 0
            || self.high_address != u64::MAX
            || block_size > 1
    }

    /// Whether `address` meets the alignment restriction.
    pub fn is_aligned(&self, address: u64) -> bool {
        address & (self.alignment as u64 - 1) == 0
    }
}
