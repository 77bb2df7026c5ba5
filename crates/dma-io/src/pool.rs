//! Scatter/gather and staging buffer pools owned by a translator.
//!
//! Both pools live behind one spinlock that is only held while entries are
//! popped or pushed. Buffers find their way home on their own: dropping a
//! [`ScatterGatherBuffer`] returns its storage, and dropping a
//! [`LoanedStagingBuffer`] returns the staging region.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::slice;

use spinning_top::Spinlock;
use x86_64::PhysAddr;

use crate::{DmaHal, DmaRegion, HardwareRestrictions, IoError};

/// One device-visible (physical address, length) segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    pub address: PhysAddr,
    pub len: usize,
}

impl DmaSegment {
    pub fn new(address: u64, len: usize) -> Self {
        Self {
            address: PhysAddr::new(address),
            len,
        }
    }

    /// First address past the segment.
    pub fn end(&self) -> u64 {
        self.address.as_u64() + self.len as u64
    }
}

/// A pre-allocated, physically contiguous staging region.
#[derive(Debug)]
pub(crate) struct StagingBuffer {
    region: DmaRegion,
}

/// Backing vectors of a scatter/gather buffer, kept while it sits in the pool.
struct SgStorage {
    slot: usize,
    segments: Vec<DmaSegment>,
    runs: Vec<DmaSegment>,
    view: Vec<DmaSegment>,
}

struct PoolState {
    buffers: Vec<SgStorage>,
    in_pool: Vec<bool>,
    staging: Vec<StagingBuffer>,
}

pub(crate) struct BufferPools {
    hal: Arc<dyn DmaHal>,
    state: Spinlock<PoolState>,
    buffer_count: usize,
    staging_count: usize,
    staging_size: usize,
}

impl BufferPools {
    /// Allocate `buffer_count` scatter/gather buffers with room for
    /// `max_segments` segments each, and `staging_count` staging regions.
    pub(crate) fn new(
        hal: Arc<dyn DmaHal>,
        restrictions: &HardwareRestrictions,
        buffer_count: usize,
        staging_count: usize,
        staging_size: usize,
    ) -> Result<Arc<Self>, IoError> {
        let max_segments = restrictions.max_segment_count;
        let mut buffers = Vec::new();
        buffers
            .try_reserve_exact(buffer_count)
            .map_err(|_| IoError::AllocationFailure)?;
        for slot in 0..buffer_count {
            buffers.push(SgStorage {
                slot,
                segments: Vec::with_capacity(max_segments),
                runs: Vec::with_capacity(max_segments),
                view: Vec::with_capacity(max_segments),
            });
        }

        let mut pools = Self {
            hal: hal.clone(),
            state: Spinlock::new(PoolState {
                buffers,
                in_pool: alloc::vec![true; buffer_count],
                staging: Vec::with_capacity(staging_count),
            }),
            buffer_count,
            staging_count,
            staging_size,
        };

        for _ in 0..staging_count {
            // Regions allocated so far are freed when `pools` drops.
            let region = hal
                .allocate_contiguous(staging_size, restrictions)
                .map_err(|err| {
                    log::debug!("dma-io: staging allocation of {} bytes failed", staging_size);
                    match err {
                        IoError::ConstraintUnsatisfiable => err,
                        _ => IoError::AllocationFailure,
                    }
                })?;
            pools.state.get_mut().staging.push(StagingBuffer { region });
        }

        Ok(Arc::new(pools))
    }

    pub(crate) fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub(crate) fn staging_count(&self) -> usize {
        self.staging_count
    }

    pub(crate) fn staging_size(&self) -> usize {
        self.staging_size
    }

    pub(crate) fn available_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub(crate) fn available_staging(&self) -> usize {
        self.state.lock().staging.len()
    }

    pub(crate) fn take_buffer(self: &Arc<Self>) -> Option<ScatterGatherBuffer> {
        let storage = {
            let mut state = self.state.lock();
            let storage = state.buffers.pop()?;
            state.in_pool[storage.slot] = false;
            storage
        };

        Some(ScatterGatherBuffer {
            slot: storage.slot,
            segments: storage.segments,
            runs: storage.runs,
            view: storage.view,
            staging: None,
            staging_used: 0,
            pools: self.clone(),
        })
    }

    pub(crate) fn take_staging(self: &Arc<Self>) -> Option<LoanedStagingBuffer> {
        let buffer = self.state.lock().staging.pop()?;
        Some(LoanedStagingBuffer {
            buffer: Some(buffer),
            pools: self.clone(),
        })
    }

    fn return_buffer(&self, mut storage: SgStorage) {
        storage.segments.clear();
        storage.runs.clear();
        storage.view.clear();

        let mut state = self.state.lock();
        assert!(
            !state.in_pool[storage.slot],
            "scatter/gather buffer {} recycled twice",
            storage.slot
        );
        state.in_pool[storage.slot] = true;
        state.buffers.push(storage);
    }

    fn return_staging(&self, buffer: StagingBuffer) {
        self.state.lock().staging.push(buffer);
    }
}

impl Drop for BufferPools {
    fn drop(&mut self) {
        for buffer in self.state.get_mut().staging.drain(..) {
            // Safety: every loan holds a reference to the pools, so no staging
            // region is in use once the pools drop.
            unsafe { self.hal.free_contiguous(&buffer.region) };
        }
    }
}

/// A staging region on loan from a translator's pool.
///
/// The region goes back to the pool when the loan is dropped.
pub struct LoanedStagingBuffer {
    buffer: Option<StagingBuffer>,
    pools: Arc<BufferPools>,
}

impl LoanedStagingBuffer {
    fn region(&self) -> &DmaRegion {
        match &self.buffer {
            Some(buffer) => &buffer.region,
            None => unreachable!("staging loan used after release"),
        }
    }

    pub fn physical_address(&self) -> PhysAddr {
        self.region().phys
    }

    pub fn size(&self) -> usize {
        self.region().size
    }

    /// Whether `address` lies inside this staging region.
    pub fn contains(&self, address: PhysAddr) -> bool {
        let start = self.physical_address();
        address >= start && address.as_u64() < start.as_u64() + self.size() as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        let region = self.region();
        // Safety: the loan grants exclusive use of a region that stays mapped
        // for the pool's lifetime, and the loan keeps the pool alive.
        unsafe { slice::from_raw_parts(region.virt.as_ptr(), region.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let region = self.region();
        // Safety: see `as_slice`; `&mut self` makes the access unique.
        unsafe { slice::from_raw_parts_mut(region.virt.as_ptr(), region.size) }
    }
}

impl Drop for LoanedStagingBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pools.return_staging(buffer);
        }
    }
}

impl core::fmt::Debug for LoanedStagingBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoanedStagingBuffer")
            .field("phys", &self.physical_address())
            .field("size", &self.size())
            .finish()
    }
}

/// A reusable list of device segments, possibly backed by a staging loan.
///
/// Obtained from [`DmaTranslator::translate_next`](crate::DmaTranslator::translate_next)
/// as part of an [`Operation`](crate::Operation). Dropping it returns the
/// storage and any staging loan to the pools it came from.
pub struct ScatterGatherBuffer {
    slot: usize,
    segments: Vec<DmaSegment>,
    /// Physical runs of caller memory resolved during translation.
    pub(crate) runs: Vec<DmaSegment>,
    /// Segments of the current operation phase.
    pub(crate) view: Vec<DmaSegment>,
    staging: Option<LoanedStagingBuffer>,
    staging_used: usize,
    pools: Arc<BufferPools>,
}

impl ScatterGatherBuffer {
    pub fn segments(&self) -> &[DmaSegment] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Sum of all segment lengths.
    pub fn length(&self) -> usize {
        self.segments.iter().map(|segment| segment.len).sum()
    }

    pub fn staging(&self) -> Option<&LoanedStagingBuffer> {
        self.staging.as_ref()
    }

    pub(crate) fn staging_mut(&mut self) -> Option<&mut LoanedStagingBuffer> {
        self.staging.as_mut()
    }

    /// Bytes of the staging loan handed out to segments so far.
    pub fn staging_used(&self) -> usize {
        self.staging_used
    }

    pub fn uses_staging(&self) -> bool {
        self.staging_used > 0
    }

    /// Whether `segment` points into this buffer's staging region.
    pub fn is_staged(&self, segment: &DmaSegment) -> bool {
        self.staging
            .as_ref()
            .is_some_and(|staging| staging.contains(segment.address))
    }

    pub(crate) fn belongs_to(&self, pools: &Arc<BufferPools>) -> bool {
        Arc::ptr_eq(&self.pools, pools)
    }

    pub(crate) fn set_staging(&mut self, staging: LoanedStagingBuffer) {
        self.staging = Some(staging);
        self.staging_used = 0;
    }

    /// Give the staging loan back early if no segment ended up using it.
    pub(crate) fn release_unused_staging(&mut self) {
        if self.staging_used == 0 {
            self.staging = None;
        }
    }

    pub(crate) fn staging_left(&self) -> usize {
        self.staging
            .as_ref()
            .map_or(0, |staging| staging.size() - self.staging_used)
    }

    pub(crate) fn push_segment(&mut self, segment: DmaSegment) {
        self.segments.push(segment);
    }

    pub(crate) fn last_segment_mut(&mut self) -> Option<&mut DmaSegment> {
        self.segments.last_mut()
    }

    /// Physical address where the next staged byte goes.
    pub(crate) fn staging_cursor(&self) -> Option<PhysAddr> {
        self.staging
            .as_ref()
            .map(|staging| staging.physical_address() + self.staging_used as u64)
    }

    pub(crate) fn consume_staging(&mut self, len: usize) {
        self.staging_used += len;
    }

    /// Remove `len` bytes from the end of the segment list, releasing staging
    /// space used by the removed bytes.
    pub(crate) fn cut_back(&mut self, mut len: usize) {
        while len > 0 {
            let Some(last) = self.segments.last().copied() else {
                break;
            };
            let staged = self.is_staged(&last);
            let cut = last.len.min(len);
            if cut == last.len {
                self.segments.pop();
            } else if let Some(segment) = self.segments.last_mut() {
                segment.len -= cut;
            }
            if staged {
                self.staging_used -= cut;
            }
            len -= cut;
        }
    }

    /// Fill the phase view with the segment bytes `[skip, skip + len)`.
    pub(crate) fn build_view(&mut self, mut skip: usize, mut len: usize) {
        self.view.clear();
        for segment in &self.segments {
            if len == 0 {
                break;
            }
            if skip >= segment.len {
                skip -= segment.len;
                continue;
            }
            let take = (segment.len - skip).min(len);
            self.view.push(DmaSegment {
                address: segment.address + skip as u64,
                len: take,
            });
            skip = 0;
            len -= take;
        }
    }

    pub(crate) fn clear_segments(&mut self) {
        self.segments.clear();
        self.staging_used = 0;
    }
}

impl Drop for ScatterGatherBuffer {
    fn drop(&mut self) {
        self.staging = None;
        self.pools.return_buffer(SgStorage {
            slot: self.slot,
            segments: core::mem::take(&mut self.segments),
            runs: core::mem::take(&mut self.runs),
            view: core::mem::take(&mut self.view),
        });
    }
}

impl core::fmt::Debug for ScatterGatherBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScatterGatherBuffer")
            .field("slot", &self.slot)
            .field("segments", &self.segments)
            .field("staging", &self.staging)
            .field("staging_used", &self.staging_used)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedMemory;

    fn pools(buffers: usize, staging: usize) -> (Arc<SimulatedMemory>, Arc<BufferPools>) {
        let memory = SimulatedMemory::new(256 * 1024);
        let restrictions = HardwareRestrictions::default().normalized();
        let pools =
            BufferPools::new(memory.clone(), &restrictions, buffers, staging, 8192).unwrap();
        (memory, pools)
    }

    #[test]
    fn dropped_buffer_returns_to_pool() {
        let (_memory, pools) = pools(2, 1);
        let a = pools.take_buffer().unwrap();
        let b = pools.take_buffer().unwrap();
        assert!(pools.take_buffer().is_none());
        drop(a);
        assert_eq!(pools.available_buffers(), 1);
        drop(b);
        assert_eq!(pools.available_buffers(), 2);
    }

    #[test]
    fn staging_loan_returns_with_its_buffer() {
        let (_memory, pools) = pools(1, 1);
        let mut buffer = pools.take_buffer().unwrap();
        buffer.set_staging(pools.take_staging().unwrap());
        assert_eq!(pools.available_staging(), 0);
        assert!(pools.take_staging().is_none());
        drop(buffer);
        assert_eq!(pools.available_staging(), 1);
    }

    #[test]
    fn unused_staging_is_released_early() {
        let (_memory, pools) = pools(1, 1);
        let mut buffer = pools.take_buffer().unwrap();
        buffer.set_staging(pools.take_staging().unwrap());
        buffer.release_unused_staging();
        assert_eq!(pools.available_staging(), 1);
        assert!(buffer.staging().is_none());
    }

    #[test]
    fn cut_back_restores_staging_space() {
        let (_memory, pools) = pools(1, 1);
        let mut buffer = pools.take_buffer().unwrap();
        buffer.set_staging(pools.take_staging().unwrap());
        let staging = buffer.staging_cursor().unwrap().as_u64();

        buffer.push_segment(DmaSegment::new(0x20_0000, 1024));
        buffer.push_segment(DmaSegment::new(staging, 1024));
        buffer.consume_staging(1024);

        buffer.cut_back(512);
        assert_eq!(buffer.staging_used(), 512);
        assert_eq!(buffer.length(), 1536);

        buffer.cut_back(1024);
        assert_eq!(buffer.staging_used(), 0);
        assert_eq!(buffer.segments(), &[DmaSegment::new(0x20_0000, 512)]);
    }

    #[test]
    fn staging_memory_is_writable() {
        let (memory, pools) = pools(1, 1);
        let mut loan = pools.take_staging().unwrap();
        loan.as_mut_slice()[..4].copy_from_slice(b"dma!");
        let mut read = [0u8; 4];
        memory
            .read_physical(loan.physical_address(), &mut read)
            .unwrap();
        assert_eq!(&read, b"dma!");
    }

    #[test]
    fn dropping_pools_frees_staging() {
        let (memory, pools) = pools(1, 2);
        assert_eq!(memory.contiguous_allocations(), 2);
        drop(pools);
        assert_eq!(memory.contiguous_allocations(), 0);
    }
}
