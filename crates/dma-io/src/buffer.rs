//! Caller memory described by a request.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use x86_64::{PhysAddr, VirtAddr};

use crate::{AddressSpace, DmaHal, IoError, PAGE_SIZE};

/// One (address, length) piece of caller memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub base: u64,
    pub len: usize,
}

impl IoVec {
    pub const fn new(base: u64, len: usize) -> Self {
        Self { base, len }
    }
}

/// How the addresses in a [`TransferBuffer`] are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Physical,
    /// Kernel virtual addresses.
    Kernel,
    /// Virtual addresses in the requesting team's address space.
    User,
}

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;
const RELEASED: u8 = 2;

/// The memory a request reads into or writes from.
///
/// Memory can be locked and unlocked once per buffer lifetime; a request
/// locks user memory before translation and unlocks it when it is notified.
#[derive(Debug)]
pub struct TransferBuffer {
    kind: BufferKind,
    vecs: Vec<IoVec>,
    length: usize,
    lock_state: AtomicU8,
}

impl TransferBuffer {
    /// Buffer over physical memory.
    pub fn physical(vecs: Vec<IoVec>) -> Result<Self, IoError> {
        for vec in &vecs {
            PhysAddr::try_new(vec.base).map_err(|_| IoError::InvalidArgument)?;
        }
        Ok(Self::new(BufferKind::Physical, vecs))
    }

    /// Buffer over kernel virtual memory.
    pub fn kernel(vecs: Vec<IoVec>) -> Result<Self, IoError> {
        Self::virtual_buffer(BufferKind::Kernel, vecs)
    }

    /// Buffer over the requesting team's user memory.
    pub fn user(vecs: Vec<IoVec>) -> Result<Self, IoError> {
        Self::virtual_buffer(BufferKind::User, vecs)
    }

    fn virtual_buffer(kind: BufferKind, vecs: Vec<IoVec>) -> Result<Self, IoError> {
        for vec in &vecs {
            VirtAddr::try_new(vec.base).map_err(|_| IoError::InvalidArgument)?;
        }
        Ok(Self::new(kind, vecs))
    }

    fn new(kind: BufferKind, vecs: Vec<IoVec>) -> Self {
        let length = vecs.iter().map(|vec| vec.len).sum();
        Self {
            kind,
            vecs,
            length,
            lock_state: AtomicU8::new(UNLOCKED),
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn is_physical(&self) -> bool {
        self.kind == BufferKind::Physical
    }

    pub fn is_user(&self) -> bool {
        self.kind == BufferKind::User
    }

    pub fn vecs(&self) -> &[IoVec] {
        &self.vecs
    }

    pub fn vec_count(&self) -> usize {
        self.vecs.len()
    }

    /// Total bytes described by all vectors.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_memory_locked(&self) -> bool {
        self.lock_state.load(Ordering::Acquire) == LOCKED
    }

    /// Lock every vector in `space`.
    ///
    /// Physical buffers need no locking but still consume the single lock
    /// cycle. If one vector fails, the ones already locked are unlocked again.
    pub fn lock_memory(
        &self,
        hal: &dyn DmaHal,
        space: AddressSpace,
        is_write: bool,
    ) -> Result<(), IoError> {
        if self
            .lock_state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("dma-io: transfer buffer locked twice");
            return Err(IoError::InvalidArgument);
        }

        if self.is_physical() {
            return Ok(());
        }

        // A write request means the device reads this memory.
        let device_writes = !is_write;
        for (index, vec) in self.vecs.iter().enumerate() {
            let result = hal.lock_memory(space, VirtAddr::new(vec.base), vec.len, device_writes);
            if let Err(err) = result {
                for locked in &self.vecs[..index] {
                    hal.unlock_memory(space, VirtAddr::new(locked.base), locked.len, device_writes);
                }
                self.lock_state.store(UNLOCKED, Ordering::Release);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Undo [`lock_memory`](Self::lock_memory). Does nothing if not locked.
    pub fn unlock_memory(&self, hal: &dyn DmaHal, space: AddressSpace, is_write: bool) {
        if self
            .lock_state
            .compare_exchange(LOCKED, RELEASED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if self.is_physical() {
            return;
        }

        for vec in &self.vecs {
            hal.unlock_memory(space, VirtAddr::new(vec.base), vec.len, !is_write);
        }
    }

    /// Build a buffer over `length` bytes starting `offset` bytes in.
    ///
    /// The first vector is trimmed by the in-vector offset and the last one is
    /// truncated to the end of the range.
    pub(crate) fn slice(&self, offset: usize, length: usize) -> Result<Self, IoError> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= self.length)
            .ok_or(IoError::InvalidArgument)?;

        let mut vecs = Vec::new();
        vecs.try_reserve(self.vecs.len())
            .map_err(|_| IoError::AllocationFailure)?;

        let mut position = 0;
        for vec in &self.vecs {
            let vec_end = position + vec.len;
            if vec_end > offset && position < end {
                let skip = offset.saturating_sub(position);
                let len = vec_end.min(end) - position - skip;
                vecs.push(IoVec::new(vec.base + skip as u64, len));
            }
            position = vec_end;
            if position >= end {
                break;
            }
        }

        Ok(Self::new(self.kind, vecs))
    }

    /// Iterate over `length` bytes starting at `offset` as kernel-reachable
    /// virtual runs.
    ///
    /// Virtual buffers yield their own vectors, clipped to the range. Physical
    /// buffers are mapped one page at a time; each yielded address stays
    /// mapped until the next call to `next` or until the iterator is dropped.
    pub fn virtual_vecs<'a>(
        &'a self,
        hal: &'a dyn DmaHal,
        offset: usize,
        length: usize,
    ) -> VirtualVecs<'a> {
        VirtualVecs {
            buffer: self,
            hal,
            vec_index: 0,
            vec_offset: 0,
            skip: offset,
            left: length.min(self.length.saturating_sub(offset)),
            mapping: None,
        }
    }
}

/// A kernel-reachable piece of a [`TransferBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualVec {
    pub address: VirtAddr,
    pub len: usize,
}

/// A physical page temporarily mapped into the kernel. Unmapped on drop.
pub struct PageMapping<'a> {
    hal: &'a dyn DmaHal,
    page: VirtAddr,
}

impl<'a> PageMapping<'a> {
    pub fn new(hal: &'a dyn DmaHal, page: PhysAddr) -> Result<Self, IoError> {
        let page = hal.map_physical_page(page)?;
        Ok(Self { hal, page })
    }

    pub fn address(&self) -> VirtAddr {
        self.page
    }
}

impl core::fmt::Debug for PageMapping<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageMapping").field("page", &self.page).finish()
    }
}

impl Drop for PageMapping<'_> {
    fn drop(&mut self) {
        self.hal.unmap_physical_page(self.page);
    }
}

/// Iterator returned by [`TransferBuffer::virtual_vecs`].
pub struct VirtualVecs<'a> {
    buffer: &'a TransferBuffer,
    hal: &'a dyn DmaHal,
    vec_index: usize,
    vec_offset: usize,
    skip: usize,
    left: usize,
    mapping: Option<PageMapping<'a>>,
}

impl Iterator for VirtualVecs<'_> {
    type Item = Result<VirtualVec, IoError>;

    fn next(&mut self) -> Option<Self::Item> {
        // The previous page is no longer needed once the caller asks for more.
        self.mapping = None;

        let vecs = self.buffer.vecs();
        while self.skip > 0 && self.vec_index < vecs.len() {
            let available = vecs[self.vec_index].len - self.vec_offset;
            if self.skip < available {
                self.vec_offset += self.skip;
                self.skip = 0;
            } else {
                self.skip -= available;
                self.vec_index += 1;
                self.vec_offset = 0;
            }
        }

        while self.left > 0 && self.vec_index < vecs.len() {
            let vec = vecs[self.vec_index];
            if self.vec_offset >= vec.len {
                self.vec_index += 1;
                self.vec_offset = 0;
                continue;
            }

            let base = vec.base + self.vec_offset as u64;
            let mut len = (vec.len - self.vec_offset).min(self.left);

            let address = if self.buffer.is_physical() {
                let page_offset = (base & (PAGE_SIZE as u64 - 1)) as usize;
                len = len.min(PAGE_SIZE - page_offset);
                let page = PhysAddr::new(base - page_offset as u64);
                let mapping = match PageMapping::new(self.hal, page) {
                    Ok(mapping) => mapping,
                    Err(err) => {
                        self.left = 0;
                        return Some(Err(err));
                    }
                };
                let address = mapping.address() + page_offset as u64;
                self.mapping = Some(mapping);
                address
            } else {
                VirtAddr::new(base)
            };

            self.vec_offset += len;
            self.left -= len;
            return Some(Ok(VirtualVec { address, len }));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PageLayout, SimulatedMemory};
    use alloc::vec;

    #[test]
    fn slice_trims_first_and_truncates_last() {
        let buffer = TransferBuffer::kernel(vec![
            IoVec::new(0x1000, 100),
            IoVec::new(0x3000, 200),
            IoVec::new(0x5000, 300),
        ])
        .unwrap();

        let slice = buffer.slice(150, 250).unwrap();
        assert_eq!(
            slice.vecs(),
            &[IoVec::new(0x3000 + 50, 150), IoVec::new(0x5000, 100)]
        );
        assert_eq!(slice.length(), 250);

        let inner = buffer.slice(10, 20).unwrap();
        assert_eq!(inner.vecs(), &[IoVec::new(0x1000 + 10, 20)]);

        assert_eq!(buffer.slice(500, 200).err(), Some(IoError::InvalidArgument));
    }

    #[test]
    fn rejects_non_canonical_virtual_address() {
        let err = TransferBuffer::user(vec![IoVec::new(0x0000_8000_0000_0000, 16)]).unwrap_err();
        assert_eq!(err, IoError::InvalidArgument);
    }

    #[test]
    fn lock_is_single_cycle() {
        let memory = SimulatedMemory::new(64 * PAGE_SIZE);
        let space = AddressSpace::Kernel;
        memory.map(space, 0x40_0000, 2 * PAGE_SIZE, PageLayout::Contiguous);
        let buffer = TransferBuffer::kernel(vec![IoVec::new(0x40_0000, 2 * PAGE_SIZE)]).unwrap();

        buffer.lock_memory(&*memory, space, false).unwrap();
        assert!(buffer.is_memory_locked());
        assert_eq!(memory.locked_pages(), 2);
        assert_eq!(
            buffer.lock_memory(&*memory, space, false),
            Err(IoError::InvalidArgument)
        );

        buffer.unlock_memory(&*memory, space, false);
        assert!(!buffer.is_memory_locked());
        assert_eq!(memory.locked_pages(), 0);
        assert_eq!(
            buffer.lock_memory(&*memory, space, false),
            Err(IoError::InvalidArgument)
        );
    }

    #[test]
    fn failed_lock_rolls_back() {
        let memory = SimulatedMemory::new(64 * PAGE_SIZE);
        let space = AddressSpace::Kernel;
        memory.map(space, 0x40_0000, PAGE_SIZE, PageLayout::Contiguous);
        let buffer = TransferBuffer::kernel(vec![
            IoVec::new(0x40_0000, PAGE_SIZE),
            IoVec::new(0x80_0000, PAGE_SIZE),
        ])
        .unwrap();

        assert!(buffer.lock_memory(&*memory, space, true).is_err());
        assert_eq!(memory.locked_pages(), 0);
        assert!(!buffer.is_memory_locked());
    }

    #[test]
    fn physical_vecs_are_mapped_page_by_page() {
        let memory = SimulatedMemory::new(64 * PAGE_SIZE);
        let phys = memory.allocate_physical(3 * PAGE_SIZE);
        let buffer = TransferBuffer::physical(vec![IoVec::new(phys + 100, 2 * PAGE_SIZE)]).unwrap();

        let mut lengths = Vec::new();
        for vec in buffer.virtual_vecs(&*memory, 0, buffer.length()) {
            let vec = vec.unwrap();
            assert_eq!(memory.mapped_pages(), 1);
            lengths.push(vec.len);
        }
        assert_eq!(lengths, vec![PAGE_SIZE - 100, PAGE_SIZE, 100]);
        assert_eq!(memory.mapped_pages(), 0);
    }

    #[test]
    fn abandoned_iteration_releases_mapping() {
        let memory = SimulatedMemory::new(64 * PAGE_SIZE);
        let phys = memory.allocate_physical(4 * PAGE_SIZE);
        let buffer = TransferBuffer::physical(vec![IoVec::new(phys, 4 * PAGE_SIZE)]).unwrap();

        let mut iter = buffer.virtual_vecs(&*memory, PAGE_SIZE, 2 * PAGE_SIZE);
        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.len, PAGE_SIZE);
        assert_eq!(memory.mapped_pages(), 1);
        drop(iter);
        assert_eq!(memory.mapped_pages(), 0);
    }

    #[test]
    fn virtual_vecs_clip_to_range() {
        let memory = SimulatedMemory::new(16 * PAGE_SIZE);
        let buffer =
            TransferBuffer::kernel(vec![IoVec::new(0x1000, 100), IoVec::new(0x9000, 100)]).unwrap();

        let vecs: Vec<_> = buffer
            .virtual_vecs(&*memory, 50, 100)
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            vecs,
            vec![
                VirtualVec {
                    address: VirtAddr::new(0x1000 + 50),
                    len: 50
                },
                VirtualVec {
                    address: VirtAddr::new(0x9000),
                    len: 50
                },
            ]
        );
    }
}
