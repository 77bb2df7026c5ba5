//! Platform services the engine needs from the kernel.
//!
//! The translator and request table never touch page tables or physical
//! memory directly. Everything goes through a [`DmaHal`] so the same code runs
//! inside the kernel and against the simulated platform in [`crate::testing`].

use core::ptr::NonNull;
use core::time::Duration;

use x86_64::{PhysAddr, VirtAddr};

use crate::{HardwareRestrictions, IoError};

/// Size of the pages the platform maps and locks.
pub const PAGE_SIZE: usize = 4096;

/// Identifies the team (process) that owns a user address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TeamId(pub u32);

/// Address space a virtual address is interpreted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressSpace {
    Kernel,
    User(TeamId),
}

/// A physically contiguous run backing part of a virtual range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRun {
    pub address: PhysAddr,
    pub len: usize,
}

/// A physically contiguous region returned by [`DmaHal::allocate_contiguous`].
///
/// `virt` is a kernel pointer to the same memory, valid until the region is
/// passed to [`DmaHal::free_contiguous`].
#[derive(Debug)]
pub struct DmaRegion {
    pub phys: PhysAddr,
    pub virt: NonNull<u8>,
    pub size: usize,
}

// Safety: the region is plain memory owned by whoever holds the descriptor.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

/// Kernel services used for DMA translation and caller-memory copies.
///
/// # Safety
///
/// `allocate_contiguous` must return memory that is physically contiguous,
/// mapped at `virt` for the whole `size`, satisfies the given restrictions,
/// and stays valid until freed. The crate writes through `virt` without
/// further checks.
pub unsafe trait DmaHal: Send + Sync {
    /// Allocate `size` bytes of contiguous memory usable under `restrictions`.
    fn allocate_contiguous(
        &self,
        size: usize,
        restrictions: &HardwareRestrictions,
    ) -> Result<DmaRegion, IoError>;

    /// Release a region from [`DmaHal::allocate_contiguous`].
    ///
    /// # Safety
    ///
    /// No reference into the region may outlive this call.
    unsafe fn free_contiguous(&self, region: &DmaRegion);

    /// The physically contiguous run starting at `vaddr`, at most `len` bytes.
    ///
    /// Returns `None` if `vaddr` is not mapped.
    fn translate(&self, space: AddressSpace, vaddr: VirtAddr, len: usize) -> Option<PhysRun>;

    /// Pin a virtual range so it stays resident for the duration of a transfer.
    fn lock_memory(
        &self,
        space: AddressSpace,
        vaddr: VirtAddr,
        len: usize,
        device_writes: bool,
    ) -> Result<(), IoError>;

    fn unlock_memory(&self, space: AddressSpace, vaddr: VirtAddr, len: usize, device_writes: bool);

    fn read_virtual(
        &self,
        space: AddressSpace,
        vaddr: VirtAddr,
        buf: &mut [u8],
    ) -> Result<(), IoError>;

    fn write_virtual(
        &self,
        space: AddressSpace,
        vaddr: VirtAddr,
        data: &[u8],
    ) -> Result<(), IoError>;

    fn read_physical(&self, paddr: PhysAddr, buf: &mut [u8]) -> Result<(), IoError>;

    fn write_physical(&self, paddr: PhysAddr, data: &[u8]) -> Result<(), IoError>;

    /// Map one physical page into the kernel address space.
    fn map_physical_page(&self, paddr: PhysAddr) -> Result<VirtAddr, IoError>;

    fn unmap_physical_page(&self, vaddr: VirtAddr);

    /// Team of the calling thread.
    fn current_team(&self) -> TeamId;

    /// Monotonic time since boot.
    fn uptime(&self) -> Duration;

    /// Pause inside a wait loop.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}
