//! Simulated platform for exercising the engine without hardware.
//!
//! This module is only compiled for tests or when the `testing` feature is
//! enabled. [`SimulatedMemory`] implements [`DmaHal`] over a block of host
//! memory standing in for physical RAM, with per-team page tables that map
//! virtual pages onto it. [`SimulatedDisk`] plays the device: it checks every
//! operation against the device restrictions and moves bytes between its
//! contents and the operation's segments.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::time::Instant;

use spinning_top::Spinlock;
use x86_64::{PhysAddr, VirtAddr, align_up};

use crate::{
    AddressSpace, DmaHal, DmaRegion, DmaTranslator, HardwareRestrictions, IoError, Operation,
    PAGE_SIZE, PhysRun, RequestId, RequestTable, TeamId,
};

/// Physical address of the first byte of simulated RAM.
pub const PHYS_BASE: u64 = 0x10_0000;

/// Team the simulated caller belongs to unless changed.
pub const DEFAULT_TEAM: TeamId = TeamId(1);

/// Kernel addresses at and above this map physical memory one to one.
const PHYS_WINDOW: u64 = 0xffff_8000_0000_0000;

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// How [`SimulatedMemory::map`] picks the frames behind a virtual range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLayout {
    /// Consecutive frames, so the range is one physical run.
    Contiguous,
    /// Every page in a frame of its own with a hole after it.
    Scattered,
}

struct SimState {
    next_frame: u64,
    pages: BTreeMap<(AddressSpace, u64), u64>,
    locked: BTreeMap<(AddressSpace, u64), usize>,
    mapped_pages: usize,
    contiguous_allocations: usize,
    current_team: TeamId,
}

/// Host-backed physical memory with simple page tables.
pub struct SimulatedMemory {
    base: NonNull<u8>,
    size: usize,
    started: Instant,
    state: Spinlock<SimState>,
}

// Safety: `base` is owned by the simulation, and every access goes through
// bounds-checked copies or through regions handed out exclusively.
unsafe impl Send for SimulatedMemory {}
unsafe impl Sync for SimulatedMemory {}

impl SimulatedMemory {
    /// Simulate `size` bytes of RAM starting at [`PHYS_BASE`].
    pub fn new(size: usize) -> Arc<Self> {
        let size = align_up(size.max(PAGE_SIZE) as u64, PAGE_SIZE as u64) as usize;
        let layout = Self::layout(size);
        // Safety: the layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(raw) else {
            std::alloc::handle_alloc_error(layout);
        };

        Arc::new(Self {
            base,
            size,
            started: Instant::now(),
            state: Spinlock::new(SimState {
                next_frame: PHYS_BASE,
                pages: BTreeMap::new(),
                locked: BTreeMap::new(),
                mapped_pages: 0,
                contiguous_allocations: 0,
                current_team: DEFAULT_TEAM,
            }),
        })
    }

    fn layout(size: usize) -> Layout {
        match Layout::from_size_align(size, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(err) => panic!("bad simulated memory size {size}: {err}"),
        }
    }

    /// First physical address past simulated RAM.
    pub fn end(&self) -> u64 {
        PHYS_BASE + self.size as u64
    }

    pub fn set_current_team(&self, team: TeamId) {
        self.state.lock().current_team = team;
    }

    /// Move the frame allocator up to `address`, so later allocations land
    /// at or above it.
    pub fn skip_physical_to(&self, address: u64) {
        let mut state = self.state.lock();
        state.next_frame = state.next_frame.max(align_up(address, PAGE_SIZE as u64));
    }

    /// Allocate `len` bytes of page-aligned physical memory.
    ///
    /// # Panics
    ///
    /// If simulated RAM is exhausted.
    pub fn allocate_physical(&self, len: usize) -> u64 {
        let mut state = self.state.lock();
        self.bump(&mut state, len)
    }

    fn bump(&self, state: &mut SimState, len: usize) -> u64 {
        let start = state.next_frame;
        let end = start + align_up(len as u64, PAGE_SIZE as u64);
        assert!(end <= self.end(), "simulated memory exhausted");
        state.next_frame = end;
        start
    }

    /// Back `len` bytes of virtual memory at `vaddr` in `space` with fresh
    /// zeroed frames.
    pub fn map(&self, space: AddressSpace, vaddr: u64, len: usize, layout: PageLayout) {
        let first = vaddr & !PAGE_MASK;
        let count = (align_up(vaddr + len as u64, PAGE_SIZE as u64) - first) as usize / PAGE_SIZE;

        let mut state = self.state.lock();
        let contiguous = match layout {
            PageLayout::Contiguous => Some(self.bump(&mut state, count * PAGE_SIZE)),
            PageLayout::Scattered => None,
        };
        for index in 0..count {
            let frame = match contiguous {
                Some(start) => start + (index * PAGE_SIZE) as u64,
                None => self.bump(&mut state, 2 * PAGE_SIZE),
            };
            state
                .pages
                .insert((space, first + (index * PAGE_SIZE) as u64), frame);
        }
    }

    /// Read `len` bytes of virtual memory. Panics if any of it is unmapped.
    pub fn read(&self, space: AddressSpace, vaddr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        if let Err(err) = self.read_virtual(space, VirtAddr::new(vaddr), &mut data) {
            panic!("reading {len} bytes at {vaddr:#x} in {space:?}: {err}");
        }
        data
    }

    /// Write `data` to virtual memory. Panics if any of it is unmapped.
    pub fn fill(&self, space: AddressSpace, vaddr: u64, data: &[u8]) {
        if let Err(err) = self.write_virtual(space, VirtAddr::new(vaddr), data) {
            panic!("writing {} bytes at {vaddr:#x} in {space:?}: {err}", data.len());
        }
    }

    pub fn read_physical_bytes(&self, paddr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        if let Err(err) = self.read_physical(PhysAddr::new(paddr), &mut data) {
            panic!("reading {len} bytes at physical {paddr:#x}: {err}");
        }
        data
    }

    pub fn write_physical_bytes(&self, paddr: u64, data: &[u8]) {
        if let Err(err) = self.write_physical(PhysAddr::new(paddr), data) {
            panic!("writing {} bytes at physical {paddr:#x}: {err}", data.len());
        }
    }

    /// Pages currently mapped through [`DmaHal::map_physical_page`].
    pub fn mapped_pages(&self) -> usize {
        self.state.lock().mapped_pages
    }

    /// Total lock count over all pages.
    pub fn locked_pages(&self) -> usize {
        self.state.lock().locked.values().sum()
    }

    /// Contiguous regions allocated and not yet freed.
    pub fn contiguous_allocations(&self) -> usize {
        self.state.lock().contiguous_allocations
    }

    /// Host pointer to `len` bytes at `paddr`, if they are inside RAM.
    fn host(&self, paddr: u64, len: usize) -> Option<*mut u8> {
        let offset = paddr.checked_sub(PHYS_BASE)?;
        let end = offset.checked_add(len as u64)?;
        if end > self.size as u64 {
            return None;
        }
        // Safety: `offset + len` is within the allocation.
        Some(unsafe { self.base.as_ptr().add(offset as usize) })
    }

    /// Page-by-page walk of a virtual range as physical runs.
    fn for_each_run(
        &self,
        space: AddressSpace,
        vaddr: VirtAddr,
        len: usize,
        mut f: impl FnMut(u64, usize, usize),
    ) -> Result<(), IoError> {
        let mut done = 0;
        while done < len {
            let run = self
                .translate(space, vaddr + done as u64, len - done)
                .ok_or(IoError::CopyFailure)?;
            f(run.address.as_u64(), done, run.len);
            done += run.len;
        }
        Ok(())
    }
}

impl Drop for SimulatedMemory {
    fn drop(&mut self) {
        // Safety: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.size)) };
    }
}

impl core::fmt::Debug for SimulatedMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimulatedMemory")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

unsafe impl DmaHal for SimulatedMemory {
    fn allocate_contiguous(
        &self,
        size: usize,
        restrictions: &HardwareRestrictions,
    ) -> Result<DmaRegion, IoError> {
        let size = align_up(size.max(1) as u64, PAGE_SIZE as u64);
        let alignment = (restrictions.alignment.max(PAGE_SIZE)) as u64;

        let mut state = self.state.lock();
        let mut start = align_up(state.next_frame.max(restrictions.low_address), alignment);
        if restrictions.boundary != 0 {
            let boundary = restrictions.boundary as u64;
            if size <= boundary && start / boundary != (start + size - 1) / boundary {
                start = align_up(start + 1, boundary);
            }
        }

        let end = start + size;
        if restrictions.high_address != 0 && end > restrictions.high_address {
            return Err(IoError::ConstraintUnsatisfiable);
        }
        let Some(host) = self.host(start, size as usize) else {
            return Err(IoError::AllocationFailure);
        };

        state.next_frame = end;
        state.contiguous_allocations += 1;
        Ok(DmaRegion {
            phys: PhysAddr::new(start),
            // Safety: `host` never returns null for memory inside RAM.
            virt: unsafe { NonNull::new_unchecked(host) },
            size: size as usize,
        })
    }

    unsafe fn free_contiguous(&self, _region: &DmaRegion) {
        self.state.lock().contiguous_allocations -= 1;
    }

    fn translate(&self, space: AddressSpace, vaddr: VirtAddr, len: usize) -> Option<PhysRun> {
        let vaddr = vaddr.as_u64();
        if space == AddressSpace::Kernel && vaddr >= PHYS_WINDOW {
            return Some(PhysRun {
                address: PhysAddr::new(vaddr - PHYS_WINDOW),
                len,
            });
        }

        let state = self.state.lock();
        let page = vaddr & !PAGE_MASK;
        let frame = *state.pages.get(&(space, page))?;
        let address = frame + (vaddr - page);
        let mut run = (PAGE_SIZE - (vaddr - page) as usize).min(len);
        let mut next = page + PAGE_SIZE as u64;
        while run < len {
            let expected = frame + (next - page);
            if state.pages.get(&(space, next)) != Some(&expected) {
                break;
            }
            run = (run + PAGE_SIZE).min(len);
            next += PAGE_SIZE as u64;
        }

        Some(PhysRun {
            address: PhysAddr::new(address),
            len: run,
        })
    }

    fn lock_memory(
        &self,
        space: AddressSpace,
        vaddr: VirtAddr,
        len: usize,
        _device_writes: bool,
    ) -> Result<(), IoError> {
        let first = vaddr.as_u64() & !PAGE_MASK;
        let end = vaddr.as_u64() + len as u64;

        let mut state = self.state.lock();
        let mut page = first;
        while page < end {
            if !state.pages.contains_key(&(space, page)) {
                return Err(IoError::InvalidArgument);
            }
            page += PAGE_SIZE as u64;
        }

        let mut page = first;
        while page < end {
            *state.locked.entry((space, page)).or_insert(0) += 1;
            page += PAGE_SIZE as u64;
        }
        Ok(())
    }

    fn unlock_memory(
        &self,
        space: AddressSpace,
        vaddr: VirtAddr,
        len: usize,
        _device_writes: bool,
    ) {
        let end = vaddr.as_u64() + len as u64;
        let mut state = self.state.lock();
        let mut page = vaddr.as_u64() & !PAGE_MASK;
        while page < end {
            if let Some(count) = state.locked.get_mut(&(space, page)) {
                *count -= 1;
                if *count == 0 {
                    state.locked.remove(&(space, page));
                }
            }
            page += PAGE_SIZE as u64;
        }
    }

    fn read_virtual(
        &self,
        space: AddressSpace,
        vaddr: VirtAddr,
        buf: &mut [u8],
    ) -> Result<(), IoError> {
        let len = buf.len();
        let mut result = Ok(());
        self.for_each_run(space, vaddr, len, |paddr, done, run| {
            if result.is_ok() {
                result = self.read_physical(PhysAddr::new(paddr), &mut buf[done..done + run]);
            }
        })?;
        result
    }

    fn write_virtual(
        &self,
        space: AddressSpace,
        vaddr: VirtAddr,
        data: &[u8],
    ) -> Result<(), IoError> {
        let mut result = Ok(());
        self.for_each_run(space, vaddr, data.len(), |paddr, done, run| {
            if result.is_ok() {
                result = self.write_physical(PhysAddr::new(paddr), &data[done..done + run]);
            }
        })?;
        result
    }

    fn read_physical(&self, paddr: PhysAddr, buf: &mut [u8]) -> Result<(), IoError> {
        let host = self
            .host(paddr.as_u64(), buf.len())
            .ok_or(IoError::CopyFailure)?;
        // Safety: `host` checked the range; `buf` cannot alias simulated RAM
        // handed out as a staging slice while it is borrowed mutably.
        unsafe { ptr::copy(host, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn write_physical(&self, paddr: PhysAddr, data: &[u8]) -> Result<(), IoError> {
        let host = self
            .host(paddr.as_u64(), data.len())
            .ok_or(IoError::CopyFailure)?;
        // Safety: see `read_physical`.
        unsafe { ptr::copy(data.as_ptr(), host, data.len()) };
        Ok(())
    }

    fn map_physical_page(&self, paddr: PhysAddr) -> Result<VirtAddr, IoError> {
        self.host(paddr.as_u64(), PAGE_SIZE)
            .ok_or(IoError::InvalidArgument)?;
        self.state.lock().mapped_pages += 1;
        Ok(VirtAddr::new(PHYS_WINDOW + paddr.as_u64()))
    }

    fn unmap_physical_page(&self, _vaddr: VirtAddr) {
        self.state.lock().mapped_pages -= 1;
    }

    fn current_team(&self) -> TeamId {
        self.state.lock().current_team
    }

    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn relax(&self) {
        std::thread::yield_now();
    }
}

/// A block device backed by a byte vector.
///
/// Every executed phase is checked against the block size and the device
/// restrictions, so a translator bug shows up as a panic at the device.
pub struct SimulatedDisk {
    memory: Arc<SimulatedMemory>,
    data: Spinlock<Vec<u8>>,
    block_size: usize,
    restrictions: HardwareRestrictions,
    fail_at: AtomicUsize,
    transfers: AtomicUsize,
}

impl SimulatedDisk {
    pub fn new(
        memory: Arc<SimulatedMemory>,
        size: usize,
        block_size: usize,
        restrictions: &HardwareRestrictions,
    ) -> Self {
        Self {
            memory,
            data: Spinlock::new(vec![0; size]),
            block_size,
            restrictions: restrictions.normalized(),
            fail_at: AtomicUsize::new(usize::MAX),
            transfers: AtomicUsize::new(0),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Overwrite the disk starting at byte `offset`.
    pub fn fill(&self, offset: usize, data: &[u8]) {
        self.data.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Fail the transfer with the given zero-based index.
    pub fn fail_transfer(&self, index: usize) {
        self.fail_at.store(index, Ordering::SeqCst);
    }

    /// Number of phases executed so far.
    pub fn transfers(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    /// Execute the current phase of `operation` and record its status.
    ///
    /// # Panics
    ///
    /// If the phase violates the block size or any device restriction.
    pub fn execute(&self, operation: &mut Operation) {
        let offset = operation.offset();
        let length = operation.length();
        let segments = operation.vecs();
        let r = &self.restrictions;

        assert_eq!(offset % self.block_size as u64, 0, "unaligned device offset {offset}");
        assert_eq!(length % self.block_size, 0, "partial block transfer of {length} bytes");
        assert!(length <= r.max_transfer_size, "transfer of {length} bytes too long");
        assert!(segments.len() <= r.max_segment_count, "{} segments", segments.len());
        assert_eq!(segments.iter().map(|s| s.len).sum::<usize>(), length);
        for segment in segments {
            let start = segment.address.as_u64();
            assert!(segment.len > 0 && segment.len <= r.max_segment_size, "{segment:?}");
            assert!(r.is_aligned(start), "misaligned {segment:?}");
            assert!(start >= r.low_address && segment.end() <= r.high_address, "{segment:?}");
            if r.boundary != 0 {
                let boundary = r.boundary as u64;
                assert_eq!(start / boundary, (segment.end() - 1) / boundary, "{segment:?}");
            }
        }

        let index = self.transfers.fetch_add(1, Ordering::SeqCst);
        if index == self.fail_at.load(Ordering::SeqCst) {
            operation.set_status(Err(IoError::DeviceError), 0);
            return;
        }

        let mut data = self.data.lock();
        let mut position = offset as usize;
        assert!(position + length <= data.len(), "transfer past the end of the disk");
        for segment in segments {
            let bytes = &mut data[position..position + segment.len];
            let moved = if operation.is_write() {
                self.memory.read_physical(segment.address, bytes)
            } else {
                self.memory.write_physical(segment.address, bytes)
            };
            if let Err(err) = moved {
                panic!("device access to {segment:?} failed: {err}");
            }
            position += segment.len;
        }
        drop(data);

        operation.set_status(Ok(()), length);
    }
}

/// Translate and execute `request` one operation at a time until it is done
/// or an operation fails, then notify it.
///
/// Retries when the translator's pools are momentarily empty, which happens
/// when several requests share one translator.
pub fn drive_request(
    translator: &DmaTranslator,
    requests: &RequestTable,
    request: RequestId,
    disk: &SimulatedDisk,
) -> Result<(), IoError> {
    while requests.remaining_bytes(request)? > 0 {
        let mut operation = match translator.translate_next(requests, request, 0) {
            Ok(operation) => operation,
            Err(IoError::ResourceExhausted) => {
                std::thread::yield_now();
                continue;
            }
            Err(err) => return Err(err),
        };

        loop {
            disk.execute(&mut operation);
            if operation.finish(requests) {
                break;
            }
        }

        let failed = !matches!(operation.status(), Some(Ok(())));
        requests.operation_finished(&mut operation)?;
        if let Some(buffer) = operation.take_buffer() {
            translator.recycle_buffer(buffer);
        }
        if failed {
            break;
        }
    }

    requests.notify_finished(request)
}
