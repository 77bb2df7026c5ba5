//! Copies between a request's memory and kernel buffers.
//!
//! Physical buffers are accessed through the physical copy routines. User
//! memory of another team cannot be reached through the current address
//! space, so it is resolved to physical runs first. Everything else is copied
//! through its virtual address.

use core::ops::Range;

use x86_64::{PhysAddr, VirtAddr};

use super::{Request, RequestId, RequestTable};
use crate::{AddressSpace, BufferKind, IoError};

const ZEROES: [u8; 512] = [0; 512];

#[derive(Debug, Clone, Copy)]
enum Target {
    Physical(PhysAddr),
    Virtual(AddressSpace, VirtAddr),
}

impl RequestTable {
    /// Copy request memory starting at absolute `offset` into `buf`.
    pub fn copy_data_in(&self, id: RequestId, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        let request = self.request(id)?;
        let hal = self.hal();
        self.for_each_piece(&request, offset, buf.len(), |target, range| match target {
            Target::Physical(address) => hal.read_physical(address, &mut buf[range]),
            Target::Virtual(space, address) => hal.read_virtual(space, address, &mut buf[range]),
        })
    }

    /// Copy `data` into request memory starting at absolute `offset`.
    pub fn copy_data_out(&self, id: RequestId, data: &[u8], offset: u64) -> Result<(), IoError> {
        let request = self.request(id)?;
        let hal = self.hal();
        self.for_each_piece(&request, offset, data.len(), |target, range| match target {
            Target::Physical(address) => hal.write_physical(address, &data[range]),
            Target::Virtual(space, address) => hal.write_virtual(space, address, &data[range]),
        })
    }

    /// Zero `length` bytes of request memory starting at absolute `offset`.
    pub fn clear_data(&self, id: RequestId, offset: u64, length: usize) -> Result<(), IoError> {
        let request = self.request(id)?;
        let hal = self.hal();
        let start = request_range(&request, offset, length)?.start;

        if request.buffer.is_physical() {
            for vec in request.buffer.virtual_vecs(hal, start, length) {
                let vec = vec.map_err(|_| IoError::CopyFailure)?;
                write_zeroes(vec.len, |position, zeroes| {
                    hal.write_virtual(AddressSpace::Kernel, vec.address + position as u64, zeroes)
                })?;
            }
            return Ok(());
        }

        self.for_each_piece(&request, offset, length, |target, range| {
            write_zeroes(range.len(), |position, zeroes| match target {
                Target::Physical(address) => hal.write_physical(address + position as u64, zeroes),
                Target::Virtual(space, address) => {
                    hal.write_virtual(space, address + position as u64, zeroes)
                }
            })
        })
    }

    /// Split `length` bytes at absolute `offset` into pieces the platform can
    /// copy in one call. `f` gets each piece's target and its range within
    /// the caller's buffer. The first failure stops the walk.
    fn for_each_piece(
        &self,
        request: &Request,
        offset: u64,
        length: usize,
        mut f: impl FnMut(Target, Range<usize>) -> Result<(), IoError>,
    ) -> Result<(), IoError> {
        let mut skip = request_range(request, offset, length)?.start;
        let space = request.space();
        let foreign_user =
            request.buffer.kind() == BufferKind::User && request.team != self.hal().current_team();

        let mut done = 0;
        for vec in request.buffer.vecs() {
            if done == length {
                break;
            }
            if skip >= vec.len {
                skip -= vec.len;
                continue;
            }

            let mut base = vec.base + skip as u64;
            let mut available = (vec.len - skip).min(length - done);
            skip = 0;

            while available > 0 {
                let (target, len) = match request.buffer.kind() {
                    BufferKind::Physical => (Target::Physical(PhysAddr::new(base)), available),
                    BufferKind::User if foreign_user => {
                        let run = self
                            .hal()
                            .translate(space, VirtAddr::new(base), available)
                            .filter(|run| run.len > 0)
                            .ok_or(IoError::CopyFailure)?;
                        (Target::Physical(run.address), run.len.min(available))
                    }
                    _ => (Target::Virtual(space, VirtAddr::new(base)), available),
                };

                f(target, done..done + len).map_err(|err| {
                    log::debug!("dma-io: copy at {:#x} failed: {}", base, err);
                    IoError::CopyFailure
                })?;

                base += len as u64;
                available -= len;
                done += len;
            }
        }

        Ok(())
    }
}

/// The range `[offset, offset + length)` relative to the request start.
fn request_range(request: &Request, offset: u64, length: usize) -> Result<Range<usize>, IoError> {
    let start = offset
        .checked_sub(request.offset)
        .and_then(|start| usize::try_from(start).ok())
        .ok_or(IoError::InvalidArgument)?;
    let end = start.checked_add(length).ok_or(IoError::InvalidArgument)?;
    if end > request.length {
        return Err(IoError::InvalidArgument);
    }
    Ok(start..end)
}

fn write_zeroes(
    length: usize,
    mut write: impl FnMut(usize, &[u8]) -> Result<(), IoError>,
) -> Result<(), IoError> {
    let mut position = 0;
    while position < length {
        let len = (length - position).min(ZEROES.len());
        write(position, &ZEROES[..len]).map_err(|_| IoError::CopyFailure)?;
        position += len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use crate::testing::{DEFAULT_TEAM, PageLayout, SimulatedMemory};
    use crate::{
        AddressSpace, IoError, IoVec, PAGE_SIZE, RequestFlags, RequestTable, TeamId, TransferBuffer,
    };

    const USER_BASE: u64 = 0x20_0000;

    fn user_request(table: &RequestTable, len: usize) -> crate::RequestId {
        let buffer = TransferBuffer::user(vec![IoVec::new(USER_BASE, len)]).unwrap();
        table
            .create(0x1000, buffer, len, false, RequestFlags::default())
            .unwrap()
    }

    #[test]
    fn copies_through_current_address_space() {
        let memory = SimulatedMemory::new(64 * PAGE_SIZE);
        memory.set_current_team(TeamId(7));
        let space = AddressSpace::User(TeamId(7));
        memory.map(space, USER_BASE, 2 * PAGE_SIZE, PageLayout::Scattered);
        let table = RequestTable::new(memory.clone());
        let id = user_request(&table, 2 * PAGE_SIZE);

        let data: alloc::vec::Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let offset = 0x1000 + PAGE_SIZE as u64 - 100;
        table.copy_data_out(id, &data, offset).unwrap();
        assert_eq!(memory.read(space, USER_BASE + PAGE_SIZE as u64 - 100, 300), data);

        let mut back = vec![0u8; 300];
        table.copy_data_in(id, offset, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn copies_foreign_team_memory_physically() {
        let memory = SimulatedMemory::new(64 * PAGE_SIZE);
        memory.set_current_team(TeamId(7));
        let space = AddressSpace::User(TeamId(7));
        memory.map(space, USER_BASE, 2 * PAGE_SIZE, PageLayout::Scattered);
        let table = RequestTable::new(memory.clone());
        let id = user_request(&table, 2 * PAGE_SIZE);

        // Completion runs on behalf of some other team.
        memory.set_current_team(TeamId(1));
        let data = vec![0xa5u8; PAGE_SIZE];
        table.copy_data_out(id, &data, 0x1000 + 512).unwrap();
        assert_eq!(memory.read(space, USER_BASE + 512, PAGE_SIZE), data);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let memory = SimulatedMemory::new(64 * PAGE_SIZE);
        let space = AddressSpace::User(DEFAULT_TEAM);
        memory.map(space, USER_BASE, PAGE_SIZE, PageLayout::Contiguous);
        let table = RequestTable::new(memory.clone());
        let id = user_request(&table, PAGE_SIZE);

        let mut buf = [0u8; 16];
        assert_eq!(table.copy_data_in(id, 0x800, &mut buf), Err(IoError::InvalidArgument));
        assert_eq!(
            table.copy_data_in(id, 0x1000 + PAGE_SIZE as u64 - 8, &mut buf),
            Err(IoError::InvalidArgument)
        );
    }

    #[test]
    fn unmapped_memory_fails_the_copy() {
        let memory = SimulatedMemory::new(64 * PAGE_SIZE);
        let table = RequestTable::new(memory.clone());
        let id = user_request(&table, PAGE_SIZE);

        let mut buf = [0u8; 16];
        assert_eq!(table.copy_data_in(id, 0x1000, &mut buf), Err(IoError::CopyFailure));
    }

    #[test]
    fn clear_data_zeroes_virtual_and_physical_memory() {
        let memory = SimulatedMemory::new(64 * PAGE_SIZE);
        let space = AddressSpace::User(DEFAULT_TEAM);
        memory.map(space, USER_BASE, PAGE_SIZE, PageLayout::Contiguous);
        memory.fill(space, USER_BASE, &vec![0xffu8; PAGE_SIZE]);
        let table = RequestTable::new(memory.clone());
        let id = user_request(&table, PAGE_SIZE);

        table.clear_data(id, 0x1000 + 100, 1000).unwrap();
        let contents = memory.read(space, USER_BASE, PAGE_SIZE);
        assert!(contents[..100].iter().all(|b| *b == 0xff));
        assert!(contents[100..1100].iter().all(|b| *b == 0));
        assert!(contents[1100..].iter().all(|b| *b == 0xff));

        let phys = memory.allocate_physical(2 * PAGE_SIZE);
        memory.write_physical_bytes(phys, &vec![0xffu8; 2 * PAGE_SIZE]);
        let buffer = TransferBuffer::physical(vec![IoVec::new(phys, 2 * PAGE_SIZE)]).unwrap();
        let id = table
            .create(0, buffer, 2 * PAGE_SIZE, false, RequestFlags::default())
            .unwrap();
        table.clear_data(id, PAGE_SIZE as u64 - 10, 20).unwrap();
        let contents = memory.read_physical_bytes(phys, 2 * PAGE_SIZE);
        assert!(contents[PAGE_SIZE - 10..PAGE_SIZE + 10].iter().all(|b| *b == 0));
        assert_eq!(contents[PAGE_SIZE - 11], 0xff);
        assert_eq!(contents[PAGE_SIZE + 10], 0xff);
        assert_eq!(memory.mapped_pages(), 0);
    }
}
