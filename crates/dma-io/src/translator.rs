//! Translation of requests into device-ready operations.
//!
//! [`DmaTranslator::translate_next`] carves the next piece off a request and
//! describes it as a scatter/gather list the device can consume directly.
//! Caller memory the device cannot reach, or that is misaligned, is routed
//! through the translator's staging buffers. Partial blocks at either end are
//! always staged so that writes can read-modify-write them.

use alloc::sync::Arc;

use x86_64::{PhysAddr, VirtAddr, align_up};

use crate::operation::OperationLayout;
use crate::pool::BufferPools;
use crate::request::{Cursor, Request};
use crate::{
    DmaHal, DmaSegment, HardwareRestrictions, IoError, Operation, PAGE_SIZE, RequestId,
    RequestTable, ScatterGatherBuffer,
};

/// Largest staging buffer sized automatically from the restrictions.
const MAX_STAGING_BUFFER_SIZE: usize = 4 * PAGE_SIZE;

/// How a piece of caller memory reaches the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRouting {
    /// The device can address the memory as is.
    Direct(DmaSegment),
    /// This many bytes must go through a staging buffer.
    Staged(usize),
}

/// Shorten `len` so a segment at `base` respects the maximum segment size
/// and does not cross a boundary.
pub fn restrict_boundary_and_segment_size(
    restrictions: &HardwareRestrictions,
    base: u64,
    len: usize,
) -> usize {
    let len = len.min(restrictions.max_segment_size);
    if len == 0 || restrictions.boundary == 0 {
        return len;
    }

    let boundary = restrictions.boundary as u64;
    let first = base / boundary;
    let last = (base + len as u64 - 1) / boundary;
    if first != last {
        ((first + 1) * boundary - base) as usize
    } else {
        len
    }
}

/// Decide whether `len` bytes of caller memory at physical `base` can be
/// handed to the device directly.
///
/// Memory below the low address is staged up to the low address. Misaligned
/// memory and memory at or above the high address is staged whole. Direct
/// segments stop at the high address and are aligned down; a direct segment
/// that would end up empty is staged instead.
pub fn classify_segment(
    restrictions: &HardwareRestrictions,
    base: u64,
    len: usize,
) -> SegmentRouting {
    if base < restrictions.low_address {
        let below = restrictions.low_address - base;
        return SegmentRouting::Staged(len.min(below.try_into().unwrap_or(usize::MAX)));
    }
    if !restrictions.is_aligned(base) || base >= restrictions.high_address {
        return SegmentRouting::Staged(len);
    }

    let mut direct = len;
    if base.saturating_add(len as u64) > restrictions.high_address {
        direct = (restrictions.high_address - base) as usize;
    }
    direct &= !(restrictions.alignment - 1);

    if direct == 0 {
        SegmentRouting::Staged(len)
    } else {
        SegmentRouting::Direct(DmaSegment::new(base, direct))
    }
}

/// Splits requests into operations that satisfy a device's DMA restrictions.
///
/// Owns the scatter/gather and staging buffer pools for one device. All
/// methods take `&self` and may be called from several threads at once; the
/// pools are the only shared state and are locked only while buffers are
/// taken or returned.
pub struct DmaTranslator {
    hal: Arc<dyn DmaHal>,
    restrictions: HardwareRestrictions,
    block_size: usize,
    needs_staging: bool,
    pools: Arc<BufferPools>,
}

impl DmaTranslator {
    /// Create a translator with `buffer_count` scatter/gather buffers and
    /// `staging_count` staging buffers sized from the restrictions.
    ///
    /// Staging buffers are only allocated when the restrictions or block size
    /// can ever require them.
    pub fn new(
        hal: Arc<dyn DmaHal>,
        restrictions: &HardwareRestrictions,
        block_size: usize,
        buffer_count: usize,
        staging_count: usize,
    ) -> Result<Self, IoError> {
        let normalized = restrictions.normalized();
        normalized.validate(block_size)?;

        let size = normalized
            .max_segment_size
            .saturating_mul(normalized.max_segment_count.min(4))
            .min(MAX_STAGING_BUFFER_SIZE)
            .max(2 * block_size);

        Self::with_staging_size(hal, restrictions, block_size, buffer_count, staging_count, size)
    }

    /// Like [`new`](Self::new) but with an explicit staging buffer size,
    /// rounded up to whole blocks.
    pub fn with_staging_size(
        hal: Arc<dyn DmaHal>,
        restrictions: &HardwareRestrictions,
        block_size: usize,
        buffer_count: usize,
        staging_count: usize,
        staging_size: usize,
    ) -> Result<Self, IoError> {
        let mut restrictions = restrictions.normalized();
        restrictions.validate(block_size)?;
        restrictions.max_transfer_size &= !(block_size - 1);

        let needs_staging = restrictions.needs_staging(block_size);
        if buffer_count == 0 || (needs_staging && staging_count == 0) {
            return Err(IoError::InvalidArgument);
        }

        let staging_size =
            align_up(staging_size.max(block_size) as u64, block_size as u64) as usize;
        let staging_count = if needs_staging { staging_count } else { 0 };
        let pools = BufferPools::new(
            hal.clone(),
            &restrictions,
            buffer_count,
            staging_count,
            staging_size,
        )?;

        log::debug!(
            "dma-io: translator ready: block {} bytes, {} buffers, {} staging x {} bytes, {:?}",
            block_size,
            buffer_count,
            staging_count,
            staging_size,
            restrictions
        );

        Ok(Self {
            hal,
            restrictions,
            block_size,
            needs_staging,
            pools,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The normalized restrictions the translator works with.
    pub fn restrictions(&self) -> &HardwareRestrictions {
        &self.restrictions
    }

    pub fn staging_buffer_size(&self) -> usize {
        self.pools.staging_size()
    }

    pub fn buffer_count(&self) -> usize {
        self.pools.buffer_count()
    }

    pub fn staging_buffer_count(&self) -> usize {
        self.pools.staging_count()
    }

    pub fn available_buffers(&self) -> usize {
        self.pools.available_buffers()
    }

    pub fn available_staging_buffers(&self) -> usize {
        self.pools.available_staging()
    }

    /// Return a scatter/gather buffer and its staging loan to the pools.
    ///
    /// # Panics
    ///
    /// If the buffer was handed out by a different translator.
    pub fn recycle_buffer(&self, buffer: ScatterGatherBuffer) {
        assert!(
            buffer.belongs_to(&self.pools),
            "scatter/gather buffer recycled into a foreign translator"
        );
        drop(buffer);
    }

    /// Build the next operation for `request`, starting at its cursor.
    ///
    /// `max_operation_length` limits the operation's device length including
    /// a leading partial block; zero means the restrictions' transfer limit.
    /// On success the request's cursor has advanced past the bytes the
    /// operation covers and the operation is attached to the request.
    ///
    /// Fails with [`IoError::ResourceExhausted`] when no buffer is free, in
    /// which case the cursor is unchanged and the call can be retried after a
    /// buffer is recycled.
    pub fn translate_next(
        &self,
        requests: &RequestTable,
        request_id: RequestId,
        max_operation_length: usize,
    ) -> Result<Operation, IoError> {
        let request = requests.request(request_id)?;
        let cursor = request.cursor();
        if cursor.remaining == 0 {
            return Err(IoError::InvalidArgument);
        }
        if max_operation_length != 0 && max_operation_length < self.block_size {
            return Err(IoError::InvalidArgument);
        }

        let block = self.block_size;
        let block_mask = block - 1;
        let alignment = self.restrictions.alignment;
        let max_transfer = self.restrictions.max_transfer_size;
        let max_segments = self.restrictions.max_segment_count;
        let is_write = request.is_write();

        let request_end = request.offset() + request.length() as u64;
        let original_offset = request_end - cursor.remaining as u64;
        let partial_begin = (original_offset & block_mask as u64) as usize;
        let mut offset = original_offset;

        let mut total = cursor.remaining.min(max_transfer);
        if max_operation_length > 0 && max_operation_length < total + partial_begin {
            total = max_operation_length - partial_begin;
        }

        let Some(mut buffer) = self.pools.take_buffer() else {
            log::debug!("dma-io: no scatter/gather buffer for request {:?}", request_id);
            return Err(IoError::ResourceExhausted);
        };

        total = self.resolve_runs(&request, cursor, total, &mut buffer)?;

        if self.needs_staging {
            let Some(staging) = self.pools.take_staging() else {
                log::debug!("dma-io: no staging buffer for request {:?}", request_id);
                return Err(IoError::ResourceExhausted);
            };
            buffer.set_staging(staging);
        }

        let mut dma_length = 0usize;
        let mut transfer_left = total;
        let mut run_index = 0;
        let mut run_offset = 0usize;

        if partial_begin > 0 {
            // Writes need the whole first block to merge with what is on disk.
            // Reads only need to skip the leading bytes.
            let length = if is_write {
                block
            } else {
                align_up(partial_begin as u64, alignment as u64) as usize
            };
            if self.add_staging(&mut buffer, length, true) == 0 {
                return Err(IoError::ConstraintUnsatisfiable);
            }

            let transferred = length - partial_begin;
            dma_length += length;
            run_offset += transferred;
            offset -= partial_begin as u64;
            transfer_left = transfer_left.saturating_sub(transferred);
        }

        while transfer_left > 0
            && run_index < buffer.runs.len()
            && buffer.segment_count() < max_segments
            && dma_length < max_transfer
        {
            let run = buffer.runs[run_index];
            if run.len <= run_offset {
                run_offset -= run.len;
                run_index += 1;
                continue;
            }

            let base = run.address.as_u64() + run_offset as u64;
            let length = (run.len - run_offset)
                .min(transfer_left)
                .min(max_transfer - dma_length);
            let length = restrict_boundary_and_segment_size(&self.restrictions, base, length);

            let accepted = match classify_segment(&self.restrictions, base, length) {
                SegmentRouting::Direct(segment) => {
                    buffer.push_segment(segment);
                    segment.len
                }
                SegmentRouting::Staged(size) => {
                    let size = align_up(size as u64, alignment as u64) as usize;
                    let added = self.add_staging(&mut buffer, size, false);
                    if added == 0 {
                        break;
                    }
                    added
                }
            };

            log::trace!(
                "dma-io: run {} at {:#x}: accepted {} of {} bytes",
                run_index,
                base,
                accepted,
                length
            );

            dma_length += accepted;
            run_offset += accepted;
            transfer_left -= accepted.min(transfer_left);
        }

        if is_write {
            // A trailing partial block must be read first, so it has to live
            // in staging. The same holds for a staged tail that overruns the
            // end of the request.
            let mut diff = dma_length & block_mask;
            if diff == 0 && dma_length > 0 && offset + dma_length as u64 > request_end {
                diff = block;
            }
            if diff != 0 {
                buffer.cut_back(diff);
                dma_length -= diff;
                if self.add_staging(&mut buffer, block, true) != 0 {
                    dma_length += block;
                } else if dma_length == 0 {
                    return Err(IoError::ConstraintUnsatisfiable);
                }
            }
        }

        while dma_length & block_mask != 0 {
            let target = align_up(dma_length as u64, block as u64) as usize;
            if target <= max_transfer
                && self.add_staging(&mut buffer, target - dma_length, true) != 0
            {
                dma_length = target;
                continue;
            }

            let to_cut = dma_length & block_mask;
            if dma_length > to_cut {
                buffer.cut_back(to_cut);
                dma_length -= to_cut;
                continue;
            }

            // Not even one block fits the segment limits. Carry as much as
            // possible through staging instead, in whole blocks.
            buffer.clear_segments();
            let staging_blocks = self.pools.staging_size() & !block_mask;
            let wanted = (align_up((partial_begin + total) as u64, block as u64) as usize)
                .min(staging_blocks)
                .min(max_transfer);
            let added = self.add_staging(&mut buffer, wanted, false);
            let length = added & !block_mask;
            buffer.cut_back(added - length);
            if length == 0 {
                return Err(IoError::ConstraintUnsatisfiable);
            }
            dma_length = length;
        }

        let device_end = offset + dma_length as u64;
        let original_end = device_end.min(request_end);
        if dma_length == 0 || original_end <= original_offset {
            log::debug!(
                "dma-io: request {:?} cannot be translated at offset {}",
                request_id,
                original_offset
            );
            return Err(IoError::ConstraintUnsatisfiable);
        }

        buffer.release_unused_staging();
        let uses_staging = buffer.uses_staging();
        let original_length = (original_end - original_offset) as usize;

        let layout = OperationLayout {
            original_offset,
            original_length,
            offset,
            length: dma_length,
            partial_begin: partial_begin != 0,
            partial_end: device_end > request_end,
            uses_staging,
            block_size: block,
            request_is_write: is_write,
        };

        log::trace!(
            "dma-io: request {:?}: {:?} in {} segments",
            request_id,
            layout,
            buffer.segment_count()
        );

        let mut operation = Operation::new(requests.next_operation_id(), buffer, layout);
        operation.prepare(requests, request_id)?;
        requests.advance(request_id, original_length)?;

        Ok(operation)
    }

    /// Resolve up to `total` bytes of caller memory from `cursor` into
    /// physical runs. Returns how many bytes were resolved.
    fn resolve_runs(
        &self,
        request: &Request,
        cursor: Cursor,
        total: usize,
        buffer: &mut ScatterGatherBuffer,
    ) -> Result<usize, IoError> {
        let transfer = request.buffer();
        let space = request.space();
        let max_runs = self.restrictions.max_segment_count;
        let runs = &mut buffer.runs;
        runs.clear();

        let mut resolved = 0;
        let mut vec_offset = cursor.vec_offset;
        'vecs: for vec in transfer.vecs().iter().skip(cursor.vec_index) {
            let mut position = vec_offset;
            vec_offset = 0;

            while position < vec.len && resolved < total {
                let wanted = (vec.len - position).min(total - resolved);
                let base = vec.base + position as u64;

                let (address, len) = if transfer.is_physical() {
                    (PhysAddr::new(base), wanted)
                } else {
                    match self.hal.translate(space, VirtAddr::new(base), wanted) {
                        Some(run) if run.len > 0 => (run.address, run.len.min(wanted)),
                        _ => {
                            log::debug!("dma-io: {:#x} in {:?} is not mapped", base, space);
                            break 'vecs;
                        }
                    }
                };

                let contiguous = runs
                    .last()
                    .is_some_and(|last| last.end() == address.as_u64());
                if contiguous {
                    if let Some(last) = runs.last_mut() {
                        last.len += len;
                    }
                } else if runs.len() == max_runs {
                    break 'vecs;
                } else {
                    runs.push(DmaSegment { address, len });
                }

                position += len;
                resolved += len;
            }

            if resolved >= total {
                break;
            }
        }

        if resolved == 0 {
            return Err(IoError::InvalidArgument);
        }
        Ok(resolved)
    }

    /// Add `length` bytes of staging to the end of `buffer`.
    ///
    /// Extends the last segment when it ends where the staging cursor is.
    /// Without `fixed` as much as fits is added; with `fixed` either all of
    /// it is added or nothing. Returns the number of bytes added.
    fn add_staging(&self, buffer: &mut ScatterGatherBuffer, length: usize, fixed: bool) -> usize {
        let left = buffer.staging_left();
        let mut length = length;
        if left < length {
            if fixed {
                return 0;
            }
            length = left;
        }
        let Some(cursor) = buffer.staging_cursor() else {
            return 0;
        };
        if length == 0 {
            return 0;
        }

        let mut added = 0;
        let joinable = buffer
            .segments()
            .last()
            .is_some_and(|last| last.end() == cursor.as_u64() && buffer.is_staged(last));
        if joinable {
            if let Some(last) = buffer.last_segment_mut() {
                let joined = restrict_boundary_and_segment_size(
                    &self.restrictions,
                    last.address.as_u64(),
                    last.len + length,
                );
                added = joined.saturating_sub(last.len).min(length);
                last.len += added;
            }
        }

        while added < length && buffer.segment_count() < self.restrictions.max_segment_count {
            let address = cursor.as_u64() + added as u64;
            let len =
                restrict_boundary_and_segment_size(&self.restrictions, address, length - added);
            if len == 0 {
                break;
            }
            buffer.push_segment(DmaSegment::new(address, len));
            added += len;
        }

        buffer.consume_staging(added);
        if fixed && added < length {
            buffer.cut_back(added);
            return 0;
        }
        added
    }
}

impl core::fmt::Debug for DmaTranslator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaTranslator")
            .field("block_size", &self.block_size)
            .field("restrictions", &self.restrictions)
            .field("staging_buffer_size", &self.pools.staging_size())
            .field("available_buffers", &self.available_buffers())
            .field("available_staging_buffers", &self.available_staging_buffers())
            .finish()
    }
}
