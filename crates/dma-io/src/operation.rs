//! Driver-ready transfer units.
//!
//! An [`Operation`] covers one piece of a request. Writes whose first or last
//! block only partly overlaps the request run in up to three phases: the
//! partial blocks are read into staging first, merged with the caller's data,
//! and then everything is written in one go.

use crate::{DmaSegment, IoError, RequestId, RequestTable, ScatterGatherBuffer};

/// Identifies an operation among a request's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(pub u64);

/// Which part of its device range an operation transfers next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    /// Read the first block into staging.
    ReadBegin,
    /// Read the last block into staging.
    ReadEnd,
    /// Transfer the whole device range in the request's direction.
    DoAll,
}

/// What to do after a phase completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Submit the operation again in the given phase.
    Resubmit(OperationPhase),
    Complete,
}

impl OperationPhase {
    /// The step after this phase finished with `result`.
    ///
    /// `partial_end_pending` says whether the last block still has to be read
    /// once the first one is done. A failed phase always completes.
    pub fn advance(self, result: Result<(), IoError>, partial_end_pending: bool) -> NextAction {
        if result.is_err() {
            return NextAction::Complete;
        }
        match self {
            OperationPhase::ReadBegin if partial_end_pending => {
                NextAction::Resubmit(OperationPhase::ReadEnd)
            }
            OperationPhase::ReadBegin | OperationPhase::ReadEnd => {
                NextAction::Resubmit(OperationPhase::DoAll)
            }
            OperationPhase::DoAll => NextAction::Complete,
        }
    }
}

/// Ranges and flags the translator computed for an operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OperationLayout {
    pub original_offset: u64,
    pub original_length: usize,
    pub offset: u64,
    pub length: usize,
    pub partial_begin: bool,
    pub partial_end: bool,
    pub uses_staging: bool,
    pub block_size: usize,
    pub request_is_write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyDirection {
    ToStaging,
    FromStaging,
}

/// One transfer a driver can submit to the device.
///
/// `offset`, `length` and `vecs` describe the current phase only. The
/// original range is the part of the request the operation is responsible
/// for; the device range is that range widened to whole blocks.
#[derive(Debug)]
pub struct Operation {
    id: OperationId,
    parent: Option<RequestId>,
    buffer: Option<ScatterGatherBuffer>,
    layout: OperationLayout,
    phase: OperationPhase,
    status: Option<Result<(), IoError>>,
    transferred_bytes: usize,
}

impl Operation {
    pub(crate) fn new(
        id: OperationId,
        buffer: ScatterGatherBuffer,
        layout: OperationLayout,
    ) -> Self {
        Self {
            id,
            parent: None,
            buffer: Some(buffer),
            layout,
            phase: OperationPhase::DoAll,
            status: None,
            transferred_bytes: 0,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    /// The request this operation is attached to.
    pub fn parent(&self) -> Option<RequestId> {
        self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: Option<RequestId>) {
        self.parent = parent;
    }

    /// Attach the operation to `request` and get it ready for its first phase.
    ///
    /// Staged write data that does not depend on a partial-block read is
    /// copied from the caller now.
    pub fn prepare(&mut self, requests: &RequestTable, request: RequestId) -> Result<(), IoError> {
        if let Some(parent) = self.parent {
            if let Err(err) = requests.remove_operation(parent, self) {
                log::debug!("dma-io: detaching {:?} from {:?}: {}", self.id, parent, err);
                self.parent = None;
            }
        }
        self.transferred_bytes = 0;
        self.status = None;

        let layout = self.layout;
        let block = layout.block_size as u64;
        if layout.request_is_write && layout.uses_staging {
            let start = layout.offset + if layout.partial_begin { block } else { 0 };
            let end =
                layout.offset + layout.length as u64 - if layout.partial_end { block } else { 0 };
            self.copy_staged(requests, request, start, end, CopyDirection::ToStaging)?;
        }

        self.phase = if layout.request_is_write && layout.partial_begin {
            OperationPhase::ReadBegin
        } else if layout.request_is_write && layout.partial_end {
            OperationPhase::ReadEnd
        } else {
            OperationPhase::DoAll
        };
        self.prepare_view();

        requests.add_operation(request, self)
    }

    /// Record the device's result for the current phase.
    ///
    /// `completed_length` is the number of device bytes moved. Only phases in
    /// the request's direction count towards the transferred bytes, and
    /// padding in front of the original range is not counted.
    pub fn set_status(&mut self, result: Result<(), IoError>, completed_length: usize) {
        self.status = Some(result);

        if self.is_write() == self.layout.request_is_write {
            let lead = (self.layout.original_offset - self.layout.offset) as usize;
            let completed = completed_length.saturating_sub(lead);
            self.transferred_bytes =
                (self.transferred_bytes + completed).min(self.layout.original_length);
        }
    }

    pub fn status(&self) -> Option<Result<(), IoError>> {
        self.status
    }

    /// Handle completion of the current phase.
    ///
    /// Returns `false` if the operation moved on to another phase and must be
    /// submitted again, `true` once it is done. Reads through staging are
    /// copied back to the caller here.
    ///
    /// # Panics
    ///
    /// If no status was set for the phase.
    pub fn finish(&mut self, requests: &RequestTable) -> bool {
        let Some(status) = self.status else {
            panic!("operation {:?} finished without a status", self.id);
        };
        let Some(request) = self.parent else {
            log::warn!("dma-io: {:?} finished without a parent request", self.id);
            return true;
        };

        let layout = self.layout;
        let block = layout.block_size as u64;

        if status.is_ok() && layout.request_is_write && self.phase != OperationPhase::DoAll {
            let (start, end) = match self.phase {
                OperationPhase::ReadBegin => (layout.offset, layout.offset + block),
                _ => {
                    let end = layout.offset + layout.length as u64;
                    (end - block, end)
                }
            };
            let copied = self.copy_staged(requests, request, start, end, CopyDirection::ToStaging);
            if let Err(err) = copied {
                self.status = Some(Err(err));
                return true;
            }

            let original_end = layout.original_offset + layout.original_length as u64;
            let single_block = original_end <= layout.offset + block;
            let partial_end_pending = layout.partial_end && !single_block;

            return match self.phase.advance(status, partial_end_pending) {
                NextAction::Resubmit(next) => {
                    self.phase = next;
                    self.status = None;
                    self.prepare_view();
                    false
                }
                NextAction::Complete => true,
            };
        }

        if !layout.request_is_write && layout.uses_staging {
            let end = layout.original_offset + self.transferred_bytes as u64;
            if let Err(err) =
                self.copy_staged(requests, request, layout.offset, end, CopyDirection::FromStaging)
            {
                self.status = Some(Err(err));
            }
        }

        true
    }

    /// Copy between staging and the caller for the device range
    /// `[start, end)`, limited to the original range.
    fn copy_staged(
        &mut self,
        requests: &RequestTable,
        request: RequestId,
        start: u64,
        end: u64,
        direction: CopyDirection,
    ) -> Result<(), IoError> {
        let layout = self.layout;
        let start = start.max(layout.original_offset);
        let end = end.min(layout.original_offset + layout.original_length as u64);
        if start >= end {
            return Ok(());
        }
        let Some(buffer) = self.buffer.as_mut() else {
            return Err(IoError::InvalidArgument);
        };
        let Some(staging_base) = buffer.staging().map(|staging| staging.physical_address()) else {
            return Ok(());
        };

        let mut position = layout.offset;
        for index in 0..buffer.segment_count() {
            let segment = buffer.segments()[index];
            let segment_start = position;
            let segment_end = position + segment.len as u64;
            position = segment_end;

            if !buffer.is_staged(&segment) {
                continue;
            }
            let from = segment_start.max(start);
            let to = segment_end.min(end);
            if from >= to {
                continue;
            }

            let staging_offset =
                (segment.address - staging_base) as usize + (from - segment_start) as usize;
            let len = (to - from) as usize;
            let Some(staging) = buffer.staging_mut() else {
                return Err(IoError::InvalidArgument);
            };
            let bytes = &mut staging.as_mut_slice()[staging_offset..staging_offset + len];
            match direction {
                CopyDirection::ToStaging => requests.copy_data_in(request, from, bytes)?,
                CopyDirection::FromStaging => requests.copy_data_out(request, bytes, from)?,
            }
        }

        Ok(())
    }

    /// Rebuild the segment view for the current phase.
    fn prepare_view(&mut self) {
        let block = self.layout.block_size;
        let length = self.layout.length;
        let Some(buffer) = self.buffer.as_mut() else {
            return;
        };
        match self.phase {
            OperationPhase::ReadBegin => buffer.build_view(0, block),
            OperationPhase::ReadEnd => buffer.build_view(length - block, block),
            OperationPhase::DoAll => buffer.view.clear(),
        }
    }

    /// Device offset of the current phase.
    pub fn offset(&self) -> u64 {
        match self.phase {
            OperationPhase::ReadEnd => {
                self.layout.offset + (self.layout.length - self.layout.block_size) as u64
            }
            _ => self.layout.offset,
        }
    }

    /// Device length of the current phase.
    pub fn length(&self) -> usize {
        match self.phase {
            OperationPhase::DoAll => self.layout.length,
            _ => self.layout.block_size,
        }
    }

    /// Segments of the current phase.
    pub fn vecs(&self) -> &[DmaSegment] {
        match (&self.buffer, self.phase) {
            (Some(buffer), OperationPhase::DoAll) => buffer.segments(),
            (Some(buffer), _) => &buffer.view,
            (None, _) => &[],
        }
    }

    pub fn vec_count(&self) -> usize {
        self.vecs().len()
    }

    /// Whether the current phase writes to the device.
    pub fn is_write(&self) -> bool {
        self.layout.request_is_write && self.phase == OperationPhase::DoAll
    }

    pub fn is_read(&self) -> bool {
        !self.is_write()
    }

    pub fn phase(&self) -> OperationPhase {
        self.phase
    }

    pub fn original_offset(&self) -> u64 {
        self.layout.original_offset
    }

    pub fn original_length(&self) -> usize {
        self.layout.original_length
    }

    /// Offset of the whole device range, independent of the phase.
    pub fn device_offset(&self) -> u64 {
        self.layout.offset
    }

    pub fn device_length(&self) -> usize {
        self.layout.length
    }

    pub fn transferred_bytes(&self) -> usize {
        self.transferred_bytes
    }

    pub fn has_partial_begin(&self) -> bool {
        self.layout.partial_begin
    }

    pub fn has_partial_end(&self) -> bool {
        self.layout.partial_end
    }

    pub fn uses_staging(&self) -> bool {
        self.layout.uses_staging
    }

    pub fn block_size(&self) -> usize {
        self.layout.block_size
    }

    pub fn buffer(&self) -> Option<&ScatterGatherBuffer> {
        self.buffer.as_ref()
    }

    /// Detach the scatter/gather buffer, typically to recycle it.
    pub fn take_buffer(&mut self) -> Option<ScatterGatherBuffer> {
        self.buffer.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_begin_moves_to_read_end_when_tail_pending() {
        assert_eq!(
            OperationPhase::ReadBegin.advance(Ok(()), true),
            NextAction::Resubmit(OperationPhase::ReadEnd)
        );
        assert_eq!(
            OperationPhase::ReadBegin.advance(Ok(()), false),
            NextAction::Resubmit(OperationPhase::DoAll)
        );
    }

    #[test]
    fn read_end_moves_to_do_all() {
        assert_eq!(
            OperationPhase::ReadEnd.advance(Ok(()), true),
            NextAction::Resubmit(OperationPhase::DoAll)
        );
    }

    #[test]
    fn do_all_and_failures_complete() {
        assert_eq!(OperationPhase::DoAll.advance(Ok(()), false), NextAction::Complete);
        for phase in [
            OperationPhase::ReadBegin,
            OperationPhase::ReadEnd,
            OperationPhase::DoAll,
        ] {
            assert_eq!(
                phase.advance(Err(IoError::DeviceError), true),
                NextAction::Complete
            );
        }
    }
}
