//! Requests and their completion tree.
//!
//! Requests live in a [`RequestTable`] and are addressed by generation-checked
//! [`RequestId`]s, so a stale id is rejected instead of reaching a reused
//! slot. A request's children are its operations and sub-requests; each child
//! reports back when it is done and the request aggregates status and
//! transferred length. Nothing here blocks while holding a lock, and no lock
//! is held while a callback runs.

mod copy;
mod wait;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::task::Waker;

use spinning_top::Spinlock;

use crate::{
    AddressSpace, BufferKind, DmaHal, IoError, Operation, OperationId, TeamId, TransferBuffer,
};

pub use wait::RequestFinished;

/// Handle to a request in a [`RequestTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    index: u32,
    generation: u32,
}

/// A child of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkId {
    Operation(OperationId),
    SubRequest(RequestId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    /// Latency sensitive; schedulers may prefer it.
    pub vip: bool,
    /// Remove the request from the table once it has been notified.
    pub auto_delete: bool,
}

/// What an iteration callback did with an unfinished request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// More work was scheduled; the request is not finished yet.
    Continue,
    /// Stop here and finish the request as a partial transfer.
    PartialTransfer,
}

/// Called once when a request is notified, with its final status, whether
/// the transfer was partial, and the number of bytes transferred.
pub type FinishedCallback =
    Box<dyn FnOnce(&RequestTable, RequestId, Result<(), IoError>, bool, usize) + Send>;

/// Called instead of finishing when all children are done but bytes remain.
pub type IterationCallback =
    Box<dyn FnMut(&RequestTable, RequestId) -> Result<IterationOutcome, IoError> + Send>;

/// Position of the next untranslated byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub vec_index: usize,
    pub vec_offset: usize,
    pub remaining: usize,
}

struct RequestState {
    cursor: Cursor,
    transferred: usize,
    children: Vec<ChunkId>,
    sub_requests: Vec<RequestId>,
    pending_children: usize,
    /// `None` until a result is known.
    status: Option<Result<(), IoError>>,
    partial_transfer: bool,
    suppress_child_notifications: bool,
    notifying: bool,
    finished_callback: Option<FinishedCallback>,
    iteration_callback: Option<IterationCallback>,
    wakers: Vec<Waker>,
}

pub(crate) struct Request {
    id: RequestId,
    offset: u64,
    length: usize,
    is_write: bool,
    flags: RequestFlags,
    team: TeamId,
    parent: Option<RequestId>,
    /// Where this request starts within its parent.
    relative_parent_offset: usize,
    buffer: TransferBuffer,
    state: Spinlock<RequestState>,
    notified: AtomicBool,
}

impl Request {
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn length(&self) -> usize {
        self.length
    }

    pub(crate) fn is_write(&self) -> bool {
        self.is_write
    }

    pub(crate) fn buffer(&self) -> &TransferBuffer {
        &self.buffer
    }

    pub(crate) fn cursor(&self) -> Cursor {
        self.state.lock().cursor
    }

    /// Address space the buffer's virtual addresses live in.
    pub(crate) fn space(&self) -> AddressSpace {
        match self.buffer.kind() {
            BufferKind::User => AddressSpace::User(self.team),
            BufferKind::Kernel | BufferKind::Physical => AddressSpace::Kernel,
        }
    }

    fn final_status(&self) -> Result<(), IoError> {
        self.state.lock().status.unwrap_or(Ok(()))
    }
}

impl core::fmt::Debug for Request {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("is_write", &self.is_write)
            .field("flags", &self.flags)
            .field("team", &self.team)
            .field("parent", &self.parent)
            .field("cursor", &state.cursor)
            .field("transferred", &state.transferred)
            .field("children", &state.children)
            .field("pending_children", &state.pending_children)
            .field("status", &state.status)
            .field("partial_transfer", &state.partial_transfer)
            .field("notified", &self.notified.load(Ordering::Relaxed))
            .finish()
    }
}

struct Slot {
    generation: u32,
    request: Option<Arc<Request>>,
}

#[derive(Default)]
struct Slots {
    entries: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Arena of in-flight requests.
pub struct RequestTable {
    hal: Arc<dyn DmaHal>,
    slots: Spinlock<Slots>,
    max_requests: Option<usize>,
    next_operation_id: AtomicU64,
}

impl RequestTable {
    pub fn new(hal: Arc<dyn DmaHal>) -> Self {
        Self {
            hal,
            slots: Spinlock::new(Slots::default()),
            max_requests: None,
            next_operation_id: AtomicU64::new(1),
        }
    }

    /// A table that refuses to hold more than `max_requests` requests.
    pub fn with_capacity(hal: Arc<dyn DmaHal>, max_requests: usize) -> Self {
        Self {
            max_requests: Some(max_requests),
            ..Self::new(hal)
        }
    }

    pub(crate) fn hal(&self) -> &dyn DmaHal {
        &*self.hal
    }

    /// Number of live requests.
    pub fn len(&self) -> usize {
        self.slots.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.request(id).is_ok()
    }

    pub(crate) fn next_operation_id(&self) -> OperationId {
        OperationId(self.next_operation_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn request(&self, id: RequestId) -> Result<Arc<Request>, IoError> {
        let slots = self.slots.lock();
        slots
            .entries
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.request.clone())
            .ok_or(IoError::InvalidArgument)
    }

    fn insert(&self, build: impl FnOnce(RequestId) -> Request) -> Result<RequestId, IoError> {
        let mut slots = self.slots.lock();
        if self.max_requests.is_some_and(|max| slots.live >= max) {
            return Err(IoError::AllocationFailure);
        }

        let index = match slots.free.pop() {
            Some(index) => index,
            None => {
                let index =
                    u32::try_from(slots.entries.len()).map_err(|_| IoError::AllocationFailure)?;
                slots
                    .entries
                    .try_reserve(1)
                    .map_err(|_| IoError::AllocationFailure)?;
                slots.entries.push(Slot {
                    generation: 0,
                    request: None,
                });
                index
            }
        };

        let slot = &mut slots.entries[index as usize];
        let id = RequestId {
            index,
            generation: slot.generation,
        };
        slot.request = Some(Arc::new(build(id)));
        slots.live += 1;
        Ok(id)
    }

    /// Create a request over `length` bytes at device `offset`, backed by
    /// `buffer`.
    ///
    /// User buffers are interpreted in the calling team's address space.
    pub fn create(
        &self,
        offset: u64,
        buffer: TransferBuffer,
        length: usize,
        is_write: bool,
        flags: RequestFlags,
    ) -> Result<RequestId, IoError> {
        if length > buffer.length() {
            return Err(IoError::InvalidArgument);
        }
        let team = self.hal.current_team();
        let id = self.insert(|id| {
            new_request(id, offset, length, is_write, flags, team, None, 0, buffer)
        })?;
        log::debug!(
            "dma-io: request {:?}: {} {} bytes at {}",
            id,
            if is_write { "write" } else { "read" },
            length,
            offset
        );
        Ok(id)
    }

    /// Create a child of `parent` for `length` bytes starting at
    /// `parent_offset` in the parent's range, placed at device `offset`.
    ///
    /// The child shares the parent's memory, team and flags (except
    /// auto-delete) and counts as a pending child of the parent.
    pub fn create_sub_request(
        &self,
        parent: RequestId,
        parent_offset: u64,
        offset: u64,
        length: usize,
    ) -> Result<RequestId, IoError> {
        let request = self.request(parent)?;
        let start = parent_offset
            .checked_sub(request.offset)
            .and_then(|start| usize::try_from(start).ok())
            .ok_or(IoError::InvalidArgument)?;
        if start + length > request.length {
            return Err(IoError::InvalidArgument);
        }

        let buffer = request.buffer.slice(start, length)?;
        let flags = RequestFlags {
            auto_delete: false,
            ..request.flags
        };
        let child = self.insert(|id| {
            new_request(
                id,
                offset,
                length,
                request.is_write,
                flags,
                request.team,
                Some(parent),
                start,
                buffer,
            )
        })?;

        let attached = {
            let mut state = request.state.lock();
            let reserved = state.children.try_reserve(1).is_ok()
                && state.sub_requests.try_reserve(1).is_ok();
            if reserved {
                state.children.push(ChunkId::SubRequest(child));
                state.sub_requests.push(child);
                state.pending_children += 1;
            }
            reserved
        };
        if !attached {
            self.destroy(child)?;
            return Err(IoError::AllocationFailure);
        }

        Ok(child)
    }

    /// Remove a request from the table, along with the sub-requests it
    /// created.
    ///
    /// Callers still holding a [`RequestFinished`] future keep the request's
    /// state alive until they drop it.
    pub fn destroy(&self, id: RequestId) -> Result<(), IoError> {
        let request = {
            let mut slots = self.slots.lock();
            let slot = slots
                .entries
                .get_mut(id.index as usize)
                .filter(|slot| slot.generation == id.generation && slot.request.is_some())
                .ok_or(IoError::InvalidArgument)?;
            let request = slot.request.take();
            slot.generation = slot.generation.wrapping_add(1);
            slots.free.push(id.index);
            slots.live -= 1;
            request
        };

        if let Some(request) = request {
            let sub_requests = core::mem::take(&mut request.state.lock().sub_requests);
            for sub_request in sub_requests {
                // Already removed if it was destroyed on its own.
                let _ = self.destroy(sub_request);
            }
        }
        Ok(())
    }

    /// Destroy all sub-requests created from `id`.
    ///
    /// Sub-requests that had not finished yet stop counting as pending.
    pub fn delete_sub_requests(&self, id: RequestId) -> Result<(), IoError> {
        let request = self.request(id)?;
        let sub_requests = {
            let mut state = request.state.lock();
            state
                .children
                .retain(|chunk| !matches!(chunk, ChunkId::SubRequest(_)));
            core::mem::take(&mut state.sub_requests)
        };
        for sub_request in sub_requests {
            let unfinished = self
                .request(sub_request)
                .is_ok_and(|sub| !sub.notified.load(Ordering::Acquire));
            if unfinished {
                let mut state = request.state.lock();
                state.pending_children = state.pending_children.saturating_sub(1);
            }
            let _ = self.destroy(sub_request);
        }
        Ok(())
    }

    /// Sub-requests created from `id`, in creation order.
    pub fn sub_requests(&self, id: RequestId) -> Result<Vec<RequestId>, IoError> {
        Ok(self.request(id)?.state.lock().sub_requests.clone())
    }

    /// Current children of `id`.
    pub fn children(&self, id: RequestId) -> Result<Vec<ChunkId>, IoError> {
        Ok(self.request(id)?.state.lock().children.clone())
    }

    /// Attach `operation` to request `id` as a pending child.
    pub fn add_operation(&self, id: RequestId, operation: &mut Operation) -> Result<(), IoError> {
        let request = self.request(id)?;
        let mut state = request.state.lock();
        state
            .children
            .try_reserve(1)
            .map_err(|_| IoError::AllocationFailure)?;
        state.children.push(ChunkId::Operation(operation.id()));
        state.pending_children += 1;
        operation.set_parent(Some(id));
        Ok(())
    }

    /// Detach `operation` from request `id` without recording a result.
    pub fn remove_operation(
        &self,
        id: RequestId,
        operation: &mut Operation,
    ) -> Result<(), IoError> {
        let request = self.request(id)?;
        let mut state = request.state.lock();
        let chunk = ChunkId::Operation(operation.id());
        if let Some(position) = state.children.iter().position(|child| *child == chunk) {
            state.children.remove(position);
            state.pending_children -= 1;
        }
        operation.set_parent(None);
        Ok(())
    }

    /// Record that `operation` is done and detach it from its request.
    ///
    /// A failed or short operation truncates the request's transferred length
    /// to the end of what the operation managed, and the first failure
    /// becomes the request's status. When the last child is done an unset
    /// status becomes success. The request is not notified; call
    /// [`notify_finished`](Self::notify_finished) once no more operations
    /// will be added.
    pub fn operation_finished(&self, operation: &mut Operation) -> Result<(), IoError> {
        let Some(id) = operation.parent() else {
            return Err(IoError::InvalidArgument);
        };
        let request = self.request(id)?;

        let status = operation.status().unwrap_or_else(|| {
            log::warn!("dma-io: {:?} finished without a status", operation.id());
            Err(IoError::DeviceError)
        });
        let transferred = operation.transferred_bytes();
        let partial = transferred < operation.original_length();

        let mut state = request.state.lock();
        let chunk = ChunkId::Operation(operation.id());
        if let Some(position) = state.children.iter().position(|child| *child == chunk) {
            state.children.remove(position);
        }
        operation.set_parent(None);

        if status.is_err() || partial {
            let end = (operation.original_offset() + transferred as u64 - request.offset) as usize;
            state.transferred = state.transferred.min(end);
            state.partial_transfer = true;
            log::debug!(
                "dma-io: request {:?}: {:?} stopped at {} bytes ({:?})",
                id,
                operation.id(),
                end,
                status
            );
        }

        record_child_result(&mut state, status);
        Ok(())
    }

    /// Record that sub-request `child` of `id` is done.
    ///
    /// `transfer_end` is where the child's transfer stopped, relative to the
    /// start of `id`. Notifies `id` when this was its last pending child,
    /// unless child notifications are suppressed.
    pub fn sub_request_finished(
        &self,
        id: RequestId,
        child: RequestId,
        status: Result<(), IoError>,
        partial_transfer: bool,
        transfer_end: usize,
    ) -> Result<(), IoError> {
        let request = self.request(id)?;

        let notify = {
            let mut state = request.state.lock();
            if status.is_err() || partial_transfer {
                state.transferred = state.transferred.min(transfer_end);
                state.partial_transfer = true;
            }
            record_child_result(&mut state, status);
            state.pending_children == 0 && !state.suppress_child_notifications
        };

        log::trace!("dma-io: request {:?}: sub-request {:?} done", id, child);
        if notify {
            self.notify_finished(id)?;
        }
        Ok(())
    }

    /// Deliver the request's completion.
    ///
    /// If every child succeeded but bytes remain and an iteration callback is
    /// set, the callback runs instead and may schedule more work. Otherwise
    /// the request's memory is unlocked, waiters are woken, the finished
    /// callback runs, the parent is told, and an auto-delete request is
    /// removed. A request is notified at most once.
    pub fn notify_finished(&self, id: RequestId) -> Result<(), IoError> {
        let request = self.request(id)?;
        let mut state = request.state.lock();
        if request.notified.load(Ordering::Acquire) || state.notifying {
            log::warn!("dma-io: request {:?} notified twice", id);
            return Ok(());
        }

        let unfinished = matches!(state.status, Some(Ok(())))
            && !state.partial_transfer
            && state.cursor.remaining > 0;
        if unfinished {
            if let Some(mut callback) = state.iteration_callback.take() {
                state.status = None;
                drop(state);

                let outcome = callback(self, id);

                state = request.state.lock();
                if state.iteration_callback.is_none() {
                    state.iteration_callback = Some(callback);
                }
                // The callback may have notified the request itself.
                if request.notified.load(Ordering::Acquire) || state.notifying {
                    return Ok(());
                }
                match outcome {
                    Ok(IterationOutcome::Continue) => return Ok(()),
                    Ok(IterationOutcome::PartialTransfer) => state.status = Some(Ok(())),
                    Err(err) => state.status = Some(Err(err)),
                }
                state.partial_transfer = true;
            }
        }

        if state.pending_children > 0 {
            log::warn!(
                "dma-io: request {:?} notified with {} pending children",
                id,
                state.pending_children
            );
        }
        state.notifying = true;
        drop(state);

        if request.buffer.is_memory_locked() {
            request
                .buffer
                .unlock_memory(&*self.hal, request.space(), request.is_write);
        }

        let (status, partial, transferred, callback, wakers) = {
            let mut state = request.state.lock();
            let status = *state.status.get_or_insert(Ok(()));
            let partial = status.is_err() || state.partial_transfer;
            request.notified.store(true, Ordering::Release);
            (
                status,
                partial,
                state.transferred,
                state.finished_callback.take(),
                core::mem::take(&mut state.wakers),
            )
        };

        log::debug!(
            "dma-io: request {:?} finished: {:?}, {} bytes{}",
            id,
            status,
            transferred,
            if partial { " (partial)" } else { "" }
        );

        for waker in wakers {
            waker.wake();
        }
        if let Some(callback) = callback {
            callback(self, id, status, partial, transferred);
        }
        if let Some(parent) = request.parent {
            self.sub_request_finished(
                parent,
                id,
                status,
                partial,
                request.relative_parent_offset + transferred,
            )?;
        }
        if request.flags.auto_delete {
            // The finished callback may already have destroyed it.
            let _ = self.destroy(id);
        }
        Ok(())
    }

    /// Set the status and notify, typically to abort a request.
    pub fn set_status_and_notify(
        &self,
        id: RequestId,
        status: Result<(), IoError>,
    ) -> Result<(), IoError> {
        self.request(id)?.state.lock().status = Some(status);
        self.notify_finished(id)
    }

    /// Forget the current status so the request counts as unfinished again.
    pub fn set_unfinished(&self, id: RequestId) -> Result<(), IoError> {
        self.request(id)?.state.lock().status = None;
        Ok(())
    }

    pub fn set_transferred_bytes(
        &self,
        id: RequestId,
        partial_transfer: bool,
        transferred: usize,
    ) -> Result<(), IoError> {
        let request = self.request(id)?;
        let mut state = request.state.lock();
        state.partial_transfer = partial_transfer;
        state.transferred = transferred;
        Ok(())
    }

    /// Stop sub-request completions from notifying `id`.
    pub fn set_suppress_child_notifications(
        &self,
        id: RequestId,
        suppress: bool,
    ) -> Result<(), IoError> {
        self.request(id)?.state.lock().suppress_child_notifications = suppress;
        Ok(())
    }

    pub fn set_finished_callback(
        &self,
        id: RequestId,
        callback: FinishedCallback,
    ) -> Result<(), IoError> {
        self.request(id)?.state.lock().finished_callback = Some(callback);
        Ok(())
    }

    pub fn set_iteration_callback(
        &self,
        id: RequestId,
        callback: IterationCallback,
    ) -> Result<(), IoError> {
        self.request(id)?.state.lock().iteration_callback = Some(callback);
        Ok(())
    }

    /// Move the cursor of `id` forward by `bytes`.
    pub fn advance(&self, id: RequestId, bytes: usize) -> Result<(), IoError> {
        let request = self.request(id)?;
        let vecs = request.buffer.vecs();
        let mut state = request.state.lock();
        if bytes > state.cursor.remaining {
            return Err(IoError::InvalidArgument);
        }
        state.cursor.remaining -= bytes;
        state.transferred += bytes;

        let cursor = &mut state.cursor;
        let mut left = bytes;
        while cursor.vec_index < vecs.len()
            && vecs[cursor.vec_index].len - cursor.vec_offset <= left
        {
            left -= vecs[cursor.vec_index].len - cursor.vec_offset;
            cursor.vec_offset = 0;
            cursor.vec_index += 1;
        }
        cursor.vec_offset += left;
        Ok(())
    }

    /// Lock the request's memory until it is notified.
    pub fn lock_memory(&self, id: RequestId) -> Result<(), IoError> {
        let request = self.request(id)?;
        request
            .buffer
            .lock_memory(&*self.hal, request.space(), request.is_write)
    }

    pub fn status(&self, id: RequestId) -> Result<Option<Result<(), IoError>>, IoError> {
        Ok(self.request(id)?.state.lock().status)
    }

    /// Whether a status is known and no child is pending.
    pub fn is_finished(&self, id: RequestId) -> Result<bool, IoError> {
        let request = self.request(id)?;
        let state = request.state.lock();
        Ok(state.status.is_some() && state.pending_children == 0)
    }

    pub fn is_notified(&self, id: RequestId) -> Result<bool, IoError> {
        Ok(self.request(id)?.notified.load(Ordering::Acquire))
    }

    pub fn transferred_bytes(&self, id: RequestId) -> Result<usize, IoError> {
        Ok(self.request(id)?.state.lock().transferred)
    }

    pub fn is_partial_transfer(&self, id: RequestId) -> Result<bool, IoError> {
        Ok(self.request(id)?.state.lock().partial_transfer)
    }

    /// Bytes not yet handed to an operation or sub-request.
    pub fn remaining_bytes(&self, id: RequestId) -> Result<usize, IoError> {
        Ok(self.request(id)?.cursor().remaining)
    }

    pub fn pending_children(&self, id: RequestId) -> Result<usize, IoError> {
        Ok(self.request(id)?.state.lock().pending_children)
    }

    pub fn offset(&self, id: RequestId) -> Result<u64, IoError> {
        Ok(self.request(id)?.offset)
    }

    pub fn length(&self, id: RequestId) -> Result<usize, IoError> {
        Ok(self.request(id)?.length)
    }

    pub fn is_write(&self, id: RequestId) -> Result<bool, IoError> {
        Ok(self.request(id)?.is_write)
    }

    pub fn flags(&self, id: RequestId) -> Result<RequestFlags, IoError> {
        Ok(self.request(id)?.flags)
    }

    pub fn team(&self, id: RequestId) -> Result<TeamId, IoError> {
        Ok(self.request(id)?.team)
    }

    pub fn parent(&self, id: RequestId) -> Result<Option<RequestId>, IoError> {
        Ok(self.request(id)?.parent)
    }

    /// Offset of `id` within its parent's range.
    pub fn relative_parent_offset(&self, id: RequestId) -> Result<usize, IoError> {
        Ok(self.request(id)?.relative_parent_offset)
    }

    /// The buffer's vectors; handy for checking sub-request layout.
    pub fn vecs(&self, id: RequestId) -> Result<Vec<crate::IoVec>, IoError> {
        Ok(self.request(id)?.buffer.vecs().to_vec())
    }
}

impl core::fmt::Debug for RequestTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let slots = self.slots.lock();
        f.debug_list()
            .entries(slots.entries.iter().filter_map(|slot| slot.request.as_ref()))
            .finish()
    }
}

/// Fold a child's status into the request. The first failure wins, and the
/// status becomes success once the last child is done without one.
fn record_child_result(state: &mut RequestState, status: Result<(), IoError>) {
    if let Err(err) = status {
        if !matches!(state.status, Some(Err(_))) {
            state.status = Some(Err(err));
        }
    }

    if state.pending_children == 0 {
        log::warn!("dma-io: child finished with no pending children");
    } else {
        state.pending_children -= 1;
    }
    if state.pending_children == 0 && state.status.is_none() {
        state.status = Some(Ok(()));
    }
}

#[allow(clippy::too_many_arguments)]
fn new_request(
    id: RequestId,
    offset: u64,
    length: usize,
    is_write: bool,
    flags: RequestFlags,
    team: TeamId,
    parent: Option<RequestId>,
    relative_parent_offset: usize,
    buffer: TransferBuffer,
) -> Request {
    Request {
        id,
        offset,
        length,
        is_write,
        flags,
        team,
        parent,
        relative_parent_offset,
        buffer,
        state: Spinlock::new(RequestState {
            cursor: Cursor {
                vec_index: 0,
                vec_offset: 0,
                remaining: length,
            },
            transferred: 0,
            children: Vec::new(),
            sub_requests: Vec::new(),
            pending_children: 0,
            status: None,
            partial_transfer: false,
            suppress_child_notifications: false,
            notifying: false,
            finished_callback: None,
            iteration_callback: None,
            wakers: Vec::new(),
        }),
        notified: AtomicBool::new(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedMemory;
    use crate::{IoVec, PAGE_SIZE};
    use alloc::vec;
    use core::sync::atomic::AtomicUsize;

    fn table() -> RequestTable {
        RequestTable::new(SimulatedMemory::new(16 * PAGE_SIZE))
    }

    fn buffer() -> TransferBuffer {
        TransferBuffer::kernel(vec![
            IoVec::new(0x40_0000, 1000),
            IoVec::new(0x50_0000, 3000),
        ])
        .unwrap()
    }

    fn request(table: &RequestTable, flags: RequestFlags) -> RequestId {
        table.create(0, buffer(), 4000, false, flags).unwrap()
    }

    #[test]
    fn stale_id_is_rejected() {
        let table = table();
        let old = request(&table, RequestFlags::default());
        table.destroy(old).unwrap();
        let new = request(&table, RequestFlags::default());

        assert_ne!(old, new);
        assert!(!table.contains(old));
        assert_eq!(table.offset(old), Err(IoError::InvalidArgument));
        assert_eq!(table.destroy(old), Err(IoError::InvalidArgument));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let table = RequestTable::with_capacity(SimulatedMemory::new(PAGE_SIZE), 1);
        request(&table, RequestFlags::default());
        assert_eq!(
            table.create(0, buffer(), 10, false, RequestFlags::default()),
            Err(IoError::AllocationFailure)
        );
    }

    #[test]
    fn create_rejects_length_beyond_buffer() {
        let table = table();
        assert_eq!(
            table.create(0, buffer(), 4001, true, RequestFlags::default()),
            Err(IoError::InvalidArgument)
        );
    }

    #[test]
    fn sub_request_covers_a_slice_of_the_parent() {
        let table = table();
        let flags = RequestFlags {
            vip: true,
            auto_delete: true,
        };
        let parent = request(&table, flags);

        let sub = table.create_sub_request(parent, 1500, 8192, 1000).unwrap();
        assert_eq!(table.vecs(sub).unwrap(), vec![IoVec::new(0x50_0000 + 500, 1000)]);
        assert_eq!(table.offset(sub).unwrap(), 8192);
        assert_eq!(table.relative_parent_offset(sub).unwrap(), 1500);
        assert_eq!(table.parent(sub).unwrap(), Some(parent));
        assert_eq!(
            table.flags(sub).unwrap(),
            RequestFlags {
                vip: true,
                auto_delete: false
            }
        );

        let straddling = table.create_sub_request(parent, 900, 0, 200).unwrap();
        assert_eq!(
            table.vecs(straddling).unwrap(),
            vec![IoVec::new(0x40_0000 + 900, 100), IoVec::new(0x50_0000, 100)]
        );

        assert_eq!(table.pending_children(parent).unwrap(), 2);
        assert_eq!(table.sub_requests(parent).unwrap(), vec![sub, straddling]);
        assert_eq!(
            table.create_sub_request(parent, 3900, 0, 200),
            Err(IoError::InvalidArgument)
        );
    }

    #[test]
    fn last_sub_request_notifies_parent_and_first_error_wins() {
        let table = table();
        let parent = request(&table, RequestFlags::default());
        let first = table.create_sub_request(parent, 0, 0, 2000).unwrap();
        let second = table.create_sub_request(parent, 2000, 2000, 2000).unwrap();

        table
            .set_status_and_notify(second, Err(IoError::DeviceError))
            .unwrap();
        assert!(!table.is_notified(parent).unwrap());
        assert_eq!(table.pending_children(parent).unwrap(), 1);
        assert!(table.is_partial_transfer(parent).unwrap());

        table.set_status_and_notify(first, Ok(())).unwrap();
        assert!(table.is_notified(parent).unwrap());
        assert_eq!(table.status(parent).unwrap(), Some(Err(IoError::DeviceError)));
        assert_eq!(table.wait(parent, None), Err(IoError::DeviceError));
    }

    #[test]
    fn suppressed_parent_waits_for_explicit_notify() {
        let table = table();
        let parent = request(&table, RequestFlags::default());
        table.set_suppress_child_notifications(parent, true).unwrap();
        let sub = table.create_sub_request(parent, 0, 0, 4000).unwrap();

        table.set_status_and_notify(sub, Ok(())).unwrap();
        assert!(table.is_finished(parent).unwrap());
        assert!(!table.is_notified(parent).unwrap());

        table.advance(parent, 4000).unwrap();
        table.notify_finished(parent).unwrap();
        assert!(table.is_notified(parent).unwrap());
        assert_eq!(table.status(parent).unwrap(), Some(Ok(())));
    }

    #[test]
    fn finished_callback_runs_once() {
        let table = table();
        let id = request(&table, RequestFlags::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        table
            .set_finished_callback(
                id,
                Box::new(move |_, _, status, partial, transferred| {
                    assert_eq!(status, Ok(()));
                    assert!(!partial);
                    assert_eq!(transferred, 4000);
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        table.advance(id, 4000).unwrap();
        table.set_status_and_notify(id, Ok(())).unwrap();
        table.notify_finished(id).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn iteration_callback_can_stop_early() {
        let table = table();
        let id = request(&table, RequestFlags::default());
        table
            .set_iteration_callback(id, Box::new(|_, _| Ok(IterationOutcome::PartialTransfer)))
            .unwrap();

        table.advance(id, 1000).unwrap();
        table.set_status_and_notify(id, Ok(())).unwrap();
        assert!(table.is_notified(id).unwrap());
        assert!(table.is_partial_transfer(id).unwrap());
        assert_eq!(table.transferred_bytes(id).unwrap(), 1000);
    }

    #[test]
    fn iteration_callback_that_notifies_is_not_notified_again() {
        let table = table();
        let parent = request(&table, RequestFlags::default());
        let first = table.create_sub_request(parent, 0, 0, 2000).unwrap();
        let second = table.create_sub_request(parent, 2000, 2000, 2000).unwrap();
        table
            .set_iteration_callback(
                first,
                Box::new(|table, id| {
                    table.set_status_and_notify(id, Ok(()))?;
                    Ok(IterationOutcome::PartialTransfer)
                }),
            )
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        table
            .set_finished_callback(
                first,
                Box::new(move |_, _, _, _, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        table.set_status_and_notify(first, Ok(())).unwrap();
        assert!(table.is_notified(first).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(table.pending_children(parent).unwrap(), 1);
        assert!(!table.is_notified(parent).unwrap());

        table.set_status_and_notify(second, Ok(())).unwrap();
        assert_eq!(table.pending_children(parent).unwrap(), 0);
        assert!(table.is_notified(parent).unwrap());
    }

    #[test]
    fn iteration_callback_can_schedule_more_work() {
        let table = table();
        let id = request(&table, RequestFlags::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        table
            .set_iteration_callback(
                id,
                Box::new(move |_, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(IterationOutcome::Continue)
                }),
            )
            .unwrap();

        table.advance(id, 1000).unwrap();
        table.set_status_and_notify(id, Ok(())).unwrap();
        assert!(!table.is_notified(id).unwrap());
        assert_eq!(table.status(id).unwrap(), None);

        table.advance(id, 3000).unwrap();
        table.set_status_and_notify(id, Ok(())).unwrap();
        assert!(table.is_notified(id).unwrap());
        assert!(!table.is_partial_transfer(id).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_iteration_callback_fails_the_request() {
        let table = table();
        let id = request(&table, RequestFlags::default());
        table
            .set_iteration_callback(id, Box::new(|_, _| Err(IoError::CopyFailure)))
            .unwrap();

        table.set_status_and_notify(id, Ok(())).unwrap();
        assert_eq!(table.wait(id, None), Err(IoError::CopyFailure));
    }

    #[test]
    fn advance_walks_the_vectors() {
        let table = table();
        let id = request(&table, RequestFlags::default());

        table.advance(id, 1200).unwrap();
        let cursor = table.request(id).unwrap().cursor();
        assert_eq!(
            cursor,
            Cursor {
                vec_index: 1,
                vec_offset: 200,
                remaining: 2800
            }
        );
        assert_eq!(table.transferred_bytes(id).unwrap(), 1200);

        table.advance(id, 1800).unwrap();
        assert_eq!(table.request(id).unwrap().cursor().vec_offset, 2000);
        assert_eq!(table.advance(id, 1001), Err(IoError::InvalidArgument));
    }

    #[test]
    fn destroy_and_delete_remove_sub_requests() {
        let table = table();
        let parent = request(&table, RequestFlags::default());
        let a = table.create_sub_request(parent, 0, 0, 1000).unwrap();
        let b = table.create_sub_request(parent, 1000, 1000, 1000).unwrap();
        table.set_status_and_notify(a, Ok(())).unwrap();

        table.delete_sub_requests(parent).unwrap();
        assert!(!table.contains(a) && !table.contains(b));
        assert!(table.children(parent).unwrap().is_empty());
        assert_eq!(table.pending_children(parent).unwrap(), 0);

        let c = table.create_sub_request(parent, 0, 0, 1000).unwrap();
        table.destroy(parent).unwrap();
        assert!(!table.contains(c));
        assert!(table.is_empty());
    }

    #[test]
    fn set_unfinished_clears_status() {
        let table = table();
        let id = request(&table, RequestFlags::default());
        let sub = table.create_sub_request(id, 0, 0, 10).unwrap();
        table
            .sub_request_finished(id, sub, Ok(()), false, 10)
            .unwrap();
        assert_eq!(table.status(id).unwrap(), Some(Ok(())));

        table.set_unfinished(id).unwrap();
        assert_eq!(table.status(id).unwrap(), None);
        assert!(!table.is_finished(id).unwrap());
    }
}
