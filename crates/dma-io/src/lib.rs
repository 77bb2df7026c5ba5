//! DMA-aware I/O translation and completion tracking for block devices.
//!
//! A [`RequestTable`] holds position-addressed I/O requests over caller memory
//! described by a [`TransferBuffer`]. A [`DmaTranslator`] carves each request
//! into [`Operation`]s whose scatter/gather lists satisfy the device's
//! [`HardwareRestrictions`], routing unusable memory through a small pool of
//! staging buffers. Drivers execute operations, report their result, and the
//! request tree aggregates completion, waking waiters and firing callbacks once
//! the last child is done.
//!
//! Platform services (contiguous allocation, address translation, page locking
//! and copies between address spaces) come from a [`DmaHal`] implementation.

#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "testing"))]
extern crate std;

mod buffer;
mod error;
mod hal;
mod operation;
mod pool;
mod request;
mod restrictions;
mod translator;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use buffer::{BufferKind, IoVec, PageMapping, TransferBuffer, VirtualVec, VirtualVecs};
pub use error::IoError;
pub use hal::{AddressSpace, DmaHal, DmaRegion, PAGE_SIZE, PhysRun, TeamId};
pub use operation::{NextAction, Operation, OperationId, OperationPhase};
pub use pool::{DmaSegment, LoanedStagingBuffer, ScatterGatherBuffer};
pub use request::{
    ChunkId, FinishedCallback, IterationCallback, IterationOutcome, RequestFinished,
    RequestFlags, RequestId, RequestTable,
};
pub use restrictions::HardwareRestrictions;
pub use translator::{
    DmaTranslator, SegmentRouting, classify_segment, restrict_boundary_and_segment_size,
};
