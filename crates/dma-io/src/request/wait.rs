//! Waiting for requests to finish.

use alloc::sync::Arc;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::Ordering;
use core::task::{Context, Poll};
use core::time::Duration;

use super::{Request, RequestId, RequestTable};
use crate::IoError;

impl RequestTable {
    /// Block until `id` has been notified, then return its final status.
    ///
    /// With a timeout, gives up with [`IoError::TimedOut`] once it expires.
    /// Timing out leaves the request and its operations running.
    pub fn wait(&self, id: RequestId, timeout: Option<Duration>) -> Result<(), IoError> {
        let request = self.request(id)?;
        let hal = self.hal();
        let deadline = timeout.and_then(|timeout| hal.uptime().checked_add(timeout));

        while !request.notified.load(Ordering::Acquire) {
            if deadline.is_some_and(|deadline| hal.uptime() >= deadline) {
                return Err(IoError::TimedOut);
            }
            hal.relax();
        }

        request.final_status()
    }

    /// A future resolving to the final status of `id` once it is notified.
    pub fn finished(&self, id: RequestId) -> Result<RequestFinished, IoError> {
        Ok(RequestFinished {
            request: self.request(id)?,
        })
    }
}

/// Future returned by [`RequestTable::finished`].
///
/// Holds on to the request, so it still resolves if the request is removed
/// from the table (for example by auto-delete) before it is polled.
pub struct RequestFinished {
    request: Arc<Request>,
}

impl Future for RequestFinished {
    type Output = Result<(), IoError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.request.state.lock();
        if self.request.notified.load(Ordering::Acquire) {
            return Poll::Ready(state.status.unwrap_or(Ok(())));
        }

        if !state.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::task::Wake;
    use alloc::vec;
    use core::future::Future;
    use core::pin::pin;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use core::task::{Context, Poll, Waker};
    use core::time::Duration;

    use crate::testing::SimulatedMemory;
    use crate::{IoError, IoVec, PAGE_SIZE, RequestFlags, RequestTable, TransferBuffer};

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn table() -> RequestTable {
        RequestTable::new(SimulatedMemory::new(16 * PAGE_SIZE))
    }

    fn request(table: &RequestTable) -> crate::RequestId {
        let buffer = TransferBuffer::kernel(vec![IoVec::new(0x40_0000, 512)]).unwrap();
        table
            .create(0, buffer, 512, false, RequestFlags::default())
            .unwrap()
    }

    #[test]
    fn wait_times_out_while_pending() {
        let table = table();
        let id = request(&table);
        assert_eq!(
            table.wait(id, Some(Duration::from_millis(5))),
            Err(IoError::TimedOut)
        );
        // Timing out does not disturb the request.
        assert!(table.contains(id));
        assert!(!table.is_notified(id).unwrap());
    }

    #[test]
    fn wait_returns_final_status() {
        let table = table();
        let id = request(&table);
        table
            .set_status_and_notify(id, Err(IoError::DeviceError))
            .unwrap();
        assert_eq!(table.wait(id, None), Err(IoError::DeviceError));
    }

    #[test]
    fn future_is_woken_on_notify() {
        let table = table();
        let id = request(&table);
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let mut cx = Context::from_waker(&waker);

        let mut finished = pin!(table.finished(id).unwrap());
        assert_eq!(finished.as_mut().poll(&mut cx), Poll::Pending);
        assert_eq!(finished.as_mut().poll(&mut cx), Poll::Pending);

        table.set_status_and_notify(id, Ok(())).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(finished.as_mut().poll(&mut cx), Poll::Ready(Ok(())));
    }

    #[test]
    fn future_outlives_auto_deleted_request() {
        let table = table();
        let buffer = TransferBuffer::kernel(vec![IoVec::new(0x40_0000, 512)]).unwrap();
        let flags = RequestFlags {
            auto_delete: true,
            ..Default::default()
        };
        let id = table.create(0, buffer, 512, true, flags).unwrap();
        let mut finished = pin!(table.finished(id).unwrap());

        table.set_status_and_notify(id, Ok(())).unwrap();
        assert!(!table.contains(id));

        let mut cx = Context::from_waker(Waker::noop());
        assert_eq!(finished.as_mut().poll(&mut cx), Poll::Ready(Ok(())));
    }
}
